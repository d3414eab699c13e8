use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote control instruction for one worker or the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    UpdateWorker {
        repo: String,
        branch: String,
        version: String,
        #[serde(default)]
        delay_ms: u64,
    },
    RebuildWorker {
        #[serde(default)]
        delay_ms: u64,
    },
    Suspend,
    Resume,
    ChangeRegion {
        new_region: String,
    },
    ResetPointsPeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTarget {
    Broadcast,
    Worker(String),
}

impl CommandTarget {
    /// Routing key on the command exchange.
    pub fn routing_key(&self) -> String {
        match self {
            CommandTarget::Broadcast => "broadcast".to_string(),
            CommandTarget::Worker(id) => format!("worker.{id}"),
        }
    }
}

/// Durable-until-acknowledged envelope around a control command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub target: CommandTarget,
    #[serde(flatten)]
    pub command: ControlCommand,
}

impl CommandEnvelope {
    pub fn new(target: CommandTarget, command: ControlCommand) -> Self {
        Self {
            id: Uuid::new_v4(),
            issued_at: Utc::now(),
            target,
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_tag() {
        let envelope = CommandEnvelope::new(
            CommandTarget::Worker("w-1".into()),
            ControlCommand::ChangeRegion {
                new_region: "us-east-1".into(),
            },
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"command\":\"change_region\""));
        let back: CommandEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn routing_keys() {
        assert_eq!(CommandTarget::Broadcast.routing_key(), "broadcast");
        assert_eq!(
            CommandTarget::Worker("abc".into()).routing_key(),
            "worker.abc"
        );
    }
}
