use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

/// Incident lifecycle. Transitions are monotonic apart from the terminal
/// `Resolved`; a recurrence after resolution opens a fresh incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl IncidentState {
    fn rank(&self) -> u8 {
        match self {
            IncidentState::Investigating => 0,
            IncidentState::Identified => 1,
            IncidentState::Monitoring => 2,
            IncidentState::Resolved => 3,
        }
    }

    pub fn can_transition_to(&self, next: IncidentState) -> bool {
        if *self == IncidentState::Resolved {
            return false;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentUpdate {
    pub at: DateTime<Utc>,
    pub state: IncidentState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Operator-visible record of sustained degradation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub nest_id: Uuid,
    pub affected_service_ids: Vec<Uuid>,
    pub severity: Severity,
    pub state: IncidentState,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updates: Vec<IncidentUpdate>,
}

impl Incident {
    pub fn open(nest_id: Uuid, service_id: Uuid, severity: Severity, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            nest_id,
            affected_service_ids: vec![service_id],
            severity,
            state: IncidentState::Investigating,
            started_at,
            resolved_at: None,
            updates: vec![IncidentUpdate {
                at: started_at,
                state: IncidentState::Investigating,
                message: "automatic detection: sustained non-up status".to_string(),
                actor: None,
            }],
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != IncidentState::Resolved
    }

    /// Advance the state machine, recording the update. Returns false and
    /// leaves the incident untouched for non-monotonic transitions.
    pub fn advance(
        &mut self,
        next: IncidentState,
        message: impl Into<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next == IncidentState::Resolved {
            self.resolved_at = Some(at);
        }
        self.updates.push(IncidentUpdate {
            at,
            state: next,
            message: message.into(),
            actor,
        });
        true
    }
}
