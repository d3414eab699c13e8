//! Queue and routing-key naming shared by every transport.

pub const TASKS_EXCHANGE: &str = "tasks";
pub const COMMANDS_EXCHANGE: &str = "worker_commands";
pub const RESULTS_QUEUE: &str = "worker_results";
pub const BROADCAST_KEY: &str = "broadcast";

pub fn task_queue(region: &str) -> String {
    format!("tasks.{region}")
}

pub fn command_queue(worker_id: &str) -> String {
    format!("worker.{worker_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        assert_eq!(task_queue("eu-central-1"), "tasks.eu-central-1");
        assert_eq!(command_queue("w-7"), "worker.w-7");
    }
}
