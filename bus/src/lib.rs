//! Broker abstraction for the GuardAnt fabric.
//!
//! Topology (AMQP-style semantics over any compatible transport):
//! - exchange `tasks`, routing key = region id, queue `tasks.<region>`;
//! - exchange `worker_commands`, routing key `worker.<id>` or `broadcast`;
//! - durable queue `worker_results` consumed by competing aggregators.
//!
//! Components depend on the [`MessageBus`] trait, never on a concrete
//! transport. [`memory::InMemoryBus`] backs tests and single-process
//! deployments; [`redis_bus::RedisBus`] is the production transport.
//! Delivery is at-least-once: consumers ack after side effects complete,
//! and an unacked delivery returns to its queue with a bumped redelivery
//! count.

pub mod memory;
pub mod redis_bus;
pub mod topology;

use async_trait::async_trait;
use guardant_core::{CommandEnvelope, ProbeResult, ProbeTask};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,
    #[error("message encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("broker credentials rejected")]
    Unauthorized,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::AuthenticationFailed {
            BusError::Unauthorized
        } else {
            BusError::Transport(err.to_string())
        }
    }
}

/// One in-flight message. Call [`Delivery::ack`] after the side effect is
/// durable; dropping without ack requeues the payload.
pub struct Delivery<T> {
    payload: Option<T>,
    redelivered: u32,
    requeue: Option<Box<dyn FnOnce(T, u32) + Send>>,
    on_ack: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Delivery<T> {
    pub fn new(
        payload: T,
        redelivered: u32,
        requeue: Option<Box<dyn FnOnce(T, u32) + Send>>,
        on_ack: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            payload: Some(payload),
            redelivered,
            requeue,
            on_ack,
        }
    }

    pub fn payload(&self) -> &T {
        self.payload.as_ref().expect("payload taken")
    }

    /// How many times this message has been redelivered before now.
    pub fn redelivered(&self) -> u32 {
        self.redelivered
    }

    /// Acknowledge and take the payload.
    pub fn ack(mut self) -> T {
        self.requeue = None;
        if let Some(on_ack) = self.on_ack.take() {
            on_ack();
        }
        self.payload.take().expect("payload taken")
    }
}

impl<T> Drop for Delivery<T> {
    fn drop(&mut self) {
        if let (Some(payload), Some(requeue)) = (self.payload.take(), self.requeue.take()) {
            requeue(payload, self.redelivered + 1);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Delivery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &self.payload)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Pull-style consumer over one queue binding.
#[async_trait]
pub trait Consumer<T>: Send + Sync {
    /// Next delivery; `None` when the binding is gone.
    async fn next(&self) -> Option<Delivery<T>>;
}

pub type TaskConsumer = Box<dyn Consumer<ProbeTask>>;
pub type CommandConsumer = Box<dyn Consumer<CommandEnvelope>>;
pub type ResultConsumer = Box<dyn Consumer<ProbeResult>>;

/// Transport-neutral broker interface.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a task, routed by `task.region`, ordered by priority.
    async fn publish_task(&self, task: &ProbeTask) -> Result<(), BusError>;

    /// Competing-consumer binding on `tasks.<region>`.
    async fn consume_tasks(&self, region: &str) -> Result<TaskConsumer, BusError>;

    /// Publish a control command to one worker or the whole fleet.
    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), BusError>;

    /// Binding merging `worker.<worker_id>` with the broadcast stream.
    async fn consume_commands(&self, worker_id: &str) -> Result<CommandConsumer, BusError>;

    /// Publish a probe result to the durable `worker_results` queue.
    async fn publish_result(&self, result: &ProbeResult) -> Result<(), BusError>;

    /// Competing-consumer binding on `worker_results`.
    async fn consume_results(&self) -> Result<ResultConsumer, BusError>;
}
