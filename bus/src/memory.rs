//! In-process transport used by tests and single-node deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use guardant_core::{CommandEnvelope, CommandTarget, ProbeResult, ProbeTask};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::topology;
use crate::{BusError, CommandConsumer, Consumer, Delivery, MessageBus, ResultConsumer, TaskConsumer};

const BROADCAST_CAPACITY: usize = 256;

struct QueueEntry<T> {
    payload: T,
    priority: u8,
    redelivered: u32,
}

/// Unbounded FIFO with priority insertion and requeue-to-front, shared by
/// competing consumers.
struct AsyncQueue<T> {
    entries: Mutex<Vec<QueueEntry<T>>>,
    notify: Notify,
}

impl<T: Send + 'static> AsyncQueue<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    async fn push(&self, payload: T, priority: u8, redelivered: u32) {
        let mut entries = self.entries.lock().await;
        // Lower priority value is dispatched first; redeliveries go to the
        // head of their priority class.
        let pos = if redelivered > 0 {
            entries.iter().position(|e| e.priority >= priority)
        } else {
            entries.iter().position(|e| e.priority > priority)
        }
        .unwrap_or(entries.len());
        entries.insert(
            pos,
            QueueEntry {
                payload,
                priority,
                redelivered,
            },
        );
        drop(entries);
        self.notify.notify_one();
    }

    fn push_blocking(self: &Arc<Self>, payload: T, priority: u8, redelivered: u32) {
        let queue = Arc::clone(self);
        // Requeue path runs from Drop, outside an await point.
        tokio::spawn(async move {
            queue.push(payload, priority, redelivered).await;
        });
    }

    async fn pop(self: &Arc<Self>) -> Delivery<T> {
        loop {
            {
                let mut entries = self.entries.lock().await;
                if !entries.is_empty() {
                    let entry = entries.remove(0);
                    let queue = Arc::clone(self);
                    let priority = entry.priority;
                    return Delivery::new(
                        entry.payload,
                        entry.redelivered,
                        Some(Box::new(move |payload, redelivered| {
                            queue.push_blocking(payload, priority, redelivered);
                        })),
                        None,
                    );
                }
            }
            self.notify.notified().await;
        }
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[derive(Default)]
struct Registry {
    task_queues: HashMap<String, Arc<AsyncQueue<ProbeTask>>>,
    command_queues: HashMap<String, Arc<AsyncQueue<CommandEnvelope>>>,
}

/// In-memory [`MessageBus`] with the production topology semantics:
/// priority-ordered task queues, per-worker command queues merged with a
/// broadcast stream, and a single competing-consumer result queue.
pub struct InMemoryBus {
    registry: Mutex<Registry>,
    results: Arc<AsyncQueue<ProbeResult>>,
    broadcast: broadcast::Sender<CommandEnvelope>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Mutex::new(Registry::default()),
            results: AsyncQueue::new(),
            broadcast,
        }
    }

    async fn task_queue(&self, region: &str) -> Arc<AsyncQueue<ProbeTask>> {
        let mut registry = self.registry.lock().await;
        registry
            .task_queues
            .entry(topology::task_queue(region))
            .or_insert_with(AsyncQueue::new)
            .clone()
    }

    async fn command_queue(&self, worker_id: &str) -> Arc<AsyncQueue<CommandEnvelope>> {
        let mut registry = self.registry.lock().await;
        registry
            .command_queues
            .entry(topology::command_queue(worker_id))
            .or_insert_with(AsyncQueue::new)
            .clone()
    }

    /// Depth of a region's task queue (test observability).
    pub async fn task_queue_depth(&self, region: &str) -> usize {
        self.task_queue(region).await.len().await
    }

    /// Depth of the result queue (test observability).
    pub async fn result_queue_depth(&self) -> usize {
        self.results.len().await
    }
}

struct QueueConsumer<T> {
    queue: Arc<AsyncQueue<T>>,
}

#[async_trait]
impl<T: Send + 'static> Consumer<T> for QueueConsumer<T> {
    async fn next(&self) -> Option<Delivery<T>> {
        Some(self.queue.pop().await)
    }
}

struct MergedCommandConsumer {
    queue: Arc<AsyncQueue<CommandEnvelope>>,
    broadcast: Mutex<broadcast::Receiver<CommandEnvelope>>,
}

#[async_trait]
impl Consumer<CommandEnvelope> for MergedCommandConsumer {
    async fn next(&self) -> Option<Delivery<CommandEnvelope>> {
        let mut broadcast = self.broadcast.lock().await;
        tokio::select! {
            delivery = self.queue.pop() => Some(delivery),
            received = broadcast.recv() => match received {
                // Broadcast deliveries are fire-and-forget per consumer.
                Ok(envelope) => Some(Delivery::new(envelope, 0, None, None)),
                Err(broadcast::error::RecvError::Lagged(_)) => Some(self.queue.pop().await),
                Err(broadcast::error::RecvError::Closed) => None,
            },
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish_task(&self, task: &ProbeTask) -> Result<(), BusError> {
        self.task_queue(&task.region)
            .await
            .push(task.clone(), task.priority, 0)
            .await;
        Ok(())
    }

    async fn consume_tasks(&self, region: &str) -> Result<TaskConsumer, BusError> {
        Ok(Box::new(QueueConsumer {
            queue: self.task_queue(region).await,
        }))
    }

    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), BusError> {
        match &envelope.target {
            CommandTarget::Broadcast => {
                // No subscribers yet is fine; late workers get later commands.
                let _ = self.broadcast.send(envelope.clone());
            }
            CommandTarget::Worker(worker_id) => {
                self.command_queue(worker_id)
                    .await
                    .push(envelope.clone(), 0, 0)
                    .await;
            }
        }
        Ok(())
    }

    async fn consume_commands(&self, worker_id: &str) -> Result<CommandConsumer, BusError> {
        Ok(Box::new(MergedCommandConsumer {
            queue: self.command_queue(worker_id).await,
            broadcast: Mutex::new(self.broadcast.subscribe()),
        }))
    }

    async fn publish_result(&self, result: &ProbeResult) -> Result<(), BusError> {
        self.results.push(result.clone(), 0, 0).await;
        Ok(())
    }

    async fn consume_results(&self) -> Result<ResultConsumer, BusError> {
        Ok(Box::new(QueueConsumer {
            queue: Arc::clone(&self.results),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardant_core::ControlCommand;

    #[tokio::test]
    async fn task_priority_ordering() {
        let bus = InMemoryBus::new();
        let mut low = ProbeTask::synthetic_template();
        low.priority = 10;
        let mut high = ProbeTask::synthetic_template();
        high.priority = 1;
        high.region = low.region.clone();

        bus.publish_task(&low).await.unwrap();
        bus.publish_task(&high).await.unwrap();

        let consumer = bus.consume_tasks(&low.region).await.unwrap();
        let first = consumer.next().await.unwrap();
        assert_eq!(first.payload().task_id, high.task_id);
        first.ack();
        let second = consumer.next().await.unwrap();
        assert_eq!(second.payload().task_id, low.task_id);
        second.ack();
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered() {
        let bus = InMemoryBus::new();
        let task = ProbeTask::synthetic_template();
        bus.publish_task(&task).await.unwrap();

        let consumer = bus.consume_tasks(&task.region).await.unwrap();
        {
            let delivery = consumer.next().await.unwrap();
            assert_eq!(delivery.redelivered(), 0);
            // dropped without ack
        }
        let redelivered = consumer.next().await.unwrap();
        assert_eq!(redelivered.redelivered(), 1);
        assert_eq!(redelivered.payload().task_id, task.task_id);
        redelivered.ack();
    }

    #[tokio::test]
    async fn targeted_and_broadcast_commands_reach_worker() {
        let bus = InMemoryBus::new();
        let consumer = bus.consume_commands("w-1").await.unwrap();

        bus.publish_command(&CommandEnvelope::new(
            CommandTarget::Worker("w-1".into()),
            ControlCommand::Suspend,
        ))
        .await
        .unwrap();
        let targeted = consumer.next().await.unwrap().ack();
        assert_eq!(targeted.command, ControlCommand::Suspend);

        bus.publish_command(&CommandEnvelope::new(
            CommandTarget::Broadcast,
            ControlCommand::ResetPointsPeriod,
        ))
        .await
        .unwrap();
        let broadcast = consumer.next().await.unwrap().ack();
        assert_eq!(broadcast.command, ControlCommand::ResetPointsPeriod);
    }

    #[tokio::test]
    async fn results_fan_in_to_single_queue() {
        let bus = InMemoryBus::new();
        let task = ProbeTask::synthetic_template();
        let result =
            guardant_core::ProbeResult::for_task(&task, "w-1", chrono::Utc::now());
        bus.publish_result(&result).await.unwrap();
        assert_eq!(bus.result_queue_depth().await, 1);

        let consumer = bus.consume_results().await.unwrap();
        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.payload().result_id, result.result_id);
        delivery.ack();
        assert_eq!(bus.result_queue_depth().await, 0);
    }
}
