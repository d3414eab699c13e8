//! Redis-backed transport.
//!
//! Task queues are sorted sets scored by `(priority, sequence)` so the
//! consumer side pops highest-priority work first; targeted commands and
//! results use the same shape with a flat priority; broadcast commands
//! ride pub/sub. Every popped message is parked in a per-queue pending
//! hash until acked, which keeps delivery at-least-once across consumer
//! crashes: `recover_pending` requeues parked messages on startup.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::StreamExt;
use guardant_core::{CommandEnvelope, CommandTarget, ProbeResult, ProbeTask};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::topology;
use crate::{BusError, CommandConsumer, Consumer, Delivery, MessageBus, ResultConsumer, TaskConsumer};

const KEY_PREFIX: &str = "guardant";
const BROADCAST_CHANNEL: &str = "guardant:commands:broadcast";
const POP_TIMEOUT_SECONDS: f64 = 5.0;
/// Priority dominates ordering; sequence breaks ties FIFO.
const PRIORITY_STRIDE: f64 = 1e12;

fn queue_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:{queue}")
}

fn pending_key(queue: &str) -> String {
    format!("{KEY_PREFIX}:pending:{queue}")
}

#[derive(Debug, Serialize, Deserialize)]
struct Parcel<T> {
    id: String,
    redelivered: u32,
    message: T,
}

/// Production [`MessageBus`] over a Redis deployment. The connection URL
/// carries the credentials issued by the registry
/// (`redis://worker-<id>:<password>@host/`).
#[derive(Clone)]
pub struct RedisBus {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisBus {
    /// Authentication failures surface as [`BusError::Unauthorized`] so the
    /// worker's 3-strike rule can distinguish them from outages.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(BusError::from)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { manager, client })
    }

    async fn push<T: Serialize>(
        &self,
        queue: &str,
        message: &T,
        priority: u8,
        redelivered: u32,
    ) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let seq: u64 = conn.incr(format!("{KEY_PREFIX}:seq"), 1).await?;
        let parcel = Parcel {
            id: format!("{seq}"),
            redelivered,
            message,
        };
        let body = serde_json::to_string(&parcel)?;
        let score = if redelivered > 0 {
            // Redeliveries re-enter ahead of fresh work.
            0.0
        } else {
            priority as f64 * PRIORITY_STRIDE + seq as f64
        };
        let _: () = conn.zadd(queue_key(queue), body, score).await?;
        Ok(())
    }

    /// Move every parked message of a queue back onto it. Called by
    /// consumers on startup to reclaim work lost to a crashed peer.
    pub async fn recover_pending(&self, queue: &str) -> Result<usize, BusError> {
        let mut conn = self.manager.clone();
        let parked: Vec<(String, String)> = conn.hgetall(pending_key(queue)).await?;
        let mut recovered = 0;
        for (field, body) in parked {
            let _: () = conn.zadd(queue_key(queue), body, 0.0).await?;
            let _: () = conn.hdel(pending_key(queue), field).await?;
            recovered += 1;
        }
        if recovered > 0 {
            debug!(queue, recovered, "recovered pending messages");
        }
        Ok(recovered)
    }
}

struct ZsetConsumer<T> {
    bus: RedisBus,
    queue: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ZsetConsumer<T> {
    fn new(bus: RedisBus, queue: String) -> Self {
        Self {
            bus,
            queue,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Consumer<T> for ZsetConsumer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn next(&self) -> Option<Delivery<T>> {
        loop {
            let mut conn = self.bus.manager.clone();
            let popped: Option<(String, String, f64)> = match conn
                .bzpopmin(queue_key(&self.queue), POP_TIMEOUT_SECONDS)
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "queue pop failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            let Some((_, body, _)) = popped else {
                continue;
            };
            let parcel: Parcel<T> = match serde_json::from_str(&body) {
                Ok(parcel) => parcel,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "discarding undecodable message");
                    continue;
                }
            };
            // Park until settled.
            if let Err(err) = conn
                .hset::<_, _, _, ()>(pending_key(&self.queue), &parcel.id, &body)
                .await
            {
                warn!(queue = %self.queue, error = %err, "failed to park message");
            }

            let requeue = {
                let bus = self.bus.clone();
                let queue = self.queue.clone();
                let id = parcel.id.clone();
                Box::new(move |message: T, redelivered: u32| {
                    tokio::spawn(async move {
                        if let Err(err) = bus.push(&queue, &message, 0, redelivered).await {
                            // Parked copy stays; recovery picks it up later.
                            warn!(queue = %queue, error = %err, "requeue failed");
                            return;
                        }
                        let mut conn = bus.manager.clone();
                        let _: Result<(), redis::RedisError> =
                            conn.hdel(pending_key(&queue), &id).await;
                    });
                }) as Box<dyn FnOnce(T, u32) + Send>
            };
            let on_ack = {
                let bus = self.bus.clone();
                let queue = self.queue.clone();
                let id = parcel.id.clone();
                Box::new(move || {
                    let mut conn = bus.manager.clone();
                    tokio::spawn(async move {
                        let _: Result<(), redis::RedisError> =
                            conn.hdel(pending_key(&queue), &id).await;
                    });
                }) as Box<dyn FnOnce() + Send>
            };
            return Some(Delivery::new(
                parcel.message,
                parcel.redelivered,
                Some(requeue),
                Some(on_ack),
            ));
        }
    }
}

struct PumpedCommandConsumer {
    rx: Mutex<mpsc::UnboundedReceiver<CommandEnvelope>>,
}

#[async_trait]
impl Consumer<CommandEnvelope> for PumpedCommandConsumer {
    async fn next(&self) -> Option<Delivery<CommandEnvelope>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .map(|envelope| Delivery::new(envelope, 0, None, None))
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish_task(&self, task: &ProbeTask) -> Result<(), BusError> {
        self.push(&topology::task_queue(&task.region), task, task.priority, 0)
            .await
    }

    async fn consume_tasks(&self, region: &str) -> Result<TaskConsumer, BusError> {
        let queue = topology::task_queue(region);
        self.recover_pending(&queue).await?;
        Ok(Box::new(ZsetConsumer::<ProbeTask>::new(self.clone(), queue)))
    }

    async fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), BusError> {
        match &envelope.target {
            CommandTarget::Broadcast => {
                let mut conn = self.manager.clone();
                let body = serde_json::to_string(envelope)?;
                let _: () = conn.publish(BROADCAST_CHANNEL, body).await?;
                Ok(())
            }
            CommandTarget::Worker(worker_id) => {
                self.push(&topology::command_queue(worker_id), envelope, 0, 0)
                    .await
            }
        }
    }

    async fn consume_commands(&self, worker_id: &str) -> Result<CommandConsumer, BusError> {
        let queue = topology::command_queue(worker_id);
        self.recover_pending(&queue).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Targeted queue pump. Commands settle once handed to the agent;
        // the agent acks commands by completing them.
        let targeted = ZsetConsumer::<CommandEnvelope>::new(self.clone(), queue);
        let targeted_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(delivery) = targeted.next().await {
                let envelope = delivery.ack();
                if targeted_tx.send(envelope).is_err() {
                    break;
                }
            }
        });

        // Broadcast pump.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(BusError::from)?;
        pubsub.subscribe(BROADCAST_CHANNEL).await?;
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let Ok(body) = message.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<CommandEnvelope>(&body) {
                    Ok(envelope) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "discarding undecodable broadcast"),
                }
            }
        });

        Ok(Box::new(PumpedCommandConsumer { rx: Mutex::new(rx) }))
    }

    async fn publish_result(&self, result: &ProbeResult) -> Result<(), BusError> {
        self.push(topology::RESULTS_QUEUE, result, 0, 0).await
    }

    async fn consume_results(&self) -> Result<ResultConsumer, BusError> {
        self.recover_pending(topology::RESULTS_QUEUE).await?;
        Ok(Box::new(ZsetConsumer::<ProbeResult>::new(
            self.clone(),
            topology::RESULTS_QUEUE.to_string(),
        )))
    }
}
