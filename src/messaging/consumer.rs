//! Event Consumer Module
//!
//! One long-lived consumer per message type. Messages on a queue are handled
//! one at a time with manual acknowledgement: decode failures are discarded,
//! handler failures are requeued. When the delivery stream ends underneath a
//! running consumer it resubscribes on a fresh channel until stopped.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{BrokerChannel, Delivery, QueueOptions};
use super::connection::BrokerConnectionManager;
use super::messages::BrokerMessage;
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Reacts to one decoded message. An error requeues the message.
#[async_trait]
pub trait MessageHandler<M: BrokerMessage>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

/// The channel a consumer currently reads from.
type ChannelSlot = Arc<Mutex<Arc<dyn BrokerChannel>>>;

pub struct EventConsumer<M, H> {
    connection: Arc<BrokerConnectionManager>,
    handler: Arc<H>,
    exchange: String,
    routing_key: String,
    resubscribe_delay: Duration,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> EventConsumer<M, H>
where
    M: BrokerMessage,
    H: MessageHandler<M>,
{
    pub fn new(
        connection: Arc<BrokerConnectionManager>,
        handler: Arc<H>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            connection,
            handler,
            exchange: M::exchange(config).to_string(),
            routing_key: M::routing_key(config).to_string(),
            resubscribe_delay: config.resubscribe_delay,
            _message: PhantomData,
        }
    }

    // == Start ==
    /// Declares the exchange, queue and binding, then starts consuming on a
    /// background task. The task stops when `shutdown` is cancelled.
    pub async fn start(self, shutdown: &CancellationToken) -> Result<ConsumerHandle, BrokerError> {
        let channel = self.connection.create_channel().await?;
        let deliveries = match self.subscribe(channel.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                close_quietly(channel.as_ref()).await;
                return Err(e);
            }
        };

        info!(
            queue = M::QUEUE,
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            "Consumer started"
        );

        let slot: ChannelSlot = Arc::new(Mutex::new(channel));
        let stop = shutdown.child_token();
        let task = tokio::spawn(self.supervise(deliveries, Arc::clone(&slot), stop.clone()));
        Ok(ConsumerHandle {
            queue: M::QUEUE,
            channel: slot,
            stop,
            task,
        })
    }

    async fn subscribe(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        channel.declare_exchange(&self.exchange, true).await?;
        channel
            .declare_queue(M::QUEUE, QueueOptions::durable())
            .await?;
        channel
            .bind_queue(M::QUEUE, &self.exchange, &self.routing_key)
            .await?;

        let consumer_tag = format!("{}-{}", M::KIND, Uuid::new_v4());
        channel.consume(M::QUEUE, &consumer_tag).await
    }

    /// Consumes until stopped, resubscribing whenever the stream closes.
    /// Returns the number of deliveries processed.
    async fn supervise(
        self,
        mut deliveries: mpsc::Receiver<Delivery>,
        slot: ChannelSlot,
        stop: CancellationToken,
    ) -> u64 {
        let mut processed = 0;
        loop {
            processed += consume_loop::<M, H>(self.handler.as_ref(), &mut deliveries, &stop).await;
            if stop.is_cancelled() {
                break;
            }

            warn!(queue = M::QUEUE, "Delivery stream closed, resubscribing");
            match self.resubscribe(&slot, &stop).await {
                Some(next) => deliveries = next,
                None => break,
            }
        }
        processed
    }

    /// Retries channel setup with a fixed delay. `None` once stopped.
    async fn resubscribe(
        &self,
        slot: &ChannelSlot,
        stop: &CancellationToken,
    ) -> Option<mpsc::Receiver<Delivery>> {
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return None,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
            attempt += 1;

            let channel = match self.connection.create_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(queue = M::QUEUE, attempt, error = %e, "Resubscribe failed");
                    continue;
                }
            };
            // Stored before subscribing so a stop closes it either way.
            let previous = std::mem::replace(&mut *slot.lock().await, Arc::clone(&channel));
            close_quietly(previous.as_ref()).await;

            match self.subscribe(channel.as_ref()).await {
                Ok(deliveries) => {
                    info!(queue = M::QUEUE, attempt, "Consumer resubscribed");
                    return Some(deliveries);
                }
                Err(e) => {
                    warn!(queue = M::QUEUE, attempt, error = %e, "Resubscribe failed");
                }
            }
        }
    }
}

// == Consumer Handle ==
/// A running consumer.
pub struct ConsumerHandle {
    queue: &'static str,
    channel: ChannelSlot,
    stop: CancellationToken,
    task: JoinHandle<u64>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &'static str {
        self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops taking deliveries and lets the in-flight message finish within
    /// `grace`; after that the task is aborted. The channel is closed either
    /// way, so unacknowledged deliveries go back to the queue.
    pub async fn stop(self, grace: Duration) {
        self.stop.cancel();

        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(processed)) => info!(queue = self.queue, processed, "Consumer stopped"),
            Ok(Err(e)) => warn!(queue = self.queue, error = %e, "Consumer task failed"),
            Err(_) => {
                warn!(queue = self.queue, ?grace, "Consumer did not drain in time, aborting");
                task.abort();
            }
        }

        let channel = Arc::clone(&*self.channel.lock().await);
        if let Err(e) = channel.close().await {
            warn!(queue = self.queue, error = %e, "Consumer channel did not close cleanly");
        }
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Channel close after failed setup");
    }
}

/// Handles deliveries until `stop` fires or the stream ends; returns how
/// many were processed.
async fn consume_loop<M, H>(
    handler: &H,
    deliveries: &mut mpsc::Receiver<Delivery>,
    stop: &CancellationToken,
) -> u64
where
    M: BrokerMessage,
    H: MessageHandler<M>,
{
    let mut processed = 0;
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        process::<M, H>(handler, delivery).await;
        processed += 1;
    }
    processed
}

async fn process<M, H>(handler: &H, delivery: Delivery)
where
    M: BrokerMessage,
    H: MessageHandler<M>,
{
    let message = match M::decode(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                queue = M::QUEUE,
                tag = delivery.tag,
                error = %e,
                "Discarding undecodable message"
            );
            if let Err(e) = delivery.nack(false).await {
                warn!(queue = M::QUEUE, error = %e, "Failed to reject message");
            }
            return;
        }
    };

    debug!(
        queue = M::QUEUE,
        tag = delivery.tag,
        redelivered = delivery.redelivered,
        ?message,
        "Handling message"
    );
    match handler.handle(message).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(queue = M::QUEUE, error = %e, "Failed to acknowledge message");
            }
        }
        Err(e) => {
            error!(
                queue = M::QUEUE,
                tag = delivery.tag,
                error = %format!("{e:#}"),
                "Handler failed, requeueing"
            );
            if let Err(e) = delivery.nack(true).await {
                warn!(queue = M::QUEUE, error = %e, "Failed to requeue message");
            }
        }
    }
}
