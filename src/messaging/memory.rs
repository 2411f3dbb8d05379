//! In-Memory Broker
//!
//! An in-process broker with the AMQP behavior the consumers rely on:
//! direct, fanout and topic routing, manual acknowledgement, requeue on nack
//! and on channel close. Used for local runs and tests; it also exposes
//! publishing and inspection hooks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::broker::{
    Acknowledge, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, QueueOptions,
};
use crate::error::BrokerError;

/// Deliveries buffered per consumer ahead of the handler.
const PREFETCH: usize = 16;

/// Counters over the broker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryBrokerStats {
    pub published: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    ready: VecDeque<Message>,
    notify: Arc<Notify>,
}

/// Direct exchange: (binding key, queue) pairs.
struct Exchange {
    bindings: Vec<(String, String)>,
}

struct Unacked {
    channel: u64,
    queue: String,
    message: Message,
}

enum Settle {
    Ack,
    Nack { requeue: bool },
}

enum Next {
    Ready(u64, Message),
    Empty,
    Closed,
}

struct BrokerState {
    reachable: bool,
    failing_connects: u32,
    next_id: u64,
    next_tag: u64,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashSet<u64>,
    /// channel id -> (connection id, pump cancellation)
    channels: HashMap<u64, (u64, CancellationToken)>,
    unacked: HashMap<u64, Unacked>,
    stats: MemoryBrokerStats,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            reachable: true,
            failing_connects: 0,
            next_id: 0,
            next_tag: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashSet::new(),
            channels: HashMap::new(),
            unacked: HashMap::new(),
            stats: MemoryBrokerStats::default(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel: u64) -> Result<(), BrokerError> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        let exchange = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for (binding_key, queue) in &exchange.bindings {
            if binding_key == routing_key && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn next_delivery(&mut self, channel: u64, queue: &str) -> Next {
        if !self.channels.contains_key(&channel) {
            return Next::Closed;
        }
        let Some(ready) = self.queues.get_mut(queue) else {
            return Next::Closed;
        };
        let Some(message) = ready.ready.pop_front() else {
            return Next::Empty;
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(
            tag,
            Unacked {
                channel,
                queue: queue.to_string(),
                message: message.clone(),
            },
        );
        self.stats.delivered += 1;
        Next::Ready(tag, message)
    }

    fn settle(&mut self, channel: u64, tag: u64, outcome: Settle) -> Result<(), BrokerError> {
        self.check_channel(channel)?;
        match self.unacked.get(&tag) {
            Some(unacked) if unacked.channel == channel => {}
            _ => return Err(BrokerError::UnknownDelivery(tag)),
        }
        let Some(unacked) = self.unacked.remove(&tag) else {
            return Err(BrokerError::UnknownDelivery(tag));
        };

        match outcome {
            Settle::Ack => self.stats.acked += 1,
            Settle::Nack { requeue: true } => self.requeue(&unacked.queue, unacked.message),
            Settle::Nack { requeue: false } => self.stats.discarded += 1,
        }
        Ok(())
    }

    /// Puts a message back at the head of its queue, flagged as redelivered.
    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.redelivered = true;
        if let Some(target) = self.queues.get_mut(queue) {
            target.ready.push_front(message);
            target.notify.notify_one();
            self.stats.requeued += 1;
        }
    }

    fn close_channel(&mut self, channel: u64) {
        let Some((_, cancel)) = self.channels.remove(&channel) else {
            return;
        };
        cancel.cancel();

        // Highest tag first so the oldest delivery ends up at the head.
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(&unacked.queue, unacked.message);
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, (owner, _))| *owner == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// == In-Memory Broker ==
/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::new()),
            }),
        }
    }

    /// When false, new connection attempts are refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().failing_connects = count;
    }

    /// Closes every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.shared.lock();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection);
        }
    }

    /// Routes a message through `exchange`; returns how many queues got it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<usize, BrokerError> {
        let mut state = self.shared.lock();
        let targets = state.route(exchange, routing_key)?;
        let body = body.into();

        state.stats.published += 1;
        if targets.is_empty() {
            state.stats.unroutable += 1;
            debug!(exchange, routing_key, "Message unroutable, dropped");
        }

        for queue in &targets {
            if let Some(target) = state.queues.get_mut(queue) {
                target.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                });
                target.notify.notify_one();
            }
        }
        Ok(targets.len())
    }

    /// Messages waiting in `queue`, or None if it was never declared.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Deliveries from `queue` not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .unacked
            .values()
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        self.shared.lock().stats
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = self.shared.lock();
        if !state.reachable {
            return Err(BrokerError::Unreachable("connection refused".to_string()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Unreachable("connection reset".to_string()));
        }

        let id = state.next_id();
        state.connections.insert(id);
        Ok(Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

// == Connection ==
struct InMemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.shared.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = state.next_id();
        let cancel = CancellationToken::new();
        state.channels.insert(id, (self.id, cancel.clone()));
        Ok(Arc::new(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
            cancel,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.lock().close_connection(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().connections.contains(&self.id)
    }
}

// == Channel ==
struct InMemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    cancel: CancellationToken,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, _durable: bool) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn declare_queue(&self, name: &str, _options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        state.queues.entry(name.to_string()).or_insert_with(|| Queue {
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let notify = {
            let state = self.shared.lock();
            state.check_channel(self.id)?;
            let target = state
                .queues
                .get(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            Arc::clone(&target.notify)
        };

        let (tx, rx) = mpsc::channel(PREFETCH);
        debug!(queue, consumer_tag, "Consumer registered");
        tokio::spawn(pump(
            Arc::clone(&self.shared),
            self.id,
            queue.to_string(),
            notify,
            self.cancel.clone(),
            tx,
        ));
        Ok(rx)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.lock().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().channels.contains_key(&self.id)
    }
}

/// Moves ready messages from one queue to one consumer until the channel
/// closes or the consumer goes away.
async fn pump(
    shared: Arc<Shared>,
    channel: u64,
    queue: String,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Delivery>,
) {
    loop {
        let next = shared.lock().next_delivery(channel, &queue);
        match next {
            Next::Ready(tag, message) => {
                let acker = MemoryAcker {
                    shared: Arc::clone(&shared),
                    channel,
                    tag,
                };
                let delivery = Delivery::new(
                    tag,
                    message.routing_key,
                    message.body,
                    message.redelivered,
                    Box::new(acker),
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(delivery) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Next::Empty => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = notify.notified() => {}
                }
            }
            Next::Closed => break,
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.shared.lock().settle(self.channel, self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.shared
            .lock()
            .settle(self.channel, self.tag, Settle::Nack { requeue })
    }
}
