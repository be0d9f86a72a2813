//! In-memory channel-based broker for standalone mode.
//!
//! Models the parts of a topic broker this crate relies on: topic exchanges,
//! named queues backed by tokio mpsc channels, idempotent bindings, manual
//! ack/reject, and a connection flag that ends every consumer stream when the
//! broker is closed. Ideal for local development and testing without an
//! external RabbitMQ.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info};

use super::{
    topic_matches, Broker, BusError, Delivery, DeliveryAcker, DeliveryStream, PublishOptions,
    Result,
};

/// One buffered message.
#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    data: Vec<u8>,
}

/// Broker-side queue: a sender for routing and a receiver shared by its
/// competing consumers.
struct QueueState {
    durable: bool,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
}

/// Broker-side state. Survives close/connect like a real broker's would.
#[derive(Default)]
struct State {
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    /// (queue, exchange, routing key)
    bindings: BTreeSet<(String, String, String)>,
}

/// Counters shared with every acker.
struct Stats {
    published: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
    rejected_bodies: Mutex<Vec<Vec<u8>>>,
    settled: watch::Sender<usize>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            published: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            rejected_bodies: Mutex::new(Vec::new()),
            settled: watch::channel(0).0,
        }
    }
}

/// In-process topic broker.
pub struct ChannelBroker {
    state: Arc<RwLock<State>>,
    connected: watch::Sender<bool>,
    stats: Arc<Stats>,
    unreachable: AtomicBool,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    /// Create a broker. Starts disconnected.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            connected: watch::channel(false).0,
            stats: Arc::new(Stats::default()),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Create a broker whose `connect()` always fails.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.unreachable.store(true, Ordering::SeqCst);
        broker
    }

    /// Simulate the transport dropping without a local `close()`.
    pub fn drop_connection(&self) {
        self.connected.send_replace(false);
    }

    /// Number of messages accepted by `publish`.
    pub fn published_count(&self) -> usize {
        self.stats.published.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> usize {
        self.stats.acked.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> usize {
        self.stats.rejected.load(Ordering::SeqCst)
    }

    /// Bodies of every rejected message, in rejection order.
    pub async fn rejected_bodies(&self) -> Vec<Vec<u8>> {
        self.stats.rejected_bodies.lock().await.clone()
    }

    /// Wait until at least `count` deliveries were acked or rejected.
    pub async fn wait_settled(&self, count: usize) {
        let mut settled = self.stats.settled.subscribe();
        let _ = settled.wait_for(|n| *n >= count).await;
    }

    pub async fn binding_count(&self) -> usize {
        self.state.read().await.bindings.len()
    }

    pub async fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.read().await.bindings.contains(&(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ))
    }

    pub async fn has_exchange(&self, exchange: &str) -> bool {
        self.state.read().await.exchanges.contains_key(exchange)
    }

    pub async fn has_queue(&self, queue: &str) -> bool {
        self.state.read().await.queues.contains_key(queue)
    }

    fn ensure_connected(&self) -> Result<()> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn connect(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BusError::Connection(
                "Failed to connect: broker unreachable".to_string(),
            ));
        }
        self.connected.send_replace(true);
        info!("Channel broker connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connected.send_replace(false) {
            info!("Channel broker closed");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.write().await;
        match state.exchanges.get(exchange) {
            Some(&existing) if existing != durable => Err(BusError::Subscribe(format!(
                "Failed to declare exchange: inequivalent arg 'durable' for exchange '{}'",
                exchange
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), durable);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.write().await;
        match state.queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(BusError::Subscribe(format!(
                "Failed to declare queue: inequivalent arg 'durable' for queue '{}'",
                queue
            ))),
            Some(_) => Ok(()),
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                state.queues.insert(
                    queue.to_string(),
                    QueueState {
                        durable,
                        sender,
                        receiver: Arc::new(Mutex::new(receiver)),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.write().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Subscribe(format!(
                "Failed to bind queue: no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Subscribe(format!(
                "Failed to bind queue: no queue '{}'",
                queue
            )));
        }
        state.bindings.insert((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        _options: &PublishOptions,
    ) -> Result<()> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Publish(format!("no exchange '{}'", exchange)));
        }

        // A queue bound by several matching patterns still gets one copy
        let targets: BTreeSet<&str> = state
            .bindings
            .iter()
            .filter(|(_, ex, pattern)| ex == exchange && topic_matches(pattern, routing_key))
            .map(|(queue, _, _)| queue.as_str())
            .collect();

        for queue in &targets {
            if let Some(q) = state.queues.get(*queue) {
                let _ = q.sender.send(Message {
                    routing_key: routing_key.to_string(),
                    data: payload.clone(),
                });
            }
        }

        self.stats.published.fetch_add(1, Ordering::SeqCst);
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            queues = targets.len(),
            "Published message to channel broker"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_connected()?;
        let receiver = {
            let state = self.state.read().await;
            let q = state.queues.get(queue).ok_or_else(|| {
                BusError::Subscribe(format!("Failed to start consumer: no queue '{}'", queue))
            })?;
            Arc::clone(&q.receiver)
        };

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Channel consumer started");

        let connected = self.connected.subscribe();
        let stats = Arc::clone(&self.stats);

        let stream = futures::stream::unfold(
            (receiver, connected, stats),
            |(receiver, mut connected, stats)| async move {
                loop {
                    if !*connected.borrow_and_update() {
                        return None;
                    }
                    // Each message goes to whichever consumer takes the lock first
                    let next = async { receiver.lock().await.recv().await };
                    tokio::select! {
                        message = next => {
                            let message = message?;
                            let acker = ChannelAcker {
                                stats: Arc::clone(&stats),
                                connected: connected.clone(),
                                body: message.data.clone(),
                                settled: AtomicBool::new(false),
                            };
                            let delivery = Delivery::new(
                                message.routing_key,
                                message.data,
                                false,
                                Box::new(acker),
                            );
                            return Some((Ok(delivery), (receiver, connected, stats)));
                        }
                        changed = connected.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Settles one in-memory delivery.
struct ChannelAcker {
    stats: Arc<Stats>,
    connected: watch::Receiver<bool>,
    body: Vec<u8>,
    settled: AtomicBool,
}

impl ChannelAcker {
    fn begin_settle(&self) -> Result<()> {
        if !*self.connected.borrow() {
            return Err(BusError::Acknowledge("channel closed".to_string()));
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Acknowledge(
                "delivery already settled".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.begin_settle()?;
        self.stats.acked.fetch_add(1, Ordering::SeqCst);
        self.stats.settled.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.begin_settle()?;
        self.stats.rejected.fetch_add(1, Ordering::SeqCst);
        self.stats
            .rejected_bodies
            .lock()
            .await
            .push(self.body.clone());
        self.stats.settled.send_modify(|n| *n += 1);
        Ok(())
    }
}
