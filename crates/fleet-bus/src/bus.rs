//! Message bus trait and the in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::DEFAULT_CHANNEL_CAPACITY;
use crate::codec::BusMessage;
use crate::error::{BusError, BusResult};

/// Callback invoked for every decoded message on a subscribed channel.
///
/// Handlers run on the bus's delivery task; they should only enqueue work.
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Publish/subscribe transport contract used by the fleet core.
pub trait MessageBus: Send + Sync {
    /// Publish a raw payload. Returns the number of subscribers of `channel`
    /// it was handed to.
    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize>;

    /// Register a callback for a channel. Delivery stops when the returned
    /// [`Subscription`] is dropped.
    fn subscribe(&self, channel: &str, handler: Handler) -> BusResult<Subscription>;

    /// Whether the transport connection is up.
    fn is_connected(&self) -> bool;

    /// Re-establish the transport connection.
    fn reconnect(&self) -> BusResult<()>;

    /// Store the transport-visible heartbeat key for an instance.
    fn record_heartbeat(&self, instance: &str, payload: Bytes) -> BusResult<()>;

    /// Clear an instance's heartbeat key. Returns true if one existed.
    fn clear_heartbeat(&self, instance: &str) -> BusResult<bool>;

    /// Encode and publish a typed message on its channel.
    fn publish_message(&self, message: &BusMessage) -> BusResult<usize> {
        let payload = message.encode()?;
        self.publish(message.channel(), payload)
    }
}

/// Handle for an active subscription; aborts delivery on drop.
#[must_use = "dropping a Subscription stops delivery"]
pub struct Subscription {
    channel: String,
    task: JoinHandle<()>,
    listeners: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        self.listeners.fetch_sub(1, Ordering::SeqCst);
        debug!(channel = %self.channel, "subscription dropped");
    }
}

#[derive(Clone, Debug)]
struct Envelope {
    channel: Arc<str>,
    payload: Bytes,
}

/// In-process bus over a `tokio::sync::broadcast` channel.
///
/// Suitable for a single daemon process running both the autoscaler and the
/// deployment queue; a networked transport implements the same trait.
pub struct InMemoryBus {
    sender: broadcast::Sender<Envelope>,
    connected: AtomicBool,
    heartbeats: RwLock<HashMap<String, Bytes>>,
    /// Live subscriptions per channel.
    listeners: RwLock<HashMap<String, Arc<AtomicUsize>>>,
    published: AtomicU64,
    reconnects: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connected: AtomicBool::new(true),
            heartbeats: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        warn!("bus connection marked down");
    }

    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn heartbeat(&self, instance: &str) -> Option<Bytes> {
        self.heartbeats
            .read()
            .ok()
            .and_then(|map| map.get(instance).cloned())
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.listeners
            .read()
            .ok()
            .and_then(|map| map.get(channel).map(|n| n.load(Ordering::SeqCst)))
            .unwrap_or(0)
    }

    fn listeners_of(&self, channel: &str) -> Arc<AtomicUsize> {
        match self.listeners.write() {
            Ok(mut map) => Arc::clone(map.entry(channel.to_string()).or_default()),
            Err(_) => Arc::new(AtomicUsize::new(0)),
        }
    }

    fn ensure_connected(&self) -> BusResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        self.ensure_connected()?;
        self.published.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            channel: Arc::from(channel),
            payload,
        };
        let subscribers = self.subscriber_count(channel);
        match self.sender.send(envelope) {
            Ok(_) if subscribers > 0 => {
                debug!(%channel, receivers = subscribers, "message published");
                Ok(subscribers)
            }
            _ => {
                debug!(%channel, "message dropped (no subscribers)");
                Ok(0)
            }
        }
    }

    fn subscribe(&self, channel: &str, handler: Handler) -> BusResult<Subscription> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let mut receiver = self.sender.subscribe();
        let wanted: Arc<str> = Arc::from(channel);
        let task_channel = Arc::clone(&wanted);
        let listeners = self.listeners_of(channel);
        listeners.fetch_add(1, Ordering::SeqCst);

        let task = runtime.spawn(async move {
            loop {
                let envelope = match receiver.recv().await {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(channel = %task_channel, lagged = count, "subscriber lagged, messages dropped");
                        continue;
                    }
                };
                if envelope.channel != task_channel {
                    continue;
                }
                match BusMessage::decode(&envelope.payload) {
                    Ok(message) if message.channel() == &*task_channel => handler(message),
                    Ok(message) => {
                        warn!(
                            channel = %task_channel,
                            tag_channel = message.channel(),
                            "message published on the wrong channel, ignoring"
                        );
                    }
                    Err(e) => {
                        warn!(channel = %task_channel, error = %e, "undecodable message, ignoring");
                    }
                }
            }
        });

        debug!(%channel, "subscription created");
        Ok(Subscription {
            channel: wanted.to_string(),
            task,
            listeners,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect(&self) -> BusResult<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            info!("bus connection re-established");
        }
        Ok(())
    }

    fn record_heartbeat(&self, instance: &str, payload: Bytes) -> BusResult<()> {
        self.ensure_connected()?;
        if let Ok(mut map) = self.heartbeats.write() {
            map.insert(instance.to_string(), payload);
        }
        Ok(())
    }

    fn clear_heartbeat(&self, instance: &str) -> BusResult<bool> {
        self.ensure_connected()?;
        Ok(self
            .heartbeats
            .write()
            .map(|mut map| map.remove(instance).is_some())
            .unwrap_or(false))
    }
}
