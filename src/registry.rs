use crate::transport::{FrameWriter, TransportError};
use heapless::FnvIndexSet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Topics one subscriber may filter on. Must stay a power of two.
pub const MAX_TOPICS_PER_SUBSCRIBER: usize = 32;

pub type SubscriberId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("subscriber limit of {max} reached")]
    Full { max: usize },
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),
    #[error("topic filter full, cannot add topic {topic}")]
    FilterFull { topic: u16 },
}

/// Set of topic ids a subscriber wants. An empty filter matches everything.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    topics: FnvIndexSet<u16, MAX_TOPICS_PER_SUBSCRIBER>,
}

impl TopicFilter {
    pub fn new() -> Self {
        Self {
            topics: FnvIndexSet::new(),
        }
    }

    pub fn matches(&self, topic_id: u16) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic_id)
    }

    pub fn contains(&self, topic_id: u16) -> bool {
        self.topics.contains(&topic_id)
    }

    /// Adding a topic that is already present is a no-op.
    pub fn insert(&mut self, topic_id: u16) -> Result<(), RegistryError> {
        if self.topics.contains(&topic_id) {
            return Ok(());
        }
        self.topics
            .insert(topic_id)
            .map(|_| ())
            .map_err(|topic| RegistryError::FilterFull { topic })
    }

    /// Returns whether the topic was present.
    pub fn remove(&mut self, topic_id: u16) -> bool {
        self.topics.remove(&topic_id)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn to_vec(&self) -> Vec<u16> {
        let mut topics: Vec<u16> = self.topics.iter().copied().collect();
        topics.sort_unstable();
        topics
    }
}

impl Default for TopicFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap clone of a subscriber's sending side, handed out for fan-out.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    sink: Arc<AsyncMutex<FrameWriter>>,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.sink.lock().await.send(payload).await
    }
}

/// What a freshly registered connection's handler needs.
#[derive(Debug)]
pub struct Registration {
    pub handle: SubscriberHandle,
    /// Flips to `true` (or closes) when the handler must stop.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriberId,
    sink: Arc<AsyncMutex<FrameWriter>>,
    topics: TopicFilter,
    active: bool,
    shutdown: watch::Sender<bool>,
    handler: Option<JoinHandle<()>>,
}

impl Subscriber {
    fn handle(&self) -> SubscriberHandle {
        SubscriberHandle {
            id: self.id,
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Live subscribers keyed by id.
///
/// One mutex guards the whole collection; it is only held for map lookups
/// and mutation, never across socket I/O.
#[derive(Debug)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    max_subscribers: usize,
}

impl SubscriberRegistry {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            max_subscribers,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_subscribers
    }

    /// Takes ownership of the sending side of a new connection. Only active
    /// subscribers count against the limit; one already dropped from fan-out
    /// is on its way out and does not hold a slot.
    pub fn register(&self, writer: FrameWriter) -> Result<Registration, RegistryError> {
        let mut subscribers = self.subscribers.lock();
        if subscribers.values().filter(|s| s.active).count() >= self.max_subscribers {
            return Err(RegistryError::Full {
                max: self.max_subscribers,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscriber = Subscriber {
            id,
            sink: Arc::new(AsyncMutex::new(writer)),
            topics: TopicFilter::new(),
            active: true,
            shutdown: shutdown_tx,
            handler: None,
        };
        let handle = subscriber.handle();
        subscribers.insert(id, subscriber);

        debug!(subscriber = id, total = subscribers.len(), "subscriber registered");

        Ok(Registration {
            handle,
            shutdown: shutdown_rx,
        })
    }

    /// Records the task running the subscriber's receive loop so shutdown can
    /// join it.
    pub fn attach_handler(&self, id: SubscriberId, handler: JoinHandle<()>) {
        let orphan = {
            let mut subscribers = self.subscribers.lock();
            if let Some(subscriber) = subscribers.get_mut(&id) {
                subscriber.handler = Some(handler);
                None
            } else {
                Some(handler)
            }
        };
        if let Some(handler) = orphan {
            self.retire(handler);
        }
    }

    /// Active subscribers whose filter matches `topic_id`.
    pub fn by_topic(&self, topic_id: u16) -> Vec<SubscriberHandle> {
        self.subscribers
            .lock()
            .values()
            .filter(|s| s.active && s.topics.matches(topic_id))
            .map(Subscriber::handle)
            .collect()
    }

    pub fn add_topic(&self, id: SubscriberId, topic_id: u16) -> Result<(), RegistryError> {
        let mut subscribers = self.subscribers.lock();
        let subscriber = subscribers
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSubscriber(id))?;
        subscriber.topics.insert(topic_id)
    }

    /// Removing a topic that was never added succeeds.
    pub fn remove_topic(&self, id: SubscriberId, topic_id: u16) -> Result<(), RegistryError> {
        let mut subscribers = self.subscribers.lock();
        let subscriber = subscribers
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSubscriber(id))?;
        subscriber.topics.remove(topic_id);
        Ok(())
    }

    /// Whether `topic_id` is explicitly in the subscriber's filter.
    pub fn has_topic(&self, id: SubscriberId, topic_id: u16) -> bool {
        self.subscribers
            .lock()
            .get(&id)
            .is_some_and(|s| s.topics.contains(topic_id))
    }

    pub fn topics(&self, id: SubscriberId) -> Option<Vec<u16>> {
        self.subscribers.lock().get(&id).map(|s| s.topics.to_vec())
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().contains_key(&id)
    }

    pub fn is_active(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().get(&id).is_some_and(|s| s.active)
    }

    /// Hides the subscriber from fan-out and tells its handler to stop. The
    /// handler then deregisters it.
    pub fn mark_inactive(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(subscriber) = subscribers.get_mut(&id) else {
            return false;
        };
        subscriber.active = false;
        let _ = subscriber.shutdown.send(true);
        true
    }

    /// Removes the subscriber, signals its handler and closes its transport.
    /// Returns `false` if it was already gone.
    pub async fn deregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id);
        let Some(mut subscriber) = removed else {
            return false;
        };

        subscriber.active = false;
        let _ = subscriber.shutdown.send(true);
        if let Some(handler) = subscriber.handler.take() {
            self.retire(handler);
        }

        if let Err(e) = subscriber.sink.lock().await.close().await {
            debug!(subscriber = id, error = %e, "close after deregister failed");
        }

        debug!(subscriber = id, "subscriber deregistered");
        true
    }

    /// Deregisters every subscriber and waits for all handler tasks.
    pub async fn shutdown(&self) {
        let drained: Vec<Subscriber> = self.subscribers.lock().drain().map(|(_, s)| s).collect();

        let mut handlers = Vec::with_capacity(drained.len());
        for mut subscriber in drained {
            let _ = subscriber.shutdown.send(true);
            if let Some(handler) = subscriber.handler.take() {
                handlers.push(handler);
            }
            let _ = subscriber.sink.lock().await.close().await;
        }
        handlers.append(&mut self.retired.lock());

        for handler in handlers {
            if let Err(e) = handler.await {
                if e.is_panic() {
                    warn!(error = %e, "subscriber handler panicked");
                }
            }
        }
    }

    /// Registered entries, including ones marked inactive but not yet
    /// deregistered.
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn active_len(&self) -> usize {
        self.subscribers.lock().values().filter(|s| s.active).count()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Number of active subscribers a packet on `topic_id` would reach.
    pub fn subscribers_for_topic(&self, topic_id: u16) -> usize {
        self.subscribers
            .lock()
            .values()
            .filter(|s| s.active && s.topics.matches(topic_id))
            .count()
    }

    fn retire(&self, handler: JoinHandle<()>) {
        let mut retired = self.retired.lock();
        retired.retain(|h| !h.is_finished());
        retired.push(handler);
    }
}
