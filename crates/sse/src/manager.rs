//! The connection manager.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use gavel_bootable::Bootable;
use thiserror::Error as ThisError;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::{Envelope, Publish, Subscribe};

/// Errors that can occur in a connection manager.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The manager has been stopped (or never started).
    #[error("connection manager is cancelled")]
    Cancelled,

    /// `publish` was called on a manager built without a publisher.
    #[error("publisher not configured")]
    PublisherNotConfigured,

    /// The upstream source failed to hand out its channel.
    #[error("subscriber error: {0}")]
    Subscriber(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The publisher rejected a value.
    #[error("publish error: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Placeholder publisher type for managers that only fan out.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPublisher;

impl<T> Publish<T> for NoPublisher {
    fn publish(&self, _value: &T) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err(Box::new(Error::PublisherNotConfigured))
    }
}

/// Options for a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ConnectionManagerOptions<P> {
    /// Capacity of each subscriber's channel.
    pub buffer: usize,

    /// Optional publisher for [`ConnectionManager::publish`].
    pub publisher: Option<P>,
}

impl Default for ConnectionManagerOptions<NoPublisher> {
    fn default() -> Self {
        Self {
            buffer: 1,
            publisher: None,
        }
    }
}

/// One local subscription to a topic.
///
/// Receives every message broadcast to the topic after the subscription
/// was created. Hand it back to
/// [`ConnectionManager::unsubscribe`] to detach cleanly; the channel is
/// also closed when the manager shuts down.
#[derive(Debug)]
pub struct Subscription<T> {
    topic: String,
    id: u64,
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// The topic this subscription is attached to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receives the next message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Fans upstream envelopes out to per-topic sets of local subscribers.
#[derive(Debug)]
pub struct ConnectionManager<T, P = NoPublisher>
where
    T: Clone + Send + Sync + 'static,
    P: Publish<Envelope<T>> + 'static,
{
    topics: std::sync::Arc<RwLock<HashMap<String, Topic<T>>>>,
    upstream: StdMutex<Option<mpsc::Receiver<Envelope<T>>>>,
    publisher: Option<P>,
    buffer: usize,
    next_id: AtomicU64,
    lifecycle: StdMutex<Lifecycle>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Debug)]
struct Topic<T> {
    senders: HashMap<u64, mpsc::Sender<T>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }
}

impl<T> ConnectionManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a fan-out-only manager over `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Subscriber`] when the source cannot hand out its
    /// channel.
    pub fn new(source: &impl Subscribe<Envelope<T>>) -> Result<Self, Error> {
        Self::with_options(source, ConnectionManagerOptions::default())
    }
}

impl<T, P> ConnectionManager<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Publish<Envelope<T>> + 'static,
{
    /// Creates a manager over `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Subscriber`] when the source cannot hand out its
    /// channel.
    pub fn with_options(
        source: &impl Subscribe<Envelope<T>>,
        options: ConnectionManagerOptions<P>,
    ) -> Result<Self, Error> {
        let upstream = source.subscribe().map_err(Error::Subscriber)?;
        Ok(Self {
            topics: std::sync::Arc::new(RwLock::new(HashMap::new())),
            upstream: StdMutex::new(Some(upstream)),
            publisher: options.publisher,
            buffer: options.buffer.max(1),
            next_id: AtomicU64::new(0),
            lifecycle: StdMutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Subscribes to `topic`, creating the topic on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the manager is not running.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<Subscription<T>, Error> {
        if !self.running() {
            return Err(Error::Cancelled);
        }

        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut topics = self.topics.write().await;
        topics.entry(topic.clone()).or_default().senders.insert(id, tx);
        debug!(topic, id, "subscriber added");

        Ok(Subscription {
            topic,
            id,
            receiver: rx,
        })
    }

    /// Detaches `subscription` and removes its topic once empty.
    pub async fn unsubscribe(&self, subscription: Subscription<T>) {
        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get_mut(&subscription.topic) {
            topic.senders.remove(&subscription.id);
            if topic.senders.is_empty() {
                topics.remove(&subscription.topic);
            }
        }
        debug!(topic = %subscription.topic, id = subscription.id, "subscriber removed");
        // Dropping the subscription closes its channel.
    }

    /// Publishes `value` to `topic` across all instances.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the manager is not running,
    /// [`Error::PublisherNotConfigured`] without a publisher, and
    /// [`Error::Publish`] when the publisher rejects the value.
    pub fn publish(&self, topic: impl Into<String>, value: T) -> Result<(), Error> {
        if !self.running() {
            return Err(Error::Cancelled);
        }
        let Some(publisher) = &self.publisher else {
            return Err(Error::PublisherNotConfigured);
        };
        publisher
            .publish(&Envelope {
                topic: topic.into(),
                payload: value,
            })
            .map_err(Error::Publish)
    }

    fn running(&self) -> bool {
        *self.lifecycle.lock().expect("lifecycle lock poisoned") == Lifecycle::Running
    }

    async fn dispatch(
        topics: std::sync::Arc<RwLock<HashMap<String, Topic<T>>>>,
        mut upstream: mpsc::Receiver<Envelope<T>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                () = shutdown.cancelled() => return,
                envelope = upstream.recv() => match envelope {
                    Some(envelope) => envelope,
                    // Upstream closed: the source has shut down.
                    None => return,
                },
            };

            debug!(topic = %envelope.topic, "received message");

            // The read lock is held across the sends: subscription changes
            // land between messages, never in the middle of a broadcast.
            let topics = topics.read().await;
            if let Some(topic) = topics.get(&envelope.topic) {
                for sender in topic.senders.values() {
                    let _ = sender.send(envelope.payload.clone()).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, P> Bootable for ConnectionManager<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Publish<Envelope<T>> + 'static,
{
    fn name(&self) -> &str {
        "connection-manager"
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(Box::new(Error::Cancelled)),
            Lifecycle::Idle => {}
        }

        let upstream = self
            .upstream
            .lock()
            .expect("upstream lock poisoned")
            .take()
            .ok_or(Error::Cancelled)?;

        info!("connection manager started");
        self.tracker.spawn(Self::dispatch(
            std::sync::Arc::clone(&self.topics),
            upstream,
            self.shutdown.clone(),
        ));
        self.tracker.close();
        *lifecycle = Lifecycle::Running;

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if *lifecycle == Lifecycle::Stopped {
                return Ok(());
            }
            *lifecycle = Lifecycle::Stopped;
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        // Closing every subscriber channel tells the event handlers the
        // stream has ended.
        let mut topics = self.topics.write().await;
        topics.clear();

        info!("connection manager stopped");
        Ok(())
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }
}
