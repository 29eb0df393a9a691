//! Broadcast (fan-out) stream consumer.

use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::Duration;

use gavel_bootable::Bootable;
use gavel_store::{StreamStore, TailPosition};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::codec::{BinaryCodec, Codec};

/// Errors that can occur in a broadcast consumer.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream name is empty.
    #[error("stream name cannot be empty")]
    EmptyStreamName,

    /// The consumer is not running.
    #[error("consumer is closed")]
    Closed,

    /// The downstream channel has already been handed out.
    #[error("downstream already subscribed")]
    AlreadySubscribed,
}

/// Options for a [`BroadcastConsumer`].
#[derive(Clone, Debug)]
pub struct BroadcastConsumerOptions<C> {
    /// Capacity of the downstream channel.
    pub buffer: usize,

    /// Upper bound on each blocking tail read.
    pub block: Duration,

    /// The codec used to decode entries.
    pub codec: C,
}

impl<T> Default for BroadcastConsumerOptions<BinaryCodec<T>> {
    fn default() -> Self {
        Self {
            buffer: 100,
            block: Duration::from_secs(1),
            codec: BinaryCodec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Tails a stream and delivers every entry to one local subscriber.
///
/// The cursor starts at the logical new-only position, so only entries
/// appended after `start` are observed. Every instance of the service runs
/// its own broadcast consumer, which is how one appended entry reaches all
/// of them; fanning out to many local subscribers is the connection
/// manager's job, not this one's.
#[derive(Debug)]
pub struct BroadcastConsumer<T, S, C = BinaryCodec<T>>
where
    S: StreamStore,
    C: Codec<T>,
{
    store: S,
    stream: String,
    name: String,
    codec: C,
    block: Duration,
    downstream: Mutex<Option<mpsc::Receiver<T>>>,
    downstream_tx: Mutex<Option<mpsc::Sender<T>>>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> BroadcastConsumer<T, S>
where
    T: Send + Sync + 'static,
    S: StreamStore,
    BinaryCodec<T>: Codec<T>,
{
    /// Creates a consumer for `stream` with the default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyStreamName`] when `stream` is empty.
    pub fn new(store: S, stream: impl Into<String>) -> Result<Self, Error> {
        Self::with_options(store, stream, BroadcastConsumerOptions::default())
    }
}

impl<T, S, C> BroadcastConsumer<T, S, C>
where
    T: Send + Sync + 'static,
    S: StreamStore,
    C: Codec<T>,
{
    /// Creates a consumer for `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyStreamName`] when `stream` is empty.
    pub fn with_options(
        store: S,
        stream: impl Into<String>,
        options: BroadcastConsumerOptions<C>,
    ) -> Result<Self, Error> {
        let stream = stream.into();
        if stream.is_empty() {
            return Err(Error::EmptyStreamName);
        }

        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        Ok(Self {
            store,
            name: format!("broadcast-consumer:{stream}"),
            stream,
            codec: options.codec,
            block: options.block,
            downstream: Mutex::new(Some(rx)),
            downstream_tx: Mutex::new(Some(tx)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            _marker: PhantomData,
        })
    }

    /// Takes the downstream channel. Each consumer hands it out once.
    ///
    /// The channel is closed when the consumer shuts down, so subscribers
    /// observe end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySubscribed`] on the second call.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<T>, Error> {
        self.downstream
            .lock()
            .expect("downstream lock poisoned")
            .take()
            .ok_or(Error::AlreadySubscribed)
    }

    async fn run(
        store: S,
        stream: String,
        codec: C,
        block: Duration,
        tx: mpsc::Sender<T>,
        shutdown: CancellationToken,
    ) {
        let mut pos = TailPosition::Latest;

        loop {
            let read = tokio::select! {
                () = shutdown.cancelled() => return,
                read = store.read_tail(&stream, pos, block) => read,
            };

            let entry = match read {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    error!(stream, error = %err, "fetch message error");
                    continue;
                }
            };

            pos = TailPosition::After(entry.id);
            debug!(stream, id = %entry.id, "received message");

            let value = match codec.decode(&entry.fields) {
                Ok(value) => value,
                Err(err) => {
                    error!(stream, id = %entry.id, error = %err, "failed to decode message");
                    continue;
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => return,
                sent = tx.send(value) => {
                    if sent.is_err() {
                        // Subscriber dropped its receiver.
                        return;
                    }
                    debug!(stream, id = %entry.id, "message sent to downstream");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, S, C> Bootable for BroadcastConsumer<T, S, C>
where
    T: Send + Sync + 'static,
    S: StreamStore,
    C: Codec<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(Box::new(Error::Closed)),
            Lifecycle::Idle => {}
        }

        let tx = self
            .downstream_tx
            .lock()
            .expect("downstream lock poisoned")
            .take()
            .ok_or(Error::Closed)?;

        info!(stream = %self.stream, "starting stream consumer");
        self.tracker.spawn(Self::run(
            self.store.clone(),
            self.stream.clone(),
            self.codec.clone(),
            self.block,
            tx,
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

        info!(stream = %self.stream, "closing stream consumer");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(stream = %self.stream, "stream consumer closed");
        Ok(())
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use gavel_store::FieldMap;
    use gavel_store_memory::MemoryStore;
    use serde::{Deserialize, Serialize};
    use tokio::time::timeout;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct TestMessage {
        content: String,
    }

    async fn append(store: &MemoryStore, stream: &str, content: &str) {
        let codec = BinaryCodec::<TestMessage>::new();
        let fields = codec
            .encode(&TestMessage {
                content: content.to_string(),
            })
            .unwrap();
        gavel_store::StreamStore::append(store, stream, fields)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delivers_new_entries_in_order() {
        let store = MemoryStore::new();
        append(&store, "events", "before-start").await;

        let consumer = BroadcastConsumer::<TestMessage, _>::new(store.clone(), "events").unwrap();
        let mut rx = consumer.subscribe().unwrap();
        consumer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        append(&store, "events", "one").await;
        append(&store, "events", "two").await;

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.content, "one", "entries before start must be skipped");
        assert_eq!(second.content, "two");

        consumer.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none(), "downstream must close on shutdown");
    }

    #[tokio::test]
    async fn test_decode_failure_is_skipped() {
        let store = MemoryStore::new();
        let consumer = BroadcastConsumer::<TestMessage, _>::new(store.clone(), "events").unwrap();
        let mut rx = consumer.subscribe().unwrap();
        consumer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut poisoned = FieldMap::new();
        poisoned.insert("data".to_string(), Bytes::from_static(b"!!garbage!!"));
        gavel_store::StreamStore::append(&store, "events", poisoned)
            .await
            .unwrap();
        append(&store, "events", "good").await;

        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.content, "good");

        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_only_once() {
        let store = MemoryStore::new();
        let consumer = BroadcastConsumer::<TestMessage, _>::new(store, "events").unwrap();
        let _rx = consumer.subscribe().unwrap();
        assert!(matches!(
            consumer.subscribe(),
            Err(Error::AlreadySubscribed)
        ));
    }
}
