//! Typed stream producer.

use std::marker::PhantomData;
use std::sync::Mutex;

use gavel_bootable::Bootable;
use gavel_store::{FieldMap, StreamStore};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::codec::{self, BinaryCodec, Codec};

/// Errors that can occur in a producer.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream name is empty.
    #[error("stream name cannot be empty")]
    EmptyStreamName,

    /// The producer is not running.
    #[error("producer is closed")]
    Closed,

    /// The value could not be encoded.
    #[error(transparent)]
    Codec(#[from] codec::Error),
}

/// Options for a [`Producer`].
#[derive(Clone, Debug)]
pub struct ProducerOptions<C> {
    /// The codec used to serialize published values.
    pub codec: C,
}

impl<T> Default for ProducerOptions<BinaryCodec<T>> {
    fn default() -> Self {
        Self {
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

/// Appends caller values to a stream without ever blocking the caller.
///
/// `publish` serializes the value and pushes it onto an unbounded
/// in-process queue; one worker drains the queue and appends to the
/// stream. A failed append is logged and the value dropped — the producer
/// promises at most one append per publish, nothing more.
#[derive(Debug)]
pub struct Producer<T, S, C = BinaryCodec<T>>
where
    S: StreamStore,
    C: Codec<T>,
{
    store: S,
    stream: String,
    name: String,
    codec: C,
    queue_tx: mpsc::UnboundedSender<FieldMap>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<FieldMap>>>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> Producer<T, S>
where
    T: Send + Sync + 'static,
    S: StreamStore,
    BinaryCodec<T>: Codec<T>,
{
    /// Creates a producer for `stream` with the default codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyStreamName`] when `stream` is empty.
    pub fn new(store: S, stream: impl Into<String>) -> Result<Self, Error> {
        Self::with_options(store, stream, ProducerOptions::default())
    }
}

impl<T, S, C> Producer<T, S, C>
where
    T: Send + Sync + 'static,
    S: StreamStore,
    C: Codec<T>,
{
    /// Creates a producer for `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyStreamName`] when `stream` is empty.
    pub fn with_options(
        store: S,
        stream: impl Into<String>,
        options: ProducerOptions<C>,
    ) -> Result<Self, Error> {
        let stream = stream.into();
        if stream.is_empty() {
            return Err(Error::EmptyStreamName);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            name: format!("producer:{stream}"),
            stream,
            codec: options.codec,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            _marker: PhantomData,
        })
    }

    /// Serializes `value` and queues it for appending.
    ///
    /// Never blocks: the queue grows as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] unless the producer is running and
    /// [`Error::Codec`] when serialization fails.
    pub fn publish(&self, value: &T) -> Result<(), Error> {
        if *self.lifecycle.lock().expect("lifecycle lock poisoned") != Lifecycle::Running {
            return Err(Error::Closed);
        }
        let fields = self.codec.encode(value)?;
        self.queue_tx.send(fields).map_err(|_| Error::Closed)
    }

    async fn run(
        store: S,
        stream: String,
        mut queue: mpsc::UnboundedReceiver<FieldMap>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                fields = queue.recv() => {
                    let Some(fields) = fields else { return };
                    match store.append(&stream, fields).await {
                        Ok(id) => debug!(stream, %id, "message published"),
                        Err(err) => error!(stream, error = %err, "publish message error"),
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, S, C> Bootable for Producer<T, S, C>
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

        let queue = self
            .queue_rx
            .lock()
            .expect("queue lock poisoned")
            .take()
            .ok_or(Error::Closed)?;

        info!(stream = %self.stream, "starting stream producer");
        self.tracker.spawn(Self::run(
            self.store.clone(),
            self.stream.clone(),
            queue,
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

        info!(stream = %self.stream, "closing stream producer");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(stream = %self.stream, "stream producer closed");
        Ok(())
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }
}
