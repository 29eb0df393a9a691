//! Consumer-group stream consumer.
//!
//! Each entry goes to exactly one consumer per group. With strict ordering
//! enabled, a group-wide auto-renewing mutex serialises delivery across
//! every instance, and each holder drains the group's pending entries in
//! id order before reading anything new, so entries half-handled by a
//! crashed holder are re-delivered first. Delivery at the subscriber
//! boundary is at-least-once: an entry observed but not yet acked when the
//! lease is lost will be seen again by the next holder.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use gavel_bootable::Bootable;
use gavel_locks::{AutoRenewMutex, MutexOptions};
use gavel_store::{
    EntryId, FieldMap, LeaseStore, StoreError, StreamEntry, StreamStore, dead_letter_stream,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::codec::{BinaryCodec, Codec};

/// Size of each page when scanning the pending-entries list.
const PENDING_PAGE: usize = 100;

/// Errors that can occur in a group consumer or on a delivery handle.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: StoreError,
{
    /// Stream, group, or consumer name is empty.
    #[error("stream, group and consumer cannot be empty")]
    EmptyName,

    /// The consumer is not running.
    #[error("consumer is closed")]
    Closed,

    /// The downstream channel has already been handed out.
    #[error("downstream already subscribed")]
    AlreadySubscribed,

    /// A store operation failed.
    #[error(transparent)]
    Store(E),
}

/// A delivered value plus the primitives to settle it.
///
/// `done` acknowledges the entry; `fail` quarantines it on the paired
/// dead-letter stream (original fields plus an `error` field) and then
/// acknowledges it. Both are idempotent after their first success.
#[derive(Debug)]
pub struct Delivery<T, S>
where
    S: StreamStore,
{
    value: T,
    id: EntryId,
    stream: String,
    group: String,
    raw: FieldMap,
    store: S,
    settled: bool,
}

impl<T, S> Delivery<T, S>
where
    S: StreamStore,
{
    /// The decoded value.
    pub const fn data(&self) -> &T {
        &self.value
    }

    /// The id of the underlying stream entry.
    pub const fn id(&self) -> EntryId {
        self.id
    }

    /// Acknowledges the entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the ack fails; the handle stays
    /// unsettled and may be retried.
    pub async fn done(&mut self) -> Result<(), Error<S::Error>> {
        if self.settled {
            return Ok(());
        }
        self.store
            .ack(&self.stream, &self.group, self.id)
            .await
            .map_err(Error::Store)?;
        self.settled = true;
        Ok(())
    }

    /// Moves the entry to the dead-letter stream and acknowledges it.
    ///
    /// The dead-letter entry carries the original fields augmented with an
    /// `error` field holding `reason`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when either step fails; the handle stays
    /// unsettled and may be retried.
    pub async fn fail(&mut self, reason: &str) -> Result<(), Error<S::Error>> {
        if self.settled {
            return Ok(());
        }
        let mut fields = self.raw.clone();
        fields.insert("error".to_string(), Bytes::from(reason.to_string()));
        self.store
            .append(&dead_letter_stream(&self.stream), fields)
            .await
            .map_err(Error::Store)?;
        self.store
            .ack(&self.stream, &self.group, self.id)
            .await
            .map_err(Error::Store)?;
        self.settled = true;
        Ok(())
    }
}

/// Options for a [`GroupConsumer`].
#[derive(Clone, Debug)]
pub struct GroupConsumerOptions<C> {
    /// Capacity of the downstream channel.
    pub buffer: usize,

    /// Upper bound on each blocking group read.
    pub block: Duration,

    /// Serialise delivery across all group members through a group-wide
    /// mutex, yielding total stream order while a single lease holds.
    pub strict_ordering: bool,

    /// Lease parameters for the strict-ordering mutex. Store errors during
    /// acquisition are always demoted to contention regardless of this
    /// value's `skip_lock_error`.
    pub lock: MutexOptions,

    /// The codec used to decode entries.
    pub codec: C,
}

impl<T> Default for GroupConsumerOptions<BinaryCodec<T>> {
    fn default() -> Self {
        Self {
            buffer: 1,
            block: Duration::from_secs(1),
            strict_ordering: false,
            lock: MutexOptions::default(),
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

/// Reads a stream on behalf of a named group member.
#[derive(Debug)]
pub struct GroupConsumer<T, S, C = BinaryCodec<T>>
where
    S: StreamStore + LeaseStore,
    C: Codec<T>,
{
    store: S,
    stream: String,
    group: String,
    consumer: String,
    name: String,
    options: GroupConsumerOptions<C>,
    downstream: Mutex<Option<mpsc::Receiver<Delivery<T, S>>>>,
    downstream_tx: Mutex<Option<mpsc::Sender<Delivery<T, S>>>>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    _marker: PhantomData<fn() -> T>,
}

/// Why a processing round ended.
enum RoundEnd<E> {
    /// The workload token fired: shutdown, or a lost lease in strict mode.
    Cancelled,

    /// The downstream subscriber dropped its receiver.
    Downstream,

    /// A store operation failed in a way the round cannot absorb.
    Store(E),
}

impl<T, S> GroupConsumer<T, S>
where
    T: Send + Sync + 'static,
    S: StreamStore + LeaseStore,
    BinaryCodec<T>: Codec<T>,
{
    /// Creates a consumer with the default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyName`] when any name is empty.
    pub fn new(
        store: S,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, Error<<S as StreamStore>::Error>> {
        Self::with_options(store, stream, group, consumer, GroupConsumerOptions::default())
    }
}

impl<T, S, C> GroupConsumer<T, S, C>
where
    T: Send + Sync + 'static,
    S: StreamStore + LeaseStore,
    C: Codec<T>,
{
    /// Creates a consumer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyName`] when any name is empty.
    pub fn with_options(
        store: S,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        options: GroupConsumerOptions<C>,
    ) -> Result<Self, Error<<S as StreamStore>::Error>> {
        let stream = stream.into();
        let group = group.into();
        let consumer = consumer.into();
        if stream.is_empty() || group.is_empty() || consumer.is_empty() {
            return Err(Error::EmptyName);
        }

        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        Ok(Self {
            store,
            name: format!("group-consumer:{stream}:{group}:{consumer}"),
            stream,
            group,
            consumer,
            options,
            downstream: Mutex::new(Some(rx)),
            downstream_tx: Mutex::new(Some(tx)),
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            _marker: PhantomData,
        })
    }

    /// Takes the downstream channel of delivery handles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySubscribed`] on the second call.
    pub fn subscribe(
        &self,
    ) -> Result<mpsc::Receiver<Delivery<T, S>>, Error<<S as StreamStore>::Error>> {
        self.downstream
            .lock()
            .expect("downstream lock poisoned")
            .take()
            .ok_or(Error::AlreadySubscribed)
    }

    async fn run(
        store: S,
        stream: String,
        group: String,
        consumer: String,
        options: GroupConsumerOptions<C>,
        tx: mpsc::Sender<Delivery<T, S>>,
        shutdown: CancellationToken,
    ) {
        let mutex = options.strict_ordering.then(|| {
            let lock_options = MutexOptions {
                skip_lock_error: true,
                ..options.lock
            };
            AutoRenewMutex::with_options(
                store.clone(),
                format!("lock:{stream}:{group}"),
                lock_options,
            )
        });

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // In strict mode only the lease holder reads and acks; the
            // holder token doubles as the round's workload token.
            let workload = if let Some(mutex) = &mutex {
                match mutex.lock(&shutdown).await {
                    Ok(guard) => guard,
                    Err(gavel_locks::Error::Cancelled) => break,
                    Err(err) => {
                        error!(stream, group, error = %err, "failed to acquire lock");
                        continue;
                    }
                }
            } else {
                shutdown.child_token()
            };

            let end = Self::round(
                &store,
                &stream,
                &group,
                &consumer,
                &options,
                &tx,
                &workload,
            )
            .await;

            match end {
                RoundEnd::Cancelled => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    error!(
                        stream,
                        group, "lock context cancelled, restarting group consumer"
                    );
                }
                RoundEnd::Downstream => break,
                RoundEnd::Store(err) => {
                    error!(stream, group, error = %err, "error processing messages, restarting group consumer");
                    // The lease survives a restart caused by a store error;
                    // release it so reacquisition does not wait out the TTL.
                    if let Some(mutex) = &mutex {
                        let _ = mutex.unlock().await;
                    }
                }
            }
        }

        if let Some(mutex) = &mutex {
            let _ = mutex.unlock().await;
        }
    }

    /// One processing round: in strict mode, drain pending then read new
    /// entries until the workload token fires or an unabsorbable error.
    async fn round(
        store: &S,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &GroupConsumerOptions<C>,
        tx: &mpsc::Sender<Delivery<T, S>>,
        workload: &CancellationToken,
    ) -> RoundEnd<<S as StreamStore>::Error> {
        let mut pending: VecDeque<EntryId> = VecDeque::new();
        if options.strict_ordering {
            match Self::fetch_pending(store, stream, group, workload).await {
                Ok(ids) => pending = ids,
                Err(end) => return end,
            }
        }

        loop {
            if workload.is_cancelled() {
                return RoundEnd::Cancelled;
            }

            let from_pending = pending.front().copied();
            let read = tokio::select! {
                () = workload.cancelled() => return RoundEnd::Cancelled,
                read = async {
                    match from_pending {
                        Some(id) => store.read_at(stream, id).await,
                        None => store.read_group(stream, group, consumer, options.block).await,
                    }
                } => read,
            };

            let entry = match read {
                Ok(entry) => {
                    if from_pending.is_some() {
                        pending.pop_front();
                    }
                    entry
                }
                Err(err) => {
                    // Transient transport problem; stay in the round.
                    error!(stream, group, error = %err, "fetch message error");
                    continue;
                }
            };

            let Some(entry) = entry else {
                if let Some(id) = from_pending {
                    // The entry vanished from the stream while pending
                    // (trimmed); nothing left to deliver, clear the slot.
                    warn!(stream, group, %id, "pending entry no longer in stream, acking");
                    if let Err(err) = store.ack(stream, group, id).await {
                        return RoundEnd::Store(err);
                    }
                }
                continue;
            };

            let value = match options.codec.decode(&entry.fields) {
                Ok(value) => value,
                Err(err) => {
                    error!(stream, group, id = %entry.id, error = %err, "failed to decode message");
                    if let Err(err) = Self::quarantine(store, stream, group, entry).await {
                        error!(stream, group, error = %err, "error moving message to dead letter");
                        return RoundEnd::Store(err);
                    }
                    continue;
                }
            };

            let delivery = Delivery {
                value,
                id: entry.id,
                stream: stream.to_string(),
                group: group.to_string(),
                raw: entry.fields,
                store: store.clone(),
                settled: false,
            };

            tokio::select! {
                () = workload.cancelled() => return RoundEnd::Cancelled,
                sent = tx.send(delivery) => {
                    if sent.is_err() {
                        return RoundEnd::Downstream;
                    }
                    debug!(stream, group, id = %entry.id, "message sent to downstream");
                }
            }
        }
    }

    /// Scans the whole pending-entries list in pages, in id order.
    async fn fetch_pending(
        store: &S,
        stream: &str,
        group: &str,
        workload: &CancellationToken,
    ) -> Result<VecDeque<EntryId>, RoundEnd<<S as StreamStore>::Error>> {
        let mut ids = VecDeque::new();
        let mut after = None;

        loop {
            if workload.is_cancelled() {
                return Err(RoundEnd::Cancelled);
            }
            let page = match store.pending(stream, group, after, PENDING_PAGE).await {
                Ok(page) => page,
                Err(err) => {
                    error!(stream, group, error = %err, "initial pending messages fetch failed");
                    return Err(RoundEnd::Store(err));
                }
            };
            if page.is_empty() {
                break;
            }
            after = page.last().copied();
            let last_page = page.len() < PENDING_PAGE;
            ids.extend(page);
            if last_page {
                break;
            }
        }

        info!(stream, group, count = ids.len(), "fetched all pending message ids");
        Ok(ids)
    }

    /// Publishes the raw entry to the dead-letter stream, then acks it.
    async fn quarantine(
        store: &S,
        stream: &str,
        group: &str,
        entry: StreamEntry,
    ) -> Result<(), <S as StreamStore>::Error> {
        store
            .append(&dead_letter_stream(stream), entry.fields)
            .await?;
        store.ack(stream, group, entry.id).await
    }
}

#[async_trait::async_trait]
impl<T, S, C> Bootable for GroupConsumer<T, S, C>
where
    T: Send + Sync + 'static,
    S: StreamStore + LeaseStore,
    C: Codec<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            match *lifecycle {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => {
                    return Err(Box::new(Error::<<S as StreamStore>::Error>::Closed));
                }
                Lifecycle::Idle => {}
            }
        }

        self.store
            .ensure_group(&self.stream, &self.group)
            .await
            .map_err(Error::Store)?;

        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        if *lifecycle != Lifecycle::Idle {
            return Ok(());
        }

        let tx = self
            .downstream_tx
            .lock()
            .expect("downstream lock poisoned")
            .take()
            .ok_or(Error::<<S as StreamStore>::Error>::Closed)?;

        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "starting group consumer");
        self.tracker.spawn(Self::run(
            self.store.clone(),
            self.stream.clone(),
            self.group.clone(),
            self.consumer.clone(),
            self.options.clone(),
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

        info!(stream = %self.stream, group = %self.group, "closing group consumer");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(stream = %self.stream, group = %self.group, "group consumer closed gracefully");
        Ok(())
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }
}
