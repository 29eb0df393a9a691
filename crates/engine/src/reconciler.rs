//! The bid reconciler.

use std::sync::Mutex;
use std::time::Duration;

use gavel_bootable::Bootable;
use gavel_locks::MutexOptions;
use gavel_store::{LeaseStore, StreamStore};
use gavel_streams::{Delivery, GroupConsumer, GroupConsumerOptions};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::bid::Bid;
use crate::repository::AuctionRepository;

/// Options for a [`Reconciler`].
#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// The consumer group all reconciler instances join.
    pub group: String,

    /// Upper bound on each blocking group read.
    pub block: Duration,

    /// Lease parameters for the strict-ordering lock.
    pub lock: MutexOptions,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            group: "reconcilers".to_string(),
            block: Duration::from_secs(1),
            lock: MutexOptions::default(),
        }
    }
}

/// Persists the highest bid per item from the bid stream.
///
/// Owns one strict-ordered group consumer, so across every instance one
/// reconciler at a time applies bids, in stream order. Application is
/// idempotent: a redelivered bid that no longer beats the stored highest
/// is simply acknowledged.
#[derive(Debug)]
pub struct Reconciler<S, R>
where
    S: StreamStore + LeaseStore,
    R: AuctionRepository,
{
    consumer: GroupConsumer<Bid, S>,
    repository: R,
    name: String,
    started: Mutex<bool>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<S, R> Reconciler<S, R>
where
    S: StreamStore + LeaseStore,
    R: AuctionRepository,
{
    /// Creates a reconciler reading `stream` as group member `instance`.
    ///
    /// # Errors
    ///
    /// Returns the group consumer's validation error when any name is
    /// empty.
    pub fn new(
        store: S,
        stream: impl Into<String>,
        instance: impl Into<String>,
        repository: R,
    ) -> Result<Self, gavel_streams::group::Error<<S as StreamStore>::Error>> {
        Self::with_options(store, stream, instance, repository, ReconcilerOptions::default())
    }

    /// Creates a reconciler with the given options.
    ///
    /// # Errors
    ///
    /// Returns the group consumer's validation error when any name is
    /// empty.
    pub fn with_options(
        store: S,
        stream: impl Into<String>,
        instance: impl Into<String>,
        repository: R,
        options: ReconcilerOptions,
    ) -> Result<Self, gavel_streams::group::Error<<S as StreamStore>::Error>> {
        let stream = stream.into();
        let instance = instance.into();
        let consumer = GroupConsumer::with_options(
            store,
            stream.clone(),
            options.group.clone(),
            instance.clone(),
            GroupConsumerOptions {
                strict_ordering: true,
                block: options.block,
                lock: options.lock,
                ..GroupConsumerOptions::default()
            },
        )?;

        Ok(Self {
            consumer,
            repository,
            name: format!("reconciler:{stream}:{instance}"),
            started: Mutex::new(false),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    async fn run(
        mut deliveries: tokio::sync::mpsc::Receiver<Delivery<Bid, S>>,
        repository: R,
        shutdown: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                () = shutdown.cancelled() => return,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    // The consumer closed the channel.
                    None => return,
                },
            };

            Self::apply(&repository, delivery).await;
        }
    }

    /// Applies one bid to the aggregate and settles the handle.
    async fn apply(repository: &R, mut delivery: Delivery<Bid, S>) {
        let bid = delivery.data().clone();

        let record = match repository.load(bid.item_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(item_id = %bid.item_id, "bid for unknown auction item");
                if let Err(err) = delivery.fail("unknown auction item").await {
                    error!(item_id = %bid.item_id, error = %err, "failed to dead-letter bid");
                }
                return;
            }
            Err(err) => {
                error!(item_id = %bid.item_id, error = %err, "failed to load auction item");
                if let Err(fail_err) = delivery.fail(&err.to_string()).await {
                    error!(item_id = %bid.item_id, error = %fail_err, "failed to dead-letter bid");
                }
                return;
            }
        };

        if bid.amount > record.current_price() {
            if let Err(err) = repository.record_highest(&bid).await {
                error!(item_id = %bid.item_id, error = %err, "failed to persist highest bid");
                if let Err(fail_err) = delivery.fail(&err.to_string()).await {
                    error!(item_id = %bid.item_id, error = %fail_err, "failed to dead-letter bid");
                }
                return;
            }
            info!(item_id = %bid.item_id, amount = bid.amount, "highest bid updated");
        } else {
            // Redelivery or a raced lower bid; applying it again would
            // regress the aggregate.
            debug!(item_id = %bid.item_id, amount = bid.amount, "bid does not beat stored highest");
        }

        if let Err(err) = delivery.done().await {
            error!(item_id = %bid.item_id, error = %err, "failed to ack bid");
        }
    }
}

#[async_trait::async_trait]
impl<S, R> Bootable for Reconciler<S, R>
where
    S: StreamStore + LeaseStore,
    R: AuctionRepository,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let started = self.started.lock().expect("started lock poisoned");
            if *started {
                return Ok(());
            }
        }

        let deliveries = self.consumer.subscribe()?;
        self.consumer.start().await?;

        let mut started = self.started.lock().expect("started lock poisoned");
        if *started {
            return Ok(());
        }

        info!(name = %self.name, "starting reconciler");
        self.tracker.spawn(Self::run(
            deliveries,
            self.repository.clone(),
            self.shutdown.clone(),
        ));
        self.tracker.close();
        *started = true;

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.consumer.shutdown().await?;
        info!(name = %self.name, "reconciler stopped");
        Ok(())
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }
}
