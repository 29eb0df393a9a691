//! The atomic bid-placement flow.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use gavel_locks::{AutoRenewMutex, MutexOptions};
use gavel_store::{LeaseStore, Placement, PlacementStore, StoreError, ValueStore};
use gavel_streams::codec::{self, BinaryCodec, Codec};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bid::{AuctionRecord, Bid, Bidder, item_lock_key, register_key};
use crate::repository::{AuctionRepository, RepositoryError};

/// Errors that can occur while placing a bid.
#[derive(Debug, ThisError)]
pub enum Error<SE, RE>
where
    SE: StoreError,
    RE: RepositoryError,
{
    /// The caller's cancellation signal fired.
    #[error("placement cancelled")]
    Cancelled,

    /// A store operation failed.
    #[error(transparent)]
    Store(SE),

    /// The relational collaborator failed.
    #[error(transparent)]
    Repository(RE),

    /// The bid payload could not be serialized.
    #[error(transparent)]
    Codec(#[from] codec::Error),

    /// The register stayed cold even after warming it; something else keeps
    /// deleting the key faster than the flow can use it.
    #[error("price register unavailable after warm-up")]
    RegisterUnavailable,
}

/// What happened to a placement request.
///
/// Business rejections are values, not errors: the ingress maps them to
/// its response codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The bid beat the current price and is on the stream.
    Accepted(Bid),

    /// The bid did not beat the current price.
    TooLow,

    /// The auction item does not exist.
    NotFound,

    /// Bidding has not opened yet.
    NotStarted,

    /// Bidding is already over.
    Ended,
}

/// Options for a [`BidPlacement`].
#[derive(Clone, Debug)]
pub struct PlacementOptions {
    /// TTL of the per-item price register.
    pub register_ttl: Duration,

    /// Lease parameters for the per-item lock.
    pub lock: MutexOptions,
}

impl Default for PlacementOptions {
    fn default() -> Self {
        Self {
            register_ttl: Duration::from_secs(60 * 60),
            lock: MutexOptions::default(),
        }
    }
}

/// The ingress-facing placement flow.
///
/// The placement script itself is atomic; the per-item lock exists to give
/// the cold-register path a deterministic shape: warm the register from
/// the relational collaborator, then rerun the script exactly once.
#[derive(Debug)]
pub struct BidPlacement<S, R>
where
    S: PlacementStore + ValueStore + LeaseStore,
    R: AuctionRepository,
{
    store: S,
    repository: R,
    stream: String,
    codec: BinaryCodec<Bid>,
    options: PlacementOptions,
}

impl<E, S, R> BidPlacement<S, R>
where
    E: StoreError,
    S: PlacementStore<Error = E> + ValueStore<Error = E> + LeaseStore<Error = E>,
    R: AuctionRepository,
{
    /// Creates a placement flow appending accepted bids to `stream`.
    pub fn new(store: S, repository: R, stream: impl Into<String>) -> Self {
        Self::with_options(store, repository, stream, PlacementOptions::default())
    }

    /// Creates a placement flow with the given options.
    pub fn with_options(
        store: S,
        repository: R,
        stream: impl Into<String>,
        options: PlacementOptions,
    ) -> Self {
        Self {
            store,
            repository,
            stream: stream.into(),
            codec: BinaryCodec::new(),
            options,
        }
    }

    /// Places a bid of `amount` on `item_id` for `bidder`.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when `cancel` fires while waiting for the
    /// per-item lock; [`Error::Store`] / [`Error::Repository`] on collaborator
    /// failures.
    pub async fn place(
        &self,
        item_id: Uuid,
        bidder: Bidder,
        amount: u64,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error<E, R::Error>> {
        let Some(record) = self
            .repository
            .load(item_id)
            .await
            .map_err(Error::Repository)?
        else {
            return Ok(Outcome::NotFound);
        };

        let now = Utc::now();
        if now < record.start_time {
            return Ok(Outcome::NotStarted);
        }
        if now > record.end_time {
            return Ok(Outcome::Ended);
        }

        let bid = Bid {
            item_id,
            bidder,
            amount,
            created_at: now,
        };
        let payload = self.codec.encode_value(&bid)?;

        let mutex = AutoRenewMutex::with_options(
            self.store.clone(),
            item_lock_key(item_id),
            self.options.lock,
        );
        mutex.lock(cancel).await.map_err(|err| match err {
            // lock() never reports an expired lease; the arm is here for the
            // exhaustiveness check only.
            gavel_locks::Error::Cancelled | gavel_locks::Error::LeaseAlreadyExpired => {
                Error::Cancelled
            }
            gavel_locks::Error::Acquire(e) | gavel_locks::Error::Release(e) => Error::Store(e),
        })?;

        let placed = self.place_locked(&record, &bid, payload).await;

        if let Err(err) = mutex.unlock().await {
            // The work is done; a lapsed lease at this point costs nothing.
            warn!(item_id = %item_id, error = %err, "failed to release placement lock");
        }

        match placed? {
            Placement::Accepted => {
                info!(item_id = %item_id, amount, "bid accepted");
                Ok(Outcome::Accepted(bid))
            }
            Placement::TooLow => Ok(Outcome::TooLow),
            Placement::MissingRegister => Err(Error::RegisterUnavailable),
        }
    }

    /// Runs the placement script, warming the register from the relational
    /// collaborator and retrying exactly once when it is cold.
    async fn place_locked(
        &self,
        record: &AuctionRecord,
        bid: &Bid,
        payload: Bytes,
    ) -> Result<Placement, Error<E, R::Error>> {
        let register = register_key(bid.item_id);

        let first = self
            .store
            .place(
                &register,
                &self.stream,
                bid.amount,
                payload.clone(),
                self.options.register_ttl,
                None,
            )
            .await
            .map_err(Error::Store)?;

        if first != Placement::MissingRegister {
            return Ok(first);
        }

        debug!(item_id = %bid.item_id, "price register cold, warming from repository");
        let current = record.current_price();
        self.store
            .put_with_ttl(
                &register,
                Bytes::from(current.to_string()),
                self.options.register_ttl,
            )
            .await
            .map_err(Error::Store)?;

        self.store
            .place(
                &register,
                &self.stream,
                bid.amount,
                payload,
                self.options.register_ttl,
                None,
            )
            .await
            .map_err(Error::Store)
    }
}
