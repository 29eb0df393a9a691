use gavel_store::StoreError;
use thiserror::Error;

/// Errors that can occur while locking or unlocking.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: StoreError,
{
    /// The caller's cancellation signal fired while waiting for the lock.
    #[error("lock acquisition cancelled")]
    Cancelled,

    /// The stored token no longer matches the holder's token; the lease has
    /// expired or been taken over, and the store was left untouched.
    #[error("lease already expired")]
    LeaseAlreadyExpired,

    /// A store error occurred while acquiring the lock.
    #[error("failed to acquire lock: {0}")]
    Acquire(#[source] E),

    /// A store error occurred while releasing the lock.
    #[error("failed to release lock: {0}")]
    Release(#[source] E),
}
