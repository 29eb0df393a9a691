use std::time::Duration;

use async_trait::async_trait;

use crate::StoreError;

/// Token-guarded lease primitives over named keys.
///
/// A lease is a key holding a per-acquisition random token with a TTL.
/// Every mutating operation compares the stored token first, so a holder
/// whose lease has been taken over can neither extend nor release the new
/// holder's lease. `Ok(false)` means the comparison failed (the key was
/// absent or held a different token); transport problems are `Err`.
#[async_trait]
pub trait LeaseStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the store.
    type Error: StoreError;

    /// Writes `token` under `key` with the given TTL if the key is absent.
    ///
    /// Returns `Ok(true)` when the lease was acquired, `Ok(false)` when it
    /// is already held.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, Self::Error>;

    /// Resets the TTL of `key` to `ttl` if it still holds `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Self::Error>;

    /// Deletes `key` if it still holds `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, Self::Error>;
}
