use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::StoreError;

/// Plain key-value access with TTLs.
///
/// Backs the per-item price register: the placement path reads and warms
/// `auction:{itemID}` through this trait when the register has gone cold.
#[async_trait]
pub trait ValueStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the store.
    type Error: StoreError;

    /// Retrieves the value at `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error>;

    /// Stores `value` at `key` with the given TTL.
    async fn put_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), Self::Error>;

    /// Deletes `key`.
    async fn del(&self, key: &str) -> Result<(), Self::Error>;
}
