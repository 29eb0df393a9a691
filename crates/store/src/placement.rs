use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::StoreError;

/// Result of the atomic bid-placement operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The bid beat the register's value; the register was updated and the
    /// bid appended to the stream.
    Accepted,

    /// The bid did not beat the register's value; nothing was written.
    TooLow,

    /// The register key was absent and no fallback was supplied; nothing
    /// was written. The caller is expected to warm the register and retry
    /// once.
    MissingRegister,
}

/// The atomic bid-placement operation.
///
/// Runs server-side as a single script so the register check, the register
/// update, and the stream append cannot interleave with a concurrent
/// placement.
#[async_trait]
pub trait PlacementStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the store.
    type Error: StoreError;

    /// Places `amount` against the price register at `register_key`.
    ///
    /// When the register is absent, `fallback` (the item's starting price)
    /// stands in for its value; without a fallback the operation reports
    /// [`Placement::MissingRegister`]. On acceptance the register is set to
    /// `amount` with `ttl` and an entry `{data: payload}` is appended to
    /// `stream`.
    async fn place(
        &self,
        register_key: &str,
        stream: &str,
        amount: u64,
        payload: Bytes,
        ttl: Duration,
        fallback: Option<u64>,
    ) -> Result<Placement, Self::Error>;
}
