use std::time::Duration;

use async_trait::async_trait;

use crate::StoreError;
use crate::entry::{EntryId, FieldMap, StreamEntry, TailPosition};

/// Returns the name of the dead-letter stream paired with `stream`.
#[must_use]
pub fn dead_letter_stream(stream: &str) -> String {
    format!("{stream}:dead-letter")
}

/// Append-only stream operations, including consumer groups.
///
/// Blocking reads are bounded by the caller's block timeout and return
/// `Ok(None)` when it elapses without data, so worker loops stay
/// responsive to shutdown.
#[async_trait]
pub trait StreamStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the store.
    type Error: StoreError;

    /// Appends an entry and returns its server-assigned id.
    async fn append(&self, stream: &str, fields: FieldMap) -> Result<EntryId, Self::Error>;

    /// Reads the next entry after `pos`, blocking up to `block`.
    async fn read_tail(
        &self,
        stream: &str,
        pos: TailPosition,
        block: Duration,
    ) -> Result<Option<StreamEntry>, Self::Error>;

    /// Creates `group` on `stream` at the tail if it does not exist yet.
    ///
    /// Creating the stream as a side effect is allowed; calling this for an
    /// existing group is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Self::Error>;

    /// Reads one new entry on behalf of `consumer` in `group`, blocking up
    /// to `block`.
    ///
    /// The entry becomes pending for `consumer` until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, Self::Error>;

    /// Acknowledges `id` for `group`, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), Self::Error>;

    /// Returns one page of the group's pending entry ids in id order.
    ///
    /// `after` is an exclusive continuation cursor; `None` starts from the
    /// beginning. A page shorter than `count` is the last page.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<EntryId>, Self::Error>;

    /// Reads the entry at exactly `id`, or `None` when it does not exist.
    async fn read_at(&self, stream: &str, id: EntryId) -> Result<Option<StreamEntry>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_stream_name() {
        assert_eq!(dead_letter_stream("bids"), "bids:dead-letter");
    }
}
