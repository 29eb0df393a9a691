use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

/// The opaque field map carried by a stream entry.
pub type FieldMap = BTreeMap<String, Bytes>;

/// A server-assigned stream entry identifier.
///
/// Ids are assigned at append time as millisecond timestamp plus a
/// per-millisecond sequence, so their total order is the append order.
/// The textual form is `ms-seq`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    /// Millisecond component.
    pub ms: u64,

    /// Sequence component within the millisecond.
    pub seq: u64,
}

impl EntryId {
    /// Creates an id from its two components.
    #[must_use]
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Error returned when a textual entry id does not parse.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid stream entry id: {0}")]
pub struct ParseEntryIdError(pub String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseEntryIdError(s.to_string()))?;
        let ms = ms.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

/// One appended record: a server-assigned id plus an opaque field map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    /// The entry's id.
    pub id: EntryId,

    /// The entry's fields.
    pub fields: FieldMap,
}

/// Cursor for tail reads of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailPosition {
    /// Only entries appended after the read starts.
    Latest,

    /// Entries with an id strictly greater than the given one.
    After(EntryId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_round_trip() {
        let id = EntryId::new(1_700_000_000_123, 7);
        let parsed: EntryId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_entry_id_rejects_garbage() {
        assert!("".parse::<EntryId>().is_err());
        assert!("12345".parse::<EntryId>().is_err());
        assert!("a-b".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_order_matches_append_order() {
        let earlier = EntryId::new(1000, 5);
        let same_ms = EntryId::new(1000, 6);
        let later = EntryId::new(1001, 0);
        assert!(earlier < same_ms);
        assert!(same_ms < later);
    }
}
