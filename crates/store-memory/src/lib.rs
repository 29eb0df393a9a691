//! In-process implementation of the backing-store traits.
//!
//! `MemoryStore` keeps values, leases, and streams in maps behind a single
//! mutex and reproduces the store semantics the fabric relies on: TTLs
//! (expired lazily on access), monotonically increasing stream entry ids,
//! consumer groups with ordered pending lists, and the atomic placement
//! operation. Blocking reads wait on a per-stream watch channel bumped by
//! every append.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use gavel_store::{
    EntryId, FieldMap, LeaseStore, Placement, PlacementStore, StreamEntry, StreamStore,
    TailPosition, ValueStore,
};
use tokio::sync::{Mutex, watch};
use tokio::time::timeout_at;

/// An in-memory store implementing every backing-store trait.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, ValueCell>,
    streams: HashMap<String, StreamLog>,
}

#[derive(Debug)]
struct ValueCell {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl ValueCell {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Debug)]
struct StreamLog {
    entries: Vec<StreamEntry>,
    last_id: Option<EntryId>,
    groups: HashMap<String, Group>,
    appended: watch::Sender<u64>,
}

impl Default for StreamLog {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            last_id: None,
            groups: HashMap::new(),
            appended: watch::channel(0).0,
        }
    }
}

impl StreamLog {
    fn next_id(&self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX);
        match self.last_id {
            Some(last) if now_ms <= last.ms => EntryId::new(last.ms, last.seq + 1),
            _ => EntryId::new(now_ms, 0),
        }
    }

    fn append(&mut self, fields: FieldMap) -> EntryId {
        let id = self.next_id();
        self.entries.push(StreamEntry { id, fields });
        self.last_id = Some(id);
        self.appended.send_modify(|n| *n += 1);
        id
    }

    fn entry_after(&self, after: Option<EntryId>) -> Option<&StreamEntry> {
        match after {
            None => self.entries.first(),
            Some(id) => {
                let idx = self.entries.partition_point(|e| e.id <= id);
                self.entries.get(idx)
            }
        }
    }
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: Option<EntryId>,
    pending: BTreeMap<EntryId, String>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids currently on `stream`, in append order.
    ///
    /// Test helper; not part of any store trait.
    pub async fn entry_ids(&self, stream: &str) -> Vec<EntryId> {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .map(|log| log.entries.iter().map(|e| e.id).collect())
            .unwrap_or_default()
    }
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&ValueCell> {
        if self.values.get(key).is_some_and(|cell| !cell.live()) {
            self.values.remove(key);
        }
        self.values.get(key)
    }
}

#[async_trait]
impl ValueStore for MemoryStore {
    type Error = Error;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_value(key).map(|cell| cell.value.clone()))
    }

    async fn put_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            ValueCell {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    type Error = Error;

    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            ValueCell {
                value: Bytes::from(token.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Self::Error> {
        let mut inner = self.inner.lock().await;
        if inner
            .live_value(key)
            .is_none_or(|cell| cell.value != token.as_bytes())
        {
            return Ok(false);
        }
        if let Some(cell) = inner.values.get_mut(key) {
            cell.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, Self::Error> {
        let mut inner = self.inner.lock().await;
        if inner
            .live_value(key)
            .is_none_or(|cell| cell.value != token.as_bytes())
        {
            return Ok(false);
        }
        inner.values.remove(key);
        Ok(true)
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    type Error = Error;

    async fn append(&self, stream: &str, fields: FieldMap) -> Result<EntryId, Self::Error> {
        let mut inner = self.inner.lock().await;
        Ok(inner.streams.entry(stream.to_string()).or_default().append(fields))
    }

    async fn read_tail(
        &self,
        stream: &str,
        pos: TailPosition,
        block: Duration,
    ) -> Result<Option<StreamEntry>, Self::Error> {
        let deadline = tokio::time::Instant::now() + block;
        let mut after = None;

        loop {
            let mut rx = {
                let mut inner = self.inner.lock().await;
                let log = inner.streams.entry(stream.to_string()).or_default();
                // Resolve the cursor once, before the first wait, so only
                // entries appended after this call are observed.
                let cursor = *after.get_or_insert(match pos {
                    TailPosition::Latest => log.last_id,
                    TailPosition::After(id) => Some(id),
                });
                if let Some(entry) = log.entry_after(cursor) {
                    return Ok(Some(entry.clone()));
                }
                log.appended.subscribe()
            };

            if timeout_at(deadline, rx.changed()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        let log = inner.streams.entry(stream.to_string()).or_default();
        let tail = log.last_id;
        log.groups.entry(group.to_string()).or_insert_with(|| Group {
            last_delivered: tail,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, Self::Error> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            let mut rx = {
                let mut inner = self.inner.lock().await;
                let log = inner.streams.entry(stream.to_string()).or_default();
                let cursor = log
                    .groups
                    .get(group)
                    .and_then(|g| g.last_delivered);
                if let Some(entry) = log.entry_after(cursor).cloned() {
                    let g = log.groups.entry(group.to_string()).or_default();
                    g.last_delivered = Some(entry.id);
                    g.pending.insert(entry.id, consumer.to_string());
                    return Ok(Some(entry));
                }
                log.appended.subscribe()
            };

            if timeout_at(deadline, rx.changed()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        if let Some(g) = inner
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        {
            g.pending.remove(&id);
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<EntryId>, Self::Error> {
        let inner = self.inner.lock().await;
        let Some(g) = inner
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
        else {
            return Ok(Vec::new());
        };
        let start = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(g.pending
            .range((start, Bound::Unbounded))
            .take(count)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn read_at(&self, stream: &str, id: EntryId) -> Result<Option<StreamEntry>, Self::Error> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(stream).and_then(|log| {
            log.entries
                .binary_search_by(|e| e.id.cmp(&id))
                .ok()
                .map(|idx| log.entries[idx].clone())
        }))
    }
}

#[async_trait]
impl PlacementStore for MemoryStore {
    type Error = Error;

    async fn place(
        &self,
        register_key: &str,
        stream: &str,
        amount: u64,
        payload: Bytes,
        ttl: Duration,
        fallback: Option<u64>,
    ) -> Result<Placement, Self::Error> {
        let mut inner = self.inner.lock().await;

        let current = match inner.live_value(register_key) {
            Some(cell) => std::str::from_utf8(&cell.value)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            None => match fallback {
                Some(fallback) => fallback,
                None => return Ok(Placement::MissingRegister),
            },
        };

        if amount <= current {
            return Ok(Placement::TooLow);
        }

        inner.values.insert(
            register_key.to_string(),
            ValueCell {
                value: Bytes::from(amount.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );

        let mut fields = FieldMap::new();
        fields.insert("data".to_string(), payload);
        inner.streams.entry(stream.to_string()).or_default().append(fields);

        Ok(Placement::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(data: &str) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("data".to_string(), Bytes::from(data.to_string()));
        map
    }

    #[tokio::test]
    async fn test_value_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .put_with_ttl("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lease_acquire_conflict_and_release() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire("lock", "a", ttl).await.unwrap());
        assert!(!store.try_acquire("lock", "b", ttl).await.unwrap());

        // Wrong token neither extends nor releases.
        assert!(!store.extend("lock", "b", ttl).await.unwrap());
        assert!(!store.release("lock", "b").await.unwrap());

        assert!(store.extend("lock", "a", ttl).await.unwrap());
        assert!(store.release("lock", "a").await.unwrap());
        assert!(store.try_acquire("lock", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_expires() {
        let store = MemoryStore::new();
        assert!(
            store
                .try_acquire("lock", "a", Duration::from_millis(20))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.extend("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(store.try_acquire("lock", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.append("s", fields("1")).await.unwrap();
        let b = store.append("s", fields("2")).await.unwrap();
        let c = store.append("s", fields("3")).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_read_tail_sees_only_new_entries() {
        let store = MemoryStore::new();
        store.append("s", fields("old")).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_tail("s", TailPosition::Latest, Duration::from_secs(2))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", fields("new")).await.unwrap();

        let entry = reader.await.unwrap().expect("entry");
        assert_eq!(entry.fields.get("data"), Some(&Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_read_tail_times_out() {
        let store = MemoryStore::new();
        let got = store
            .read_tail("s", TailPosition::Latest, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_group_read_tracks_pending_until_ack() {
        let store = MemoryStore::new();
        store.ensure_group("s", "g").await.unwrap();
        store.append("s", fields("1")).await.unwrap();
        store.append("s", fields("2")).await.unwrap();

        let first = store
            .read_group("s", "g", "c1", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("first");
        let second = store
            .read_group("s", "g", "c1", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("second");
        assert!(first.id < second.id);

        let pending = store.pending("s", "g", None, 100).await.unwrap();
        assert_eq!(pending, vec![first.id, second.id]);

        store.ack("s", "g", first.id).await.unwrap();
        let pending = store.pending("s", "g", None, 100).await.unwrap();
        assert_eq!(pending, vec![second.id]);
    }

    #[tokio::test]
    async fn test_group_created_at_tail() {
        let store = MemoryStore::new();
        store.append("s", fields("before")).await.unwrap();
        store.ensure_group("s", "g").await.unwrap();

        let got = store
            .read_group("s", "g", "c1", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(got.is_none(), "group must not see entries before creation");
    }

    #[tokio::test]
    async fn test_pending_pages_do_not_overlap() {
        let store = MemoryStore::new();
        store.ensure_group("s", "g").await.unwrap();
        for i in 0..5 {
            store.append("s", fields(&i.to_string())).await.unwrap();
            store
                .read_group("s", "g", "c1", Duration::from_millis(50))
                .await
                .unwrap();
        }

        let first = store.pending("s", "g", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = store
            .pending("s", "g", Some(first[1]), 2)
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert!(first[1] < second[0]);
    }

    #[tokio::test]
    async fn test_read_at_exact_id() {
        let store = MemoryStore::new();
        let id = store.append("s", fields("x")).await.unwrap();
        let entry = store.read_at("s", id).await.unwrap().expect("entry");
        assert_eq!(entry.id, id);
        assert!(
            store
                .read_at("s", EntryId::new(id.ms + 10, 0))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_place_with_fallback_warms_register() {
        let store = MemoryStore::new();
        let got = store
            .place(
                "auction:1",
                "bids",
                200,
                Bytes::from_static(b"payload"),
                Duration::from_secs(60),
                Some(0),
            )
            .await
            .unwrap();
        assert_eq!(got, Placement::Accepted);
        assert_eq!(
            store.get("auction:1").await.unwrap(),
            Some(Bytes::from_static(b"200"))
        );
        assert_eq!(store.entry_ids("bids").await.len(), 1);
    }

    #[tokio::test]
    async fn test_place_too_low_writes_nothing() {
        let store = MemoryStore::new();
        store
            .put_with_ttl("auction:1", Bytes::from_static(b"200"), Duration::from_secs(60))
            .await
            .unwrap();

        let got = store
            .place(
                "auction:1",
                "bids",
                150,
                Bytes::from_static(b"payload"),
                Duration::from_secs(60),
                None,
            )
            .await
            .unwrap();
        assert_eq!(got, Placement::TooLow);
        assert_eq!(
            store.get("auction:1").await.unwrap(),
            Some(Bytes::from_static(b"200"))
        );
        assert!(store.entry_ids("bids").await.is_empty());
    }

    #[tokio::test]
    async fn test_place_missing_register_without_fallback() {
        let store = MemoryStore::new();
        let got = store
            .place(
                "auction:1",
                "bids",
                200,
                Bytes::from_static(b"payload"),
                Duration::from_secs(60),
                None,
            )
            .await
            .unwrap();
        assert_eq!(got, Placement::MissingRegister);
        assert!(store.entry_ids("bids").await.is_empty());
    }
}
