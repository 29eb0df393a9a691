//! Redis implementation of the backing-store traits.
//!
//! Leases are `SET NX PX` plus token-compare scripts for extend and
//! release; streams map straight onto the stream command family; the
//! placement operation is a single server-side script, so the register
//! check, the register update, and the stream append are atomic.
//!
//! Non-blocking commands share one auto-reconnecting connection. Blocking
//! reads (`XREAD BLOCK`, `XREADGROUP BLOCK`) would stall everything else
//! multiplexed onto that connection, so they run on dedicated connections
//! opened per call.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gavel_store::{
    EntryId, FieldMap, LeaseStore, Placement, PlacementStore, StreamEntry, StreamStore,
    TailPosition, ValueStore,
};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply, StreamRangeReply};
use redis::{AsyncCommands, Script};
use tracing::debug;

/// Resets the TTL of KEYS[1] when it still holds the caller's token.
const EXTEND_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";

/// Deletes KEYS[1] when it still holds the caller's token.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// The atomic bid placement described in the fabric's placement contract.
///
/// KEYS[1] - price register, KEYS[2] - bid stream.
/// ARGV[1] - new bid, ARGV[2] - serialized bid payload,
/// ARGV[3] - register TTL in seconds, ARGV[4] - fallback price ('' = none).
///
/// Returns 1 (accepted), 0 (too low), -1 (register absent, no fallback).
const PLACE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    if ARGV[4] == '' then
        return -1
    end
    current = ARGV[4]
end
local new_bid = tonumber(ARGV[1])
if new_bid <= (tonumber(current) or 0) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
redis.call('XADD', KEYS[2], '*', 'data', ARGV[2])
return 1
";

/// A Redis-backed store implementing every backing-store trait.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
}

struct Scripts {
    extend: Script,
    release: Script,
    place: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Creates a store over an already-opened client.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial connection cannot be established.
    pub async fn new(client: redis::Client) -> Result<Self, Error> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            scripts: std::sync::Arc::new(Scripts {
                extend: Script::new(EXTEND_SCRIPT),
                release: Script::new(RELEASE_SCRIPT),
                place: Script::new(PLACE_SCRIPT),
            }),
        })
    }

    /// Creates a store from a `redis://` connection URL.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is invalid or the initial connection
    /// cannot be established.
    pub async fn from_url(url: &str) -> Result<Self, Error> {
        Self::new(redis::Client::open(url)?).await
    }

    /// Opens a dedicated connection for a blocking read.
    async fn blocking_conn(&self) -> Result<MultiplexedConnection, Error> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn first_entry(reply: Option<StreamReadReply>) -> Result<Option<StreamEntry>, Error> {
        let Some(reply) = reply else {
            return Ok(None);
        };
        let Some(id) = reply.keys.into_iter().flat_map(|key| key.ids).next() else {
            return Ok(None);
        };
        entry_from_stream_id(id).map(Some)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn entry_from_stream_id(raw: StreamId) -> Result<StreamEntry, Error> {
    let id: EntryId = raw.id.parse()?;
    let mut fields = FieldMap::new();
    for (name, value) in raw.map {
        let bytes: Vec<u8> = redis::from_redis_value(&value)?;
        fields.insert(name, Bytes::from(bytes));
    }
    Ok(StreamEntry { id, fields })
}

fn raw_fields(fields: &FieldMap) -> BTreeMap<&str, &[u8]> {
    fields
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_ref()))
        .collect()
}

#[async_trait]
impl LeaseStore for RedisStore {
    type Error = Error;

    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .scripts
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}

#[async_trait]
impl ValueStore for RedisStore {
    type Error = Error;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn put_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    type Error = Error;

    async fn append(&self, stream: &str, fields: FieldMap) -> Result<EntryId, Self::Error> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd_map(stream, "*", raw_fields(&fields)).await?;
        debug!(stream, id, "appended entry");
        Ok(id.parse()?)
    }

    async fn read_tail(
        &self,
        stream: &str,
        pos: TailPosition,
        block: Duration,
    ) -> Result<Option<StreamEntry>, Self::Error> {
        let cursor = match pos {
            TailPosition::Latest => "$".to_string(),
            TailPosition::After(id) => id.to_string(),
        };
        let options = StreamReadOptions::default()
            .count(1)
            .block(usize::try_from(millis(block)).unwrap_or(usize::MAX));

        let mut conn = self.blocking_conn().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[cursor.as_str()], &options)
            .await?;
        Self::first_entry(reply)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, Self::Error> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(usize::try_from(millis(block)).unwrap_or(usize::MAX));

        let mut conn = self.blocking_conn().await?;
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;
        Self::first_entry(reply)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id.to_string()]).await?;
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<EntryId>, Self::Error> {
        // Exclusive continuation so consecutive pages never overlap.
        let start = after.map_or_else(|| "-".to_string(), |id| format!("({id}"));

        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamPendingCountReply = conn
            .xpending_count(stream, group, start, "+", count)
            .await?;
        reply
            .ids
            .into_iter()
            .map(|pending| pending.id.parse().map_err(Error::from))
            .collect()
    }

    async fn read_at(&self, stream: &str, id: EntryId) -> Result<Option<StreamEntry>, Self::Error> {
        let target = id.to_string();
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, target.as_str(), target.as_str(), 1)
            .await?;
        reply.ids.into_iter().next().map(entry_from_stream_id).transpose()
    }
}

#[async_trait]
impl PlacementStore for RedisStore {
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
        let fallback = fallback.map_or_else(String::new, |price| price.to_string());

        let mut conn = self.conn.clone();
        let verdict: i64 = self
            .scripts
            .place
            .key(register_key)
            .key(stream)
            .arg(amount)
            .arg(payload.as_ref())
            .arg(ttl.as_secs().max(1))
            .arg(fallback)
            .invoke_async(&mut conn)
            .await?;

        match verdict {
            1 => Ok(Placement::Accepted),
            0 => Ok(Placement::TooLow),
            -1 => Ok(Placement::MissingRegister),
            other => Err(Error::UnexpectedReply(format!(
                "placement script returned {other}"
            ))),
        }
    }
}
