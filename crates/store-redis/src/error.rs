use gavel_store::{ParseEntryIdError, StoreError};
use thiserror::Error;

/// Errors that can occur in the Redis store.
#[derive(Debug, Error)]
pub enum Error {
    /// An error returned by the Redis client or server.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// A stream entry id returned by the server did not parse.
    #[error(transparent)]
    EntryId(#[from] ParseEntryIdError),

    /// The server replied with a shape the store does not understand.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl StoreError for Error {}
