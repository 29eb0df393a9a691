//! Per-topic fan-out of stream messages to local subscribers.
//!
//! A [`ConnectionManager`] bridges exactly one upstream source (in
//! practice a broadcast consumer tailing the event stream) and many local
//! subscribers grouped by topic name, which is how one instance's bid
//! reaches every open event connection on every instance. Publishing goes
//! the other way: a local value is wrapped into an [`Envelope`] and handed
//! to the configured publisher so it crosses instances through the stream.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod manager;

pub use manager::{
    ConnectionManager, ConnectionManagerOptions, Error, NoPublisher, Subscription,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The cross-instance wire shape: a topic name plus the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The topic the payload is addressed to.
    pub topic: String,

    /// The payload itself.
    pub payload: T,
}

/// A source of upstream messages for a connection manager.
pub trait Subscribe<T>
where
    Self: Send + Sync,
{
    /// Hands out the source's message channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel has already been handed out or the
    /// source cannot produce one.
    fn subscribe(&self) -> Result<mpsc::Receiver<T>, Box<dyn std::error::Error + Send + Sync>>;
}

/// A sink for messages published through a connection manager.
pub trait Publish<T>
where
    Self: Send + Sync,
{
    /// Accepts one value for publication.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be accepted.
    fn publish(&self, value: &T) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<T, S, C> Subscribe<T> for gavel_streams::BroadcastConsumer<T, S, C>
where
    T: Send + Sync + 'static,
    S: gavel_store::StreamStore,
    C: gavel_streams::Codec<T>,
{
    fn subscribe(&self) -> Result<mpsc::Receiver<T>, Box<dyn std::error::Error + Send + Sync>> {
        Self::subscribe(self).map_err(Into::into)
    }
}

impl<T, S, C> Publish<T> for gavel_streams::Producer<T, S, C>
where
    T: Send + Sync + 'static,
    S: gavel_store::StreamStore,
    C: gavel_streams::Codec<T>,
{
    fn publish(&self, value: &T) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Self::publish(self, value).map_err(Into::into)
    }
}
