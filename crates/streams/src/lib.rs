//! Typed stream components of the bidding fabric.
//!
//! A [`producer::Producer`] turns caller values into stream entries, a
//! [`broadcast::BroadcastConsumer`] delivers every entry to its local
//! subscriber on each instance, and a [`group::GroupConsumer`] delivers
//! each entry to exactly one member of a named group, with optional strict
//! global ordering, pending recovery, and dead-letter quarantine. All three
//! are generic over the value type and a [`codec::Codec`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod broadcast;
pub mod codec;
pub mod group;
pub mod producer;

pub use broadcast::{BroadcastConsumer, BroadcastConsumerOptions};
pub use codec::{BinaryCodec, Codec, DATA_FIELD};
pub use group::{Delivery, GroupConsumer, GroupConsumerOptions};
pub use producer::{Producer, ProducerOptions};
