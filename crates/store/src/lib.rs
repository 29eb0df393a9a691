//! Abstract interface to the shared backing store.
//!
//! The bidding fabric needs four things from its store: token-guarded
//! leases, TTL'd value registers, append-only streams with consumer
//! groups, and one atomic bid-placement operation. Each is a separate
//! trait so components can bound exactly what they use; a single backend
//! typically implements all of them.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod entry;
mod lease;
mod placement;
mod stream;
mod value;

pub use entry::{EntryId, FieldMap, ParseEntryIdError, StreamEntry, TailPosition};
pub use lease::LeaseStore;
pub use placement::{Placement, PlacementStore};
pub use stream::{StreamStore, dead_letter_stream};
pub use value::ValueStore;

use std::error::Error;
use std::fmt::Debug;

/// Marker trait for store errors
pub trait StoreError: Debug + Error + Send + Sync + 'static {}
