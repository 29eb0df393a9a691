//! Bid placement and reconciliation.
//!
//! [`placement::BidPlacement`] is the ingress-facing hot path: business
//! window checks, the per-item auto-renewing lock, and the atomic
//! placement script, including the cold-register warm-up-and-retry-once
//! path. [`reconciler::Reconciler`] sits on the other end of the bid
//! stream and is the single writer of the authoritative highest-bid state
//! in the relational collaborator; the per-item price register is only an
//! ephemeral cache for the hot path.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bid;
pub mod placement;
pub mod reconciler;
pub mod repository;

pub use bid::{AuctionRecord, Bid, Bidder, item_lock_key, register_key};
pub use placement::{BidPlacement, Outcome, PlacementOptions};
pub use reconciler::{Reconciler, ReconcilerOptions};
pub use repository::{AuctionRepository, MemoryAuctionRepository, RepositoryError};
