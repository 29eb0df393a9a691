//! The relational collaborator seam.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bid::{AuctionRecord, Bid};

/// Marker trait for repository errors
pub trait RepositoryError: Debug + std::error::Error + Send + Sync + 'static {}

/// Persistence of auction aggregates.
///
/// This is the interface the core needs from the relational collaborator:
/// loading an aggregate for the placement checks and the reconciler, and
/// persisting the reconciled highest bid. The reconciler is its single
/// writer.
#[async_trait]
pub trait AuctionRepository
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the repository.
    type Error: RepositoryError;

    /// Loads the aggregate for `item_id`, or `None` when it does not exist.
    async fn load(&self, item_id: Uuid) -> Result<Option<AuctionRecord>, Self::Error>;

    /// Creates an aggregate.
    async fn create(&self, record: AuctionRecord) -> Result<(), Self::Error>;

    /// Persists `bid` as the item's highest bid.
    async fn record_highest(&self, bid: &Bid) -> Result<(), Self::Error>;
}

/// Errors that can occur in the memory repository.
#[derive(Debug, Error)]
pub enum MemoryRepositoryError {
    /// The referenced auction item does not exist.
    #[error("unknown auction item: {0}")]
    UnknownItem(Uuid),
}

impl RepositoryError for MemoryRepositoryError {}

/// In-process repository for tests and local runs.
#[derive(Clone, Debug, Default)]
pub struct MemoryAuctionRepository {
    items: Arc<Mutex<HashMap<Uuid, AuctionRecord>>>,
}

impl MemoryAuctionRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuctionRepository for MemoryAuctionRepository {
    type Error = MemoryRepositoryError;

    async fn load(&self, item_id: Uuid) -> Result<Option<AuctionRecord>, Self::Error> {
        Ok(self.items.lock().await.get(&item_id).cloned())
    }

    async fn create(&self, record: AuctionRecord) -> Result<(), Self::Error> {
        self.items.lock().await.insert(record.item_id, record);
        Ok(())
    }

    async fn record_highest(&self, bid: &Bid) -> Result<(), Self::Error> {
        let mut items = self.items.lock().await;
        let record = items
            .get_mut(&bid.item_id)
            .ok_or(MemoryRepositoryError::UnknownItem(bid.item_id))?;
        record.highest_bid = Some(bid.amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration as ChronoDuration, Utc};

    use crate::bid::Bidder;

    fn record(item_id: Uuid) -> AuctionRecord {
        AuctionRecord {
            item_id,
            starting_price: 50,
            highest_bid: None,
            start_time: Utc::now() - ChronoDuration::minutes(5),
            end_time: Utc::now() + ChronoDuration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_record_highest_updates_aggregate() {
        let repository = MemoryAuctionRepository::new();
        let item_id = Uuid::new_v4();
        repository.create(record(item_id)).await.unwrap();

        let bid = Bid {
            item_id,
            bidder: Bidder {
                id: Uuid::new_v4(),
                name: "alice".to_string(),
            },
            amount: 120,
            created_at: Utc::now(),
        };
        repository.record_highest(&bid).await.unwrap();

        let loaded = repository.load(item_id).await.unwrap().unwrap();
        assert_eq!(loaded.highest_bid, Some(120));
        assert_eq!(loaded.current_price(), 120);
    }

    #[tokio::test]
    async fn test_record_highest_for_unknown_item() {
        let repository = MemoryAuctionRepository::new();
        let bid = Bid {
            item_id: Uuid::new_v4(),
            bidder: Bidder {
                id: Uuid::new_v4(),
                name: "bob".to_string(),
            },
            amount: 10,
            created_at: Utc::now(),
        };
        assert!(matches!(
            repository.record_highest(&bid).await,
            Err(MemoryRepositoryError::UnknownItem(_))
        ));
    }
}
