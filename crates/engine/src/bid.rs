use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The user placing a bid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bidder {
    /// The user's id in the relational collaborator.
    pub id: Uuid,

    /// The user's display name.
    pub name: String,
}

/// One bid as it travels the stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    /// The auction item the bid is for.
    pub item_id: Uuid,

    /// Who placed the bid.
    pub bidder: Bidder,

    /// The offered amount.
    pub amount: u64,

    /// When the ingress accepted the bid.
    pub created_at: DateTime<Utc>,
}

/// The auction aggregate as the relational collaborator sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuctionRecord {
    /// The item's id.
    pub item_id: Uuid,

    /// Price the bidding starts from.
    pub starting_price: u64,

    /// The highest reconciled bid so far.
    pub highest_bid: Option<u64>,

    /// When bidding opens.
    pub start_time: DateTime<Utc>,

    /// When bidding closes.
    pub end_time: DateTime<Utc>,
}

impl AuctionRecord {
    /// The price a new bid has to beat.
    #[must_use]
    pub const fn current_price(&self) -> u64 {
        match self.highest_bid {
            Some(amount) => amount,
            None => self.starting_price,
        }
    }
}

/// The per-item price register key.
#[must_use]
pub fn register_key(item_id: Uuid) -> String {
    format!("auction:{item_id}")
}

/// The per-item placement lock key.
#[must_use]
pub fn item_lock_key(item_id: Uuid) -> String {
    format!("auction:{item_id}:lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_conventions() {
        let id = Uuid::nil();
        assert_eq!(
            register_key(id),
            "auction:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            item_lock_key(id),
            "auction:00000000-0000-0000-0000-000000000000:lock"
        );
    }

    #[test]
    fn test_current_price_falls_back_to_starting_price() {
        let record = AuctionRecord {
            item_id: Uuid::nil(),
            starting_price: 100,
            highest_bid: None,
            start_time: Utc::now(),
            end_time: Utc::now(),
        };
        assert_eq!(record.current_price(), 100);
        let with_bid = AuctionRecord {
            highest_bid: Some(250),
            ..record
        };
        assert_eq!(with_bid.current_price(), 250);
    }
}
