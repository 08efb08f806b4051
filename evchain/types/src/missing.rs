use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::EventId;

/// Bookkeeping record for an event the chain has admitted but whose payload
/// this replica does not yet hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingEvent {
    pub event_id: EventId,
    pub received_time: DateTime<Utc>,
    pub block_height: i64,
    pub last_retry_time: DateTime<Utc>,
    pub retried_unicast: bool,
    pub retry_count: u32,
}

impl MissingEvent {
    pub fn new(event_id: EventId, received_time: DateTime<Utc>, block_height: i64) -> Self {
        MissingEvent {
            event_id,
            received_time,
            block_height,
            // Never retried; any retry interval has trivially elapsed.
            last_retry_time: DateTime::UNIX_EPOCH,
            retried_unicast: false,
            retry_count: 0,
        }
    }
}

/// Half-open block interval `[low, high)` known to contain unseen blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub low: i64,
    pub high: i64,
}

impl BlockRange {
    pub fn new(low: i64, high: i64) -> Self {
        BlockRange { low, high }
    }

    pub fn len(&self) -> i64 {
        (self.high - self.low).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_half_open() {
        let range = BlockRange::new(3, 7);
        assert_eq!(range.len(), 4);
        assert!(!range.is_empty());
        assert!(BlockRange::new(5, 5).is_empty());
    }
}
