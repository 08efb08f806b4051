use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use thiserror::Error;

use evchain_types::{BlockRange, EventId, MissingEvent};

const KEY_LAST_SEEN_BLOCK_HEIGHT: &[u8] = b"last_seen_block_height";
const KEY_MISSING_BLOCKS_COUNTER: &[u8] = b"id_counter_missing_blocks";
const PREFIX_MISSING_BLOCKS: &[u8] = b"missing_blocks_";
const KEY_MISSING_EVENTS_COUNTER: &[u8] = b"id_counter_missing_events";
const PREFIX_MISSING_EVENTS: &[u8] = b"missing_events_";
const PREFIX_MISSING_EVENTS_INDEX: &[u8] = b"index_missing_events_";

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("rocksdb error: {0}")]
    Backend(#[from] rocksdb::Error),
    #[error("corrupt state record: {0}")]
    Corrupt(&'static str),
    #[error("missing event index entry not found")]
    IndexNotFound,
}

/// Monotonic 128-bit insertion counter. Lexicographic key order equals
/// insertion order, so prefix iteration walks records oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey(pub [u8; 16]);

impl StateKey {
    pub fn zero() -> Self {
        StateKey([0u8; 16])
    }

    pub fn next(&self) -> Self {
        let value = u128::from_be_bytes(self.0).wrapping_add(1);
        StateKey(value.to_be_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedBlockRange {
    pub range: BlockRange,
    pub key: StateKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMissingEvent {
    pub event: MissingEvent,
    pub key: StateKey,
}

/// Durable single-writer record of this replica's reconciliation state:
/// the last chain height it has seen, block ranges known to be missing,
/// and per-event retry bookkeeping. All multi-key mutations go through one
/// write batch under the writer lock.
pub struct ReplicaStateStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl ReplicaStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DBWithThreadMode::open(&opts, path)?;
        Ok(ReplicaStateStore {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    pub fn last_seen_block_height(&self) -> Result<Option<i64>, StateStoreError> {
        match self.db.get(KEY_LAST_SEEN_BLOCK_HEIGHT)? {
            Some(raw) => Ok(Some(decode_i64(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_last_seen_block_height(&self, height: i64) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock();
        self.db
            .put(KEY_LAST_SEEN_BLOCK_HEIGHT, height.to_le_bytes())?;
        Ok(())
    }

    pub fn missing_blocks(&self) -> Result<Vec<TrackedBlockRange>, StateStoreError> {
        let mut ranges = Vec::new();
        for entry in self.prefix_iter(PREFIX_MISSING_BLOCKS) {
            let (key, value) = entry?;
            let state_key = strip_state_key(&key, PREFIX_MISSING_BLOCKS)?;
            if value.len() != 16 {
                return Err(StateStoreError::Corrupt("missing block range value"));
            }
            ranges.push(TrackedBlockRange {
                range: BlockRange::new(decode_i64(&value[..8])?, decode_i64(&value[8..])?),
                key: state_key,
            });
        }
        Ok(ranges)
    }

    pub fn add_missing_blocks(&self, range: BlockRange) -> Result<StateKey, StateStoreError> {
        let _guard = self.write_lock.lock();
        let key = self.bump_counter(KEY_MISSING_BLOCKS_COUNTER, 1)?.0;

        let mut batch = WriteBatch::default();
        batch.put(KEY_MISSING_BLOCKS_COUNTER, key.0);
        batch.put(prefixed(PREFIX_MISSING_BLOCKS, &key.0), encode_range(&range));
        self.db.write(batch)?;
        Ok(key)
    }

    pub fn update_missing_block_range(
        &self,
        tracked: &TrackedBlockRange,
    ) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock();
        self.db.put(
            prefixed(PREFIX_MISSING_BLOCKS, &tracked.key.0),
            encode_range(&tracked.range),
        )?;
        Ok(())
    }

    pub fn remove_missing_block_range(&self, key: &StateKey) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock();
        self.db.delete(prefixed(PREFIX_MISSING_BLOCKS, &key.0))?;
        Ok(())
    }

    /// Iterates missing events in insertion order, starting strictly after
    /// `after`.
    pub fn missing_events(
        &self,
        after: Option<&StateKey>,
        limit: usize,
    ) -> Result<Vec<TrackedMissingEvent>, StateStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let start = match after {
            Some(after) => prefixed(PREFIX_MISSING_EVENTS, &after.0),
            None => PREFIX_MISSING_EVENTS.to_vec(),
        };

        let mut events = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward));
        for entry in iter {
            let (key, value) = entry?;
            if !key.starts_with(PREFIX_MISSING_EVENTS) {
                break;
            }
            let state_key = strip_state_key(&key, PREFIX_MISSING_EVENTS)?;
            // The iterator starts at-or-after the cursor; skip the cursor
            // entry itself.
            if after.is_some_and(|after| *after == state_key) {
                continue;
            }
            events.push(TrackedMissingEvent {
                event: decode_missing_event(&value)?,
                key: state_key,
            });
            if events.len() >= limit {
                break;
            }
        }
        Ok(events)
    }

    pub fn missing_event_count(&self) -> Result<usize, StateStoreError> {
        let mut count = 0;
        for entry in self.prefix_iter(PREFIX_MISSING_EVENTS_INDEX) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Tracks events as missing. An event id already tracked is
    /// overwritten: the new copy replaces the old one and takes a fresh
    /// internal key.
    pub fn add_missing_events(
        &self,
        events: &[MissingEvent],
    ) -> Result<Vec<TrackedMissingEvent>, StateStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock();
        let (mut key, _) = self.bump_counter(KEY_MISSING_EVENTS_COUNTER, events.len())?;

        let mut batch = WriteBatch::default();
        let mut tracked = Vec::with_capacity(events.len());
        for event in events {
            let index_key = prefixed(PREFIX_MISSING_EVENTS_INDEX, event.event_id.as_bytes());
            if let Some(previous) = self.db.get(&index_key)? {
                batch.delete(prefixed(PREFIX_MISSING_EVENTS, &previous));
            }

            batch.put(&index_key, key.0);
            batch.put(
                prefixed(PREFIX_MISSING_EVENTS, &key.0),
                encode_missing_event(event),
            );
            tracked.push(TrackedMissingEvent {
                event: event.clone(),
                key,
            });
            key = key.next();
        }
        batch.put(KEY_MISSING_EVENTS_COUNTER, tracked.last().expect("non-empty").key.0);
        self.db.write(batch)?;
        Ok(tracked)
    }

    /// Marks a retry attempt: stamps the retry time, sets the unicast flag
    /// and bumps the counter.
    pub fn increment_missing_event_retry_count(
        &self,
        event_id: &EventId,
    ) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock();

        let index_key = prefixed(PREFIX_MISSING_EVENTS_INDEX, event_id.as_bytes());
        let internal = self
            .db
            .get(&index_key)?
            .ok_or(StateStoreError::IndexNotFound)?;

        let record_key = prefixed(PREFIX_MISSING_EVENTS, &internal);
        let raw = self
            .db
            .get(&record_key)?
            .ok_or(StateStoreError::Corrupt("dangling missing event index"))?;
        let mut event = decode_missing_event(&raw)?;

        event.retried_unicast = true;
        event.last_retry_time = Utc::now();
        event.retry_count += 1;

        self.db.put(&record_key, encode_missing_event(&event))?;
        Ok(())
    }

    /// Removes the marker and its index entry atomically. Unknown ids are
    /// a no-op.
    pub fn remove_missing_event(&self, event_id: &EventId) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock();

        let index_key = prefixed(PREFIX_MISSING_EVENTS_INDEX, event_id.as_bytes());
        let Some(internal) = self.db.get(&index_key)? else {
            return Ok(());
        };

        let mut batch = WriteBatch::default();
        batch.delete(&index_key);
        batch.delete(prefixed(PREFIX_MISSING_EVENTS, &internal));
        self.db.write(batch)?;
        Ok(())
    }

    fn prefix_iter(
        &self,
        prefix: &'static [u8],
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), StateStoreError>> + '_ {
        self.db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
            .map(|entry| entry.map_err(StateStoreError::from))
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.starts_with(prefix),
                Err(_) => true,
            })
    }

    /// Reserves `count` consecutive keys; returns the first and the last.
    fn bump_counter(
        &self,
        counter_key: &[u8],
        count: usize,
    ) -> Result<(StateKey, StateKey), StateStoreError> {
        let current = match self.db.get(counter_key)? {
            Some(raw) => StateKey(
                raw.as_slice()
                    .try_into()
                    .map_err(|_| StateStoreError::Corrupt("counter length"))?,
            ),
            None => StateKey::zero(),
        };

        let first = current.next();
        let mut last = first;
        for _ in 1..count {
            last = last.next();
        }
        Ok((first, last))
    }
}

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(suffix);
    key
}

fn strip_state_key(key: &[u8], prefix: &[u8]) -> Result<StateKey, StateStoreError> {
    let suffix = &key[prefix.len()..];
    let bytes: [u8; 16] = suffix
        .try_into()
        .map_err(|_| StateStoreError::Corrupt("state key length"))?;
    Ok(StateKey(bytes))
}

fn decode_i64(raw: &[u8]) -> Result<i64, StateStoreError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StateStoreError::Corrupt("integer length"))?;
    Ok(i64::from_le_bytes(bytes))
}

fn encode_range(range: &BlockRange) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&range.low.to_le_bytes());
    out.extend_from_slice(&range.high.to_le_bytes());
    out
}

/// Packed missing-event record: event id (length-prefixed), timestamps as
/// unix milliseconds, block height, unicast flag, retry count. All
/// little-endian.
fn encode_missing_event(event: &MissingEvent) -> Vec<u8> {
    let id = event.event_id.as_bytes();
    let mut out = Vec::with_capacity(2 + id.len() + 8 + 8 + 8 + 1 + 4);
    out.extend_from_slice(&(id.len() as u16).to_le_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&event.received_time.timestamp_millis().to_le_bytes());
    out.extend_from_slice(&event.block_height.to_le_bytes());
    out.extend_from_slice(&event.last_retry_time.timestamp_millis().to_le_bytes());
    out.push(event.retried_unicast as u8);
    out.extend_from_slice(&event.retry_count.to_le_bytes());
    out
}

fn decode_missing_event(raw: &[u8]) -> Result<MissingEvent, StateStoreError> {
    let mut cursor = 0usize;

    let id_len = u16::from_le_bytes(take::<2>(raw, &mut cursor)?) as usize;
    if raw.len() < cursor + id_len {
        return Err(StateStoreError::Corrupt("missing event id"));
    }
    let event_id = EventId::from_slice(&raw[cursor..cursor + id_len])
        .map_err(|_| StateStoreError::Corrupt("missing event id"))?;
    cursor += id_len;

    let received_ms = i64::from_le_bytes(take::<8>(raw, &mut cursor)?);
    let block_height = i64::from_le_bytes(take::<8>(raw, &mut cursor)?);
    let last_retry_ms = i64::from_le_bytes(take::<8>(raw, &mut cursor)?);
    let retried_unicast = take::<1>(raw, &mut cursor)?[0] == 1;
    let retry_count = u32::from_le_bytes(take::<4>(raw, &mut cursor)?);

    Ok(MissingEvent {
        event_id,
        received_time: millis_to_datetime(received_ms)?,
        block_height,
        last_retry_time: millis_to_datetime(last_retry_ms)?,
        retried_unicast,
        retry_count,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, StateStoreError> {
    DateTime::from_timestamp_millis(millis).ok_or(StateStoreError::Corrupt("timestamp"))
}

fn take<const N: usize>(raw: &[u8], cursor: &mut usize) -> Result<[u8; N], StateStoreError> {
    if raw.len() < *cursor + N {
        return Err(StateStoreError::Corrupt("record truncated"));
    }
    let bytes: [u8; N] = raw[*cursor..*cursor + N].try_into().expect("length checked");
    *cursor += N;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> ReplicaStateStore {
        ReplicaStateStore::open(dir.path().join("state")).expect("open state store")
    }

    fn missing(id_byte: u8, height: i64) -> MissingEvent {
        MissingEvent::new(
            EventId::from_bytes([id_byte; 32]),
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            height,
        )
    }

    #[test]
    fn last_seen_height_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        assert_eq!(store.last_seen_block_height().unwrap(), None);
        store.set_last_seen_block_height(42).unwrap();
        assert_eq!(store.last_seen_block_height().unwrap(), Some(42));
    }

    #[test]
    fn block_ranges_are_tracked_updated_and_removed() {
        let dir = tempdir().unwrap();
        let store = store(&dir);

        let key = store.add_missing_blocks(BlockRange::new(0, 10)).unwrap();
        store.add_missing_blocks(BlockRange::new(20, 25)).unwrap();

        let mut ranges = store.missing_blocks().unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].range, BlockRange::new(0, 10));
        assert_eq!(ranges[0].key, key);

        ranges[0].range.low = 5;
        store.update_missing_block_range(&ranges[0]).unwrap();
        let ranges = store.missing_blocks().unwrap();
        assert_eq!(ranges[0].range, BlockRange::new(5, 10));

        store.remove_missing_block_range(&key).unwrap();
        assert_eq!(store.missing_blocks().unwrap().len(), 1);
    }

    #[test]
    fn missing_events_iterate_in_insertion_order() {
        let dir = tempdir().unwrap();
        let store = store(&dir);

        store
            .add_missing_events(&[missing(1, 10), missing(2, 11), missing(3, 12)])
            .unwrap();

        let events = store.missing_events(None, 10).unwrap();
        let heights: Vec<i64> = events.iter().map(|entry| entry.event.block_height).collect();
        assert_eq!(heights, vec![10, 11, 12]);
        assert_eq!(store.missing_event_count().unwrap(), 3);
    }

    #[test]
    fn pagination_starts_strictly_after_the_cursor() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store
            .add_missing_events(&[missing(1, 10), missing(2, 11), missing(3, 12)])
            .unwrap();

        let first_page = store.missing_events(None, 2).unwrap();
        assert_eq!(first_page.len(), 2);

        let second_page = store
            .missing_events(Some(&first_page[1].key), 2)
            .unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].event.block_height, 12);
    }

    #[test]
    fn re_adding_an_event_replaces_it_with_a_new_key() {
        let dir = tempdir().unwrap();
        let store = store(&dir);

        let original = store.add_missing_events(&[missing(1, 10)]).unwrap();
        store.add_missing_events(&[missing(2, 11)]).unwrap();
        let replacement = store.add_missing_events(&[missing(1, 99)]).unwrap();

        assert_ne!(original[0].key, replacement[0].key);
        assert_eq!(store.missing_event_count().unwrap(), 2);

        // The replacement moved to the back of the iteration order.
        let events = store.missing_events(None, 10).unwrap();
        let heights: Vec<i64> = events.iter().map(|entry| entry.event.block_height).collect();
        assert_eq!(heights, vec![11, 99]);
    }

    #[test]
    fn retry_increment_stamps_time_and_flags() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.add_missing_events(&[missing(1, 10)]).unwrap();

        let id = EventId::from_bytes([1; 32]);
        store.increment_missing_event_retry_count(&id).unwrap();
        store.increment_missing_event_retry_count(&id).unwrap();

        let events = store.missing_events(None, 10).unwrap();
        let event = &events[0].event;
        assert_eq!(event.retry_count, 2);
        assert!(event.retried_unicast);
        assert!(event.last_retry_time > event.received_time);

        let unknown = EventId::from_bytes([9; 32]);
        assert!(matches!(
            store.increment_missing_event_retry_count(&unknown),
            Err(StateStoreError::IndexNotFound)
        ));
    }

    #[test]
    fn removal_is_atomic_and_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.add_missing_events(&[missing(1, 10)]).unwrap();

        let id = EventId::from_bytes([1; 32]);
        store.remove_missing_event(&id).unwrap();
        assert_eq!(store.missing_event_count().unwrap(), 0);
        assert!(store.missing_events(None, 10).unwrap().is_empty());

        // Removing again is fine.
        store.remove_missing_event(&id).unwrap();
    }

    #[test]
    fn state_key_ordering_is_monotonic() {
        let mut key = StateKey::zero();
        let mut previous = key;
        for _ in 0..300 {
            key = key.next();
            assert!(key.0 > previous.0);
            previous = key;
        }
    }
}
