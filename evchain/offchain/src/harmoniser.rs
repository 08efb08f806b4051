use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use evchain_client::ChainReader;
use evchain_types::{BlockRange, EventId, MissingEvent};

use crate::payload::{encode_payload, EventRequest, TYPE_REQUEST_EVENT};
use crate::repository::EventRepository;
use crate::state::{ReplicaStateStore, StateKey, TrackedBlockRange};
use crate::transport::EventTransport;

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Ask one peer directly before resorting to multicast.
    pub try_unicast_first: bool,
    pub block_poll_interval: Duration,
    pub block_fetch_chunk_size: u32,
    pub event_poll_interval: Duration,
    pub event_fetch_chunk_size: usize,
    /// Events newer than this are skipped; the submitter may still be
    /// broadcasting them.
    pub new_event_ignore_threshold: Duration,
    pub event_retry_interval: Duration,
    pub event_max_retries: u32,
    pub multicast_backoff: Duration,
    pub unicast_backoff: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            try_unicast_first: true,
            block_poll_interval: Duration::from_secs(60),
            block_fetch_chunk_size: 100,
            event_poll_interval: Duration::from_secs(60),
            event_fetch_chunk_size: 100,
            new_event_ignore_threshold: Duration::from_secs(5 * 60),
            event_retry_interval: Duration::from_secs(30 * 60),
            event_max_retries: 48,
            multicast_backoff: Duration::from_secs(5),
            unicast_backoff: Duration::from_secs(1),
        }
    }
}

/// Computes the missing-block range implied by a newly observed height.
/// `None` means no gap. Heights at or below the last seen one are handled
/// by the caller (ignored entirely).
pub fn gap_range(last_seen: Option<i64>, height: i64) -> Option<BlockRange> {
    match last_seen {
        None if height > 0 => Some(BlockRange::new(0, height)),
        None => None,
        Some(last) if height > last + 1 => Some(BlockRange::new(last + 1, height)),
        Some(_) => None,
    }
}

/// Ensures this replica eventually holds every event the chain has
/// admitted, or knows it cannot obtain it. Three cooperating loops share
/// the state store: listen records gaps, block backfill resolves missing
/// ranges into missing events, event backfill requests payloads from peers.
pub struct Harmoniser<C, R, T> {
    chain: Arc<C>,
    repository: Arc<R>,
    state: Arc<ReplicaStateStore>,
    transport: Arc<T>,
    config: BackfillConfig,
}

impl<C, R, T> Harmoniser<C, R, T>
where
    C: ChainReader,
    R: EventRepository,
    T: EventTransport,
{
    pub fn new(
        chain: Arc<C>,
        repository: Arc<R>,
        state: Arc<ReplicaStateStore>,
        transport: Arc<T>,
        config: BackfillConfig,
    ) -> Arc<Self> {
        Arc::new(Harmoniser {
            chain,
            repository,
            state,
            transport,
            config,
        })
    }

    pub fn spawn(
        self: &Arc<Self>,
        heights: mpsc::Receiver<i64>,
        missing: mpsc::Receiver<MissingEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).listen_loop(heights, missing, shutdown.clone())),
            tokio::spawn(Arc::clone(self).block_backfill_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).event_backfill_loop(shutdown)),
        ]
    }

    /// Loop 1: consumes the follower's streams and records gaps.
    async fn listen_loop(
        self: Arc<Self>,
        mut heights: mpsc::Receiver<i64>,
        mut missing: mpsc::Receiver<MissingEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down chain event listener");
                        return;
                    }
                }
                height = heights.recv() => {
                    let Some(height) = height else { return; };
                    self.observe_height(height);
                }
                event = missing.recv() => {
                    let Some(event) = event else { return; };
                    info!(event_id = %event.event_id, "seen new event on chain");
                    if let Err(err) = self.state.add_missing_events(&[event]) {
                        error!(?err, "failed to add missing event");
                    }
                }
            }
        }
    }

    fn observe_height(&self, height: i64) {
        debug!(height, "received new block height");

        let last_seen = match self.state.last_seen_block_height() {
            Ok(last_seen) => last_seen,
            Err(err) => {
                error!(?err, "failed to get last seen block height");
                return;
            }
        };

        // Heights we have already passed carry no new information.
        if last_seen.is_some_and(|last| height <= last) {
            return;
        }

        if let Some(range) = gap_range(last_seen, height) {
            warn!(
                low = range.low,
                high = range.high,
                "blocks missing below observed height"
            );
            if let Err(err) = self.state.add_missing_blocks(range) {
                error!(?err, "failed to store missing block range");
            }
        }

        if let Err(err) = self.state.set_last_seen_block_height(height) {
            error!(?err, "failed to set last seen block height");
        }
    }

    /// Loop 2: resolves recorded block ranges into missing events by
    /// paginating the chain's event index.
    async fn block_backfill_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.block_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down block backfill loop");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let ranges = match self.state.missing_blocks() {
                        Ok(ranges) => ranges,
                        Err(err) => {
                            error!(?err, "failed to get missing blocks");
                            continue;
                        }
                    };
                    if ranges.is_empty() {
                        continue;
                    }

                    let total: i64 = ranges.iter().map(|tracked| tracked.range.len()).sum();
                    info!(count = total, "found missing blocks");

                    for tracked in ranges {
                        if *shutdown.borrow() {
                            info!("shutting down block backfill loop mid-operation");
                            return;
                        }
                        self.backfill_range(tracked).await;
                    }
                }
            }
        }
    }

    /// One pass over every recorded missing range.
    pub async fn run_block_backfill_pass(&self) {
        let ranges = match self.state.missing_blocks() {
            Ok(ranges) => ranges,
            Err(err) => {
                error!(?err, "failed to get missing blocks");
                return;
            }
        };
        for tracked in ranges {
            self.backfill_range(tracked).await;
        }
    }

    async fn backfill_range(&self, tracked: TrackedBlockRange) {
        let chunk = self.config.block_fetch_chunk_size;
        let mut page = 1u32;

        let (events, total) = match self
            .chain
            .search_events(tracked.range.low, tracked.range.high, page, chunk)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(?err, "failed to fetch missing events");
                return;
            }
        };
        if self.ingest_backlog_chunk(&tracked, &events) {
            return;
        }

        let mut retrieved = chunk as u64;
        page += 1;

        while retrieved < total {
            info!(retrieved, total, "got chunk of event transactions, more to retrieve");
            let (events, _) = match self
                .chain
                .search_events(tracked.range.low, tracked.range.high, page, chunk)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    error!(?err, "failed to fetch missing events");
                    return;
                }
            };
            if self.ingest_backlog_chunk(&tracked, &events) {
                return;
            }
            retrieved += chunk as u64;
            page += 1;
        }

        if let Err(err) = self.state.remove_missing_block_range(&tracked.key) {
            error!(?err, "failed to remove missing block range");
        }
    }

    /// Stores a chunk's events and shrinks the range. Returns true when
    /// the range was fully resolved and removed.
    fn ingest_backlog_chunk(
        &self,
        tracked: &TrackedBlockRange,
        events: &[MissingEvent],
    ) -> bool {
        for event in events {
            if let Err(err) = self.state.add_missing_events(std::slice::from_ref(event)) {
                error!(?err, "failed to store missing event");
            }
            debug!(
                event_id = %event.event_id,
                block_height = event.block_height,
                "recorded missing event from block backfill"
            );
        }

        let Some(last) = events.last() else {
            return false;
        };
        let max_height = last.block_height;

        if max_height >= tracked.range.high - 1 {
            if let Err(err) = self.state.remove_missing_block_range(&tracked.key) {
                error!(?err, "failed to remove missing block range");
            }
            true
        } else {
            // Keep `low` at the max height seen, not one past it: more
            // transactions may exist at that height.
            let updated = TrackedBlockRange {
                range: BlockRange::new(max_height, tracked.range.high),
                key: tracked.key,
            };
            if let Err(err) = self.state.update_missing_block_range(&updated) {
                error!(?err, "failed to update missing block range");
            }
            false
        }
    }

    /// Loop 3: walks the missing-event table and requests payloads from
    /// peers, batching ids into unicast and multicast requests.
    async fn event_backfill_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.event_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down event backfill loop");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if self.run_event_backfill_pass(&mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over the missing-event table. Returns true when a
    /// shutdown was observed mid-pass.
    pub async fn run_event_backfill_pass(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        debug!("checking for missing events");
        match self.state.missing_event_count() {
            Ok(0) => debug!("no missing events found"),
            Ok(count) => info!(count, "found missing events"),
            Err(err) => error!(?err, "failed to count missing events"),
        }

        let mut after: Option<StateKey> = None;
        loop {
            let chunk = match self
                .state
                .missing_events(after.as_ref(), self.config.event_fetch_chunk_size)
            {
                Ok(chunk) => chunk,
                Err(err) => {
                    error!(?err, "failed to get missing events");
                    return false;
                }
            };
            if chunk.is_empty() {
                return false;
            }
            info!(chunk_size = chunk.len(), "attempting to retrieve chunk of missing events");

            let mut unicast_bucket: Vec<EventId> = Vec::new();
            let mut multicast_bucket: Vec<EventId> = Vec::new();
            for tracked in &chunk {
                if *shutdown.borrow() {
                    info!("shutting down event backfill loop mid-operation");
                    return true;
                }

                match self.handle_missing_event(&tracked.event).await {
                    Ok((false, _)) => {}
                    Ok((true, false)) => unicast_bucket.push(tracked.event.event_id),
                    Ok((true, true)) => multicast_bucket.push(tracked.event.event_id),
                    Err(err) => {
                        error!(?err, event_id = %tracked.event.event_id, "failed to handle missing event");
                    }
                }
            }
            let chunk_len = chunk.len();
            after = chunk.last().map(|tracked| tracked.key);

            if !multicast_bucket.is_empty()
                && self
                    .request_bucket(&multicast_bucket, true, shutdown)
                    .await
            {
                return true;
            }
            if !unicast_bucket.is_empty()
                && self.request_bucket(&unicast_bucket, false, shutdown).await
            {
                return true;
            }

            if chunk_len < self.config.event_fetch_chunk_size {
                return false;
            }
        }
    }

    /// Sends one batched request and applies the bucket's back-off.
    /// Returns true when a shutdown was observed while backing off.
    async fn request_bucket(
        &self,
        event_ids: &[EventId],
        multicast: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        info!(
            count = event_ids.len(),
            multicast, "requesting missing events from peers"
        );

        let request = EventRequest {
            event_ids: event_ids.to_vec(),
        };
        let encoded = match encode_payload(TYPE_REQUEST_EVENT, &request) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(?err, "failed to encode event request");
                return false;
            }
        };

        for event_id in event_ids {
            if let Err(err) = self.state.increment_missing_event_retry_count(event_id) {
                error!(?err, event_id = %event_id, "failed to increment missing event retry count");
            }
        }

        let sent = if multicast {
            self.transport.broadcast(encoded).await
        } else {
            self.transport.unicast_random_neighbour(encoded).await
        };
        if let Err(err) = sent {
            error!(%err, multicast, "failed to send event request");
            return false;
        }

        let backoff = if multicast {
            self.config.multicast_backoff
        } else {
            self.config.unicast_backoff
        };
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutting down event backfill loop mid-operation");
                    return true;
                }
                false
            }
            _ = tokio::time::sleep(backoff) => false,
        }
    }

    /// Decides what to do with one missing event: `(should_request,
    /// use_multicast)`.
    pub async fn handle_missing_event(
        &self,
        event: &MissingEvent,
    ) -> Result<(bool, bool), crate::state::StateStoreError> {
        // Already stored locally: the marker is stale.
        match self.repository.get_event_by_id(&event.event_id).await {
            Ok(Some(_)) => {
                debug!(
                    event_id = %event.event_id,
                    "event already stored locally, clearing missing marker"
                );
                self.state.remove_missing_event(&event.event_id)?;
                return Ok((false, false));
            }
            Ok(None) => {}
            Err(err) => {
                error!(?err, "failed to check local repository");
                return Ok((false, false));
            }
        }

        let now = Utc::now();

        // Too fresh: the submitter may still be broadcasting it.
        if event.received_time > now - self.config.new_event_ignore_threshold {
            debug!(event_id = %event.event_id, "event too new, skipping");
            return Ok((false, false));
        }

        // Give up: assume no replica has the payload.
        if event.retry_count >= self.config.event_max_retries {
            warn!(
                event_id = %event.event_id,
                retry_count = event.retry_count,
                "event reached max retry count, abandoning"
            );
            self.state.remove_missing_event(&event.event_id)?;
            return Ok((false, false));
        }

        if now < event.last_retry_time + self.config.event_retry_interval {
            debug!(event_id = %event.event_id, "event retried recently, skipping");
            return Ok((false, false));
        }

        // Try one direct request before resorting to multicast chatter.
        if self.config.try_unicast_first && !event.retried_unicast {
            debug!(event_id = %event.event_id, "requesting event via unicast");
            Ok((true, false))
        } else {
            debug!(event_id = %event.event_id, "requesting event via multicast");
            Ok((true, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_below_first_height_spans_from_genesis() {
        assert_eq!(gap_range(None, 5), Some(BlockRange::new(0, 5)));
        assert_eq!(gap_range(None, 0), None);
    }

    #[test]
    fn consecutive_heights_leave_no_gap() {
        assert_eq!(gap_range(Some(4), 5), None);
        assert_eq!(gap_range(Some(5), 5), None);
        assert_eq!(gap_range(Some(6), 5), None);
    }

    #[test]
    fn skipped_heights_produce_a_half_open_range() {
        assert_eq!(gap_range(Some(4), 9), Some(BlockRange::new(5, 9)));
    }
}
