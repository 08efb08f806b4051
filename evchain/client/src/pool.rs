use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is empty")]
    Empty,
}

/// A pooled connection. Members are shared, so implementations must be safe
/// to use from several callers at once.
#[async_trait]
pub trait PoolMember: Send + Sync + 'static {
    /// Cheap liveness probe with its own deadline.
    async fn probe(&self) -> bool;

    /// Releases the member's resources when the pool closes.
    async fn close(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// A member probed within this window is reused without re-probing.
    pub liveness_valid_threshold: Duration,
    /// Cadence of the background sweep that revives dead members.
    pub dead_conn_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            liveness_valid_threshold: Duration::from_secs(10),
            dead_conn_check_interval: Duration::from_secs(15),
        }
    }
}

struct PoolState<C> {
    idx: usize,
    live: Vec<Arc<C>>,
    dead: Vec<Arc<C>>,
    last_test: HashMap<usize, Instant>,
}

impl<C> PoolState<C> {
    fn member_id(member: &Arc<C>) -> usize {
        Arc::as_ptr(member) as usize
    }

    fn demote(&mut self, member: &Arc<C>) {
        if let Some(position) = self.live.iter().position(|c| Arc::ptr_eq(c, member)) {
            let member = self.live.remove(position);
            if self.idx >= self.live.len() {
                self.idx = 0;
            }
            self.dead.push(member);
        }
    }

    fn promote(&mut self, member: &Arc<C>) {
        if let Some(position) = self.dead.iter().position(|c| Arc::ptr_eq(c, member)) {
            let member = self.dead.remove(position);
            self.live.push(member);
        }
    }
}

/// Round-robin pool of liveness-tested connections. Probes run outside the
/// lock; a failed probe moves the member to the dead set, and a background
/// sweep promotes recovered members back.
pub struct Pool<C: PoolMember> {
    state: Arc<Mutex<PoolState<C>>>,
    liveness_valid_threshold: Duration,
    shutdown: watch::Sender<bool>,
    reviver: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PoolMember> Pool<C> {
    pub async fn new(members: Vec<C>, config: PoolConfig) -> Self {
        let state = Arc::new(Mutex::new(PoolState {
            idx: 0,
            live: Vec::new(),
            dead: Vec::new(),
            last_test: HashMap::new(),
        }));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pool = Pool {
            state,
            liveness_valid_threshold: config.liveness_valid_threshold,
            shutdown,
            reviver: Mutex::new(None),
        };
        pool.add(members).await;

        if !config.dead_conn_check_interval.is_zero() {
            let handle = tokio::spawn(revive_loop(
                Arc::clone(&pool.state),
                config.dead_conn_check_interval,
                shutdown_rx,
            ));
            *pool.reviver.lock() = Some(handle);
        }

        pool
    }

    pub async fn add(&self, members: Vec<C>) {
        for member in members {
            let member = Arc::new(member);
            let alive = member.probe().await;
            let mut state = self.state.lock();
            state
                .last_test
                .insert(PoolState::member_id(&member), Instant::now());
            if alive {
                state.live.push(member);
            } else {
                state.dead.push(member);
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Returns the next member in rotation, probing it first unless it was
    /// probed recently. Dead members are skipped and demoted.
    pub async fn get(&self) -> Result<Arc<C>, PoolError> {
        loop {
            let member = {
                let mut state = self.state.lock();
                if state.live.is_empty() {
                    return Err(PoolError::Empty);
                }
                state.idx = (state.idx + 1) % state.live.len();
                let member = Arc::clone(&state.live[state.idx]);

                let fresh = state
                    .last_test
                    .get(&PoolState::member_id(&member))
                    .is_some_and(|tested| tested.elapsed() <= self.liveness_valid_threshold);
                if fresh {
                    return Ok(member);
                }
                member
            };

            if member.probe().await {
                let mut state = self.state.lock();
                state
                    .last_test
                    .insert(PoolState::member_id(&member), Instant::now());
                return Ok(member);
            }

            debug!("pool member failed liveness probe, demoting");
            self.state.lock().demote(&member);
        }
    }

    /// Returns every member currently considered live, re-probing stale
    /// entries. With `include_dead`, returns everything without probing.
    pub async fn get_all(&self, include_dead: bool) -> Vec<Arc<C>> {
        if include_dead {
            let state = self.state.lock();
            return state
                .live
                .iter()
                .chain(state.dead.iter())
                .cloned()
                .collect();
        }

        let candidates: Vec<Arc<C>> = self.state.lock().live.to_vec();
        let mut alive = Vec::with_capacity(candidates.len());
        for member in candidates {
            let fresh = self
                .state
                .lock()
                .last_test
                .get(&PoolState::member_id(&member))
                .is_some_and(|tested| tested.elapsed() <= self.liveness_valid_threshold);

            if fresh || member.probe().await {
                if !fresh {
                    self.state
                        .lock()
                        .last_test
                        .insert(PoolState::member_id(&member), Instant::now());
                }
                alive.push(member);
            } else {
                self.state.lock().demote(&member);
            }
        }
        alive
    }

    /// Stops the revive sweep and closes every member.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.reviver.lock().take() {
            handle.abort();
        }

        let members: Vec<Arc<C>> = {
            let state = self.state.lock();
            state
                .live
                .iter()
                .chain(state.dead.iter())
                .cloned()
                .collect()
        };
        for member in members {
            member.close().await;
        }
    }
}

async fn revive_loop<C: PoolMember>(
    state: Arc<Mutex<PoolState<C>>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let dead: Vec<Arc<C>> = state.lock().dead.to_vec();
                for member in dead {
                    if member.probe().await {
                        debug!("pool member recovered, promoting");
                        let mut guard = state.lock();
                        guard.promote(&member);
                        guard
                            .last_test
                            .insert(PoolState::member_id(&member), Instant::now());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeConn {
        name: &'static str,
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl FakeConn {
        fn new(name: &'static str, healthy: bool) -> Self {
            FakeConn {
                name,
                healthy: AtomicBool::new(healthy),
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PoolMember for FakeConn {
        async fn probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self) {}
    }

    fn config(threshold: Duration) -> PoolConfig {
        PoolConfig {
            liveness_valid_threshold: threshold,
            dead_conn_check_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn rotates_round_robin() {
        let pool = Pool::new(
            vec![FakeConn::new("a", true), FakeConn::new("b", true)],
            config(Duration::from_secs(60)),
        )
        .await;

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        let third = pool.get().await.unwrap();
        assert_ne!(first.name, second.name);
        assert_eq!(first.name, third.name);
    }

    #[tokio::test]
    async fn demotes_dead_members_and_serves_the_rest() {
        let pool = Pool::new(
            vec![FakeConn::new("a", true), FakeConn::new("b", false)],
            config(Duration::ZERO),
        )
        .await;

        for _ in 0..4 {
            let member = pool.get().await.unwrap();
            assert_eq!(member.name, "a");
        }
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn empty_pool_errors() {
        let pool: Pool<FakeConn> = Pool::new(Vec::new(), config(Duration::ZERO)).await;
        assert_eq!(pool.get().await.unwrap_err(), PoolError::Empty);
    }

    #[tokio::test]
    async fn fresh_members_are_not_reprobed() {
        let pool = Pool::new(
            vec![FakeConn::new("a", true)],
            config(Duration::from_secs(60)),
        )
        .await;

        let before = pool.get().await.unwrap().probes.load(Ordering::SeqCst);
        let after = pool.get().await.unwrap().probes.load(Ordering::SeqCst);
        // Only the initial add() probe; the liveness window covers get().
        assert_eq!(before, 1);
        assert_eq!(after, 1);
    }

    #[tokio::test]
    async fn revive_sweep_promotes_recovered_members() {
        let pool = Pool::new(
            vec![FakeConn::new("a", false)],
            PoolConfig {
                liveness_valid_threshold: Duration::ZERO,
                dead_conn_check_interval: Duration::from_millis(20),
            },
        )
        .await;
        assert_eq!(pool.live_count(), 0);

        let member = pool.get_all(true).await.into_iter().next().unwrap();
        member.healthy.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pool.live_count(), 1);
    }
}
