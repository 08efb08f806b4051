use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use evchain_client::ChainReader;
use evchain_types::StoredPolicy;

use crate::repository::EventRepository;

#[derive(Debug, Clone)]
pub struct RetentionAgentConfig {
    pub scan_interval: Duration,
    pub run_at_startup: bool,
}

impl Default for RetentionAgentConfig {
    fn default() -> Self {
        RetentionAgentConfig {
            scan_interval: Duration::from_secs(3600),
            run_at_startup: false,
        }
    }
}

/// Periodically enforces the committed retention policy against the local
/// event repository.
///
/// The policy is immutable once set, so it is fetched (quorum-compared)
/// until first seen and cached afterwards.
pub struct RetentionAgent<C, R> {
    chain: Arc<C>,
    repository: Arc<R>,
    config: RetentionAgentConfig,
    policy: Mutex<Option<StoredPolicy>>,
}

impl<C, R> RetentionAgent<C, R>
where
    C: ChainReader,
    R: EventRepository,
{
    pub fn new(chain: Arc<C>, repository: Arc<R>, config: RetentionAgentConfig) -> Arc<Self> {
        Arc::new(RetentionAgent {
            chain,
            repository,
            config,
            policy: Mutex::new(None),
        })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agent.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            if agent.config.run_at_startup {
                if let Err(err) = agent.scan_and_drop().await {
                    error!(%err, "failed to run retention policy scan at startup");
                }
            }

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("retention agent received shutdown signal");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = agent.scan_and_drop().await {
                            error!(%err, "failed to run retention policy scan");
                        }
                    }
                }
            }
        })
    }

    pub async fn scan_and_drop(&self) -> Result<(), String> {
        let policy = {
            let cached = self.policy.lock().clone();
            match cached {
                Some(policy) => policy,
                None => {
                    let fetched = self
                        .chain
                        .get_retention_policy()
                        .await
                        .map_err(|err| err.to_string())?;
                    match fetched {
                        Some(policy) => {
                            info!("retrieved retention policy from the chain");
                            *self.policy.lock() = Some(policy.clone());
                            policy
                        }
                        None => {
                            info!("retention policy not set yet, skipping scan");
                            return Ok(());
                        }
                    }
                }
            }
        };

        info!("scanning for events outside the retention policy");
        let dropped = self
            .repository
            .drop_expired_events(&policy.policy)
            .await
            .map_err(|err| err.to_string())?;
        info!(dropped, "retention policy enforcement complete");
        Ok(())
    }
}
