//! Background lease reaper.
//!
//! Pulls already reap inline for their own agent, so this loop only has to
//! cover agents that stopped pulling entirely. A missed tick delays lease
//! recovery by one interval, nothing more.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::infra::traits::CommandStore;

pub struct Reaper {
    store: Arc<dyn CommandStore>,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn CommandStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run until the shutdown channel fires. One failed pass is logged and
    /// retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "lease reaper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.reap_expired(Utc::now()).await {
                        Ok(summary) if !summary.is_empty() => {
                            info!(
                                recovered = summary.recovered,
                                failed = summary.failed,
                                "recycled expired leases"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "reap pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("lease reaper stopped");
                    return;
                }
            }
        }
    }
}
