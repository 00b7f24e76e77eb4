use super::{ConnectionManager, SessionState};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Consecutive keep-alive misses against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissCounter {
    limit: u32,
    misses: u32,
}

impl MissCounter {
    pub fn new(limit: u32) -> Self {
        Self { limit, misses: 0 }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Count one miss; `true` once more than `limit` misses are consecutive.
    pub fn miss(&mut self) -> bool {
        self.misses += 1;
        self.misses > self.limit
    }

    pub fn reset(&mut self) {
        self.misses = 0;
    }
}

/// Ping the live session every keep-alive interval and force a reconnect once
/// the miss limit is exceeded. Runs until shutdown.
pub(crate) async fn monitor(manager: Arc<ConnectionManager>, mut shutdown: watch::Receiver<bool>) {
    let interval = manager.properties().keep_alive_interval;
    let mut counter = MissCounter::new(manager.properties().keep_alive_limit);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if manager.state() != SessionState::Connected {
            counter.reset();
            continue;
        }
        let Ok(session) = manager.session() else {
            continue;
        };
        let answered = matches!(
            tokio::time::timeout(interval, session.keep_alive()).await,
            Ok(Ok(()))
        );
        if answered {
            counter.reset();
            continue;
        }
        manager.metrics().keep_alive_missed();
        debug!(misses = counter.misses() + 1, "keep-alive unanswered");
        if counter.miss() {
            let reason = format!("{} consecutive keep-alives unanswered", counter.misses());
            warn!(%reason, "declaring broker session dead");
            counter.reset();
            manager.mark_broken(&session, &reason).await;
            if let Err(err) = manager.ensure_connected().await {
                warn!(error = %err, "reconnect after keep-alive failure did not succeed");
            }
        }
    }
    debug!("keep-alive monitor stopped");
}
