//! Delivery metrics.
//!
//! Counters are plain atomics shared through `Arc`; the HTTP endpoint renders
//! them in Prometheus text format.

use crate::session::SessionState;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Counters
// =============================================================================

#[derive(Debug, Default)]
pub struct SinkMetrics {
    cycles_committed: AtomicU64,
    cycles_failed: AtomicU64,
    cycle_retries: AtomicU64,
    messages_published: AtomicU64,
    messages_acked: AtomicU64,
    messages_nacked: AtomicU64,
    nacks_ignored: AtomicU64,
    records_discarded: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    keep_alive_misses: AtomicU64,
    session_state: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_committed: u64,
    pub cycles_failed: u64,
    pub cycle_retries: u64,
    pub messages_published: u64,
    pub messages_acked: u64,
    pub messages_nacked: u64,
    pub nacks_ignored: u64,
    pub records_discarded: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub keep_alive_misses: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl SinkMetrics {
    pub fn cycle_committed(&self) {
        bump(&self.cycles_committed, 1);
    }

    pub fn cycle_failed(&self) {
        bump(&self.cycles_failed, 1);
    }

    pub fn cycle_retried(&self) {
        bump(&self.cycle_retries, 1);
    }

    pub fn published(&self) {
        bump(&self.messages_published, 1);
    }

    pub fn acked(&self, count: u64) {
        bump(&self.messages_acked, count);
    }

    pub fn nacked(&self) {
        bump(&self.messages_nacked, 1);
    }

    pub fn nack_ignored(&self) {
        bump(&self.nacks_ignored, 1);
    }

    pub fn record_discarded(&self) {
        bump(&self.records_discarded, 1);
    }

    pub fn committed_transaction(&self) {
        bump(&self.commits, 1);
    }

    pub fn commit_failed(&self) {
        bump(&self.commit_failures, 1);
    }

    pub fn connect_attempt(&self) {
        bump(&self.connect_attempts, 1);
    }

    pub fn reconnect(&self) {
        bump(&self.reconnects, 1);
    }

    pub fn keep_alive_missed(&self) {
        bump(&self.keep_alive_misses, 1);
    }

    pub fn set_session_state(&self, state: SessionState) {
        let code = match state {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Reconnecting => 3,
            SessionState::Failed => 4,
        };
        self.session_state.store(code, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            cycles_committed: load(&self.cycles_committed),
            cycles_failed: load(&self.cycles_failed),
            cycle_retries: load(&self.cycle_retries),
            messages_published: load(&self.messages_published),
            messages_acked: load(&self.messages_acked),
            messages_nacked: load(&self.messages_nacked),
            nacks_ignored: load(&self.nacks_ignored),
            records_discarded: load(&self.records_discarded),
            commits: load(&self.commits),
            commit_failures: load(&self.commit_failures),
            connect_attempts: load(&self.connect_attempts),
            reconnects: load(&self.reconnects),
            keep_alive_misses: load(&self.keep_alive_misses),
        }
    }

    /// Prometheus text exposition of every counter plus the session state gauge.
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let counters: [(&str, u64); 13] = [
            ("sinkbridge_cycles_committed_total", snap.cycles_committed),
            ("sinkbridge_cycles_failed_total", snap.cycles_failed),
            ("sinkbridge_cycle_retries_total", snap.cycle_retries),
            ("sinkbridge_messages_published_total", snap.messages_published),
            ("sinkbridge_messages_acked_total", snap.messages_acked),
            ("sinkbridge_messages_nacked_total", snap.messages_nacked),
            ("sinkbridge_nacks_ignored_total", snap.nacks_ignored),
            ("sinkbridge_records_discarded_total", snap.records_discarded),
            ("sinkbridge_commits_total", snap.commits),
            ("sinkbridge_commit_failures_total", snap.commit_failures),
            ("sinkbridge_connect_attempts_total", snap.connect_attempts),
            ("sinkbridge_reconnects_total", snap.reconnects),
            ("sinkbridge_keep_alive_misses_total", snap.keep_alive_misses),
        ];
        let mut body = String::new();
        for (name, value) in counters {
            let _ = writeln!(body, "# TYPE {name} counter\n{name} {value}");
        }
        let _ = writeln!(
            body,
            "# TYPE sinkbridge_session_state gauge\nsinkbridge_session_state {}",
            self.session_state.load(Ordering::Relaxed)
        );
        body
    }
}
