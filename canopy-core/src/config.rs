//! Tunables for a sync session.

use std::time::Duration;

/// Configuration for a [`CollabSession`](crate::session::CollabSession).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Idle time after the last local batch before pending replica ops are
    /// committed. Zero commits every batch immediately.
    pub commit_idle: Duration,
    /// Upper bound on how long pending ops may wait for a commit.
    pub commit_max_latency: Duration,
    /// Consecutive local steps closer together than this undo as one.
    pub undo_merge_interval: Duration,
    /// Maximum number of retained undo steps.
    pub undo_max_steps: usize,
    /// Remote presence entries not refreshed within this window are dropped.
    pub presence_timeout: Duration,
    /// Largest encoded property value accepted for replication (bytes).
    pub max_property_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            commit_idle: Duration::ZERO,
            commit_max_latency: Duration::from_millis(250),
            undo_merge_interval: Duration::from_millis(500),
            undo_max_steps: 100,
            presence_timeout: Duration::from_secs(30),
            max_property_bytes: 1 << 20,
        }
    }
}

impl SyncConfig {
    /// Debounced commits: wait for `idle` of quiet, never longer than `max_latency`.
    pub fn debounced(idle: Duration, max_latency: Duration) -> Self {
        Self {
            commit_idle: idle,
            commit_max_latency: max_latency.max(idle),
            ..Self::default()
        }
    }
}
