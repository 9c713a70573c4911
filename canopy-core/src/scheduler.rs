//! Commit scheduling.
//!
//! Propagated ops stay pending in the replica until committed. With a zero
//! idle window every local batch commits immediately; otherwise commits are
//! debounced: each new batch re-arms the idle timer, and a batch never waits
//! longer than the max latency in total.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Nothing is pending.
    Idle,
    /// Commit now.
    Now,
    /// Check again after this long.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct CommitScheduler {
    idle: Duration,
    max_latency: Duration,
    first_pending: Option<Instant>,
    last_pending: Option<Instant>,
}

impl CommitScheduler {
    pub fn new(idle: Duration, max_latency: Duration) -> Self {
        Self {
            idle,
            max_latency: max_latency.max(idle),
            first_pending: None,
            last_pending: None,
        }
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.idle.is_zero()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.first_pending.is_some()
    }

    /// Record that ops became pending at `now`. Re-arms the idle timer.
    pub fn note_pending(&mut self, now: Instant) {
        self.first_pending.get_or_insert(now);
        self.last_pending = Some(now);
    }

    /// Forget the pending state after a commit.
    pub fn cancel(&mut self) {
        self.first_pending = None;
        self.last_pending = None;
    }

    /// When the pending ops must be committed, if any are pending.
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_pending?;
        let last = self.last_pending.unwrap_or(first);
        Some((last + self.idle).min(first + self.max_latency))
    }

    pub fn poll(&self, now: Instant) -> CommitDecision {
        match self.deadline() {
            None => CommitDecision::Idle,
            Some(deadline) if now >= deadline => CommitDecision::Now,
            Some(deadline) => CommitDecision::Wait(deadline - now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_idle_when_nothing_pending() {
        let s = CommitScheduler::new(50 * MS, 200 * MS);
        assert_eq!(s.poll(Instant::now()), CommitDecision::Idle);
        assert!(!s.has_pending());
    }

    #[test]
    fn test_idle_window_rearms() {
        let mut s = CommitScheduler::new(50 * MS, 200 * MS);
        let t0 = Instant::now();
        s.note_pending(t0);
        assert_eq!(s.poll(t0 + 30 * MS), CommitDecision::Wait(20 * MS));

        s.note_pending(t0 + 40 * MS);
        assert_eq!(s.poll(t0 + 60 * MS), CommitDecision::Wait(30 * MS));
        assert_eq!(s.poll(t0 + 90 * MS), CommitDecision::Now);
    }

    #[test]
    fn test_max_latency_caps_debounce() {
        let mut s = CommitScheduler::new(50 * MS, 100 * MS);
        let t0 = Instant::now();
        for i in 0..5 {
            s.note_pending(t0 + i * 30 * MS);
        }
        assert_eq!(s.deadline(), Some(t0 + 100 * MS));
        assert_eq!(s.poll(t0 + 100 * MS), CommitDecision::Now);
    }

    #[test]
    fn test_cancel_clears() {
        let mut s = CommitScheduler::new(Duration::ZERO, Duration::ZERO);
        assert!(s.is_immediate());
        s.note_pending(Instant::now());
        s.cancel();
        assert_eq!(s.poll(Instant::now()), CommitDecision::Idle);
    }
}
