//! Server counters shared between the dispatcher and its observers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated from the event loop(s).
#[derive(Debug, Default)]
pub struct Stats {
    sessions_accepted: AtomicU64,
    sessions_closed: AtomicU64,
    frames_received: AtomicU64,
    frames_forwarded: AtomicU64,
    accept_errors: AtomicU64,
    delivery_failures: AtomicU64,
    oversized_frames: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_forwarded(&self, count: usize) {
        self.frames_forwarded.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn accept_failed(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_too_large(&self) {
        self.oversized_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let accepted = self.sessions_accepted.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);
        StatsSnapshot {
            sessions_accepted: accepted,
            sessions_closed: closed,
            active_sessions: accepted.saturating_sub(closed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            oversized_frames: self.oversized_frames.load(Ordering::Relaxed),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_closed: u64,
    pub active_sessions: u64,
    pub frames_received: u64,
    pub frames_forwarded: u64,
    pub accept_errors: u64,
    pub delivery_failures: u64,
    pub oversized_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_sessions_derived() {
        let stats = Stats::new();
        stats.session_opened();
        stats.session_opened();
        stats.session_closed();
        stats.frames_forwarded(3);

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_accepted, 2);
        assert_eq!(snap.sessions_closed, 1);
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.frames_forwarded, 3);
    }
}
