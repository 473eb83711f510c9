//! Link and logging counters for the running session.
//!
//! Updated from the receive thread with relaxed atomics (no locks on the hot path);
//! the orchestrator snapshots them at block boundaries to build the summary rows.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Counters shared between the receive thread, the router and the orchestrator.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    datagrams: AtomicU64,
    malformed: AtomicU64,
    routed: AtomicU64,
    discarded: AtomicU64,
    dropped_lines: AtomicU64,
    dropped_records: AtomicU64,
    finish_flags: AtomicU64,
}

pub type SharedMetrics = Arc<LinkMetrics>;

/// Point-in-time copy of [`LinkMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Datagrams received, well-formed or not.
    pub datagrams: u64,
    /// Datagrams shorter than one record.
    pub malformed: u64,
    /// Records that arrived while a trial was running and were queued for the log.
    pub routed: u64,
    /// Records that arrived outside a running trial.
    pub discarded: u64,
    /// Lines rejected because no log session was open.
    pub dropped_lines: u64,
    /// Records a full or closed subscriber channel refused.
    pub dropped_records: u64,
    pub finish_flags: u64,
}

impl LinkMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn record_datagram(&self) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_line(&self) {
        self.dropped_lines.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_record(&self) {
        self.dropped_records.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_finish_flag(&self) {
        self.finish_flags.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dropped_lines: self.dropped_lines.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            finish_flags: self.finish_flags.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Counter growth between `earlier` and `self`.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams: self.datagrams.saturating_sub(earlier.datagrams),
            malformed: self.malformed.saturating_sub(earlier.malformed),
            routed: self.routed.saturating_sub(earlier.routed),
            discarded: self.discarded.saturating_sub(earlier.discarded),
            dropped_lines: self.dropped_lines.saturating_sub(earlier.dropped_lines),
            dropped_records: self.dropped_records.saturating_sub(earlier.dropped_records),
            finish_flags: self.finish_flags.saturating_sub(earlier.finish_flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn counters_survive_concurrent_updates() {
        let metrics = LinkMetrics::shared();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        m.record_datagram();
                        m.record_routed();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.datagrams, 4_000);
        assert_eq!(snap.routed, 4_000);
        assert_eq!(snap.malformed, 0);
    }

    #[test]
    fn delta_between_snapshots() {
        let metrics = LinkMetrics::default();
        metrics.record_datagram();
        let before = metrics.snapshot();
        metrics.record_datagram();
        metrics.record_malformed();

        let delta = metrics.snapshot().since(&before);
        assert_eq!(delta.datagrams, 1);
        assert_eq!(delta.malformed, 1);
        assert_eq!(delta.routed, 0);
    }
}
