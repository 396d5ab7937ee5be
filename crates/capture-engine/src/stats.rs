//! Lock-free worker counters, readable from any thread without a call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct WorkerStats {
    calls: AtomicU64,
    builds: AtomicU64,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Calls the worker has finished processing.
    pub calls: u64,
    /// Successful session builds, including the one made by open.
    pub session_builds: u64,
    pub in_flight: u32,
    /// Highest number of calls ever processed at once. Never above one.
    pub peak_in_flight: u32,
}

impl WorkerStats {
    pub(crate) fn begin_call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn end_call(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_build(&self) {
        self.builds.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::SeqCst),
            session_builds: self.builds.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_overlap() {
        let stats = WorkerStats::default();
        stats.begin_call();
        stats.end_call();
        stats.begin_call();
        stats.begin_call();
        stats.end_call();
        stats.end_call();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.calls, 3);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.peak_in_flight, 2);
    }
}
