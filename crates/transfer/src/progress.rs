use std::sync::Mutex;

use tokio::time::Instant;

/// Point-in-time view of an upload's progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub elapsed_seconds: f64,
    pub throughput_bps: f64,
    /// `None` while nothing has been transferred yet.
    pub eta_seconds: Option<f64>,
}

impl ProgressSnapshot {
    /// Completion percentage in `[0, 100]`. An empty object is 100% done.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }
}

/// Cumulative byte counter for one upload.
///
/// The counter only grows and saturates at `total_bytes`. Callers record
/// each chunk once, when it is acknowledged.
#[derive(Debug)]
pub struct ProgressTracker {
    total_bytes: u64,
    started: Instant,
    transferred: Mutex<u64>,
}

impl ProgressTracker {
    /// Starts the clock for an upload of `total_bytes`.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            started: Instant::now(),
            transferred: Mutex::new(0),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Adds `bytes` to the counter and returns the updated snapshot.
    pub fn record(&self, bytes: u64) -> ProgressSnapshot {
        let transferred = {
            let mut t = self.transferred.lock().unwrap_or_else(|e| e.into_inner());
            *t = t.saturating_add(bytes).min(self.total_bytes);
            *t
        };
        self.snapshot_at(transferred)
    }

    /// Returns the current snapshot without changing the counter.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let transferred = *self.transferred.lock().unwrap_or_else(|e| e.into_inner());
        self.snapshot_at(transferred)
    }

    fn snapshot_at(&self, bytes_transferred: u64) -> ProgressSnapshot {
        let elapsed_seconds = self.started.elapsed().as_secs_f64();
        let throughput_bps = if elapsed_seconds > 0.0 {
            bytes_transferred as f64 / elapsed_seconds
        } else {
            0.0
        };
        let eta_seconds = (throughput_bps > 0.0)
            .then(|| (self.total_bytes - bytes_transferred) as f64 / throughput_bps);

        ProgressSnapshot {
            bytes_transferred,
            total_bytes: self.total_bytes,
            elapsed_seconds,
            throughput_bps,
            eta_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn eta_unknown_before_first_ack() {
        let tracker = ProgressTracker::new(1000);
        tokio::time::advance(Duration::from_secs(1)).await;

        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_transferred, 0);
        assert_eq!(snap.throughput_bps, 0.0);
        assert!(snap.eta_seconds.is_none());
        assert_eq!(snap.percent(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_and_eta() {
        let tracker = ProgressTracker::new(1000);
        tokio::time::advance(Duration::from_secs(2)).await;

        let snap = tracker.record(250);
        assert_eq!(snap.bytes_transferred, 250);
        assert!((snap.elapsed_seconds - 2.0).abs() < 1e-9);
        assert!((snap.throughput_bps - 125.0).abs() < 1e-9);
        assert!((snap.eta_seconds.unwrap() - 6.0).abs() < 1e-9);
        assert!((snap.percent() - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_is_monotonic_and_saturates() {
        let tracker = ProgressTracker::new(100);
        tokio::time::advance(Duration::from_millis(10)).await;

        let mut last = 0;
        for _ in 0..5 {
            let snap = tracker.record(30);
            assert!(snap.bytes_transferred >= last);
            last = snap.bytes_transferred;
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.bytes_transferred, 100);
        assert!(snap.is_complete());
        assert_eq!(snap.percent(), 100.0);
        assert_eq!(snap.eta_seconds, Some(0.0));
    }

    #[test]
    fn empty_object_is_complete() {
        let snap = ProgressSnapshot {
            bytes_transferred: 0,
            total_bytes: 0,
            elapsed_seconds: 0.0,
            throughput_bps: 0.0,
            eta_seconds: None,
        };
        assert_eq!(snap.percent(), 100.0);
        assert!(snap.is_complete());
    }

    #[test]
    fn concurrent_records() {
        let tracker = Arc::new(ProgressTracker::new(10_000));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let t = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.record(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.snapshot().bytes_transferred, 1000);
    }
}
