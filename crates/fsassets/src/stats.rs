//! Read counters and the periodic stats report.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters accumulated between two reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadCounters {
    /// Successful reads from metadata + backend.
    pub reads: u64,
    /// Total time spent in those reads.
    pub read_time: Duration,
    /// Lookups with no metadata record.
    pub missing_metadata: u64,
    /// Lookups whose record had no usable backend object.
    pub missing_backend: u64,
}

impl ReadCounters {
    /// Mean time per read, zero when nothing was read.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.reads) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.read_time / n,
            Err(_) => Duration::from_secs_f64(self.read_time.as_secs_f64() / self.reads as f64),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Shared read counters, guarded by their own lock.
#[derive(Debug, Default)]
pub struct ReadStats {
    counters: Mutex<ReadCounters>,
}

impl ReadStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ReadCounters> {
        // Counters stay usable even if a holder panicked.
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_read(&self, elapsed: Duration) {
        let mut counters = self.lock();
        counters.reads += 1;
        counters.read_time += elapsed;
    }

    pub fn record_missing_metadata(&self) {
        self.lock().missing_metadata += 1;
    }

    pub fn record_missing_backend(&self) {
        self.lock().missing_backend += 1;
    }

    /// Current values, without resetting.
    pub fn snapshot(&self) -> ReadCounters {
        *self.lock()
    }

    /// Current values, resetting them to zero.
    pub fn take(&self) -> ReadCounters {
        std::mem::take(&mut *self.lock())
    }
}

/// Emit one summary line and reset the counters.
///
/// Nothing is logged for a quiet interval. Returns the counters that were
/// reported.
pub fn report_once(stats: &ReadStats) -> ReadCounters {
    let counters = stats.take();
    if !counters.is_empty() {
        info!(
            reads = counters.reads,
            total_ms = counters.read_time.as_millis() as u64,
            avg_ms = counters.average().as_secs_f64() * 1000.0,
            missing_metadata = counters.missing_metadata,
            missing_backend = counters.missing_backend,
            "read stats: {} reads, avg {:.3} ms, {} missing metadata, {} missing in backend",
            counters.reads,
            counters.average().as_secs_f64() * 1000.0,
            counters.missing_metadata,
            counters.missing_backend,
        );
    }
    counters
}

/// Run [`report_once`] every `interval` until cancelled.
pub fn spawn_stats_task(
    stats: Arc<ReadStats>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first report covers
        // a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stats task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    report_once(&stats);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ReadStats::new();
        stats.record_read(Duration::from_millis(10));
        stats.record_read(Duration::from_millis(30));
        stats.record_missing_metadata();
        stats.record_missing_backend();
        stats.record_missing_backend();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.read_time, Duration::from_millis(40));
        assert_eq!(snap.average(), Duration::from_millis(20));
        assert_eq!(snap.missing_metadata, 1);
        assert_eq!(snap.missing_backend, 2);

        // snapshot does not reset
        assert_eq!(stats.snapshot(), snap);
    }

    #[test]
    fn test_report_resets() {
        let stats = ReadStats::new();
        stats.record_read(Duration::from_millis(5));

        let reported = report_once(&stats);
        assert_eq!(reported.reads, 1);
        assert!(stats.snapshot().is_empty());
        assert!(report_once(&stats).is_empty());
    }

    #[test]
    fn test_average_of_nothing() {
        assert_eq!(ReadCounters::default().average(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stats_task_reports_and_stops() {
        let stats = Arc::new(ReadStats::new());
        stats.record_missing_metadata();

        let cancel = CancellationToken::new();
        let handle = spawn_stats_task(stats.clone(), Duration::from_millis(20), cancel.clone());

        for _ in 0..100 {
            if stats.snapshot().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stats.snapshot().is_empty());

        cancel.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(5), handle).await.is_ok());
    }
}
