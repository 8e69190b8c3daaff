use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{task, time};
use tracing::info;

/// A point-in-time copy of the server counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub successes: u64,
    pub failures: u64,
}

/// Success and failure counters shared by every connection handler.
///
/// Both counters sit behind one lock, so a snapshot never sees half of an update.
/// They only ever grow.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<Snapshot>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.counters.lock().successes += 1;
    }

    pub fn record_failure(&self) {
        self.counters.lock().failures += 1;
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.counters.lock()
    }
}

/// Log a snapshot of `metrics` every `interval` until the task is aborted.
pub fn spawn_reporter(metrics: Arc<Metrics>, interval: Duration) -> task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        loop {
            let _ = ticker.tick().await;
            let snapshot = metrics.snapshot();
            info!(
                "[STATUS] Success: {}, Failures: {}",
                snapshot.successes, snapshot.failures
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            metrics.record_success();
                        } else {
                            metrics.record_failure();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            metrics.snapshot(),
            Snapshot {
                successes: 4000,
                failures: 4000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_keeps_running_without_reset() {
        let metrics = Arc::new(Metrics::new());
        metrics.record_success();
        let reporter = spawn_reporter(metrics.clone(), Duration::from_secs(10));

        time::sleep(Duration::from_secs(25)).await;
        metrics.record_failure();
        time::sleep(Duration::from_secs(10)).await;

        assert!(!reporter.is_finished());
        assert_eq!(
            metrics.snapshot(),
            Snapshot {
                successes: 1,
                failures: 1
            }
        );
        reporter.abort();
    }
}
