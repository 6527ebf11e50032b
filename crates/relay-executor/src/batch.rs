//! Shuffled, bounded fan-out shared by the trading loop and the position
//! monitor.
//!
//! Items are shuffled so no subscriber is consistently first, split into
//! batches of at most `batch_size`, and each batch runs concurrently on a
//! `JoinSet`. The next batch starts only after the previous one drained,
//! separated by `delay`. A panicking item is counted and never aborts the
//! rest of the batch.

use rand::seq::SliceRandom;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Batch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub delay: Duration,
}

impl BatchConfig {
    #[must_use]
    pub fn new(batch_size: usize, delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            delay,
        }
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: usize,
    pub completed: usize,
    pub panicked: usize,
}

/// Run `worker` over all `items` in shuffled, bounded batches.
pub async fn run_in_batches<T, F, Fut>(mut items: Vec<T>, config: BatchConfig, worker: F) -> BatchStats
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    items.shuffle(&mut rand::thread_rng());

    let batch_size = config.batch_size.max(1);
    let total = items.len();
    let mut stats = BatchStats::default();
    let mut remaining = items.into_iter().peekable();

    while remaining.peek().is_some() {
        if stats.batches > 0 && !config.delay.is_zero() {
            tokio::time::sleep(config.delay).await;
        }

        let mut set = JoinSet::new();
        for item in remaining.by_ref().take(batch_size) {
            set.spawn(worker(item));
        }
        stats.batches += 1;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(()) => stats.completed += 1,
                Err(e) => {
                    stats.panicked += 1;
                    error!(error = %e, "Batch item aborted");
                }
            }
        }
    }

    if total > 0 {
        debug!(
            total,
            batches = stats.batches,
            panicked = stats.panicked,
            "Batch run finished"
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_every_item_runs_once() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let stats = run_in_batches(
            (0..60).collect(),
            BatchConfig::new(25, Duration::ZERO),
            |i: usize| {
                let seen = seen.clone();
                async move {
                    assert!(seen.lock().unwrap().insert(i), "item {i} ran twice");
                }
            },
        )
        .await;

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.completed, 60);
        assert_eq!(seen.lock().unwrap().len(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_size_bounds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        run_in_batches(
            (0..10).collect(),
            BatchConfig::new(3, Duration::from_millis(50)),
            |_: usize| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_item_is_isolated() {
        let done = Arc::new(AtomicUsize::new(0));
        let stats = run_in_batches(
            (0..5).collect(),
            BatchConfig::new(5, Duration::ZERO),
            |i: usize| {
                let done = done.clone();
                async move {
                    if i == 2 {
                        panic!("boom");
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 4);
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let stats = run_in_batches(Vec::<u8>::new(), BatchConfig::new(10, Duration::ZERO), |_| async {}).await;
        assert_eq!(stats, BatchStats::default());
    }
}
