//! Background job scheduler.
//!
//! Two job shapes (spec.md 9 "Background scheduler"):
//! - **Keyed, non-reentrant**: triggered on demand (e.g. ingestion per
//!   fork); a key already running coalesces further triggers instead of
//!   queuing a second execution.
//! - **Interval**: runs on a fixed period for the process lifetime (prune,
//!   stale-publish cleanup).
//!
//! No distributed locking; this assumes a single scheduler instance per
//! process, matching spec.md's concurrency model.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;

/// Coalescing trigger for non-reentrant, keyed background jobs.
#[derive(Clone, Default)]
pub struct JobScheduler {
    running: Arc<DashSet<String>>,
}

impl JobScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `job` under `key` unless a job with that key is already
    /// running, in which case this call is a no-op. Never runs two jobs
    /// with the same key concurrently.
    pub fn trigger_keyed<F>(&self, key: impl Into<String>, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if !self.running.insert(key.clone()) {
            tracing::debug!(key, "job already running, coalescing trigger");
            return;
        }
        let running = self.running.clone();
        tokio::spawn(async move {
            job.await;
            running.remove(&key);
        });
    }

    #[must_use]
    pub fn is_running(&self, key: &str) -> bool {
        self.running.contains(key)
    }
}

/// Spawns a task that runs `job` every `period`, forever, until the process
/// exits. A panicking or erroring job is logged; the schedule continues.
pub fn spawn_interval<F, Fut>(name: &'static str, period: Duration, mut job: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = job().await {
                tracing::error!(job = name, error = %err, "background job failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn coalesces_concurrent_triggers_for_same_key() {
        let scheduler = JobScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = runs.clone();
            scheduler.trigger_keyed("wow", async move {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let scheduler = JobScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_a = runs.clone();
        scheduler.trigger_keyed("wow", async move {
            runs_a.fetch_add(1, Ordering::SeqCst);
        });
        let runs_b = runs.clone();
        scheduler.trigger_keyed("space-station-14", async move {
            runs_b.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn key_can_retrigger_after_completion() {
        let scheduler = JobScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_a = runs.clone();
        scheduler.trigger_keyed("wow", async move {
            runs_a.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!scheduler.is_running("wow"));

        let runs_b = runs.clone();
        scheduler.trigger_keyed("wow", async move {
            runs_b.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
