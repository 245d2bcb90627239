//! Background task ownership.
//!
//! Every periodic job (pending replay, relay pull) and every one-shot timer
//! (ticket acknowledgment checks, relay fan-out) is spawned through a
//! [`Scheduler`] so that shutdown can cancel and await all of them.

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Cheap to clone; clones share the same token and tracker.
#[derive(Clone, Default)]
pub struct Scheduler {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Run `job` every `every`, starting after the first full period.
    pub fn spawn_repeating<F, Fut>(&self, name: &'static str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return;
        }
        let token = self.token.clone();
        self.tracker.spawn(async move {
            info!(task = name, interval_ms = every.as_millis() as u64, "Background task started");
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = job() => {}
                        }
                    }
                }
            }
            info!(task = name, "Background task stopped");
        });
    }

    /// Run `job` once after `delay` unless shutdown comes first.
    pub fn spawn_once<Fut>(&self, name: &'static str, delay: Duration, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return;
        }
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = name, "One-shot task cancelled");
                }
                _ = async {
                    tokio::time::sleep(delay).await;
                    job.await;
                } => {}
            }
        });
    }

    /// Fire-and-forget work that should still be awaited on shutdown.
    pub fn spawn<Fut>(&self, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_once("detached", Duration::ZERO, job);
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Scheduler drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_repeating_task_runs_until_shutdown() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.spawn_repeating("count", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several runs, got {seen}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_one_shot_fires_after_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        scheduler.spawn_once("ack-check", Duration::from_millis(20), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_one_shot() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        scheduler.spawn_once("late", Duration::from_secs(30), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.shutdown().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_shut_down());

        // Nothing new is accepted after shutdown.
        scheduler.spawn(async {});
        assert_eq!(scheduler.active_tasks(), 0);
    }
}
