//! Debounced, single-flight push worker.
//!
//! One task owns the push loop. Triggers go through a channel of capacity
//! one: a trigger that arrives while a push is running is kept, so the
//! loop runs once more when the push finishes, and further triggers
//! coalesce into it. An independent interval catches entries that piled
//! up without a trigger.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::PushConfig;
use crate::error::Result;

/// The work the push worker drives.
#[async_trait]
pub trait Pusher: Send + Sync + 'static {
    /// Push everything that can be pushed now; returns the number delivered.
    async fn push_pending(&self) -> Result<usize>;

    /// Whether there is anything worth waking up for.
    async fn has_pending(&self) -> bool;
}

/// Handle used to request a push.
#[derive(Debug, Clone)]
pub struct PushHandle {
    tx: mpsc::Sender<()>,
}

impl PushHandle {
    /// Request a push. Never blocks; coalesces with an already queued request.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct PushWorker;

impl PushWorker {
    /// Start the worker task.
    pub fn spawn<P: Pusher>(
        pusher: Arc<P>,
        config: PushConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> (PushHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut auto_push = tokio::time::interval(config.auto_push_interval);
            auto_push.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            auto_push.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    trigger = rx.recv() => {
                        if trigger.is_none() {
                            break;
                        }
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(config.debounce) => {}
                        }
                        // Triggers received during the debounce are covered by this run.
                        while rx.try_recv().is_ok() {}
                        run_push(pusher.as_ref()).await;
                    }
                    _ = auto_push.tick() => {
                        if pusher.has_pending().await {
                            debug!("auto-push found pending entries");
                            run_push(pusher.as_ref()).await;
                        }
                    }
                }
            }
            debug!("push worker stopped");
        });

        (PushHandle { tx }, task)
    }
}

async fn run_push<P: Pusher>(pusher: &P) {
    match pusher.push_pending().await {
        Ok(0) => {}
        Ok(pushed) => debug!(pushed, "push finished"),
        Err(e) => warn!(error = %e, "push failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct SlowPusher {
        runs: AtomicUsize,
        running: AtomicBool,
        overlapped: AtomicBool,
        pending: AtomicBool,
    }

    #[async_trait]
    impl Pusher for SlowPusher {
        async fn push_pending(&self) -> Result<usize> {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.pending.store(false, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(1)
        }

        async fn has_pending(&self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }
    }

    fn config(auto: Duration) -> PushConfig {
        PushConfig {
            debounce: Duration::from_millis(5),
            auto_push_interval: auto,
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn test_triggers_coalesce_and_never_overlap() {
        let pusher = Arc::new(SlowPusher::default());
        let (_tx, rx) = watch::channel(false);
        let (handle, _task) =
            PushWorker::spawn(pusher.clone(), config(Duration::from_secs(3600)), rx);

        handle.trigger();
        tokio::time::sleep(Duration::from_millis(15)).await;
        // Push in flight; these coalesce into a single follow-up run.
        for _ in 0..10 {
            handle.trigger();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(pusher.runs.load(Ordering::SeqCst), 2);
        assert!(!pusher.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_auto_push_picks_up_pending() {
        let pusher = Arc::new(SlowPusher::default());
        pusher.pending.store(true, Ordering::SeqCst);
        let (_tx, rx) = watch::channel(false);
        let (_handle, _task) =
            PushWorker::spawn(pusher.clone(), config(Duration::from_millis(20)), rx);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pusher.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let pusher = Arc::new(SlowPusher::default());
        let (tx, rx) = watch::channel(false);
        let (_handle, task) = PushWorker::spawn(pusher, config(Duration::from_secs(3600)), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
