//! Module for driving `infer` from a background task.

use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use std::time::Duration;

use tokio::{task::JoinHandle, sync::Notify};
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::WorkerConfig;
use crate::error::ErrorKind;
use crate::scheduler::{DecodeStatus, Scheduler};

/// A handle for managing a background task that runs batch evaluations.
///
/// The handle owns the task's run flag, the notifier used to wake it and a
/// cancellation token that aborts an evaluation in flight. Dropping the handle shuts
/// the task down.
pub struct WorkerHandle {
    /// Flag indicating whether the background task should continue running
    running: Arc<AtomicBool>,

    /// Handle to the spawned background task, becomes `None` after shutdown is initiated
    handle: Option<JoinHandle<()>>,

    /// Notification mechanism to wake up the background task
    notifier: Arc<Notify>,

    /// Cancels whatever the task is awaiting on shutdown
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Creates a new `WorkerHandle` by spawning a background task.
    ///
    /// # Parameters
    ///
    /// * `notifier` - The notifier the task waits on between rounds of work.
    /// * `task` - A function that takes the running flag, the notifier and a cancellation
    ///   token, and returns a `JoinHandle` for the task it spawned.
    ///
    /// # Returns
    ///
    /// A new `WorkerHandle` instance with the task running.
    pub fn new<F>(notifier: Arc<Notify>, task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>, CancellationToken) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let handle = task(running.clone(), notifier.clone(), cancel.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
            cancel,
        }
    }

    /// Wakes the background task so it checks for work.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    /// Whether the task has been asked to keep running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the task has exited, on its own or after shutdown.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Initiates a graceful shutdown of the background task.
    ///
    /// This method:
    /// 1. Sets the running flag to `false`
    /// 2. Cancels an evaluation in flight; its tokens stay queued
    /// 3. Notifies the task to wake up so it observes the flag
    /// 4. Spawns a separate task to await its completion
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.notifier.notify_one();

        if let Some(handle) = self.handle.take() {
            tokio::spawn(async move {
                let _ = handle.await;
            });
        }
    }
}

impl Drop for WorkerHandle {
    /// Ensures the background task is terminated when the handle is dropped.
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background driver calling [`Scheduler::infer`] whenever tokens are queued.
///
/// The worker sleeps on the scheduler's work notifier, which every prompt signals,
/// and also wakes every [`WorkerConfig::poll_interval`]. On `NoCacheSlot` it waits for
/// the next wake-up before retrying. A fatal error, or the scheduler being disposed,
/// stops it.
pub struct InferWorker;

impl InferWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(scheduler: Scheduler, config: WorkerConfig) -> WorkerHandle {
        WorkerHandle::new(scheduler.work_notifier(), move |running, notifier, cancel| {
            tokio::spawn(infer_loop(scheduler, config, running, notifier, cancel))
        })
    }
}

async fn infer_loop(
    scheduler: Scheduler,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    cancel: CancellationToken,
) {
    debug!(scheduler = %scheduler.id(), "infer worker started");
    while running.load(Ordering::SeqCst) {
        if scheduler.is_disposed() || scheduler.is_faulted() {
            break;
        }
        if scheduler.batched_token_count() == 0 {
            let _ = timeout_await_notifier(&notifier, config.poll_interval).await;
            continue;
        }

        match scheduler.infer(&cancel).await {
            Ok(DecodeStatus::Ok) => {}
            Ok(DecodeStatus::NoCacheSlot) => {
                warn!(scheduler = %scheduler.id(), "worker waiting for cache space");
                let _ = timeout_await_notifier(&notifier, config.poll_interval).await;
            }
            Err(e) if e.kind() == ErrorKind::Backpressure => {}
            Err(e) => {
                error!(scheduler = %scheduler.id(), error = %e, "infer worker stopping");
                break;
            }
        }
    }
    debug!(scheduler = %scheduler.id(), "infer worker stopped");
}

/// Waits for a notification, giving up after `interval` so the loop can re-check
/// its conditions.
#[inline]
async fn timeout_await_notifier(notifier: &Notify, interval: Duration) -> Result<(), Elapsed> {
    tokio::time::timeout(interval, notifier.notified()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time;

    use crate::backend::mock_evaluator::MockEvaluator;
    use crate::backend::{EvalStatus, GreedySampler, MemoryKvCache};
    use crate::config::SchedulerConfig;
    use crate::sequence::Token;

    fn spawn_loop<F>(body: F) -> WorkerHandle
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>, CancellationToken) -> JoinHandle<()>,
    {
        WorkerHandle::new(Arc::new(Notify::new()), body)
    }

    #[tokio::test]
    async fn test_worker_starts_running() {
        let worker = spawn_loop(|running, _notifier, _cancel| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        assert!(worker.is_running());
        assert!(!worker.is_finished());
    }

    #[tokio::test]
    async fn test_worker_notifies() {
        let notification_count = Arc::new(Mutex::new(0));
        let notification_count_clone = notification_count.clone();

        let worker = spawn_loop(|running, notifier, _cancel| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    notifier.notified().await;
                    let mut count = notification_count_clone.lock().unwrap();
                    *count += 1;
                }
            })
        });

        time::sleep(Duration::from_millis(50)).await;

        worker.notify();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*notification_count.lock().unwrap(), 1);

        worker.notify();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*notification_count.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_worker_shutdown_cancels_and_stops() {
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let observed_cancel_clone = observed_cancel.clone();

        let mut worker = spawn_loop(|running, _notifier, cancel| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    cancel.cancelled().await;
                    observed_cancel_clone.store(true, Ordering::SeqCst);
                }
            })
        });

        time::sleep(Duration::from_millis(20)).await;
        worker.shutdown();
        time::sleep(Duration::from_millis(100)).await;

        assert!(!worker.is_running());
        assert!(observed_cancel.load(Ordering::SeqCst));
        assert!(worker.handle.is_none());
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn test_worker_drop_triggers_shutdown() {
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let is_shutdown_clone = is_shutdown.clone();

        {
            let worker = spawn_loop(|running, notifier, _cancel| {
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        notifier.notified().await;
                    }
                    is_shutdown_clone.store(true, Ordering::SeqCst);
                })
            });

            worker.notify();
            time::sleep(Duration::from_millis(50)).await;
        }

        time::sleep(Duration::from_millis(100)).await;
        assert!(is_shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_multiple_shutdowns() {
        let mut worker = spawn_loop(|running, _notifier, _cancel| {
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
        });

        worker.shutdown();
        worker.shutdown();
        worker.shutdown();

        assert!(!worker.is_running());
    }

    fn scheduler(evaluator: Arc<MockEvaluator>) -> Scheduler {
        Scheduler::new(evaluator, MemoryKvCache::new(), SchedulerConfig::default().with_batch_capacity(16)).unwrap()
    }

    fn fast() -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_infer_worker_evaluates_prompts() {
        let evaluator = Arc::new(MockEvaluator::new(16));
        let scheduler = scheduler(evaluator.clone());
        let _worker = InferWorker::spawn(scheduler.clone(), fast());

        let conversation = scheduler.create().unwrap();
        conversation.prompt(&[Token(3), Token(4)]).unwrap();
        time::timeout(Duration::from_secs(5), conversation.ready())
            .await
            .unwrap()
            .unwrap();

        assert!(conversation.is_sampleable());
        assert_eq!(conversation.sample(&mut GreedySampler).unwrap(), Token(5));
        time::timeout(Duration::from_secs(5), conversation.ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.committed_tokens().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_infer_worker_retries_after_no_cache_slot() {
        let evaluator = Arc::new(MockEvaluator::new(16));
        evaluator.script([EvalStatus::NoCacheSlot, EvalStatus::NoCacheSlot]);
        let scheduler = scheduler(evaluator.clone());
        let _worker = InferWorker::spawn(scheduler.clone(), fast());

        let conversation = scheduler.create().unwrap();
        conversation.prompt(&[Token(1)]).unwrap();
        time::timeout(Duration::from_secs(5), conversation.ready())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(evaluator.call_count(), 3);
        assert_eq!(scheduler.epoch().get(), 2);
    }

    #[tokio::test]
    async fn test_infer_worker_stops_on_fatal_error() {
        let evaluator = Arc::new(MockEvaluator::new(16));
        evaluator.script([EvalStatus::Error(-7)]);
        let scheduler = scheduler(evaluator.clone());
        let worker = InferWorker::spawn(scheduler.clone(), fast());

        let conversation = scheduler.create().unwrap();
        conversation.prompt(&[Token(1)]).unwrap();

        time::timeout(Duration::from_secs(5), async {
            while !worker.is_finished() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(scheduler.is_faulted());
        assert!(conversation.ready().await.is_err());
    }
}
