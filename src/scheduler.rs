// =============================================================================
// Priority Task Scheduler (§4.K)
// =============================================================================
//
// No teacher module does this directly (the teacher spawns one task per
// concern in `main.rs` and never contends for a shared worker pool). Modeled
// on `binance/rate_limit.rs`'s atomic-counter bookkeeping style for the queue
// depth gauge, and on the teacher's `tokio::spawn`-per-concern layout for how
// a submitted job's own future is driven to completion. The concurrency cap
// is a `tokio::sync::Semaphore`, the standard idiom already implied by the
// teacher's `tokio = { features = ["full"] }`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::error::EngineError;

/// Bounded worker pool capacity (§4.K).
const C_MAX: usize = 20;
/// Bounded queue capacity across all priorities combined (§4.K).
const QUEUE_CAP: usize = 1000;
/// Retry attempts and inter-attempt delays for `Transient`-tagged failures.
const RETRY_DELAYS: [Duration; 3] = [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Per-level execution timeout; `BACKGROUND` has none (§4.K).
    fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Critical => Some(Duration::from_secs(30)),
            Self::High => Some(Duration::from_secs(60)),
            Self::Normal => Some(Duration::from_secs(120)),
            Self::Low => Some(Duration::from_secs(300)),
            Self::Background => None,
        }
    }

    /// Queue index, highest priority first — used to enforce strict
    /// priority-then-FIFO ordering across the five internal lanes.
    fn lane(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
            Self::Background => 4,
        }
    }
}

type BoxedJob = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>;

struct Job {
    priority: Priority,
    label: String,
    run: Box<dyn Fn() -> BoxedJob + Send>,
    reply: Option<oneshot::Sender<Result<(), EngineError>>>,
}

/// Priority queue of pending work, backed by five FIFO lanes so that a
/// higher-priority item enqueued after a lower-priority one still starts
/// first (§4.K ordering guarantee), while same-priority items stay FIFO.
pub struct TaskScheduler {
    tx: mpsc::Sender<Job>,
    depth: Arc<AtomicUsize>,
}

impl TaskScheduler {
    /// Spawns the dispatcher loop and returns a handle. The dispatcher owns
    /// five internal FIFO lanes (one per priority) and a `C_MAX`-permit
    /// semaphore; it drains `CRITICAL` before `HIGH` before `NORMAL` and so
    /// on, only falling through to a lower lane when the higher ones are
    /// empty.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAP);
        let depth = Arc::new(AtomicUsize::new(0));
        let dispatcher_depth = depth.clone();
        tokio::spawn(dispatch_loop(rx, dispatcher_depth));
        Self { tx, depth }
    }

    /// Current combined queue depth across all lanes, for a metrics gauge.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Enqueues `job` at `priority` and awaits its outcome, retrying up to
    /// three times with the §4.K backoff schedule when the job fails with an
    /// `EngineError` it marks retryable (`Transient`/`Timeout`).
    pub async fn submit<F, Fut>(&self, priority: Priority, label: impl Into<String>, job: F) -> Result<(), EngineError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let label = label.into();
        let job = Arc::new(job);
        for (attempt, delay) in std::iter::once(None).chain(RETRY_DELAYS.into_iter().map(Some)).enumerate() {
            if let Some(delay) = delay {
                warn!(label = %label, attempt, "retrying scheduled task after transient failure");
                tokio::time::sleep(delay).await;
            }
            let result = self.submit_once(priority, label.clone(), job.clone()).await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < RETRY_DELAYS.len() => continue,
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop always returns or exhausts retries")
    }

    async fn submit_once<F, Fut>(&self, priority: Priority, label: String, job: Arc<F>) -> Result<(), EngineError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let run: Box<dyn Fn() -> BoxedJob + Send> = Box::new(move || {
            let job = job.clone();
            Box::pin(async move { job().await })
        });
        let task = Job { priority, label, run, reply: Some(reply_tx) };
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(task).await.map_err(|_| EngineError::Internal("scheduler dispatcher stopped".to_string()))?;
        reply_rx.await.map_err(|_| EngineError::Internal("scheduled task dropped before completion".to_string()))?
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Job>, depth: Arc<AtomicUsize>) {
    let semaphore = Arc::new(Semaphore::new(C_MAX));
    let mut lanes: [Vec<Job>; 5] = Default::default();

    loop {
        // Drain everything currently available on the channel into its lane
        // without blocking, so a burst of low-priority submissions doesn't
        // stall a CRITICAL item that arrives moments later.
        loop {
            match rx.try_recv() {
                Ok(job) => lanes[job.priority.lane()].push(job),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        let next = lanes.iter_mut().find_map(|lane| if lane.is_empty() { None } else { Some(lane.remove(0)) });

        let Some(job) = next else {
            // Nothing ready: block for the next submission.
            match rx.recv().await {
                Some(job) => lanes[job.priority.lane()].push(job),
                None => return,
            }
            continue;
        };

        depth.fetch_sub(1, Ordering::Relaxed);
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let label = job.label.clone();
        let priority = job.priority;
        let deadline = priority.timeout();
        let run = job.run;
        let reply = job.reply;

        tokio::spawn(async move {
            let _permit = permit;
            let fut = run();
            let outcome = match deadline {
                Some(d) => match timeout(d, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout),
                },
                None => fut.await,
            };
            if let Err(ref err) = outcome {
                error!(label = %label, priority = ?priority, error = %err, "scheduled task failed");
            }
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn priority_ordering_is_highest_first() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Background);
    }

    #[test]
    fn timeouts_match_per_level_table() {
        assert_eq!(Priority::Critical.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(Priority::High.timeout(), Some(Duration::from_secs(60)));
        assert_eq!(Priority::Normal.timeout(), Some(Duration::from_secs(120)));
        assert_eq!(Priority::Low.timeout(), Some(Duration::from_secs(300)));
        assert_eq!(Priority::Background.timeout(), None);
    }

    #[tokio::test]
    async fn submit_runs_job_and_returns_its_result() {
        let scheduler = TaskScheduler::spawn();
        let result = scheduler.submit(Priority::Normal, "noop", || async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn submit_retries_transient_failures_until_success() {
        let scheduler = TaskScheduler::spawn();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = scheduler
            .submit(Priority::High, "flaky", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::Transient("not yet".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn submit_does_not_retry_non_transient_failures() {
        let scheduler = TaskScheduler::spawn();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = scheduler
            .submit(Priority::Low, "bad-input", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::InvalidInput("nope".to_string()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
