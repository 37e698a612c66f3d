//! Trellis Job - Background Execution of Heavy Phase Functions
//!
//! The job runner is the only shared resource across sessions: a queue
//! of opaque jobs executed off the request path. Delivery is
//! at-least-once - a failed attempt is retried with backoff - so jobs
//! must be idempotent. Heavy growth functions get this for free from
//! the idempotent branch-attachment invariant in trellis-core.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// A unit of offloaded work. `run` may be invoked more than once for
/// the same job (retry after a crashed or failed attempt).
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<()>;

    /// Short human-readable tag for logs.
    fn describe(&self) -> String {
        "job".to_string()
    }
}

/// Monotonic queue-local job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(u64);

/// Handle returned by [`JobRunner::enqueue`], used to poll completion.
#[derive(Debug, Clone, Copy)]
pub struct JobHandle {
    pub id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Attempts per job before it is reported as failed.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

struct Envelope {
    id: JobId,
    job: Arc<dyn Job>,
}

type StatusMap = Arc<Mutex<HashMap<JobId, JobStatus>>>;

/// The shared job queue and its worker pool.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct JobRunner {
    tx: mpsc::UnboundedSender<Envelope>,
    statuses: StatusMap,
    tracker: TaskTracker,
    next_id: Arc<AtomicU64>,
}

impl JobRunner {
    /// Spawn the dispatcher on the current tokio runtime.
    pub fn start(config: JobConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let statuses: StatusMap = Arc::new(Mutex::new(HashMap::new()));
        let tracker = TaskTracker::new();

        let dispatcher_statuses = statuses.clone();
        let dispatcher_tracker = tracker.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let statuses = dispatcher_statuses.clone();
                let config = config.clone();
                dispatcher_tracker.spawn(async move {
                    execute(envelope, config, statuses).await;
                });
            }
        });

        Self {
            tx,
            statuses,
            tracker,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hand a job to the queue and return immediately.
    pub fn enqueue(&self, job: Arc<dyn Job>) -> JobHandle {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.statuses.lock().unwrap().insert(id, JobStatus::Pending);
        tracing::debug!(job = %job.describe(), ?id, "enqueued");
        if self.tx.send(Envelope { id, job }).is_err() {
            // Queue torn down; the status map is the only witness.
            self.statuses
                .lock()
                .unwrap()
                .insert(id, JobStatus::Failed("queue closed".to_string()));
        }
        JobHandle { id }
    }

    pub fn poll(&self, handle: &JobHandle) -> JobStatus {
        self.statuses
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
            .unwrap_or(JobStatus::Failed("unknown job".to_string()))
    }

    /// Wait until every enqueued job has reached a terminal status.
    pub async fn drain(&self) {
        loop {
            let outstanding = self
                .statuses
                .lock()
                .unwrap()
                .values()
                .any(|s| matches!(s, JobStatus::Pending | JobStatus::Running));
            if !outstanding {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn execute(envelope: Envelope, config: JobConfig, statuses: StatusMap) {
    let Envelope { id, job } = envelope;
    let tag = job.describe();
    statuses.lock().unwrap().insert(id, JobStatus::Running);

    for attempt in 1..=config.max_attempts {
        match job.run().await {
            Ok(()) => {
                tracing::debug!(job = %tag, ?id, attempt, "completed");
                statuses.lock().unwrap().insert(id, JobStatus::Done);
                return;
            }
            Err(err) if attempt < config.max_attempts => {
                tracing::warn!(job = %tag, ?id, attempt, error = %err, "attempt failed, retrying");
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(err) => {
                tracing::error!(job = %tag, ?id, attempt, error = %err, "job failed");
                statuses
                    .lock()
                    .unwrap()
                    .insert(id, JobStatus::Failed(err.to_string()));
            }
        }
    }
}
