//! Worker runner: polls the queue, claims jobs, and drives registered
//! handlers through the lifecycle protocol.
//!
//! Handlers are external business logic (email sending, OCR, report
//! generation, ...); the runner only drives the claim/complete/fail protocol.
//! Delivery is at-least-once, so handlers must be idempotent. There is no
//! timeout or reaper here: a worker that dies mid-job leaves it `processing`
//! until an external watchdog intervenes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::service::{JobQueue, QueueError};
use crate::store::JobStore;
use crate::types::{Job, JobType};

/// Outcome reported by a job handler.
#[derive(Debug)]
pub enum HandlerOutcome {
    Success,
    Failure(String),
}

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> HandlerOutcome + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How often to poll for due jobs.
    pub poll_interval: Duration,
    /// Candidates fetched per poll cycle.
    pub batch_size: usize,
    /// Name for logging.
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Counts for a single poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Claims won (candidates lost to other workers are not counted).
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Cumulative runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Background job worker.
///
/// Polls for due jobs, claims each candidate (skipping the ones another
/// worker wins), executes the registered handler, and reports the outcome
/// back through the queue.
pub struct JobWorker<S> {
    queue: JobQueue<S>,
    handlers: HashMap<JobType, JobHandler>,
}

impl<S: JobStore + 'static> JobWorker<S> {
    pub fn new(queue: JobQueue<S>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a job type.
    pub fn register_handler<F>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(&Job) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(job_type, Box::new(handler));
    }

    /// Run a single poll cycle: fetch due candidates, claim, execute, report.
    /// Useful for tests and for cron-style invocation.
    pub async fn run_once(&self, limit: usize) -> Result<BatchOutcome, QueueError> {
        let candidates = self.queue.get_next_jobs(limit).await?;
        let mut outcome = BatchOutcome::default();

        for job in candidates {
            if !self.queue.mark_job_processing(job.id).await? {
                // Lost the claim race, or the job was cancelled meanwhile.
                continue;
            }
            outcome.claimed += 1;

            if self.execute(&job).await? {
                outcome.succeeded += 1;
            } else {
                outcome.failed += 1;
            }
        }

        Ok(outcome)
    }

    async fn execute(&self, job: &Job) -> Result<bool, QueueError> {
        // The candidate snapshot predates the claim increment, hence the +1.
        let current_attempts = job.attempts + 1;

        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => handler(job),
            None => {
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
                HandlerOutcome::Failure(format!(
                    "no handler registered for job type {}",
                    job.job_type
                ))
            }
        };

        match result {
            HandlerOutcome::Success => {
                self.queue.mark_job_completed(job.id).await?;
                debug!(job_id = %job.id, "job handler succeeded");
                Ok(true)
            }
            HandlerOutcome::Failure(error) => {
                self.queue
                    .mark_job_failed(job.id, &error, current_attempts, job.max_attempts)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self, config: JobWorkerConfig) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = Arc::clone(&stats);

        let join = tokio::spawn(worker_loop(self, config, shutdown_rx, stats_clone));

        JobWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop<S: JobStore + 'static>(
    worker: JobWorker<S>,
    config: JobWorkerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, "job worker started");
    let start = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        match worker.run_once(config.batch_size).await {
            Ok(batch) => {
                let mut s = stats.lock().unwrap();
                s.jobs_processed += batch.claimed as u64;
                s.jobs_succeeded += batch.succeeded as u64;
                s.jobs_failed += batch.failed as u64;
                s.uptime_secs = start.elapsed().as_secs();
            }
            Err(error) => {
                error!(worker = %config.name, %error, "poll cycle failed");
            }
        }
    }

    info!(worker = %config.name, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::{EnqueueOptions, JobStatus};
    use chrono::Utc;
    use ledgerdesk_core::TenantId;

    fn queue() -> JobQueue<InMemoryJobStore> {
        JobQueue::new(InMemoryJobStore::new())
    }

    #[tokio::test]
    async fn run_once_completes_jobs_with_handlers() {
        let q = queue();
        let mut worker = JobWorker::new(q.clone());
        worker.register_handler(JobType::EmailSend, |_job| HandlerOutcome::Success);

        let id = q
            .enqueue_job(
                TenantId::new(),
                JobType::EmailSend,
                serde_json::json!({"to": "ops@example.com"}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let batch = worker.run_once(10).await.unwrap();
        assert_eq!(batch.claimed, 1);
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 0);

        let job = q.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn failing_handler_reschedules_until_exhausted() {
        let q = queue();
        let mut worker = JobWorker::new(q.clone());
        worker.register_handler(JobType::EmailSend, |_job| {
            HandlerOutcome::Failure("smtp down".to_string())
        });

        let id = q
            .enqueue_job(
                TenantId::new(),
                JobType::EmailSend,
                serde_json::json!({}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let batch = worker.run_once(10).await.unwrap();
        assert_eq!(batch.failed, 1);

        // First failure of three allowed attempts: back to pending with a
        // future run_at, so the next poll cycle skips it.
        let job = q.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error.as_deref(), Some("smtp down"));
        assert!(job.run_at > Utc::now());
        assert_eq!(worker.run_once(10).await.unwrap(), BatchOutcome::default());
    }

    #[tokio::test]
    async fn single_attempt_job_fails_permanently() {
        let q = queue();
        let mut worker = JobWorker::new(q.clone());
        worker.register_handler(JobType::CleanupFiles, |_job| {
            HandlerOutcome::Failure("disk unreachable".to_string())
        });

        // cleanup-files allows a single attempt.
        let id = q
            .enqueue_job(
                TenantId::new(),
                JobType::CleanupFiles,
                serde_json::json!({}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();

        let job = q.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn unhandled_job_type_goes_through_the_failure_path() {
        let q = queue();
        let worker = JobWorker::new(q.clone());

        let id = q
            .enqueue_job(
                TenantId::new(),
                JobType::ReportGenerate,
                serde_json::json!({}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        worker.run_once(10).await.unwrap();

        let job = q.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawned_worker_drains_the_queue_and_shuts_down() {
        let q = queue();
        let mut worker = JobWorker::new(q.clone());
        worker.register_handler(JobType::NotificationSend, |_job| HandlerOutcome::Success);

        let id = q
            .enqueue_job(
                TenantId::new(),
                JobType::NotificationSend,
                serde_json::json!({}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let handle = worker.spawn(
            JobWorkerConfig::default()
                .with_name("test-worker")
                .with_poll_interval(Duration::from_millis(10)),
        );

        // Wait (bounded) for a poll cycle to process the job; the stats
        // update lands after the completion is persisted.
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.stats().jobs_succeeded < 1 {
            assert!(Instant::now() < deadline, "worker never completed the job");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(q.get_job(id).await.unwrap().status, JobStatus::Completed);
        handle.shutdown().await;
    }
}
