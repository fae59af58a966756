//! Queue service: enqueue policy, the claim protocol, lifecycle transitions,
//! and retention.
//!
//! The service is a thin policy layer over a [`JobStore`]; it is safe to hand
//! clones to any number of producers and worker loops. Contention exists only
//! on the claim path, which the store resolves with a conditional update.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use ledgerdesk_core::{DomainError, JobId, TenantId};

use crate::store::{JobStore, JobStoreError};
use crate::types::{backoff_delay, EnqueueOptions, Job, JobRequest, JobStatus, JobType};

/// Error message stamped onto soft-archived jobs.
pub const ARCHIVE_REASON: &str = "Archived by cleanup cron";

/// Queue service error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What `mark_job_completed` does when the job is no longer `processing`.
///
/// The unguarded variant matches the historical contract: completion is
/// unconditional, so a completion racing a concurrent cancellation overwrites
/// it. `RequireProcessing` makes the cancellation win instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    #[default]
    Unguarded,
    RequireProcessing,
}

/// Multi-tenant background job queue.
///
/// At-least-once delivery: a claimed job whose worker crashes before
/// reporting back stays `processing` forever; recovering such jobs is an
/// external reaper's problem, not this engine's.
pub struct JobQueue<S> {
    store: Arc<S>,
    completion: CompletionPolicy,
}

impl<S> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            completion: self.completion,
        }
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            completion: CompletionPolicy::default(),
        }
    }

    pub fn with_completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.completion = policy;
        self
    }

    /// Enqueue one job. Unspecified options fall back to the per-type
    /// defaults table. The row is visible immediately, but not eligible for
    /// claiming before `run_at`.
    pub async fn enqueue_job(
        &self,
        tenant_id: TenantId,
        job_type: JobType,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        validate_options(&options)?;
        let job = Job::new(tenant_id, job_type, payload, options);
        let id = self.store.insert(job).await?;
        debug!(job_id = %id, %job_type, "job enqueued");
        Ok(id)
    }

    /// Enqueue a batch, all-or-nothing: if any insert is rejected, no job
    /// from the batch lands.
    pub async fn enqueue_jobs(
        &self,
        requests: Vec<JobRequest>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut jobs = Vec::with_capacity(requests.len());
        for request in requests {
            validate_options(&request.options)?;
            jobs.push(Job::new(
                request.tenant_id,
                request.job_type,
                request.payload,
                request.options,
            ));
        }
        let ids = self.store.insert_batch(jobs).await?;
        debug!(count = ids.len(), "job batch enqueued");
        Ok(ids)
    }

    /// Cancel a job if it is still `pending` or `processing`. Calling this on
    /// an already-terminal job is a silent no-op. Cancellation is cooperative:
    /// an in-flight handler is not interrupted.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), QueueError> {
        let changed = self.store.cancel(id, Utc::now()).await?;
        if !changed {
            debug!(job_id = %id, "cancel was a no-op (terminal or unknown job)");
        }
        Ok(())
    }

    /// Point lookup. Degrades to `None` on a backend error (logged), so
    /// dashboards keep rendering; callers cannot distinguish "missing" from
    /// "query failed" on this path. Tenant scoping is the caller's
    /// responsibility here.
    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        match self.store.get(id).await {
            Ok(job) => job,
            Err(error) => {
                warn!(job_id = %id, %error, "job lookup failed, returning none");
                None
            }
        }
    }

    /// Tenant-scoped listing, newest first. Degrades to empty on a backend
    /// error (logged).
    pub async fn get_tenant_jobs(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Vec<Job> {
        match self.store.list_for_tenant(tenant_id, status, limit).await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(%tenant_id, %error, "tenant job listing failed, returning empty");
                Vec::new()
            }
        }
    }

    /// Eligible pending jobs across all tenants, ordered by
    /// `(priority asc, created_at asc)`. Strict priority preemption: no
    /// per-tenant fairness is enforced here.
    pub async fn get_next_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.fetch_due(Utc::now(), limit).await?)
    }

    /// Claim a pending job for the calling worker.
    ///
    /// Step 1 is a status-guarded conditional update (`pending ->
    /// processing`, `started_at = now`); a miss means another worker or a
    /// cancellation won the race and returns `Ok(false)`. Step 2 increments
    /// `attempts` keyed only by id. The two writes are deliberately not
    /// atomic: nothing reads `attempts` in the window between them.
    pub async fn mark_job_processing(&self, id: JobId) -> Result<bool, QueueError> {
        if !self.store.claim(id, Utc::now()).await? {
            return Ok(false);
        }
        self.store.increment_attempts(id).await?;
        debug!(job_id = %id, "job claimed");
        Ok(true)
    }

    /// Terminal `completed` transition, guarded or not per the configured
    /// [`CompletionPolicy`].
    pub async fn mark_job_completed(&self, id: JobId) -> Result<(), QueueError> {
        let now = Utc::now();
        let changed = match self.completion {
            CompletionPolicy::Unguarded => self.store.complete(id, now).await?,
            CompletionPolicy::RequireProcessing => {
                self.store.complete_if_processing(id, now).await?
            }
        };
        if changed {
            debug!(job_id = %id, "job completed");
        } else {
            debug!(job_id = %id, "completion did not land (job not processing)");
        }
        Ok(())
    }

    /// Record a handler failure. At the attempt cap the job fails
    /// permanently; otherwise it goes back to `pending` with
    /// `run_at = now + 2^current_attempts * 60` seconds, overwriting any
    /// previous error message.
    pub async fn mark_job_failed(
        &self,
        id: JobId,
        error: &str,
        current_attempts: u32,
        max_attempts: u32,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        if current_attempts >= max_attempts {
            self.store.fail(id, error, now).await?;
            warn!(job_id = %id, attempts = current_attempts, %error, "job failed permanently");
        } else {
            let run_at = now + backoff_delay(current_attempts);
            self.store.reschedule(id, error, run_at).await?;
            debug!(
                job_id = %id,
                attempts = current_attempts,
                retry_at = %run_at,
                %error,
                "job rescheduled with backoff"
            );
        }
        Ok(())
    }

    /// Soft-archive terminal jobs whose `completed_at` is older than the
    /// cutoff. Lossy by design: the completed/failed distinction collapses
    /// into a single `cancelled` bucket stamped with [`ARCHIVE_REASON`], and
    /// `completed_at` is refreshed to the archive time. Rows are never
    /// physically deleted. Intended for a daily cron.
    pub async fn cleanup_old_jobs(&self, older_than_days: i64) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = now - Duration::days(older_than_days);
        let archived = self.store.archive_before(cutoff, now, ARCHIVE_REASON).await?;
        if archived > 0 {
            info!(archived, older_than_days, "archived old terminal jobs");
        }
        Ok(archived)
    }
}

fn validate_options(options: &EnqueueOptions) -> Result<(), DomainError> {
    if options.max_attempts == Some(0) {
        return Err(DomainError::validation("max_attempts must be at least 1"));
    }
    Ok(())
}
