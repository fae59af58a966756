//! Job persistence: the store abstraction and the in-memory implementation.
//!
//! The store exposes *mechanism* only (conditional updates, scans); policy
//! (defaults, backoff, completion guarding) lives in the service layer.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ledgerdesk_core::{JobId, TenantId};

use crate::types::{Job, JobStatus};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence abstraction over the shared job table.
///
/// The one discipline required of every implementation is that [`claim`]
/// (and the other guarded transitions) are *conditional updates reporting
/// whether a row changed*, never read-then-write. Everything else is plain
/// row manipulation.
///
/// [`claim`]: JobStore::claim
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one job.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Insert a batch atomically: either every job lands or none does.
    async fn insert_batch(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError>;

    /// Point lookup by id (no tenant filter; scoping is the caller's
    /// responsibility on this path).
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Tenant-scoped listing, newest first, optionally filtered by status.
    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Pending jobs with `run_at <= now`, across all tenants, ordered by
    /// `(priority asc, created_at asc)`.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Conditional `pending -> processing` transition setting `started_at`.
    /// Returns whether a row actually changed; `false` (another worker or a
    /// cancellation got there first, or the id is unknown) is a normal
    /// outcome, not an error.
    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Increment `attempts`, keyed only by id (no status re-check).
    async fn increment_attempts(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Unconditional terminal transition to `completed`.
    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Terminal transition to `completed`, guarded on `processing`.
    async fn complete_if_processing(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Terminal transition to `failed`, recording the last error.
    async fn fail(&self, id: JobId, error: &str, now: DateTime<Utc>)
        -> Result<(), JobStoreError>;

    /// Reset to `pending` with a new `run_at`, overwriting the error message.
    async fn reschedule(
        &self,
        id: JobId,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Transition to `cancelled`, guarded on `{pending, processing}`.
    /// Returns whether a row changed; `false` on an already-terminal job.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Soft-archive terminal (`completed`/`failed`) jobs whose `completed_at`
    /// is older than `cutoff`: status becomes `cancelled`, the error is
    /// replaced by `reason`, and `completed_at` is refreshed to `now`.
    /// Returns the number of archived rows.
    async fn archive_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, JobStoreError>;
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn insert_batch(&self, batch: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();

        // Validate the whole batch under the lock before touching the map, so
        // a rejected batch leaves no partial insert behind.
        let mut seen = HashSet::new();
        for job in &batch {
            if jobs.contains_key(&job.id) || !seen.insert(job.id) {
                return Err(JobStoreError::AlreadyExists(job.id));
            }
        }

        let ids = batch.iter().map(|j| j.id).collect();
        for job in batch {
            jobs.insert(job.id, job);
        }
        Ok(ids)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();

        result.sort_by_key(|j| (j.priority, j.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_attempts(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.attempts += 1;
        }
        Ok(())
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_if_processing(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.completed_at = Some(now);
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: JobId,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Pending;
            job.error = Some(error.to_string());
            job.run_at = run_at;
        }
        Ok(())
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&id) {
            Some(job)
                if matches!(job.status, JobStatus::Pending | JobStatus::Processing) =>
            {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn archive_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let mut archived = 0;
        for job in jobs.values_mut() {
            let old_terminal = matches!(job.status, JobStatus::Completed | JobStatus::Failed)
                && job.completed_at.is_some_and(|at| at < cutoff);
            if old_terminal {
                job.status = JobStatus::Cancelled;
                job.error = Some(reason.to_string());
                job.completed_at = Some(now);
                archived += 1;
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnqueueOptions, JobType};
    use chrono::Duration;

    fn pending_job(tenant: TenantId) -> Job {
        Job::new(
            tenant,
            JobType::EmailSend,
            serde_json::json!({}),
            EnqueueOptions::default(),
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let job = pending_job(TenantId::new());
        let id = store.insert(job).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.status, JobStatus::Pending);

        assert!(matches!(
            store.insert(loaded).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();

        let existing = pending_job(tenant);
        let existing_id = store.insert(existing.clone()).await.unwrap();

        let fresh = pending_job(tenant);
        let fresh_id = fresh.id;
        let err = store
            .insert_batch(vec![fresh, existing])
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(id) if id == existing_id));

        // The fresh job must not have been half-inserted.
        assert!(store.get(fresh_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_due_orders_by_priority_then_created_at() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        // B is older but lower-urgency; A must still come first.
        let mut a = pending_job(tenant);
        a.priority = 1;
        a.created_at = now;
        let mut b = pending_job(tenant);
        b.priority = 2;
        b.created_at = now - Duration::minutes(5);
        // Same band as B, inserted earlier: FIFO within the band.
        let mut c = pending_job(tenant);
        c.priority = 2;
        c.created_at = now - Duration::minutes(10);
        // Not yet due.
        let mut d = pending_job(tenant);
        d.priority = 0;
        d.run_at = now + Duration::minutes(1);

        let ids = (a.id, b.id, c.id);
        for job in [a, b, c, d] {
            store.insert(job).await.unwrap();
        }

        let due = store.fetch_due(Utc::now(), 10).await.unwrap();
        let got: Vec<_> = due.iter().map(|j| j.id).collect();
        assert_eq!(got, vec![ids.0, ids.2, ids.1]);

        let capped = store.fetch_due(Utc::now(), 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn claim_succeeds_only_from_pending() {
        let store = InMemoryJobStore::new();
        let id = store.insert(pending_job(TenantId::new())).await.unwrap();
        let now = Utc::now();

        assert!(store.claim(id, now).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(now));

        // Second claim misses; unknown ids miss too.
        assert!(!store.claim(id, now).await.unwrap());
        assert!(!store.claim(JobId::new(), now).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_is_guarded_and_idempotent() {
        let store = InMemoryJobStore::new();
        let id = store.insert(pending_job(TenantId::new())).await.unwrap();
        let now = Utc::now();

        assert!(store.cancel(id, now).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());

        // Already terminal: silent no-op.
        assert!(!store.cancel(id, now).await.unwrap());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn archive_never_touches_live_jobs() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        let mut old_pending = pending_job(tenant);
        old_pending.created_at = now - Duration::days(30);
        let mut old_processing = pending_job(tenant);
        old_processing.status = JobStatus::Processing;
        old_processing.started_at = Some(now - Duration::days(30));
        let pending_id = old_pending.id;
        let processing_id = old_processing.id;

        store.insert(old_pending).await.unwrap();
        store.insert(old_processing).await.unwrap();

        let archived = store
            .archive_before(now - Duration::days(7), now, "archived")
            .await
            .unwrap();
        assert_eq!(archived, 0);
        assert_eq!(
            store.get(pending_id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            store.get(processing_id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn list_for_tenant_is_scoped_and_newest_first() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let other = TenantId::new();
        let now = Utc::now();

        let mut first = pending_job(tenant);
        first.created_at = now - Duration::minutes(2);
        let mut second = pending_job(tenant);
        second.created_at = now;
        second.status = JobStatus::Completed;
        second.completed_at = Some(now);
        let foreign = pending_job(other);

        let (first_id, second_id) = (first.id, second.id);
        for job in [first, second, foreign] {
            store.insert(job).await.unwrap();
        }

        let all = store.list_for_tenant(tenant, None, 10).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second_id, first_id]);

        let completed = store
            .list_for_tenant(tenant, Some(JobStatus::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, second_id);
    }
}
