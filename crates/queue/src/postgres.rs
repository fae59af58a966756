//! Postgres-backed job store.
//!
//! Persists jobs in a single `jobs` table and leans on the database for the
//! one concurrency-critical operation: claiming. The claim is a single
//! predicate-guarded `UPDATE ... WHERE status = 'pending'` whose
//! `rows_affected` tells the caller whether it won the race; there is no
//! read-then-write anywhere on the claim path.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `JobStoreError` as follows: a unique violation
//! (`23505`) on insert becomes `AlreadyExists`; everything else (connection
//! failures, pool closed, malformed rows) becomes `Storage` with the
//! operation name for context.
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync`; the SQLx pool handles connection
//! management across tasks.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use ledgerdesk_core::{JobId, TenantId};

use crate::store::{JobStore, JobStoreError};
use crate::types::{Job, JobStatus, JobType};

/// Schema for the job table. Applied by [`PostgresJobStore::migrate`];
/// embedded here so operational tooling can inspect it.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            UUID PRIMARY KEY,
    tenant_id     UUID NOT NULL,
    job_type      TEXT NOT NULL,
    payload       JSONB NOT NULL,
    status        TEXT NOT NULL,
    priority      SMALLINT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL,
    run_at        TIMESTAMPTZ NOT NULL,
    started_at    TIMESTAMPTZ,
    completed_at  TIMESTAMPTZ,
    error         TEXT,
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_due
    ON jobs (status, run_at, priority, created_at);

CREATE INDEX IF NOT EXISTS idx_jobs_tenant
    ON jobs (tenant_id, created_at DESC);
"#;

const JOB_COLUMNS: &str = "id, tenant_id, job_type, payload, status, priority, \
     attempts, max_attempts, run_at, started_at, completed_at, error, created_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the job table schema (idempotent).
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        insert_one(&*self.pool, &job).await?;
        Ok(job.id)
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    async fn insert_batch(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;

        let mut ids = Vec::with_capacity(jobs.len());
        for job in &jobs {
            insert_one(&mut *tx, job).await?;
            ids.push(job.id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;
        Ok(ids)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE tenant_id = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3"
                ))
                .bind(tenant_id.as_uuid())
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&*self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE tenant_id = $1 \
                     ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(tenant_id.as_uuid())
                .bind(limit as i64)
                .fetch_all(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("list_for_tenant", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'pending' AND run_at <= $1 \
             ORDER BY priority ASC, created_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_due", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        // Compare-and-swap via the WHERE clause; zero rows affected means
        // another worker or a cancellation transitioned the job first.
        let result = sqlx::query(
            "UPDATE jobs SET status = 'processing', started_at = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn increment_attempts(&self, id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("UPDATE jobs SET attempts = attempts + 1 WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_attempts", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn complete_if_processing(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = $2 \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_if_processing", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id))]
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error = $2, completed_at = $3 \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %id))]
    async fn reschedule(
        &self,
        id: JobId,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', error = $2, run_at = $3 \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(run_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = $2 \
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, reason))]
    async fn archive_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', error = $3, completed_at = $2 \
             WHERE status IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(cutoff)
        .bind(now)
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("archive_before", e))?;

        Ok(result.rows_affected())
    }
}

async fn insert_one<'e, E>(executor: E, job: &Job) -> Result<(), JobStoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO jobs (id, tenant_id, job_type, payload, status, priority, \
         attempts, max_attempts, run_at, started_at, completed_at, error, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(job.id.as_uuid())
    .bind(job.tenant_id.as_uuid())
    .bind(job.job_type.as_str())
    .bind(&job.payload)
    .bind(job.status.as_str())
    .bind(job.priority)
    .bind(job.attempts as i32)
    .bind(job.max_attempts as i32)
    .bind(job.run_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.error.as_deref())
    .bind(job.created_at)
    .execute(executor)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            JobStoreError::AlreadyExists(job.id)
        }
        _ => map_sqlx_error("insert", e),
    })?;
    Ok(())
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let job_type: String = try_get(row, "job_type")?;
    let status: String = try_get(row, "status")?;

    Ok(Job {
        id: JobId::from_uuid(try_get::<Uuid>(row, "id")?),
        tenant_id: TenantId::from_uuid(try_get::<Uuid>(row, "tenant_id")?),
        job_type: JobType::from_str(&job_type)
            .map_err(|e| JobStoreError::Storage(format!("decode job_type: {e}")))?,
        payload: try_get(row, "payload")?,
        status: JobStatus::from_str(&status)
            .map_err(|e| JobStoreError::Storage(format!("decode status: {e}")))?,
        priority: try_get(row, "priority")?,
        attempts: try_get::<i32>(row, "attempts")? as u32,
        max_attempts: try_get::<i32>(row, "max_attempts")? as u32,
        run_at: try_get(row, "run_at")?,
        started_at: try_get(row, "started_at")?,
        completed_at: try_get(row, "completed_at")?,
        error: try_get(row, "error")?,
        created_at: try_get(row, "created_at")?,
    })
}

fn try_get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, JobStoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| JobStoreError::Storage(format!("decode {column}: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {err}"))
}
