//! Core job types and per-type policies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use ledgerdesk_core::{DomainError, JobId, TenantId};

/// The closed set of background work kinds the platform runs.
///
/// Adding a variant without a row in [`JobType::defaults`] is a compile
/// error, so a new type can never silently fall back to made-up scheduling
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    EmailSend,
    EmailBatch,
    InvoiceProcess,
    InvoiceOcr,
    ReportGenerate,
    NotificationSend,
    NotificationBatch,
    SyncQuickbooks,
    SyncCalendar,
    CleanupFiles,
    CleanupCache,
    AiAnalyze,
    AiExtract,
    WebhookDeliver,
}

/// Scheduling parameters applied when an enqueue request does not override
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    /// Lower is more urgent.
    pub priority: i16,
    pub max_attempts: u32,
}

impl JobType {
    /// Every variant, for exhaustive table checks in tests.
    pub const ALL: [JobType; 14] = [
        JobType::EmailSend,
        JobType::EmailBatch,
        JobType::InvoiceProcess,
        JobType::InvoiceOcr,
        JobType::ReportGenerate,
        JobType::NotificationSend,
        JobType::NotificationBatch,
        JobType::SyncQuickbooks,
        JobType::SyncCalendar,
        JobType::CleanupFiles,
        JobType::CleanupCache,
        JobType::AiAnalyze,
        JobType::AiExtract,
        JobType::WebhookDeliver,
    ];

    /// Per-type scheduling defaults.
    pub fn defaults(&self) -> JobDefaults {
        let (priority, max_attempts) = match self {
            JobType::EmailSend => (2, 3),
            JobType::EmailBatch => (3, 3),
            JobType::InvoiceProcess => (2, 3),
            JobType::InvoiceOcr => (2, 2),
            JobType::ReportGenerate => (4, 2),
            JobType::NotificationSend => (1, 3),
            JobType::NotificationBatch => (2, 3),
            JobType::SyncQuickbooks => (3, 3),
            JobType::SyncCalendar => (3, 3),
            JobType::CleanupFiles => (5, 1),
            JobType::CleanupCache => (5, 1),
            JobType::AiAnalyze => (3, 2),
            JobType::AiExtract => (2, 2),
            JobType::WebhookDeliver => (1, 5),
        };
        JobDefaults {
            priority,
            max_attempts,
        }
    }

    /// Wire/storage name (kebab-case, same as the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmailSend => "email-send",
            JobType::EmailBatch => "email-batch",
            JobType::InvoiceProcess => "invoice-process",
            JobType::InvoiceOcr => "invoice-ocr",
            JobType::ReportGenerate => "report-generate",
            JobType::NotificationSend => "notification-send",
            JobType::NotificationBatch => "notification-batch",
            JobType::SyncQuickbooks => "sync-quickbooks",
            JobType::SyncCalendar => "sync-calendar",
            JobType::CleanupFiles => "cleanup-files",
            JobType::CleanupCache => "cleanup-cache",
            JobType::AiAnalyze => "ai-analyze",
            JobType::AiExtract => "ai-extract",
            JobType::WebhookDeliver => "webhook-deliver",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job execution status.
///
/// Transitions form a DAG: `pending -> processing -> {completed, pending
/// (retry), failed}`; `pending -> cancelled`; `processing -> cancelled`.
/// Terminal statuses never transition automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed (possibly not yet due).
    Pending,
    /// Claimed by a worker, handler in flight.
    Processing,
    Completed,
    /// Exhausted its attempts.
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Overrides for the per-type defaults at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i16>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A single enqueue request, for batch inserts.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub payload: JsonValue,
    pub options: EnqueueOptions,
}

/// A unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Isolation key; never changes after creation.
    pub tenant_id: TenantId,
    pub job_type: JobType,
    /// Opaque data consumed only by the handler.
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Lower is more urgent.
    pub priority: i16,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job is eligible for claiming.
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message; earlier errors are not retained.
    pub error: Option<String>,
    /// Insertion time, FIFO tiebreak within a priority band.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a pending job, filling unspecified options from the per-type
    /// defaults table.
    pub fn new(
        tenant_id: TenantId,
        job_type: JobType,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Self {
        let now = Utc::now();
        let defaults = job_type.defaults();
        Self {
            id: JobId::new(),
            tenant_id,
            job_type,
            payload,
            status: JobStatus::Pending,
            priority: options.priority.unwrap_or(defaults.priority),
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts),
            run_at: options.run_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
        }
    }

    /// Eligible for claiming right now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }
}

/// Delay before a failed job becomes eligible again: `2^attempts * 60`
/// seconds (1, 2, 4, 8, ... minutes). Strictly increasing with the attempt
/// count, so `run_at` grows monotonically across retries. The exponent is
/// capped to keep the arithmetic in range.
pub fn backoff_delay(current_attempts: u32) -> Duration {
    let exp = current_attempts.min(30);
    Duration::seconds(60 * (1i64 << exp))
}
