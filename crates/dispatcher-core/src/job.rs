//! The job (query) domain model: status DAG, specs, and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A job's position in the lifecycle DAG.
///
/// `pending -> queued -> running -> {transferring | completed | failed}`,
/// and `transferring -> {completed | failed}`. The only backward edge is an
/// explicit rerun, which re-enters at `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Transferring,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether this status has no outgoing transitions other than rerun.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal edge in the lifecycle DAG.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Queued, Running)
                | (Running, Transferring)
                | (Running, Completed)
                | (Running, Failed)
                | (Transferring, Completed)
                | (Transferring, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Transferring => "transferring",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "transferring" => JobStatus::Transferring,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => return None,
        })
    }
}

/// One of the formats the exporter knows how to serialize a result set to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Excel,
    Json,
    Feather,
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat::Csv
    }
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xlsx",
            ExportFormat::Json => "json",
            ExportFormat::Feather => "feather",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "excel",
            ExportFormat::Json => "json",
            ExportFormat::Feather => "feather",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "csv" => ExportFormat::Csv,
            "excel" => ExportFormat::Excel,
            "json" => ExportFormat::Json,
            "feather" => ExportFormat::Feather,
            _ => return None,
        })
    }
}

/// Credentials and a connection descriptor for the database a job targets.
///
/// `connection_descriptor` is opaque to the dispatcher: it is handed
/// verbatim to the query runner's connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
    pub connection_descriptor: String,
}

/// Host, port, and auth material for the transfer agent's SSH target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshIdentity {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key_pem: String,
        passphrase: Option<String>,
    },
}

/// Row-count / byte-size facts recorded once a job finishes export and transfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub row_count: Option<u64>,
    pub column_count: Option<u64>,
    pub byte_size: Option<u64>,
    pub remote_path: Option<String>,
}

/// The persisted unit of work. Mirrors the `queries` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub db_credentials: DbCredentials,
    pub query_text: String,
    pub export_type: ExportFormat,
    pub export_location: Option<String>,
    pub export_filename: Option<String>,
    pub ssh_target: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub result_metadata: ResultMetadata,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The deterministic spool path for this job's export file, relative to
    /// a spool root: `<user_id>/<job_id>.<ext>`.
    pub fn spool_relative_path(&self) -> String {
        format!("{}/{}.{}", self.user_id, self.id, self.export_type.extension())
    }

    pub fn effective_filename(&self) -> String {
        self.export_filename.clone().unwrap_or_else(|| {
            format!(
                "{}_{}.{}",
                self.id,
                self.created_at.format("%Y%m%dT%H%M%SZ"),
                self.export_type.extension()
            )
        })
    }
}

/// What ingress supplies to `JobStore::enqueue`. The store assigns `id`,
/// `status = Pending`, and the timestamps.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub user_id: Uuid,
    pub db_credentials: DbCredentials,
    pub query_text: String,
    pub export_type: ExportFormat,
    pub export_location: Option<String>,
    pub export_filename: Option<String>,
    pub ssh_target: Option<String>,
}

/// Per-user configuration, read-through by the dispatcher to materialize a
/// job's effective settings (SSH identity, default format/location, cap).
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub user_id: Uuid,
    pub max_parallel_queries: u32,
    pub default_export_type: ExportFormat,
    pub default_export_location: Option<String>,
    pub ssh_identity: Option<SshIdentity>,
}

impl UserSettings {
    pub const DEFAULT_MAX_PARALLEL_QUERIES: u32 = 3;
}

/// Fields a `transition` call may update alongside `status`.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub error_message: Option<String>,
    pub result_metadata: Option<ResultMetadata>,
}

/// A filter passed to `JobStore::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

/// Point-in-time counts across the lifecycle states, for status endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
    pub transferring: u64,
}

/// The admission budget `claim_next` must respect. The store computes each
/// user's current occupancy itself (it owns the rows); this just carries the
/// static configuration the occupancy is compared against.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    /// Max concurrent `{running, transferring}` jobs across all users.
    pub global_cap: u32,
    /// Fallback per-user cap for a user with no `user_settings` row.
    pub default_max_parallel_queries: u32,
    /// How long a lease granted at claim time (or renewed by a heartbeat)
    /// stays valid before a reclaim pass may consider the job orphaned.
    pub lease_duration_secs: i64,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            global_cap: 50,
            default_max_parallel_queries: UserSettings::DEFAULT_MAX_PARALLEL_QUERIES,
            lease_duration_secs: 120,
        }
    }
}
