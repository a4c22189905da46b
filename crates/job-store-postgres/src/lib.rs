//! PostgreSQL implementation of the dispatcher's `JobStore` and
//! `SettingsStore`.
//!
//! # Features
//!
//! - `FOR UPDATE SKIP LOCKED` claiming, so concurrent dispatcher instances
//!   never double-claim a row.
//! - A two-stage admission: `pending -> queued` is gated on the owning
//!   user's per-user cap, `queued -> running` is gated on the global cap.
//! - Generation-tagged rows so a reclaim pass can distinguish jobs a dead
//!   process abandoned from jobs a still-live process legitimately holds.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TYPE job_status AS ENUM (
//!     'pending', 'queued', 'running', 'transferring', 'completed', 'failed'
//! );
//!
//! CREATE TABLE users (
//!     id UUID PRIMARY KEY,
//!     email TEXT NOT NULL UNIQUE,
//!     hashed_password TEXT NOT NULL,
//!     is_active BOOLEAN NOT NULL DEFAULT TRUE
//! );
//!
//! CREATE TABLE user_settings (
//!     user_id UUID PRIMARY KEY REFERENCES users(id),
//!     export_location TEXT,
//!     export_type TEXT NOT NULL DEFAULT 'csv',
//!     max_parallel_queries INTEGER NOT NULL DEFAULT 3,
//!     ssh_hostname TEXT,
//!     ssh_port INTEGER NOT NULL DEFAULT 22,
//!     ssh_username TEXT,
//!     ssh_password TEXT,
//!     ssh_key TEXT,
//!     ssh_key_passphrase TEXT
//! );
//!
//! CREATE TABLE queries (
//!     id UUID PRIMARY KEY,
//!     user_id UUID NOT NULL REFERENCES users(id),
//!     db_username TEXT NOT NULL,
//!     db_password TEXT NOT NULL,
//!     db_tns TEXT NOT NULL,
//!     query_text TEXT NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     export_location TEXT,
//!     export_type TEXT NOT NULL DEFAULT 'csv',
//!     export_filename TEXT,
//!     ssh_hostname TEXT,
//!     generation UUID,
//!     lease_expires_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     started_at TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ,
//!     error_message TEXT,
//!     result_metadata JSONB NOT NULL DEFAULT '{}'::jsonb
//! );
//!
//! CREATE INDEX idx_queries_claimable ON queries (created_at, id)
//!     WHERE status IN ('pending', 'queued');
//! CREATE INDEX idx_queries_reclaimable_queued ON queries (updated_at)
//!     WHERE status = 'queued';
//! CREATE INDEX idx_queries_reclaimable_lease ON queries (lease_expires_at)
//!     WHERE status IN ('running', 'transferring');
//! ```
//!
//! `lease_expires_at` is set when a row is promoted to `running` and renewed
//! by `PgJobStore::heartbeat` for as long as a worker is actively executing
//! it; `reclaim_stale` only reclaims a `running`/`transferring` row once that
//! lease has expired, so a job that simply takes a long time is never
//! confused with one whose worker died.
//!
//! # Usage
//!
//! ```rust,ignore
//! use job_store_postgres::PgJobStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/dispatcher").await?;
//! let store = PgJobStore::new(pool);
//! ```

use async_trait::async_trait;
use dispatcher_core::{
    AdmissionLimits, DbCredentials, DispatchError, ExportFormat, Job, JobCounts, JobFilter,
    JobSpec, JobStatus, JobStore, ReclaimReason, SettingsStore, SshAuth, SshIdentity,
    TransitionFields, UserSettings,
};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

fn sqlx_err(err: sqlx::Error) -> DispatchError {
    DispatchError::Internal(format!("job store: {err}"))
}

fn row_to_job(row: &PgRow) -> Result<Job, DispatchError> {
    let status_str: String = row.try_get("status").map_err(sqlx_err)?;
    let export_type_str: String = row.try_get("export_type").map_err(sqlx_err)?;
    let metadata_json: serde_json::Value = row.try_get("result_metadata").map_err(sqlx_err)?;

    Ok(Job {
        id: row.try_get("id").map_err(sqlx_err)?,
        user_id: row.try_get("user_id").map_err(sqlx_err)?,
        db_credentials: DbCredentials {
            username: row.try_get("db_username").map_err(sqlx_err)?,
            password: row.try_get("db_password").map_err(sqlx_err)?,
            connection_descriptor: row.try_get("db_tns").map_err(sqlx_err)?,
        },
        query_text: row.try_get("query_text").map_err(sqlx_err)?,
        export_type: ExportFormat::from_str(&export_type_str).ok_or_else(|| {
            DispatchError::Internal(format!("unknown export_type '{export_type_str}'"))
        })?,
        export_location: row.try_get("export_location").map_err(sqlx_err)?,
        export_filename: row.try_get("export_filename").map_err(sqlx_err)?,
        ssh_target: row.try_get("ssh_hostname").map_err(sqlx_err)?,
        status: JobStatus::from_str(&status_str)
            .ok_or_else(|| DispatchError::Internal(format!("unknown status '{status_str}'")))?,
        error_message: row.try_get("error_message").map_err(sqlx_err)?,
        result_metadata: serde_json::from_value(metadata_json).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        started_at: row.try_get("started_at").map_err(sqlx_err)?,
        completed_at: row.try_get("completed_at").map_err(sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_err)?,
    })
}

/// PostgreSQL-backed `JobStore`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    generation: Uuid,
}

impl PgJobStore {
    /// `generation` identifies this process; it is stamped onto every row
    /// this instance promotes to `running` so a later reclaim pass (from
    /// this or another instance) can tell a live owner from an orphan.
    pub fn new(pool: PgPool, generation: Uuid) -> Self {
        Self { pool, generation }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Promote the oldest `queued` row to `running`, gated on the global
    /// cap. `None` if no queued row qualifies (either none exist, or the
    /// global cap is saturated).
    async fn claim_queued_to_running(
        &self,
        global_cap: u32,
        lease_duration_secs: i64,
    ) -> Result<Option<Job>, DispatchError> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id
                FROM queries
                WHERE status = 'queued'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queries
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                generation = $2,
                lease_expires_at = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
              AND (
                  SELECT COUNT(*) FROM queries
                  WHERE status IN ('running', 'transferring')
              ) < $1
            RETURNING *
            "#,
        )
        .bind(global_cap as i64)
        .bind(self.generation)
        .bind(lease_duration_secs as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Promote the oldest `pending` row to `queued`, gated on the owning
    /// user's per-user cap (from `user_settings`, or `default_max` if the
    /// user has no settings row).
    async fn claim_pending_to_queued(&self, default_max: u32) -> Result<Option<Job>, DispatchError> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id, user_id
                FROM queries
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queries
            SET status = 'queued', updated_at = NOW()
            FROM candidate
            WHERE queries.id = candidate.id
              AND (
                  SELECT COUNT(*) FROM queries q2
                  WHERE q2.user_id = candidate.user_id
                    AND q2.status IN ('queued', 'running', 'transferring')
              ) < COALESCE(
                  (SELECT max_parallel_queries FROM user_settings WHERE user_id = candidate.user_id),
                  $1
              )
            RETURNING queries.*
            "#,
        )
        .bind(default_max as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;

        row.as_ref().map(row_to_job).transpose()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<Uuid, DispatchError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO queries (
                id, user_id, db_username, db_password, db_tns, query_text,
                status, export_location, export_type, export_filename, ssh_hostname,
                created_at, updated_at, result_metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10, NOW(), NOW(), '{}'::jsonb)
            "#,
        )
        .bind(id)
        .bind(spec.user_id)
        .bind(&spec.db_credentials.username)
        .bind(&spec.db_credentials.password)
        .bind(&spec.db_credentials.connection_descriptor)
        .bind(&spec.query_text)
        .bind(spec.export_location)
        .bind(spec.export_type.as_str())
        .bind(spec.export_filename)
        .bind(spec.ssh_target)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(id)
    }

    async fn claim_next(&self, limits: &AdmissionLimits) -> Result<Option<Job>, DispatchError> {
        // Promoting queued->running admits into the scarcer global budget;
        // try it first so work already past the per-user gate moves as soon
        // as global capacity frees up, rather than starving behind a long
        // pending queue.
        if let Some(job) = self
            .claim_queued_to_running(limits.global_cap, limits.lease_duration_secs)
            .await?
        {
            return Ok(Some(job));
        }
        self.claim_pending_to_queued(limits.default_max_parallel_queries)
            .await
    }

    async fn transition(
        &self,
        id: Uuid,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<(), DispatchError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::Validation(format!("job {id} does not exist")))?;

        if !current.status.can_transition_to(new_status) {
            return Err(DispatchError::Validation(format!(
                "illegal transition {:?} -> {:?} for job {id}",
                current.status, new_status
            )));
        }

        let metadata_json = fields
            .result_metadata
            .map(|m| serde_json::to_value(m).unwrap_or_default());

        sqlx::query(
            r#"
            UPDATE queries
            SET status = $2,
                error_message = COALESCE($3, error_message),
                result_metadata = COALESCE($4, result_metadata),
                started_at = CASE WHEN $2 = 'running' AND started_at IS NULL THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') AND completed_at IS NULL THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_status.as_str())
        .bind(fields.error_message)
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError> {
        let row = sqlx::query("SELECT * FROM queries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list(&self, user_id: Uuid, filter: JobFilter) -> Result<Vec<Job>, DispatchError> {
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM queries WHERE user_id = $1 AND status = $2 ORDER BY created_at DESC",
                )
                .bind(user_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM queries WHERE user_id = $1 ORDER BY created_at DESC")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(sqlx_err)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<(), DispatchError> {
        sqlx::query("DELETE FROM queries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn mark_rerun(&self, id: Uuid) -> Result<(), DispatchError> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::Validation(format!("job {id} does not exist")))?;

        if !job.status.is_terminal() {
            return Err(DispatchError::Validation(format!(
                "cannot rerun job {id} in non-terminal status {:?}",
                job.status
            )));
        }

        sqlx::query(
            r#"
            UPDATE queries
            SET status = 'pending',
                started_at = NULL,
                completed_at = NULL,
                error_message = NULL,
                result_metadata = '{}'::jsonb,
                generation = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, lease_duration_secs: i64) -> Result<(), DispatchError> {
        sqlx::query(
            r#"
            UPDATE queries
            SET lease_expires_at = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('running', 'transferring')
            "#,
        )
        .bind(id)
        .bind(lease_duration_secs as f64)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stale_threshold_secs: i64,
        current_generation: Uuid,
    ) -> Result<Vec<Uuid>, DispatchError> {
        // A `queued` row has no lease (nothing is executing it yet), so it
        // falls back to the staleness threshold on `updated_at`. A
        // `running`/`transferring` row is only reclaimed once its lease has
        // actually expired, regardless of `stale_threshold_secs`: a job that
        // heartbeats on schedule can run arbitrarily long without being
        // mistaken for an orphan. Either status is also reclaimed outright if
        // it belongs to a generation that is no longer this process, since
        // that process is known dead.
        let rows = sqlx::query(
            r#"
            UPDATE queries
            SET status = 'pending',
                started_at = NULL,
                completed_at = NULL,
                result_metadata = '{}'::jsonb,
                error_message = CASE
                    WHEN generation IS DISTINCT FROM $2 THEN $3
                    ELSE $4
                END,
                generation = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status IN ('queued', 'running', 'transferring')
              AND (
                  generation IS DISTINCT FROM $2
                  OR (status = 'queued' AND updated_at < NOW() - make_interval(secs => $1))
                  OR (status IN ('running', 'transferring') AND lease_expires_at < NOW())
              )
            RETURNING id
            "#,
        )
        .bind(stale_threshold_secs as f64)
        .bind(current_generation)
        .bind(ReclaimReason::GenerationMismatch.as_str())
        .bind(ReclaimReason::StaleUpdatedAt.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.into_iter()
            .map(|r| r.try_get::<Uuid, _>("id").map_err(sqlx_err))
            .collect()
    }

    async fn current_counts(&self) -> Result<JobCounts, DispatchError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'transferring') AS transferring
            FROM queries
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(JobCounts {
            pending: row.try_get::<i64, _>("pending").map_err(sqlx_err)? as u64,
            queued: row.try_get::<i64, _>("queued").map_err(sqlx_err)? as u64,
            running: row.try_get::<i64, _>("running").map_err(sqlx_err)? as u64,
            transferring: row.try_get::<i64, _>("transferring").map_err(sqlx_err)? as u64,
        })
    }
}

/// PostgreSQL-backed `SettingsStore`.
#[derive(Clone)]
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserSettings>, DispatchError> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let export_type_str: String = row.try_get("export_type").map_err(sqlx_err)?;
        let ssh_hostname: Option<String> = row.try_get("ssh_hostname").map_err(sqlx_err)?;
        let ssh_identity = match ssh_hostname {
            Some(host) => {
                let username: String = row.try_get("ssh_username").map_err(sqlx_err)?;
                let port: i32 = row.try_get("ssh_port").map_err(sqlx_err)?;
                let password: Option<String> = row.try_get("ssh_password").map_err(sqlx_err)?;
                let key: Option<String> = row.try_get("ssh_key").map_err(sqlx_err)?;
                let passphrase: Option<String> =
                    row.try_get("ssh_key_passphrase").map_err(sqlx_err)?;

                let auth = match (password, key) {
                    (_, Some(key_pem)) => SshAuth::PrivateKey { key_pem, passphrase },
                    (Some(password), None) => SshAuth::Password(password),
                    (None, None) => {
                        return Err(DispatchError::SshAuth(format!(
                            "user {user_id} has an ssh_hostname but no password or key configured"
                        )))
                    }
                };

                Some(SshIdentity {
                    host,
                    port: port as u16,
                    username,
                    auth,
                })
            }
            None => None,
        };

        Ok(Some(UserSettings {
            user_id,
            max_parallel_queries: row
                .try_get::<i32, _>("max_parallel_queries")
                .map_err(sqlx_err)? as u32,
            default_export_type: ExportFormat::from_str(&export_type_str).unwrap_or_default(),
            default_export_location: row.try_get("export_location").map_err(sqlx_err)?,
            ssh_identity,
        }))
    }
}
