//! In-memory doubles of the dispatcher's collaborator traits, for exercising
//! `dispatcher-core` without a running Postgres instance or real network
//! I/O.
//!
//! Grounded on the `Arc<Mutex<Vec<...>>>`-backed job queue mock used
//! elsewhere in this codebase's test suites: a single lock around a `Vec`,
//! no attempt at row-level concurrency, good enough to drive the listener
//! loop and assert on its behavior.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dispatcher_core::{
    AdmissionLimits, CellValue, DbCredentials, DispatchError, ExportFormat, ExportOutcome,
    Exporter, Job, JobCounts, JobFilter, JobSpec, JobStatus, JobStore, QueryResult, QueryRunner,
    ReclaimReason, ResultMetadata, Row, RowChunk, SshIdentity, TransferAgent, TransitionFields,
    UserSettings,
};
use futures::stream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// An in-memory `JobStore`. Not race-safe across real concurrent access
/// (one `Mutex` around the whole table), but enforces the same admission
/// policy as `PgJobStore`: `pending -> queued` gated on the owner's
/// per-user cap, `queued -> running` gated on the global cap, and a
/// per-job lease (renewed by `heartbeat`) gating `reclaim_stale` the same
/// way `PgJobStore`'s `lease_expires_at` column does.
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    generations: Mutex<HashMap<Uuid, Uuid>>,
    leases: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    /// Stamped onto every job this instance promotes to `running`, mirroring
    /// `PgJobStore`'s constructor-supplied generation.
    generation: Uuid,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            generation: Uuid::new_v4(),
        }
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job directly, bypassing `enqueue`, for tests that need to
    /// seed a specific status or id.
    pub fn seed(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    /// Back-date a job's lease so a test can force `reclaim_stale` to treat
    /// it as orphaned without waiting out a real lease window.
    pub fn expire_lease(&self, id: Uuid) {
        self.leases
            .lock()
            .unwrap()
            .insert(id, Utc::now() - ChronoDuration::seconds(1));
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<Uuid, DispatchError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let job = Job {
            id,
            user_id: spec.user_id,
            db_credentials: spec.db_credentials,
            query_text: spec.query_text,
            export_type: spec.export_type,
            export_location: spec.export_location,
            export_filename: spec.export_filename,
            ssh_target: spec.ssh_target,
            status: JobStatus::Pending,
            error_message: None,
            result_metadata: ResultMetadata::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        self.jobs.lock().unwrap().insert(id, job);
        Ok(id)
    }

    async fn claim_next(&self, limits: &AdmissionLimits) -> Result<Option<Job>, DispatchError> {
        let mut jobs = self.jobs.lock().unwrap();

        let running_count = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Transferring))
            .count() as u32;

        if running_count < limits.global_cap {
            let mut queued: Vec<&mut Job> = jobs
                .values_mut()
                .filter(|j| j.status == JobStatus::Queued)
                .collect();
            queued.sort_by_key(|j| j.created_at);
            if let Some(job) = queued.into_iter().next() {
                job.status = JobStatus::Running;
                job.started_at.get_or_insert(Utc::now());
                job.updated_at = Utc::now();
                let claimed = job.clone();
                self.generations.lock().unwrap().insert(claimed.id, self.generation);
                self.leases.lock().unwrap().insert(
                    claimed.id,
                    Utc::now() + ChronoDuration::seconds(limits.lease_duration_secs),
                );
                return Ok(Some(claimed));
            }
        }

        let mut user_counts: HashMap<Uuid, u32> = HashMap::new();
        for job in jobs.values() {
            if matches!(
                job.status,
                JobStatus::Queued | JobStatus::Running | JobStatus::Transferring
            ) {
                *user_counts.entry(job.user_id).or_insert(0) += 1;
            }
        }

        let mut pending: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|j| j.created_at);
        for job in pending {
            let occupancy = user_counts.get(&job.user_id).copied().unwrap_or(0);
            if occupancy < limits.default_max_parallel_queries {
                job.status = JobStatus::Queued;
                job.updated_at = Utc::now();
                return Ok(Some(job.clone()));
            }
        }

        Ok(None)
    }

    async fn transition(
        &self,
        id: Uuid,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DispatchError::Validation(format!("job {id} does not exist")))?;

        if !job.status.can_transition_to(new_status) {
            return Err(DispatchError::Validation(format!(
                "illegal transition {:?} -> {:?} for job {id}",
                job.status, new_status
            )));
        }

        job.status = new_status;
        if let Some(msg) = fields.error_message {
            job.error_message = Some(msg);
        }
        if let Some(metadata) = fields.result_metadata {
            job.result_metadata = metadata;
        }
        let now = Utc::now();
        if new_status == JobStatus::Running {
            job.started_at.get_or_insert(now);
        }
        if matches!(new_status, JobStatus::Completed | JobStatus::Failed) {
            job.completed_at.get_or_insert(now);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, user_id: Uuid, filter: JobFilter) -> Result<Vec<Job>, DispatchError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .filter(|j| filter.status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        Ok(matched)
    }

    async fn delete(&self, id: Uuid) -> Result<(), DispatchError> {
        self.jobs.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn mark_rerun(&self, id: Uuid) -> Result<(), DispatchError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DispatchError::Validation(format!("job {id} does not exist")))?;

        if !job.status.is_terminal() {
            return Err(DispatchError::Validation(format!(
                "cannot rerun job {id} in non-terminal status {:?}",
                job.status
            )));
        }

        job.status = JobStatus::Pending;
        job.started_at = None;
        job.completed_at = None;
        job.error_message = None;
        job.result_metadata = ResultMetadata::default();
        job.updated_at = Utc::now();
        self.generations.lock().unwrap().remove(&id);
        self.leases.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, lease_duration_secs: i64) -> Result<(), DispatchError> {
        let jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get(&id) else {
            return Ok(());
        };
        if matches!(job.status, JobStatus::Running | JobStatus::Transferring) {
            self.leases
                .lock()
                .unwrap()
                .insert(id, Utc::now() + ChronoDuration::seconds(lease_duration_secs));
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        stale_threshold_secs: i64,
        current_generation: Uuid,
    ) -> Result<Vec<Uuid>, DispatchError> {
        let mut jobs = self.jobs.lock().unwrap();
        let generations = self.generations.lock().unwrap();
        let leases = self.leases.lock().unwrap();
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for job in jobs.values_mut() {
            if !matches!(
                job.status,
                JobStatus::Queued | JobStatus::Running | JobStatus::Transferring
            ) {
                continue;
            }
            let generation_mismatch = generations
                .get(&job.id)
                .map(|g| *g != current_generation)
                .unwrap_or(false);

            // `queued` jobs have no lease; fall back to `updated_at`
            // staleness. `running`/`transferring` jobs are only reclaimed
            // once their lease has actually expired, so a heartbeating job
            // is never reclaimed purely for running a long time.
            let stale = match job.status {
                JobStatus::Queued => (now - job.updated_at).num_seconds() >= stale_threshold_secs,
                JobStatus::Running | JobStatus::Transferring => leases
                    .get(&job.id)
                    .map(|expires_at| *expires_at < now)
                    .unwrap_or(false),
                _ => false,
            };

            if stale || generation_mismatch {
                let reason = if generation_mismatch {
                    ReclaimReason::GenerationMismatch
                } else {
                    ReclaimReason::StaleUpdatedAt
                };
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.completed_at = None;
                job.result_metadata = ResultMetadata::default();
                job.error_message = Some(reason.as_str().to_string());
                job.updated_at = now;
                reclaimed.push(job.id);
            }
        }
        drop(leases);
        drop(generations);
        for id in &reclaimed {
            self.generations.lock().unwrap().remove(id);
            self.leases.lock().unwrap().remove(id);
        }
        Ok(reclaimed)
    }

    async fn current_counts(&self) -> Result<JobCounts, DispatchError> {
        let jobs = self.jobs.lock().unwrap();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Transferring => counts.transferring += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// An in-memory `SettingsStore` backed by a plain map, seeded directly by
/// tests.
#[derive(Default)]
pub struct InMemorySettingsStore {
    settings: Mutex<HashMap<Uuid, UserSettings>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, settings: UserSettings) {
        self.settings
            .lock()
            .unwrap()
            .insert(settings.user_id, settings);
    }
}

#[async_trait]
impl dispatcher_core::SettingsStore for InMemorySettingsStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserSettings>, DispatchError> {
        Ok(self.settings.lock().unwrap().get(&user_id).cloned())
    }
}

/// A `QueryRunner` that returns a fixed result set, ignoring the job's
/// actual credentials and query text.
pub struct FixedQueryRunner {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub chunk_size: usize,
}

impl FixedQueryRunner {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            chunk_size: 2,
        }
    }

    pub fn empty() -> Self {
        Self::new(vec!["value".to_string()], vec![])
    }
}

#[async_trait]
impl QueryRunner for FixedQueryRunner {
    async fn run(
        &self,
        _job: &Job,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<QueryResult, DispatchError> {
        let chunks: Vec<Result<RowChunk, DispatchError>> = self
            .rows
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(QueryResult {
            columns: self.columns.clone(),
            chunks: Box::pin(stream::iter(chunks)),
        })
    }
}

/// A `QueryRunner` that always fails, for exercising the dispatcher's
/// failure path.
pub struct FailingQueryRunner {
    pub error: fn() -> DispatchError,
}

#[async_trait]
impl QueryRunner for FailingQueryRunner {
    async fn run(
        &self,
        _job: &Job,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<QueryResult, DispatchError> {
        Err((self.error)())
    }
}

/// An `Exporter` that counts rows and columns without writing a real file,
/// touching an empty marker file at `target_path` so callers that check for
/// its existence still see one.
pub struct CountingExporter;

#[async_trait]
impl Exporter for CountingExporter {
    async fn export(
        &self,
        mut result: QueryResult,
        _format: ExportFormat,
        target_path: &Path,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ExportOutcome, DispatchError> {
        use futures::StreamExt;

        let mut row_count = 0u64;
        while let Some(chunk) = result.chunks.next().await {
            let chunk = chunk?;
            row_count += chunk.len() as u64;
        }

        if let Some(parent) = target_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(target_path, b"");

        Ok(ExportOutcome {
            local_path: target_path.to_path_buf(),
            row_count,
            column_count: result.columns.len() as u64,
            byte_size: 0,
        })
    }
}

/// A `TransferAgent` that always fails, for exercising the dispatcher's
/// transfer-failure path.
pub struct FailingTransferAgent {
    pub error: fn() -> DispatchError,
}

#[async_trait]
impl TransferAgent for FailingTransferAgent {
    async fn transfer(
        &self,
        _local_path: &Path,
        _identity: &SshIdentity,
        _remote_dir: &str,
        _remote_filename: &str,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<String, DispatchError> {
        Err((self.error)())
    }
}

/// A `TransferAgent` that records every call it receives instead of opening
/// a real SSH connection.
#[derive(Default)]
pub struct RecordingTransferAgent {
    pub calls: Mutex<Vec<(PathBuf, String, String)>>,
}

impl RecordingTransferAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferAgent for RecordingTransferAgent {
    async fn transfer(
        &self,
        local_path: &Path,
        _identity: &SshIdentity,
        remote_dir: &str,
        remote_filename: &str,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<String, DispatchError> {
        let remote_path = format!("{remote_dir}/{remote_filename}");
        self.calls.lock().unwrap().push((
            local_path.to_path_buf(),
            remote_dir.to_string(),
            remote_filename.to_string(),
        ));
        Ok(remote_path)
    }
}

/// A quick `JobSpec` builder for tests that don't care about most fields.
pub fn sample_job_spec(user_id: Uuid) -> JobSpec {
    JobSpec {
        user_id,
        db_credentials: DbCredentials {
            username: "tester".to_string(),
            password: "secret".to_string(),
            connection_descriptor: "postgres://localhost/test".to_string(),
        },
        query_text: "SELECT 1".to_string(),
        export_type: ExportFormat::Csv,
        export_location: None,
        export_filename: None,
        ssh_target: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher_core::JobStore as _;

    #[tokio::test]
    async fn claim_next_promotes_pending_then_queued() {
        let store = InMemoryJobStore::new();
        let user = Uuid::new_v4();
        let id = store.enqueue(sample_job_spec(user)).await.unwrap();

        let limits = AdmissionLimits::default();
        let promoted = store.claim_next(&limits).await.unwrap().unwrap();
        assert_eq!(promoted.id, id);
        assert_eq!(promoted.status, JobStatus::Queued);

        let promoted = store.claim_next(&limits).await.unwrap().unwrap();
        assert_eq!(promoted.id, id);
        assert_eq!(promoted.status, JobStatus::Running);

        assert!(store.claim_next(&limits).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn per_user_cap_blocks_additional_pending_jobs() {
        let store = InMemoryJobStore::new();
        let user = Uuid::new_v4();
        store.enqueue(sample_job_spec(user)).await.unwrap();
        store.enqueue(sample_job_spec(user)).await.unwrap();

        let limits = AdmissionLimits {
            global_cap: 50,
            default_max_parallel_queries: 1,
            lease_duration_secs: 120,
        };

        let first = store.claim_next(&limits).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_next(&limits).await.unwrap();
        assert!(second.is_none(), "second user job exceeds the per-user cap");
    }

    #[tokio::test]
    async fn mark_rerun_rejects_non_terminal_job() {
        let store = InMemoryJobStore::new();
        let user = Uuid::new_v4();
        let id = store.enqueue(sample_job_spec(user)).await.unwrap();

        assert!(store.mark_rerun(id).await.is_err());
    }

    #[tokio::test]
    async fn reclaim_stale_never_reclaims_a_live_job_with_a_fresh_lease() {
        let store = InMemoryJobStore::new();
        let user = Uuid::new_v4();
        store.enqueue(sample_job_spec(user)).await.unwrap();

        let limits = AdmissionLimits::default();
        store.claim_next(&limits).await.unwrap(); // pending -> queued
        let running = store.claim_next(&limits).await.unwrap().unwrap(); // queued -> running
        assert_eq!(running.status, JobStatus::Running);

        // Same generation, fresh lease, and a threshold of zero (which would
        // reclaim a queued row instantly): a live running job must survive.
        let reclaimed = store.reclaim_stale(0, store.generation).await.unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(store.get(running.id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn reclaim_stale_reclaims_a_running_job_once_its_lease_expires() {
        let store = InMemoryJobStore::new();
        let user = Uuid::new_v4();
        store.enqueue(sample_job_spec(user)).await.unwrap();

        let limits = AdmissionLimits::default();
        store.claim_next(&limits).await.unwrap();
        let running = store.claim_next(&limits).await.unwrap().unwrap();
        store.expire_lease(running.id);

        let reclaimed = store.reclaim_stale(3600, store.generation).await.unwrap();
        assert_eq!(reclaimed, vec![running.id]);
        let job = store.get(running.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error_message.as_deref(), Some(ReclaimReason::StaleUpdatedAt.as_str()));
    }

    #[tokio::test]
    async fn reclaim_on_startup_reclaims_a_different_generations_job_and_is_idempotent() {
        let store = Arc::new(InMemoryJobStore::new());
        let user = Uuid::new_v4();
        store.enqueue(sample_job_spec(user)).await.unwrap();

        let limits = AdmissionLimits::default();
        store.claim_next(&limits).await.unwrap();
        let running = store.claim_next(&limits).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);

        // A fresh generation simulates a process restart: the row belongs to
        // a generation that no longer exists, so it's reclaimed regardless
        // of its lease.
        let restarted_generation = Uuid::new_v4();
        let reclaimed = dispatcher_core::reclaim_on_startup(store.as_ref(), 300, restarted_generation)
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![running.id]);

        let again = dispatcher_core::reclaim_on_startup(store.as_ref(), 300, restarted_generation)
            .await
            .unwrap();
        assert!(again.is_empty(), "a second pass with nothing newly stale must reclaim nothing");
    }

    #[tokio::test]
    async fn per_user_cap_limits_concurrent_execution_through_the_dispatcher() {
        use dispatcher_core::{Dispatcher, DispatcherConfig};
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        struct TrackingQueryRunner {
            active: Arc<AtomicU32>,
            max_seen: Arc<AtomicU32>,
        }

        #[async_trait]
        impl QueryRunner for TrackingQueryRunner {
            async fn run(
                &self,
                _job: &Job,
                _cancel: tokio_util::sync::CancellationToken,
            ) -> Result<QueryResult, DispatchError> {
                let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(QueryResult {
                    columns: vec!["value".to_string()],
                    chunks: Box::pin(stream::iter(vec![Ok(vec![vec![CellValue::Int(1)]])])),
                })
            }
        }

        let store = Arc::new(InMemoryJobStore::new());
        let settings = Arc::new(InMemorySettingsStore::new());
        let user = Uuid::new_v4();
        settings.set(UserSettings {
            user_id: user,
            max_parallel_queries: 1,
            default_export_type: ExportFormat::Csv,
            default_export_location: None,
            ssh_identity: None,
        });
        for _ in 0..4 {
            store.enqueue(sample_job_spec(user)).await.unwrap();
        }

        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let query_runner = Arc::new(TrackingQueryRunner {
            active: active.clone(),
            max_seen: max_seen.clone(),
        });

        let spool_root = std::env::temp_dir().join(format!("dispatcher-test-{}", Uuid::new_v4()));

        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn JobStore>,
            settings as Arc<dyn dispatcher_core::SettingsStore>,
            query_runner as Arc<dyn QueryRunner>,
            Arc::new(CountingExporter) as Arc<dyn Exporter>,
            Arc::new(RecordingTransferAgent::new()) as Arc<dyn TransferAgent>,
            DispatcherConfig {
                listener_interval: Duration::from_millis(5),
                global_cap: 50,
                default_max_parallel_queries: 3,
                shutdown_grace: Duration::from_millis(500),
                job_timeout: None,
                spool_root,
                lease_duration: Duration::from_secs(60),
            },
        );

        let shutdown = tokio_util::sync::CancellationToken::new();
        let handle = tokio::spawn(Dispatcher::run(dispatcher, shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let completed = store
                .snapshot()
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .count();
            if completed == 4 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        let _ = handle.await;

        let completed = store
            .snapshot()
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        assert_eq!(completed, 4, "every admitted job should eventually complete");
        assert!(
            max_seen.load(Ordering::SeqCst) <= 1,
            "the per-user cap must never admit more than one concurrent job for this user"
        );
    }

    #[tokio::test]
    async fn transfer_failure_preserves_export_metadata_on_the_failed_job() {
        use dispatcher_core::{Dispatcher, DispatcherConfig};
        use std::time::Duration;

        let store = Arc::new(InMemoryJobStore::new());
        let settings = Arc::new(InMemorySettingsStore::new());
        let user = Uuid::new_v4();
        settings.set(UserSettings {
            user_id: user,
            max_parallel_queries: 3,
            default_export_type: ExportFormat::Csv,
            default_export_location: None,
            ssh_identity: Some(SshIdentity {
                host: "sftp.example.test".to_string(),
                port: 22,
                username: "dispatcher".to_string(),
                auth: dispatcher_core::SshAuth::Password("unused".to_string()),
            }),
        });

        let mut spec = sample_job_spec(user);
        spec.ssh_target = Some("sftp.example.test".to_string());
        let job_id = store.enqueue(spec).await.unwrap();

        let rows = vec![
            vec![CellValue::Int(1)],
            vec![CellValue::Int(2)],
            vec![CellValue::Int(3)],
        ];
        let query_runner = Arc::new(FixedQueryRunner::new(vec!["value".to_string()], rows));
        let transfer = Arc::new(FailingTransferAgent {
            error: || DispatchError::SshTransfer("connection reset".to_string()),
        });
        let spool_root = std::env::temp_dir().join(format!("dispatcher-test-{}", Uuid::new_v4()));

        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn JobStore>,
            settings as Arc<dyn dispatcher_core::SettingsStore>,
            query_runner as Arc<dyn QueryRunner>,
            Arc::new(CountingExporter) as Arc<dyn Exporter>,
            transfer as Arc<dyn TransferAgent>,
            DispatcherConfig {
                listener_interval: Duration::from_millis(5),
                global_cap: 50,
                default_max_parallel_queries: 3,
                shutdown_grace: Duration::from_millis(500),
                job_timeout: None,
                spool_root,
                lease_duration: Duration::from_secs(60),
            },
        );

        let shutdown = tokio_util::sync::CancellationToken::new();
        let handle = tokio::spawn(Dispatcher::run(dispatcher, shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(job) = store.get(job_id).await.unwrap() {
                if job.status == JobStatus::Failed {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        let _ = handle.await;

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.result_metadata.row_count,
            Some(3),
            "export metadata recorded at the Transferring transition must survive the later Failed transition"
        );
        assert_eq!(job.result_metadata.column_count, Some(1));
    }
}
