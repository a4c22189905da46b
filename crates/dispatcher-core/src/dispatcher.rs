//! The listener loop: polls the job store for admissible work, couples
//! admission with execution, and orchestrates each job's
//! run -> export -> transfer sequence.

use crate::admission::{GlobalGate, PerUserSlotManager};
use crate::collaborators::{Exporter, QueryRunner, TransferAgent};
use crate::error::{Categorizable, DispatchError, ErrorKind};
use crate::job::{Job, JobStatus, ResultMetadata, TransitionFields, UserSettings};
use crate::settings::SettingsStore;
use crate::store::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Static configuration for the listener loop. Sourced from environment
/// variables at startup (see the `processor` binary's `Config`).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listener_interval: Duration,
    pub global_cap: u32,
    pub default_max_parallel_queries: u32,
    pub shutdown_grace: Duration,
    pub job_timeout: Option<Duration>,
    pub spool_root: PathBuf,
    /// How long a claimed job's lease lasts before `reclaim_stale` may treat
    /// it as orphaned. Renewed by a background heartbeat for as long as
    /// `run_job` is actually executing it.
    pub lease_duration: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listener_interval: Duration::from_secs(10),
            global_cap: 50,
            default_max_parallel_queries: UserSettings::DEFAULT_MAX_PARALLEL_QUERIES,
            shutdown_grace: Duration::from_secs(30),
            job_timeout: None,
            spool_root: PathBuf::from("./spool"),
            lease_duration: Duration::from_secs(120),
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    settings: Arc<dyn SettingsStore>,
    query_runner: Arc<dyn QueryRunner>,
    exporter: Arc<dyn Exporter>,
    transfer_agent: Arc<dyn TransferAgent>,
    global_gate: GlobalGate,
    per_user: PerUserSlotManager,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        settings: Arc<dyn SettingsStore>,
        query_runner: Arc<dyn QueryRunner>,
        exporter: Arc<dyn Exporter>,
        transfer_agent: Arc<dyn TransferAgent>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            query_runner,
            exporter,
            transfer_agent,
            global_gate: GlobalGate::new(config.global_cap),
            per_user: PerUserSlotManager::new(),
            config,
        })
    }

    fn admission_limits(&self) -> crate::job::AdmissionLimits {
        crate::job::AdmissionLimits {
            global_cap: self.config.global_cap,
            default_max_parallel_queries: self.config.default_max_parallel_queries,
            lease_duration_secs: self.config.lease_duration.as_secs() as i64,
        }
    }

    /// Renew `job_id`'s lease on an interval well inside `lease_duration`,
    /// until `stop` fires. Runs for the lifetime of one `run_job` call so a
    /// job that's simply slow, not dead, never loses its lease to
    /// `reclaim_stale`.
    fn spawn_heartbeat(&self, job_id: Uuid, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let lease_duration_secs = self.config.lease_duration.as_secs().max(2) as i64;
        let interval = self.config.lease_duration / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = store.heartbeat(job_id, lease_duration_secs).await {
                    warn!(job_id = %job_id, error = %err, "heartbeat failed, lease may lapse");
                }
            }
        })
    }

    /// The main loop: sleep with jitter, then drain claimable work until the
    /// store reports none, spawning one worker task per admitted job.
    /// Returns once `shutdown` fires and all in-flight workers have either
    /// finished or been given up on past `shutdown_grace`.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut inflight = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.next_wake()) => {}
            }

            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let job = match self.store.claim_next(&self.admission_limits()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "claim_next failed, will retry next tick");
                        break;
                    }
                };

                // `claim_next` may have only promoted pending -> queued; that
                // doesn't admit into the running budget, so keep draining
                // without spawning a worker.
                if job.status != JobStatus::Running {
                    continue;
                }

                let Some(permit) = self.global_gate.try_acquire() else {
                    warn!(job_id = %job.id, "store admitted a job but the local gate is saturated");
                    break;
                };

                let max_parallel = self
                    .effective_max_parallel(job.user_id)
                    .await
                    .unwrap_or(self.config.default_max_parallel_queries);
                let Some(user_guard) = self.per_user.try_acquire(job.user_id, max_parallel) else {
                    warn!(job_id = %job.id, user_id = %job.user_id, "store admitted a job but the local per-user slot is saturated");
                    drop(permit);
                    break;
                };

                let this = Arc::clone(&self);
                let job_cancel = shutdown.child_token();
                inflight.spawn(async move {
                    this.run_job(job, job_cancel).await;
                    drop(permit);
                    drop(user_guard);
                });
            }
        }

        // Shutdown: give in-flight workers `shutdown_grace` to observe
        // cancellation and release their resources.
        let drain = tokio::time::timeout(self.config.shutdown_grace, async {
            while inflight.join_next().await.is_some() {}
        });
        if drain.await.is_err() {
            warn!("shutdown grace period elapsed with workers still in flight");
        }
    }

    fn next_wake(&self) -> Duration {
        let jitter_ms = fastrand::u64(0..1000);
        self.config.listener_interval + Duration::from_millis(jitter_ms)
    }

    async fn effective_max_parallel(&self, user_id: Uuid) -> Result<u32, DispatchError> {
        Ok(self
            .settings
            .get(user_id)
            .await?
            .map(|s| s.max_parallel_queries)
            .unwrap_or(self.config.default_max_parallel_queries))
    }

    /// Run -> export -> (optionally) transfer one job, writing every status
    /// transition back to the store synchronously. Never propagates a
    /// failure to the caller: every exit path ends in a terminal `transition`
    /// call, classifying the failure if one occurred.
    #[instrument(skip(self, cancel), fields(job_id = %job.id, user_id = %job.user_id))]
    async fn run_job(&self, job: Job, cancel: CancellationToken) {
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_handle = self.spawn_heartbeat(job.id, heartbeat_stop.clone());

        let outcome = self.execute(&job, cancel.clone()).await;

        heartbeat_stop.cancel();
        let _ = heartbeat_handle.await;

        match outcome {
            Ok(metadata) => {
                info!("job completed");
                if let Err(err) = self
                    .store
                    .transition(
                        job.id,
                        JobStatus::Completed,
                        TransitionFields {
                            error_message: None,
                            result_metadata: Some(metadata),
                        },
                    )
                    .await
                {
                    error!(error = %err, "failed to persist completed status after successful run");
                }
            }
            Err(err) => {
                warn!(kind = classify(&err).as_str(), error = %err.classified_message(), "job failed");
                if let Err(store_err) = self
                    .store
                    .transition(
                        job.id,
                        JobStatus::Failed,
                        TransitionFields {
                            error_message: Some(err.classified_message()),
                            result_metadata: None,
                        },
                    )
                    .await
                {
                    error!(error = %store_err, "failed to persist failed status");
                }
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<ResultMetadata, DispatchError> {
        let budget = self.config.job_timeout;
        let work = self.execute_inner(job, cancel.clone());
        match budget {
            Some(d) => match tokio::time::timeout(d, work).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(DispatchError::Timeout)
                }
            },
            None => work.await,
        }
    }

    async fn execute_inner(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<ResultMetadata, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Canceled("canceled before start".into()));
        }

        let query_result = self.query_runner.run(job, cancel.clone()).await?;

        let spool_path = self.config.spool_root.join(job.spool_relative_path());
        if let Some(parent) = spool_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DispatchError::ExportIo(e.to_string()))?;
        }

        let export = self
            .exporter
            .export(query_result, job.export_type, &spool_path, cancel.clone())
            .await?;

        let mut metadata = ResultMetadata {
            row_count: Some(export.row_count),
            column_count: Some(export.column_count),
            byte_size: Some(export.byte_size),
            remote_path: None,
        };

        if let Some(ssh_target) = &job.ssh_target {
            // Persist the export metadata now, at the Transferring transition,
            // rather than only at the final Completed/Failed one: if the
            // transfer itself fails below, the Failed transition passes
            // `result_metadata: None` and `JobStore::transition` preserves
            // whatever was last written, so byte_size/row_count/column_count
            // survive a transfer failure.
            self.store
                .transition(
                    job.id,
                    JobStatus::Transferring,
                    TransitionFields {
                        error_message: None,
                        result_metadata: Some(metadata.clone()),
                    },
                )
                .await
                .map_err(|e| DispatchError::Internal(e.to_string()))?;

            let identity = self
                .settings
                .get(job.user_id)
                .await?
                .and_then(|s| s.ssh_identity)
                .ok_or_else(|| {
                    DispatchError::SshAuth(format!(
                        "no ssh identity configured for target {ssh_target}"
                    ))
                })?;

            let remote_dir = job.export_location.clone().unwrap_or_default();
            let remote_filename = job.effective_filename();
            let remote_path = self
                .transfer_agent
                .transfer(
                    &export.local_path,
                    &identity,
                    &remote_dir,
                    &remote_filename,
                    cancel.clone(),
                )
                .await?;
            metadata.remote_path = Some(remote_path);
        }

        Ok(metadata)
    }
}

/// Classify an arbitrary leaf error for tests/tools that only have a
/// `Categorizable` trait object, not a concrete `DispatchError`.
pub fn classify(err: &dyn Categorizable) -> ErrorKind {
    err.kind()
}
