//! The `JobStore` trait: the one interface through which the dispatcher,
//! and ingress, ever mutate a job's persisted lifecycle state.
//!
//! This is deliberately policy-light: it says nothing about *how* a backing
//! store enforces the admission budget, only that `claim_next` must.
//! `job-store-postgres` is the production implementation; `testing-support`
//! provides an in-memory one for exercising the dispatcher without a
//! database.

use crate::error::DispatchError;
use crate::job::{
    AdmissionLimits, Job, JobCounts, JobFilter, JobSpec, JobStatus, TransitionFields,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Why a job was moved back to `pending` by a reclaim pass. Preserved as a
/// breadcrumb in `error_message` until the job's next run overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    /// `updated_at` was older than the configured staleness threshold.
    StaleUpdatedAt,
    /// The job's process generation did not match the current one.
    GenerationMismatch,
}

impl ReclaimReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReclaimReason::StaleUpdatedAt => "reclaimed: stale updated_at",
            ReclaimReason::GenerationMismatch => "reclaimed: generation mismatch",
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a row in `pending`, returning the assigned id.
    async fn enqueue(&self, spec: JobSpec) -> Result<Uuid, DispatchError>;

    /// Atomically select the oldest claimable `pending`/`queued` row whose
    /// owner has a free per-user slot and for which the global cap is not
    /// saturated, and transition it forward (`pending -> queued` or
    /// `queued -> running`, the latter stamping `started_at`).
    ///
    /// Must be race-safe against concurrent callers: two concurrent
    /// `claim_next` calls must never return the same row, and must never
    /// together exceed either cap.
    async fn claim_next(&self, limits: &AdmissionLimits) -> Result<Option<Job>, DispatchError>;

    /// Apply a status change, validating that `current -> new_status` is a
    /// legal edge in the lifecycle DAG. Bumps `updated_at`; sets
    /// `started_at`/`completed_at` on their respective first transitions.
    async fn transition(
        &self,
        id: Uuid,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<(), DispatchError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, DispatchError>;

    async fn list(&self, user_id: Uuid, filter: JobFilter) -> Result<Vec<Job>, DispatchError>;

    async fn delete(&self, id: Uuid) -> Result<(), DispatchError>;

    /// Restore a terminal job to `pending`, preserving its id and clearing
    /// timestamps, error, and result metadata. Rejects non-terminal jobs
    /// with `DispatchError::Validation`.
    async fn mark_rerun(&self, id: Uuid) -> Result<(), DispatchError>;

    /// Extend a `running`/`transferring` job's lease by `lease_duration_secs`
    /// from now. A worker still actively executing a job calls this on an
    /// interval well inside its lease window so `reclaim_stale` never mistakes
    /// a live, slow job for an orphan. A no-op if the job is no longer in a
    /// live status (it already finished, or was itself reclaimed out from
    /// under the caller).
    async fn heartbeat(&self, id: Uuid, lease_duration_secs: i64) -> Result<(), DispatchError>;

    /// Transition every job in `{queued, running, transferring}` back to
    /// `pending` if: it is `queued` and `updated_at` is older than
    /// `stale_threshold_secs` (queued jobs have no lease, since nothing is
    /// executing them yet); it is `running`/`transferring` and its lease has
    /// expired; or its generation does not match `current_generation`
    /// (it was claimed by a process that is no longer this one). A live job
    /// under the current generation whose lease is still valid is never
    /// reclaimed, no matter how long it has been running.
    /// Returns the reclaimed ids. Idempotent: a second call with nothing
    /// newly stale reclaims nothing.
    async fn reclaim_stale(
        &self,
        stale_threshold_secs: i64,
        current_generation: Uuid,
    ) -> Result<Vec<Uuid>, DispatchError>;

    async fn current_counts(&self) -> Result<JobCounts, DispatchError>;
}
