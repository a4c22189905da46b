//! # Dispatcher Core
//!
//! The durable, database-backed, multi-tenant query dispatcher: it
//! discovers newly submitted work, admits it under a two-tier concurrency
//! budget (a global cap and a per-user cap), executes queries and file
//! transfers concurrently while respecting those caps, keeps the persisted
//! query lifecycle state machine consistent across crashes, and recovers
//! orphaned work at startup.
//!
//! ## Architecture
//!
//! ```text
//! Ingress (out of scope) ──enqueue()──► JobStore (pending)
//!                                           │
//!                                           ▼ claim_next()
//!                                    Dispatcher.run() loop
//!                                           │
//!                      ┌────────────────────┼────────────────────┐
//!                      ▼                    ▼                    ▼
//!              GlobalGate permit    PerUserSlotManager    worker task
//!                      └────────────────────┴────────────────────┘
//!                                           │
//!                         QueryRunner ─► Exporter ─► TransferAgent
//!                                           │
//!                                  transition() on every step
//! ```
//!
//! This crate defines the domain model, the `JobStore`/`SettingsStore`
//! contracts, the admission primitives, and the listener loop itself. It is
//! deliberately independent of any particular backing store or I/O
//! implementation: `job-store-postgres` supplies the production `JobStore`,
//! `query-runner`/`exporter`/`transfer-agent` supply the three collaborator
//! traits, and `testing-support` supplies in-memory doubles of all of them.

mod admission;
mod collaborators;
mod dispatcher;
mod error;
mod job;
mod recovery;
mod settings;
mod store;

pub use admission::{GlobalGate, PerUserSlotManager, UserSlotGuard};
pub use collaborators::{
    CellValue, ExportOutcome, Exporter, QueryResult, QueryRunner, Row, RowChunk, TransferAgent,
};
pub use dispatcher::{classify, Dispatcher, DispatcherConfig};
pub use error::{Categorizable, DispatchError, ErrorKind};
pub use job::{
    AdmissionLimits, DbCredentials, ExportFormat, Job, JobCounts, JobFilter, JobSpec, JobStatus,
    ResultMetadata, SshAuth, SshIdentity, TransitionFields, UserSettings,
};
pub use recovery::{reclaim_on_startup, spawn_periodic_reclaim};
pub use settings::SettingsStore;
pub use store::{JobStore, ReclaimReason};

// Re-export commonly used external types, matching this codebase's existing
// practice of re-exporting `async_trait` so downstream crates share one
// version.
pub use async_trait::async_trait;
