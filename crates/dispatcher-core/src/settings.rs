//! Read-through access to per-user settings, consulted by the dispatcher
//! when materializing a job's effective configuration (SSH identity, default
//! export format/location, per-user cap).

use crate::error::DispatchError;
use crate::job::UserSettings;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Settings for `user_id`, or `None` if the user has never configured
    /// any (callers fall back to defaults: `UserSettings::DEFAULT_MAX_PARALLEL_QUERIES`,
    /// CSV export, no SSH identity).
    async fn get(&self, user_id: Uuid) -> Result<Option<UserSettings>, DispatchError>;
}
