//! The two-tier admission budget: a global semaphore and per-user counters.
//!
//! These are the only pieces of process-wide mutable state outside the job
//! store. `claim_next` already
//! enforces the budget at the row-selection level; these in-process guards
//! are the second line of defense so a worker never proceeds past admission
//! without holding a permit, even if the store's own bookkeeping is stale
//! for a moment.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Caps the number of jobs in `{running, transferring}` across all users.
#[derive(Clone)]
pub struct GlobalGate {
    semaphore: Arc<Semaphore>,
}

impl GlobalGate {
    pub fn new(capacity: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire one permit, held for the full run+export+transfer sequence.
    /// Fails only if the semaphore has been closed (process shutdown).
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }
}

/// Tracks, per user, how many jobs this process has admitted beyond
/// `pending` but not yet brought to a terminal state. A guard released on
/// drop, matching the "release on any terminal transition" rule from the
/// design.
pub struct UserSlotGuard {
    counters: Arc<DashMap<Uuid, u32>>,
    user_id: Uuid,
}

impl Drop for UserSlotGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.counters.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Per-user parallelism enforcement. Not a single cap: each user has their
/// own `max_parallel_queries`, read through from `UserSettings`.
#[derive(Clone, Default)]
pub struct PerUserSlotManager {
    counters: Arc<DashMap<Uuid, u32>>,
}

impl PerUserSlotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupancy(&self, user_id: Uuid) -> u32 {
        self.counters.get(&user_id).map(|c| *c).unwrap_or(0)
    }

    pub fn has_free_slot(&self, user_id: Uuid, max_parallel_queries: u32) -> bool {
        self.occupancy(user_id) < max_parallel_queries
    }

    /// Claim one slot for `user_id`, returning a guard that releases it on
    /// drop. Returns `None` if the user has no free slot; callers must
    /// check `has_free_slot` (or retry on `None`) rather than assume success.
    pub fn try_acquire(&self, user_id: Uuid, max_parallel_queries: u32) -> Option<UserSlotGuard> {
        let mut entry = self.counters.entry(user_id).or_insert(0);
        if *entry >= max_parallel_queries {
            return None;
        }
        *entry += 1;
        Some(UserSlotGuard {
            counters: self.counters.clone(),
            user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_user_slots_are_independent() {
        let mgr = PerUserSlotManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let _g1 = mgr.try_acquire(a, 1).expect("first slot for a");
        assert!(mgr.try_acquire(a, 1).is_none(), "a is saturated at cap 1");
        assert!(mgr.try_acquire(b, 1).is_some(), "b is unaffected by a's occupancy");
    }

    #[test]
    fn slot_is_released_on_drop() {
        let mgr = PerUserSlotManager::new();
        let u = Uuid::new_v4();

        {
            let _guard = mgr.try_acquire(u, 1).unwrap();
            assert_eq!(mgr.occupancy(u), 1);
        }
        assert_eq!(mgr.occupancy(u), 0, "guard drop must release the slot");
    }

    #[tokio::test]
    async fn global_gate_blocks_past_capacity() {
        let gate = GlobalGate::new(1);
        let _permit = gate.acquire().await.expect("first permit");
        assert!(gate.try_acquire().is_none());
        drop(_permit);
        assert!(gate.try_acquire().is_some());
    }
}
