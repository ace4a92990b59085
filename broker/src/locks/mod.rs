//! Per-cluster locks.
//!
//! Units of work lock the Version groups of the clusters they touch. Locks are
//! always taken in merge order (creation time, then id), the same order that
//! picks merge survivors, so two units of work sharing a group cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_shared::{Group, GroupId};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::errors::BrokerError;

/// Registry of per-group async mutexes.
#[derive(Debug, Default)]
pub struct ClusterLocks {
    locks: Mutex<HashMap<GroupId, Arc<AsyncMutex<()>>>>,
}

/// Held locks; released on drop.
#[derive(Debug)]
pub struct ClusterGuard {
    ids: Vec<GroupId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl ClusterGuard {
    /// Locked group ids, in acquisition order.
    pub fn ids(&self) -> &[GroupId] {
        &self.ids
    }

    pub fn holds(&self, id: GroupId) -> bool {
        self.ids.contains(&id)
    }
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every group in `groups`, waiting at most `timeout` in total.
    ///
    /// # Errors
    ///
    /// `Timeout` if the locks could not all be taken in time. Locks taken so
    /// far are released.
    pub async fn acquire(
        &self,
        groups: &[Group],
        timeout: Duration,
    ) -> Result<ClusterGuard, BrokerError> {
        let mut ordered: Vec<&Group> = groups.iter().collect();
        ordered.sort_by_key(|g| g.merge_order_key());
        ordered.dedup_by_key(|g| g.id);

        let deadline = Instant::now() + timeout;
        let mut ids = Vec::with_capacity(ordered.len());
        let mut guards = Vec::with_capacity(ordered.len());
        for group in ordered {
            let lock = self.lock_for(group.id);
            let guard = timeout_at(deadline, lock.lock_owned()).await.map_err(|_| {
                BrokerError::timeout(format!("waiting for the lock on group {}", group.id))
            })?;
            ids.push(group.id);
            guards.push(guard);
        }
        debug!(groups = ids.len(), "Acquired cluster locks");
        Ok(ClusterGuard {
            ids,
            _guards: guards,
        })
    }

    fn lock_for(&self, id: GroupId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop entries nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id).or_default().clone()
    }

    /// Number of groups currently locked or awaited.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|l| Arc::strong_count(l) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locks_are_taken_in_merge_order() {
        let locks = ClusterLocks::new();
        let older = Group::version(vec![]);
        let mut newer = Group::version(vec![]);
        newer.created_at = older.created_at + chrono::Duration::seconds(1);

        let guard = locks
            .acquire(&[newer.clone(), older.clone(), newer.clone()], Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(guard.ids(), &[older.id, newer.id]);
        assert!(guard.holds(newer.id));
        assert_eq!(locks.active(), 2);
        drop(guard);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_times_out() {
        let locks = ClusterLocks::new();
        let group = Group::version(vec![]);

        let _held = locks
            .acquire(std::slice::from_ref(&group), Duration::from_secs(1))
            .await
            .unwrap();
        let err = locks
            .acquire(std::slice::from_ref(&group), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_disjoint_clusters_do_not_block() {
        let locks = ClusterLocks::new();
        let a = Group::version(vec![]);
        let b = Group::version(vec![]);

        let _first = locks.acquire(&[a], Duration::from_millis(50)).await.unwrap();
        assert!(locks.acquire(&[b], Duration::from_millis(50)).await.is_ok());
    }
}
