//! Per-memory write serialization
//!
//! Shared by the engine's write operations and the reconciliation pass so a
//! retry never races an edit of the same record.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct WriteLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `id`.
    pub async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry of a record that no longer exists.
    pub fn release(&self, id: Uuid) {
        self.locks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_waits_other_ids_do_not() {
        let locks = Arc::new(WriteLocks::new());
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(Uuid::new_v4())).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.acquire(id)).await;
        assert!(same.is_err());

        drop(guard);
        let same = tokio::time::timeout(Duration::from_millis(50), locks.acquire(id)).await;
        assert!(same.is_ok());

        locks.release(id);
        assert_eq!(locks.len(), 1);
    }
}
