use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-instance advisory locks serialising the jobs that mutate turn state.
///
/// Claimers of the same instance wait for each other; different instances
/// never contend. An entry lives only while someone holds or waits for it.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

/// Held lock of one instance; released on drop.
pub struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InstanceLocks {
    /// Wait for and take the lock of `instance_id`.
    pub async fn acquire(&self, instance_id: Uuid) -> InstanceGuard<'_> {
        let lock = self.locks.entry(instance_id).or_default().clone();
        InstanceGuard {
            locks: self,
            instance_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // the map's own reference is the last one once nobody waits
        self.locks
            .locks
            .remove_if(&self.instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_instance_waits_for_holder() {
        let locks = Arc::new(InstanceLocks::default());
        let instance = Uuid::new_v4();
        let guard = locks.acquire(instance).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(instance).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn released_locks_are_forgotten() {
        let locks = InstanceLocks::default();
        let instance = Uuid::new_v4();
        let guard = locks.acquire(instance).await;
        assert_eq!(locks.tracked(), 1);
        drop(guard);
        assert_eq!(locks.tracked(), 0);

        let _again = locks.acquire(instance).await;
        assert_eq!(locks.tracked(), 1);
    }

    #[tokio::test]
    async fn different_instances_do_not_contend() {
        let locks = InstanceLocks::default();
        let _first = locks.acquire(Uuid::new_v4()).await;
        let _second = locks.acquire(Uuid::new_v4()).await;
    }
}
