use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per user. Admission reads, execution and the position writes
/// that follow all happen while holding the user's guard, so two signals (or a
/// signal and the lifecycle monitor) never act on the same user at once.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    warnings: Mutex<HashMap<Uuid, u32>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for and returns the user's guard.
    ///
    /// Entries nobody holds or waits on are dropped on the way in, so the map
    /// only tracks users with work in flight.
    pub async fn lock(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Guards and waiters each hold a clone; a count of 1 is the map alone.
            locks.retain(|id, lock| *id == user_id || Arc::strong_count(lock) > 1);
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked_users(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Counts one more risk violation and returns the new total.
    pub async fn record_violation(&self, user_id: Uuid) -> u32 {
        let mut warnings = self.warnings.lock().await;
        let count = warnings.entry(user_id).or_insert(0);
        *count += 1;
        *count
    }

    pub async fn warnings(&self, user_id: Uuid) -> u32 {
        self.warnings.lock().await.get(&user_id).copied().unwrap_or(0)
    }

    /// Clears the counter, e.g. once the user has been suspended.
    pub async fn reset_warnings(&self, user_id: Uuid) {
        self.warnings.lock().await.remove(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_user_is_serialised() {
        let locks = Arc::new(UserLocks::new());
        let user = Uuid::new_v4();
        let guard = locks.lock(user).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(user).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_users_do_not_block_each_other() {
        let locks = UserLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_users_are_forgotten() {
        let locks = UserLocks::new();
        for _ in 0..100 {
            drop(locks.lock(Uuid::new_v4()).await);
        }
        let held = Uuid::new_v4();
        let _guard = locks.lock(held).await;
        // Only the user whose guard is alive is still tracked.
        assert_eq!(locks.tracked_users().await, 1);

        drop(locks.lock(Uuid::new_v4()).await);
        assert_eq!(locks.tracked_users().await, 2);
    }

    #[tokio::test]
    async fn a_held_lock_survives_pruning() {
        let locks = Arc::new(UserLocks::new());
        let user = Uuid::new_v4();
        let guard = locks.lock(user).await;
        drop(locks.lock(Uuid::new_v4()).await);

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(user).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn violations_accumulate_per_user() {
        let locks = UserLocks::new();
        let user = Uuid::new_v4();
        assert_eq!(locks.record_violation(user).await, 1);
        assert_eq!(locks.record_violation(user).await, 2);
        assert_eq!(locks.warnings(Uuid::new_v4()).await, 0);
        locks.reset_warnings(user).await;
        assert_eq!(locks.warnings(user).await, 0);
    }
}
