use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::translate;
use crate::domain::LeaseLock;
use crate::ports::{Clock, LockStore, StoreError};

/// Lease locks in the `lease_locks` table. Expiry is unix seconds taken from
/// the injected clock, not from SQLite's own time functions.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteLockStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

/// Whole seconds, rounded up so a sub-second TTL still lasts until the next
/// second boundary.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_acquire_lock(
        &self,
        key: &str,
        val: &str,
        held_by: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_secs();
        // A live row absorbs the insert; an expired one is overwritten.
        let inserted = sqlx::query(
            r#"
            INSERT INTO lease_locks (lock_key, lock_val, held_by, expire, ctime)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(lock_key) DO UPDATE SET
                lock_val = excluded.lock_val,
                held_by = excluded.held_by,
                expire = excluded.expire,
                ctime = excluded.ctime
            WHERE lease_locks.expire <= ?5
            "#,
        )
        .bind(key)
        .bind(val)
        .bind(held_by)
        .bind(now.saturating_add(ttl_secs(ttl)))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(translate)?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn renew_lock(
        &self,
        key: &str,
        held_by: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_secs();
        let renewed = sqlx::query(
            "UPDATE lease_locks SET expire = ? WHERE lock_key = ? AND held_by = ? AND expire > ?",
        )
        .bind(now.saturating_add(ttl_secs(ttl)))
        .bind(key)
        .bind(held_by)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(translate)?;
        Ok(renewed.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, held_by: &str) -> Result<bool, StoreError> {
        let released = sqlx::query("DELETE FROM lease_locks WHERE lock_key = ? AND held_by = ?")
            .bind(key)
            .bind(held_by)
            .execute(&self.pool)
            .await
            .map_err(translate)?;
        Ok(released.rows_affected() == 1)
    }

    async fn get_lock_info(&self, key: &str) -> Result<Option<LeaseLock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT lock_key, lock_val, held_by, expire, ctime
            FROM lease_locks
            WHERE lock_key = ? AND expire > ?
            "#,
        )
        .bind(key)
        .bind(self.clock.now_secs())
        .fetch_optional(&self.pool)
        .await
        .map_err(translate)?;

        row.map(|row| {
            Ok(LeaseLock {
                lock_key: row.try_get("lock_key").map_err(translate)?,
                lock_val: row.try_get("lock_val").map_err(translate)?,
                held_by: row.try_get("held_by").map_err(translate)?,
                expire: row.try_get("expire").map_err(translate)?,
                ctime: row.try_get("ctime").map_err(translate)?,
            })
        })
        .transpose()
    }

    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError> {
        let removed = sqlx::query("DELETE FROM lease_locks WHERE expire <= ?")
            .bind(self.clock.now_secs())
            .execute(&self.pool)
            .await
            .map_err(translate)?;
        Ok(removed.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::sqlite::memory_pool;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    async fn store() -> (SqliteLockStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        (SqliteLockStore::new(memory_pool().await, clock.clone()), clock)
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let (store, _clock) = store().await;
        let store = Arc::new(store);

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.try_acquire_lock("shard/7", "v", "node-a", TTL).await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.try_acquire_lock("shard/7", "v", "node-b", TTL).await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert!(a ^ b, "exactly one acquire must win (a={a}, b={b})");

        let holder = store.get_lock_info("shard/7").await.unwrap().unwrap();
        assert_eq!(holder.held_by, if a { "node-a" } else { "node-b" });
    }

    #[tokio::test]
    async fn renew_fails_once_ttl_elapsed_even_for_holder() {
        let (store, clock) = store().await;
        assert!(store.try_acquire_lock("k", "v", "me", TTL).await.unwrap());

        clock.advance(chrono::Duration::seconds(10));
        assert!(store.renew_lock("k", "me", TTL).await.unwrap());

        clock.advance(chrono::Duration::seconds(31));
        assert!(!store.renew_lock("k", "me", TTL).await.unwrap());
        assert!(store.get_lock_info("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn foreign_holder_cannot_renew_or_release() {
        let (store, _clock) = store().await;
        assert!(store.try_acquire_lock("k", "v", "me", TTL).await.unwrap());

        assert!(!store.renew_lock("k", "intruder", TTL).await.unwrap());
        assert!(!store.release_lock("k", "intruder").await.unwrap());
        assert!(!store.try_acquire_lock("k", "v", "intruder", TTL).await.unwrap());

        assert!(store.release_lock("k", "me").await.unwrap());
        assert!(store.get_lock_info("k").await.unwrap().is_none());
        assert!(store.try_acquire_lock("k", "v", "intruder", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let (store, clock) = store().await;
        assert!(store.try_acquire_lock("k", "v1", "old", TTL).await.unwrap());
        clock.advance(chrono::Duration::seconds(30));

        assert!(store.try_acquire_lock("k", "v2", "new", TTL).await.unwrap());
        let info = store.get_lock_info("k").await.unwrap().unwrap();
        assert_eq!(info.held_by, "new");
        assert_eq!(info.lock_val, "v2");
        assert!(info.is_live(store.clock.now_secs()));
        assert!(!info.is_live(info.expire));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_rows() {
        let (store, clock) = store().await;
        assert!(store.try_acquire_lock("short", "v", "a", Duration::from_secs(5)).await.unwrap());
        assert!(store.try_acquire_lock("long", "v", "a", Duration::from_secs(60)).await.unwrap());

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.cleanup_expired_locks().await.unwrap(), 1);
        assert!(store.get_lock_info("long").await.unwrap().is_some());
        assert_eq!(store.cleanup_expired_locks().await.unwrap(), 0);
    }

    #[test]
    fn sub_second_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3)), 3);
        assert_eq!(ttl_secs(Duration::from_millis(3_500)), 4);
    }
}
