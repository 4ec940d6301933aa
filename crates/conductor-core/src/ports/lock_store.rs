//! LockStore port - ストレージに保存する lease lock
//!
//! タスクの意味論とは独立。キーに対して所有者を高々 1 つに限りたいもの
//! （特に shard の scan）はこの上に作る。

use std::time::Duration;

use async_trait::async_trait;

use super::StoreError;
use crate::domain::LeaseLock;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// `true` を返したときに限り、呼び出し側が `key` を所有する。
    ///
    /// 有効な行があれば何もしない。期限切れの行は奪い取る。
    async fn try_acquire_lock(
        &self,
        key: &str,
        val: &str,
        held_by: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// `held_by` が現在の有効な所有者である間だけ lease を延長する。
    /// `false` は lease を失ったことを意味する。
    async fn renew_lock(&self, key: &str, held_by: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    async fn release_lock(&self, key: &str, held_by: &str) -> Result<bool, StoreError>;

    /// 期限内の現在の所有者
    async fn get_lock_info(&self, key: &str) -> Result<Option<LeaseLock>, StoreError>;

    /// 期限切れの行をすべて削除し、件数を返す
    async fn cleanup_expired_locks(&self) -> Result<u64, StoreError>;
}
