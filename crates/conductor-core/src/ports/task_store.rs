//! TaskStore port - タスク状態と履歴の正本

use async_trait::async_trait;

use super::StoreError;
use crate::domain::{StateChange, Task, TaskHistory, TaskId, TaskState};

/// TaskStore はタスクと監査履歴を永続化する
///
/// # 契約
/// - `create_task` は行と最初の履歴行をアトミックに挿入する。namespace が
///   存在しなければ挿入せず `StoreError::NotFound` を返す。
/// - `update_state` は `version` に対する compare-and-swap。一致する行が
///   なければ `false` を返し、呼び出し側はそれを競合負けとして扱う。
/// - scan は `id` 昇順の keyset pagination で、`after` より厳密に後ろから読む。
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError>;

    async fn update_state(
        &self,
        id: TaskId,
        expected_version: i64,
        change: &StateChange,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    async fn scan_by_state(
        &self,
        state: TaskState,
        after: Option<TaskId>,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError>;

    /// 期限が設定済みで、すでに過ぎている非終端タスク
    async fn scan_expired(
        &self,
        now_ms: i64,
        after: Option<TaskId>,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError>;

    /// タスクが `pending_retry` に入った回数
    async fn count_retries(&self, id: TaskId) -> Result<i64, StoreError>;

    async fn list_history(&self, id: TaskId) -> Result<Vec<TaskHistory>, StoreError>;
}
