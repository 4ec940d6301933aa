use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::translate;
use crate::domain::{Settings, StateChange, Task, TaskHistory, TaskId, TaskState, TaskType};
use crate::ports::{StoreError, TaskStore};

const TASK_COLUMNS: &str = "id, namespace, task_type, input_args, output_args, callback_url, \
     state, trace_id, max_retry_cnt, expire_time, settings, error_msg, ctime, utime, version";

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
        let id: String = row.try_get("id").map_err(translate)?;
        let state: String = row.try_get("state").map_err(translate)?;
        let settings: String = row.try_get("settings").map_err(translate)?;
        let task_type: String = row.try_get("task_type").map_err(translate)?;

        Ok(Task {
            id: id
                .parse()
                .map_err(|e| StoreError::Codec(format!("{e}")))?,
            namespace: row.try_get("namespace").map_err(translate)?,
            task_type: TaskType::new(task_type),
            input_args: row.try_get("input_args").map_err(translate)?,
            output_args: row.try_get("output_args").map_err(translate)?,
            callback_url: row.try_get("callback_url").map_err(translate)?,
            state: state
                .parse()
                .map_err(|e| StoreError::Codec(format!("{e}")))?,
            trace_id: row.try_get("trace_id").map_err(translate)?,
            max_retry_cnt: row.try_get("max_retry_cnt").map_err(translate)?,
            expire_time: row.try_get("expire_time").map_err(translate)?,
            settings: serde_json::from_str::<Settings>(&settings)
                .map_err(|e| StoreError::Codec(format!("settings: {e}")))?,
            error_msg: row.try_get("error_msg").map_err(translate)?,
            ctime: row.try_get("ctime").map_err(translate)?,
            utime: row.try_get("utime").map_err(translate)?,
            version: row.try_get("version").map_err(translate)?,
        })
    }

    fn rows_to_tasks(rows: &[SqliteRow]) -> Result<Vec<Task>, StoreError> {
        rows.iter().map(Self::row_to_task).collect()
    }
}

fn cursor_key(after: Option<TaskId>) -> String {
    // Every ULID string sorts after "".
    after.map(|id| id.as_key()).unwrap_or_default()
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let settings = serde_json::to_string(&task.settings)
            .map_err(|e| StoreError::Codec(format!("settings: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(translate)?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO tasks ({TASK_COLUMNS})
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM namespaces WHERE name = ?)
            "#
        ))
        .bind(task.id.as_key())
        .bind(&task.namespace)
        .bind(task.task_type.as_str())
        .bind(&task.input_args)
        .bind(&task.output_args)
        .bind(&task.callback_url)
        .bind(task.state.as_str())
        .bind(&task.trace_id)
        .bind(task.max_retry_cnt)
        .bind(task.expire_time)
        .bind(settings)
        .bind(&task.error_msg)
        .bind(task.ctime)
        .bind(task.utime)
        .bind(task.version)
        .bind(&task.namespace)
        .execute(&mut *tx)
        .await
        .map_err(translate)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        sqlx::query("INSERT INTO task_history (task_id, state, retry_cnt, ctime) VALUES (?, ?, 0, ?)")
            .bind(task.id.as_key())
            .bind(task.state.as_str())
            .bind(task.ctime)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;

        tx.commit().await.map_err(translate)?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.as_key())
            .fetch_one(&self.pool)
            .await
            .map_err(translate)?;
        Self::row_to_task(&row)
    }

    async fn update_state(
        &self,
        id: TaskId,
        expected_version: i64,
        change: &StateChange,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(translate)?;

        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?,
                output_args = COALESCE(?, output_args),
                error_msg = COALESCE(?, error_msg),
                utime = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(change.state.as_str())
        .bind(change.output_args.as_deref())
        .bind(change.error_msg.as_deref())
        .bind(now_ms)
        .bind(id.as_key())
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(translate)?;

        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO task_history (task_id, state, retry_cnt, ctime)
            VALUES (?, ?, COALESCE(?, (
                SELECT COUNT(*) FROM task_history WHERE task_id = ? AND state = 'pending_retry'
            )), ?)
            "#,
        )
        .bind(id.as_key())
        .bind(change.state.as_str())
        .bind(change.retry_cnt)
        .bind(id.as_key())
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(translate)?;

        tx.commit().await.map_err(translate)?;
        Ok(true)
    }

    async fn scan_by_state(
        &self,
        state: TaskState,
        after: Option<TaskId>,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ? AND id > ? ORDER BY id LIMIT ?"
        ))
        .bind(state.as_str())
        .bind(cursor_key(after))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(translate)?;
        Self::rows_to_tasks(&rows)
    }

    async fn scan_expired(
        &self,
        now_ms: i64,
        after: Option<TaskId>,
        limit: u32,
    ) -> Result<Vec<Task>, StoreError> {
        let states = TaskState::NON_TERMINAL
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE state IN ({states})
              AND expire_time > 0
              AND expire_time < ?
              AND id > ?
            ORDER BY id
            LIMIT ?
            "#
        ))
        .bind(now_ms)
        .bind(cursor_key(after))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(translate)?;
        Self::rows_to_tasks(&rows)
    }

    async fn count_retries(&self, id: TaskId) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM task_history WHERE task_id = ? AND state = ?",
        )
        .bind(id.as_key())
        .bind(TaskState::PendingRetry.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(translate)
    }

    async fn list_history(&self, id: TaskId) -> Result<Vec<TaskHistory>, StoreError> {
        let rows = sqlx::query(
            "SELECT state, retry_cnt, ctime FROM task_history WHERE task_id = ? ORDER BY id",
        )
        .bind(id.as_key())
        .fetch_all(&self.pool)
        .await
        .map_err(translate)?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state").map_err(translate)?;
                Ok(TaskHistory {
                    task_id: id,
                    state: state
                        .parse()
                        .map_err(|e| StoreError::Codec(format!("{e}")))?,
                    retry_cnt: row.try_get("retry_cnt").map_err(translate)?,
                    ctime: row.try_get("ctime").map_err(translate)?,
                })
            })
            .collect()
    }
}
