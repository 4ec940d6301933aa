//! Store port の SQLite 実装（`sqlx`）
//!
//! task / namespace / lock の各 store が 1 つの pool を共有する。
//! スキーマは `connect` 時に冪等に作成する。

mod lock_store;
mod namespace_store;
mod task_store;

pub use self::lock_store::SqliteLockStore;
pub use self::namespace_store::SqliteNamespaceStore;
pub use self::task_store::SqliteTaskStore;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::ports::StoreError;

/// SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY extended codes.
const SQLITE_UNIQUE_CODES: [&str; 2] = ["2067", "1555"];

/// バックエンドのエラーを閉じた `StoreError` 集合に変換する
pub(crate) fn translate(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db)
            if db.is_unique_violation()
                || db
                    .code()
                    .is_some_and(|code| SQLITE_UNIQUE_CODES.contains(&code.as_ref())) =>
        {
            StoreError::Duplicate
        }
        other => StoreError::Backend(Box::new(other)),
    }
}

/// Opens a pool and makes sure the schema exists.
///
/// `sqlite::memory:` gets a single, never-recycled connection: every
/// connection to an in-memory database is its own database.
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let in_memory = database_url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(database_url)
        .map_err(translate)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(translate)?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS namespaces (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            ctime INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            task_type TEXT NOT NULL,
            input_args BLOB NOT NULL,
            output_args BLOB NOT NULL,
            callback_url TEXT NOT NULL,
            state TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            max_retry_cnt INTEGER NOT NULL,
            expire_time INTEGER NOT NULL DEFAULT 0,
            settings TEXT NOT NULL DEFAULT '{}',
            error_msg TEXT NOT NULL DEFAULT '',
            ctime INTEGER NOT NULL,
            utime INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS task_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            state TEXT NOT NULL,
            retry_cnt INTEGER NOT NULL,
            ctime INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS lease_locks (
            lock_key TEXT PRIMARY KEY,
            lock_val TEXT NOT NULL,
            held_by TEXT NOT NULL,
            expire INTEGER NOT NULL,
            ctime INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_state_id ON tasks(state, id);
        CREATE INDEX IF NOT EXISTS idx_tasks_expire_time ON tasks(expire_time);
        CREATE INDEX IF NOT EXISTS idx_task_history_task ON task_history(task_id, state);
        CREATE INDEX IF NOT EXISTS idx_lease_locks_expire ON lease_locks(expire);
        "#,
    )
    .execute(pool)
    .await
    .map_err(translate)?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    connect("sqlite::memory:").await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let pool = memory_pool().await;
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn unique_violation_translates_to_duplicate() {
        let pool = memory_pool().await;
        let insert = "INSERT INTO namespaces (id, name, ctime) VALUES (?, ?, 0)";
        sqlx::query(insert)
            .bind("a")
            .bind("media")
            .execute(&pool)
            .await
            .unwrap();
        let err = sqlx::query(insert)
            .bind("b")
            .bind("media")
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(matches!(translate(err), StoreError::Duplicate));
    }

    #[tokio::test]
    async fn missing_row_translates_to_not_found() {
        let pool = memory_pool().await;
        let err = sqlx::query("SELECT id FROM namespaces WHERE id = ?")
            .bind("nope")
            .fetch_one(&pool)
            .await
            .err()
            .expect("no row should match");
        assert!(matches!(translate(err), StoreError::NotFound));
    }
}
