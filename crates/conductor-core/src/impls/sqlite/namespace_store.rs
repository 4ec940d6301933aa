use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::translate;
use crate::domain::{Namespace, NamespaceId};
use crate::ports::{NamespaceStore, StoreError};

#[derive(Clone)]
pub struct SqliteNamespaceStore {
    pool: SqlitePool,
}

impl SqliteNamespaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_namespace(row: &SqliteRow) -> Result<Namespace, StoreError> {
        let id: String = row.try_get("id").map_err(translate)?;
        Ok(Namespace {
            id: id.parse().map_err(|e| StoreError::Codec(format!("{e}")))?,
            name: row.try_get("name").map_err(translate)?,
            ctime: row.try_get("ctime").map_err(translate)?,
        })
    }
}

#[async_trait]
impl NamespaceStore for SqliteNamespaceStore {
    async fn create(&self, namespace: &Namespace) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO namespaces (id, name, ctime) VALUES (?, ?, ?)")
            .bind(namespace.id.as_key())
            .bind(&namespace.name)
            .bind(namespace.ctime)
            .execute(&self.pool)
            .await
            .map_err(translate)?;
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<Namespace, StoreError> {
        let row = sqlx::query("SELECT id, name, ctime FROM namespaces WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(translate)?;
        Self::row_to_namespace(&row)
    }

    async fn get_by_id(&self, id: NamespaceId) -> Result<Namespace, StoreError> {
        let row = sqlx::query("SELECT id, name, ctime FROM namespaces WHERE id = ?")
            .bind(id.as_key())
            .fetch_one(&self.pool)
            .await
            .map_err(translate)?;
        Self::row_to_namespace(&row)
    }

    async fn delete(&self, id: NamespaceId) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM namespaces WHERE id = ?")
            .bind(id.as_key())
            .execute(&self.pool)
            .await
            .map_err(translate)?;
        Ok(deleted.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::sqlite::memory_pool;
    use ulid::Ulid;

    fn ns(name: &str) -> Namespace {
        Namespace {
            id: NamespaceId::from_ulid(Ulid::new()),
            name: name.into(),
            ctime: 42,
        }
    }

    #[tokio::test]
    async fn create_get_delete() {
        let store = SqliteNamespaceStore::new(memory_pool().await);
        let media = ns("media");
        store.create(&media).await.unwrap();

        assert_eq!(store.get_by_name("media").await.unwrap(), media);
        assert_eq!(store.get_by_id(media.id).await.unwrap(), media);

        assert!(store.delete(media.id).await.unwrap());
        assert!(!store.delete(media.id).await.unwrap());
        assert!(matches!(
            store.get_by_name("media").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let store = SqliteNamespaceStore::new(memory_pool().await);
        store.create(&ns("media")).await.unwrap();
        assert!(matches!(
            store.create(&ns("media")).await,
            Err(StoreError::Duplicate)
        ));
    }
}
