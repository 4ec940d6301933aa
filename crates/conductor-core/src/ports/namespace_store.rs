//! NamespaceStore port

use async_trait::async_trait;

use super::StoreError;
use crate::domain::{Namespace, NamespaceId};

#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// 名前が使用済みなら `StoreError::Duplicate`
    async fn create(&self, namespace: &Namespace) -> Result<(), StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Namespace, StoreError>;

    async fn get_by_id(&self, id: NamespaceId) -> Result<Namespace, StoreError>;

    /// 行を削除したかどうかを返す
    async fn delete(&self, id: NamespaceId) -> Result<bool, StoreError>;
}
