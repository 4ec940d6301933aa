use serde::{Deserialize, Serialize};

use super::NamespaceId;

/// A named grouping that every task must reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    /// Unix millis.
    pub ctime: i64,
}
