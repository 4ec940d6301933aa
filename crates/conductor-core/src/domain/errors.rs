//! Errors - ドメインエラー型とその分類

use thiserror::Error;

/// トランスポート層がステータスコードに対応付ける粗い分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 不正な入力、または現在の状態では許されない遷移
    InvalidArgument,
    NotFound,
    /// キー重複、または楽観的排他制御の競合負け
    Conflict,
    /// 呼び出し側が待機を打ち切った
    Cancelled,
    /// ストレージまたは通信の障害
    Internal,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("namespace {0:?} not found")]
    NamespaceNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("namespace {0:?} already exists")]
    NamespaceAlreadyExists(String),

    /// 読み取り後に行が変更された。再読込してから判断し直す
    #[error("task {task_id} was modified concurrently (expected version {expected})")]
    Conflict { task_id: String, expected: i64 },

    #[error("long poll cancelled")]
    Cancelled,

    #[error("internal error ({context}): {source}")]
    Internal {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl ConductorError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConductorError::InvalidArgument(msg.into())
    }

    pub fn internal(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        ConductorError::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConductorError::NamespaceNotFound(_) | ConductorError::TaskNotFound(_) => {
                ErrorKind::NotFound
            }
            ConductorError::NamespaceAlreadyExists(_) | ConductorError::Conflict { .. } => {
                ErrorKind::Conflict
            }
            ConductorError::Cancelled => ErrorKind::Cancelled,
            ConductorError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// そのまま（再読込後に）retry する価値があるのは version 競合だけ
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::Conflict { .. })
    }
}
