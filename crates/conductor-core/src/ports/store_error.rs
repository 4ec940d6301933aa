//! Store 境界のエラー
//!
//! バックエンドは固有のエラーをこの閉じた集合へ一度だけ変換する。
//! store より上の層はこの variant だけを見る。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    /// 挿入時の一意キー違反
    #[error("duplicate key")]
    Duplicate,

    /// 保存値をドメイン型にデコードできなかった
    #[error("corrupt row: {0}")]
    Codec(String),

    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),
}
