//! conductor-core
//!
//! 永続タスクオーケストレーション。タスクは namespace に登録され、
//! long poll 中の worker に渡され、楽観的排他制御の下で retry / expire を含む
//! 状態機械を進み、終了時に callback URL へ通知される。
//!
//! # モジュール構成
//! - **domain**: ID、タスクと状態モデル、namespace、lease lock、エラー
//! - **ports**: 境界の trait（store、clock、ID 生成、shard）
//! - **impls**: SQLite store と shard 所有
//! - **app**: サービス、matcher、dispatcher、callback、設定、ワイヤリング
//! - **observability**: tracing の初期化とステータス表示

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{App, AppBuilder, ConductorConfig};
pub use domain::{ConductorError, ErrorKind, RegisterTask, Task, TaskId, TaskState};
