//! App - Port の上に組み立てるコンポーネント
//!
//! # コンポーネント
//! - **NamespaceService**: TTL キャッシュ付きの namespace 参照
//! - **TaskService**: register / poll / accept / complete / abort / expire
//! - **WorkerMatcher**: long poll 中の worker とタスクのインメモリ待ち合わせ
//! - **Dispatcher**: scan、dispatch、expire の各ループ
//! - **CallbackSender**: ベストエフォートの完了通知
//! - **AppBuilder**: 設定駆動のワイヤリング

pub mod builder;
pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod matcher;
pub mod namespace;
pub mod retry;
pub mod task;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::callback::{CallbackError, CallbackPayload, CallbackSender, DeliveryOutcome};
pub use self::config::{ConductorConfig, ConfigError, ShardRange};
pub use self::dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use self::matcher::{MatchError, WorkerMatcher};
pub use self::namespace::NamespaceService;
pub use self::retry::RetryPolicy;
pub use self::task::TaskService;
