//! ドメインモデル（ID、タスク状態機械、レコード、エラー）

pub mod errors;
pub mod ids;
pub mod lock;
pub mod namespace;
pub mod state;
pub mod task;

pub use self::errors::{ConductorError, ErrorKind};
pub use self::ids::{NamespaceId, ParseIdError, TaskId};
pub use self::lock::LeaseLock;
pub use self::namespace::Namespace;
pub use self::state::TaskState;
pub use self::task::{
    can_retry, is_expired, RegisterTask, Settings, StateChange, Task, TaskHistory, TaskType,
    UNLIMITED_RETRIES,
};
