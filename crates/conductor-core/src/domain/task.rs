//! タスクモデル: 永続化される行、監査履歴、retry / expire の規則

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{TaskId, TaskState};

/// Retry budget meaning "retry forever".
pub const UNLIMITED_RETRIES: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Open extension map stored alongside a task.
pub type Settings = BTreeMap<String, serde_json::Value>;

/// A task row.
///
/// `version` is bumped by every mutation; writers must present the version
/// they read (see `ports::TaskStore::update_state`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub namespace: String,
    pub task_type: TaskType,
    pub input_args: Vec<u8>,
    pub output_args: Vec<u8>,
    pub callback_url: String,
    pub state: TaskState,
    pub trace_id: String,
    /// -1 = unlimited, 0 = no retry, n > 0 = at most n retries.
    pub max_retry_cnt: i32,
    /// Absolute deadline in unix millis, 0 = never.
    pub expire_time: i64,
    pub settings: Settings,
    /// Message reported with the last failed completion.
    pub error_msg: String,
    pub ctime: i64,
    pub utime: i64,
    pub version: i64,
}

impl Task {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        is_expired(self.expire_time, now_ms)
    }
}

/// A deadline of 0 never expires.
pub fn is_expired(expire_time: i64, now_ms: i64) -> bool {
    expire_time > 0 && now_ms > expire_time
}

/// Whether a task that has already been retried `current_retry_cnt` times
/// may be retried once more.
pub fn can_retry(max_retry_cnt: i32, current_retry_cnt: i64) -> bool {
    if max_retry_cnt < 0 {
        return true;
    }
    current_retry_cnt < i64::from(max_retry_cnt)
}

/// Registration request, as the transport would hand it over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterTask {
    pub namespace: String,
    pub task_type: String,
    #[serde(default)]
    pub input_args: Vec<u8>,
    #[serde(default)]
    pub callback_url: String,
    #[serde(default)]
    pub max_retry_cnt: i32,
    #[serde(default)]
    pub expire_time: i64,
    /// Generated when absent.
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub settings: Settings,
}

impl RegisterTask {
    /// Request with only the required fields set.
    pub fn new(namespace: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            task_type: task_type.into(),
            ..Self::default()
        }
    }
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task_id: TaskId,
    pub state: TaskState,
    pub retry_cnt: i64,
    pub ctime: i64,
}

/// Mutation applied by a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub state: TaskState,
    pub output_args: Option<Vec<u8>>,
    pub error_msg: Option<String>,
    /// Written to the history row. `None` carries the task's current retry
    /// count over.
    pub retry_cnt: Option<i64>,
}

impl StateChange {
    pub fn to(state: TaskState) -> Self {
        Self {
            state,
            output_args: None,
            error_msg: None,
            retry_cnt: None,
        }
    }

    pub fn with_output(mut self, output_args: Vec<u8>, error_msg: impl Into<String>) -> Self {
        self.output_args = Some(output_args);
        self.error_msg = Some(error_msg.into());
        self
    }

    pub fn with_retry_cnt(mut self, retry_cnt: i64) -> Self {
        self.retry_cnt = Some(retry_cnt);
        self
    }
}
