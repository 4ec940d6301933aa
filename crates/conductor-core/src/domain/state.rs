//! タスク状態機械

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// タスクの状態
///
/// 状態遷移:
/// - inited -> dispatched -> running -> success
/// - inited -> dispatched -> running -> failure -> pending_retry -> dispatched -> ...
/// - inited | dispatched -> aborted（明示的な abort）
/// - 非終端状態すべて -> expired（`expire_time` 超過後）
///
/// 保存された `failure` は終端。retry が残っていれば、complete の呼び出しが
/// そのまま `pending_retry` へ進める。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 登録済み、最初の dispatch 待ち
    Inited,

    /// worker に渡したが未 accept
    Dispatched,

    /// worker が accept 済み
    Running,

    Success,

    Failure,

    /// 失敗後、再 dispatch 待ち
    PendingRetry,

    Aborted,

    Expired,
}

impl TaskState {
    /// pending scan が対象とする 2 状態
    pub const PENDING: [TaskState; 2] = [TaskState::Inited, TaskState::PendingRetry];

    /// expire sweep が対象にしうる全状態
    pub const NON_TERMINAL: [TaskState; 4] = [
        TaskState::Inited,
        TaskState::Dispatched,
        TaskState::Running,
        TaskState::PendingRetry,
    ];

    pub fn is_pending(self) -> bool {
        matches!(self, TaskState::Inited | TaskState::PendingRetry)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Aborted | TaskState::Expired
        )
    }

    pub fn is_abortable(self) -> bool {
        matches!(self, TaskState::Inited | TaskState::Dispatched)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Inited => "inited",
            TaskState::Dispatched => "dispatched",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
            TaskState::PendingRetry => "pending_retry",
            TaskState::Aborted => "aborted",
            TaskState::Expired => "expired",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task state {0:?}")]
pub struct UnknownState(pub String);

impl FromStr for TaskState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "inited" => TaskState::Inited,
            "dispatched" => TaskState::Dispatched,
            "running" => TaskState::Running,
            "success" => TaskState::Success,
            "failure" => TaskState::Failure,
            "pending_retry" => TaskState::PendingRetry,
            "aborted" => TaskState::Aborted,
            "expired" => TaskState::Expired,
            other => return Err(UnknownState(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Inited, true, false, true)]
    #[case(TaskState::Dispatched, false, false, true)]
    #[case(TaskState::Running, false, false, false)]
    #[case(TaskState::Success, false, true, false)]
    #[case(TaskState::Failure, false, true, false)]
    #[case(TaskState::PendingRetry, true, false, false)]
    #[case(TaskState::Aborted, false, true, false)]
    #[case(TaskState::Expired, false, true, false)]
    fn state_predicates(
        #[case] state: TaskState,
        #[case] pending: bool,
        #[case] terminal: bool,
        #[case] abortable: bool,
    ) {
        assert_eq!(state.is_pending(), pending);
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_abortable(), abortable);
        assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
    }

    #[test]
    fn non_terminal_list_matches_predicate() {
        for state in TaskState::NON_TERMINAL {
            assert!(!state.is_terminal());
        }
        assert!("bogus".parse::<TaskState>().is_err());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&TaskState::PendingRetry).unwrap();
        assert_eq!(json, "\"pending_retry\"");
    }
}
