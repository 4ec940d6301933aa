//! TaskService - タスクのライフサイクル操作
//!
//! 状態変更はすべて、直前に読んだ version に対する compare-and-swap。
//! 一致する行がなければ他者が先に動かしたということで、
//! `ConductorError::Conflict` を返す。ここでは retry しない。
//!
//! ```text
//! inited ──► dispatched ──► running ──► success
//!   ▲  │          │            │
//!   │  └─abort─┐  └─abort─┐    └──► failure ──(retries left)──► pending_retry
//!   │          ▼          ▼                                          │
//!   │       aborted    aborted                                       │
//!   └──────────────────── (pending: scanned and dispatched) ◄────────┘
//!
//! any non-terminal state ──(now > expire_time)──► expired
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::callback::CallbackSender;
use super::matcher::{MatchError, WorkerMatcher};
use super::namespace::NamespaceService;
use crate::domain::{
    can_retry, ConductorError, RegisterTask, StateChange, Task, TaskHistory, TaskId, TaskState,
    TaskType,
};
use crate::ports::{Clock, IdGenerator, StoreError, TaskStore};

pub struct TaskService {
    tasks: Arc<dyn TaskStore>,
    namespaces: Arc<NamespaceService>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    matcher: Arc<WorkerMatcher>,
    callbacks: CallbackSender,
}

impl TaskService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        namespaces: Arc<NamespaceService>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        matcher: Arc<WorkerMatcher>,
        callbacks: CallbackSender,
    ) -> Self {
        Self {
            tasks,
            namespaces,
            ids,
            clock,
            matcher,
            callbacks,
        }
    }

    #[instrument(skip(self, req), fields(namespace = %req.namespace, task_type = %req.task_type))]
    pub async fn register_task(&self, req: RegisterTask) -> Result<TaskId, ConductorError> {
        if req.namespace.is_empty() {
            return Err(ConductorError::invalid("namespace is empty"));
        }
        if req.task_type.is_empty() {
            return Err(ConductorError::invalid("task type is empty"));
        }
        if req.expire_time < 0 {
            return Err(ConductorError::invalid("expire time is negative"));
        }
        if !self.namespaces.exists(&req.namespace).await? {
            return Err(ConductorError::NamespaceNotFound(req.namespace));
        }

        let now = self.clock.now_ms();
        let task = Task {
            id: self.ids.generate_task_id(),
            namespace: req.namespace,
            task_type: TaskType::new(req.task_type),
            input_args: req.input_args,
            output_args: Vec::new(),
            callback_url: req.callback_url,
            state: TaskState::Inited,
            trace_id: req
                .trace_id
                .filter(|t| !t.is_empty())
                .unwrap_or_else(new_trace_id),
            max_retry_cnt: req.max_retry_cnt,
            expire_time: req.expire_time,
            settings: req.settings,
            error_msg: String::new(),
            ctime: now,
            utime: now,
            version: 0,
        };

        match self.tasks.create_task(&task).await {
            Ok(()) => {}
            // キャッシュ上は存在したが行はもうない
            Err(StoreError::NotFound) => {
                return Err(ConductorError::NamespaceNotFound(task.namespace));
            }
            Err(e) => return Err(ConductorError::internal(format!("register task {}", task.id), e)),
        }

        info!(task_id = %task.id, "task registered");
        Ok(task.id)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, ConductorError> {
        let id = parse_id(id)?;
        self.load(id).await
    }

    pub async fn task_history(&self, id: &str) -> Result<Vec<TaskHistory>, ConductorError> {
        let id = parse_id(id)?;
        self.load(id).await?;
        self.tasks
            .list_history(id)
            .await
            .map_err(|e| ConductorError::internal(format!("history of task {id}"), e))
    }

    #[instrument(skip(self))]
    pub async fn abort_task(&self, id: &str) -> Result<Task, ConductorError> {
        let task = self.get_task(id).await?;
        if !task.state.is_abortable() {
            return Err(ConductorError::invalid(format!(
                "task {} is {} and cannot be aborted",
                task.id, task.state
            )));
        }
        let task = self.transition(task, StateChange::to(TaskState::Aborted)).await?;
        info!(task_id = %task.id, "task aborted");
        Ok(task)
    }

    /// `task_type` の pending タスクを最大 `timeout` 待ち、呼び出し側のものとして
    /// 確保する（`dispatched`）。何も来なければ `Ok(None)`。
    ///
    /// 渡されたタスクは scan 後に確保・abort・expire されている可能性がある。
    /// その場合は読み飛ばし、残り時間だけ待ち続ける。
    #[instrument(skip(self, timeout), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn long_poll(
        &self,
        worker_id: &str,
        task_type: &str,
        timeout: Duration,
    ) -> Result<Option<Task>, ConductorError> {
        self.long_poll_until(worker_id, task_type, timeout, std::future::pending())
            .await
    }

    /// `cancelled` が完了した時点で `ConductorError::Cancelled` で終わる
    /// `long_poll`（クライアントが切断したトランスポート向け）。
    /// future を drop しても matcher 側の効果は同じ。
    #[instrument(skip(self, timeout, cancelled), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn long_poll_until<F>(
        &self,
        worker_id: &str,
        task_type: &str,
        timeout: Duration,
        cancelled: F,
    ) -> Result<Option<Task>, ConductorError>
    where
        F: Future<Output = ()>,
    {
        if task_type.is_empty() {
            return Err(ConductorError::invalid("task type is empty"));
        }
        let task_type = TaskType::new(task_type);
        let deadline = Instant::now() + timeout;
        tokio::pin!(cancelled);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let task = match self
                .matcher
                .wait_for_task_until(worker_id, &task_type, remaining, &mut cancelled)
                .await
            {
                Ok(Some(task)) => task,
                Ok(None) => return Ok(None),
                Err(MatchError::Cancelled) => return Err(ConductorError::Cancelled),
            };

            if !task.state.is_pending() || task.is_expired(self.clock.now_ms()) {
                debug!(task_id = %task.id, state = %task.state, "stale handoff skipped");
                continue;
            }
            match self.transition(task, StateChange::to(TaskState::Dispatched)).await {
                Ok(task) => {
                    info!(task_id = %task.id, "task dispatched");
                    return Ok(Some(task));
                }
                Err(e @ ConductorError::Conflict { .. }) => {
                    debug!(error = %e, "dispatch lost a race, waiting on");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn accept_task(&self, id: &str) -> Result<Task, ConductorError> {
        let task = self.get_task(id).await?;
        if task.state != TaskState::Dispatched {
            return Err(ConductorError::invalid(format!(
                "task {} is {}, only dispatched tasks can be accepted",
                task.id, task.state
            )));
        }
        self.transition(task, StateChange::to(TaskState::Running)).await
    }

    /// worker の結果を記録する。retry 枠が残る失敗は `pending_retry` へ進み、
    /// 終端の結果は callback を起動する。
    #[instrument(skip(self, output_args, error_msg))]
    pub async fn complete_task(
        &self,
        id: &str,
        success: bool,
        output_args: Vec<u8>,
        error_msg: &str,
    ) -> Result<Task, ConductorError> {
        let task = self.get_task(id).await?;
        if task.state != TaskState::Running {
            return Err(ConductorError::invalid(format!(
                "task {} is {}, only running tasks can be completed",
                task.id, task.state
            )));
        }

        let outcome = if success {
            TaskState::Success
        } else {
            TaskState::Failure
        };
        let task = self
            .transition(task, StateChange::to(outcome).with_output(output_args, error_msg))
            .await?;

        if !success {
            let retries = self
                .tasks
                .count_retries(task.id)
                .await
                .map_err(|e| ConductorError::internal(format!("retry count of task {}", task.id), e))?;
            if can_retry(task.max_retry_cnt, retries) {
                let change = StateChange::to(TaskState::PendingRetry).with_retry_cnt(retries + 1);
                let task = self.transition(task, change).await?;
                info!(task_id = %task.id, retry = retries + 1, "task failed, retry scheduled");
                return Ok(task);
            }
            warn!(task_id = %task.id, retries, "task failed, retries exhausted");
        } else {
            info!(task_id = %task.id, "task succeeded");
        }

        self.callbacks.notify(&task);
        Ok(task)
    }

    /// 期限切れの非終端タスクを `expired` にする。期限前なら `Ok(false)`
    pub async fn expire_task(&self, task: &Task) -> Result<bool, ConductorError> {
        if task.state.is_terminal() || !task.is_expired(self.clock.now_ms()) {
            return Ok(false);
        }
        let task = self
            .transition(task.clone(), StateChange::to(TaskState::Expired))
            .await?;
        info!(task_id = %task.id, task_type = %task.task_type, "task expired");
        Ok(true)
    }

    pub fn matcher(&self) -> &Arc<WorkerMatcher> {
        &self.matcher
    }

    async fn load(&self, id: TaskId) -> Result<Task, ConductorError> {
        self.tasks.get_task(id).await.map_err(|e| match e {
            StoreError::NotFound => ConductorError::TaskNotFound(id.to_string()),
            e => ConductorError::internal(format!("load task {id}"), e),
        })
    }

    /// `task.version` に対する CAS。更新後のタスクを返す
    async fn transition(&self, mut task: Task, change: StateChange) -> Result<Task, ConductorError> {
        let now = self.clock.now_ms();
        let swapped = self
            .tasks
            .update_state(task.id, task.version, &change, now)
            .await
            .map_err(|e| ConductorError::internal(format!("update task {}", task.id), e))?;
        if !swapped {
            return Err(ConductorError::Conflict {
                task_id: task.id.to_string(),
                expected: task.version,
            });
        }

        debug!(task_id = %task.id, from = %task.state, to = %change.state, "task transitioned");
        task.state = change.state;
        if let Some(output_args) = change.output_args {
            task.output_args = output_args;
        }
        if let Some(error_msg) = change.error_msg {
            task.error_msg = error_msg;
        }
        task.utime = now;
        task.version += 1;
        Ok(task)
    }
}

fn parse_id(id: &str) -> Result<TaskId, ConductorError> {
    id.parse()
        .map_err(|e| ConductorError::invalid(format!("{e}")))
}

/// 128 bit の乱数を小文字 16 進 32 文字で。W3C trace id として使える
fn new_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>().max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::retry::RetryPolicy;
    use crate::domain::ErrorKind;
    use crate::impls::sqlite::{memory_pool, SqliteNamespaceStore, SqliteTaskStore};
    use crate::ports::{FixedClock, UlidGenerator};
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use tokio::sync::mpsc;

    use super::super::callback::CallbackPayload;

    struct Fixture {
        service: Arc<TaskService>,
        store: Arc<SqliteTaskStore>,
        clock: Arc<FixedClock>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let pool = memory_pool().await;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let namespaces = Arc::new(NamespaceService::new(
            Arc::new(SqliteNamespaceStore::new(pool.clone())),
            ids.clone(),
            clock.clone(),
            Duration::from_secs(60),
        ));
        namespaces.create("media").await.unwrap();

        let store = Arc::new(SqliteTaskStore::new(pool));
        let callbacks = CallbackSender::new(Duration::from_secs(2), RetryPolicy::new(1)).unwrap();
        let service = Arc::new(TaskService::new(
            store.clone(),
            namespaces,
            ids,
            clock.clone(),
            Arc::new(WorkerMatcher::new()),
            callbacks,
        ));
        Fixture {
            service,
            store,
            clock,
        }
    }

    async fn register(f: &Fixture, max_retry_cnt: i32) -> TaskId {
        let req = RegisterTask {
            max_retry_cnt,
            ..RegisterTask::new("media", "resize_image")
        };
        f.service.register_task(req).await.unwrap()
    }

    /// Drives a registered task to `running` through the matcher.
    async fn run(f: &Fixture, id: TaskId) -> Task {
        let poll = tokio::spawn({
            let service = f.service.clone();
            async move {
                service
                    .long_poll("w1", "resize_image", Duration::from_secs(5))
                    .await
            }
        });
        let t = TaskType::new("resize_image");
        while f.service.matcher().waiting_count(&t) == 0 {
            tokio::task::yield_now().await;
        }
        let task = f.store.get_task(id).await.unwrap();
        assert!(f.service.matcher().dispatch_task(task));
        let dispatched = poll.await.unwrap().unwrap().unwrap();
        assert_eq!(dispatched.state, TaskState::Dispatched);

        f.service.accept_task(&id.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn register_creates_inited_task_with_history() {
        let f = fixture().await;
        let id = register(&f, 3).await;

        let task = f.service.get_task(&id.to_string()).await.unwrap();
        assert_eq!(task.state, TaskState::Inited);
        assert_eq!(task.version, 0);
        assert_eq!(task.namespace, "media");
        assert_eq!(task.trace_id.len(), 32);

        let history = f.service.task_history(&id.as_key()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, TaskState::Inited);
    }

    #[tokio::test]
    async fn register_into_unknown_namespace_fails() {
        let f = fixture().await;
        let err = f
            .service
            .register_task(RegisterTask::new("billing", "invoice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NamespaceNotFound(ref n) if n == "billing"));
    }

    #[tokio::test]
    async fn supplied_trace_id_is_kept() {
        let f = fixture().await;
        let req = RegisterTask {
            trace_id: Some("4bf92f3577b34da6a3ce929d0e0e4736".into()),
            ..RegisterTask::new("media", "resize_image")
        };
        let id = f.service.register_task(req).await.unwrap();
        let task = f.service.get_task(&id.to_string()).await.unwrap();
        assert_eq!(task.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[rstest]
    #[case("", "resize_image")]
    #[case("media", "")]
    #[tokio::test]
    async fn empty_fields_are_argument_errors(#[case] namespace: &str, #[case] task_type: &str) {
        let f = fixture().await;
        let err = f
            .service
            .register_task(RegisterTask::new(namespace, task_type))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn malformed_and_unknown_ids() {
        let f = fixture().await;
        assert_eq!(
            f.service.get_task("not-an-id").await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        let unknown = TaskId::from_ulid(ulid::Ulid::new()).to_string();
        assert!(matches!(
            f.service.get_task(&unknown).await,
            Err(ConductorError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn abort_only_from_inited_or_dispatched() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        let aborted = f.service.abort_task(&id.to_string()).await.unwrap();
        assert_eq!(aborted.state, TaskState::Aborted);

        let err = f.service.abort_task(&id.to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let id = register(&f, 0).await;
        run(&f, id).await;
        let err = f.service.abort_task(&id.to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn accept_requires_dispatched() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        let err = f.service.accept_task(&id.to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn failure_with_budget_goes_to_pending_retry() {
        let f = fixture().await;
        let id = register(&f, 1).await;

        run(&f, id).await;
        let task = f
            .service
            .complete_task(&id.to_string(), false, b"oops".to_vec(), "decoder crashed")
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::PendingRetry);
        assert_eq!(task.error_msg, "decoder crashed");
        assert!(task.state.is_pending());

        // Second failure exhausts the single retry.
        run(&f, id).await;
        let task = f
            .service
            .complete_task(&id.to_string(), false, Vec::new(), "decoder crashed again")
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Failure);
        assert!(task.state.is_terminal());

        let states: Vec<TaskState> = f
            .service
            .task_history(&id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.state)
            .collect();
        assert_eq!(
            states,
            vec![
                TaskState::Inited,
                TaskState::Dispatched,
                TaskState::Running,
                TaskState::Failure,
                TaskState::PendingRetry,
                TaskState::Dispatched,
                TaskState::Running,
                TaskState::Failure,
            ]
        );
    }

    #[tokio::test]
    async fn no_retry_budget_fails_immediately() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        run(&f, id).await;
        let task = f
            .service
            .complete_task(&id.to_string(), false, Vec::new(), "bad input")
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Failure);
    }

    #[tokio::test]
    async fn complete_requires_running() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        let err = f
            .service
            .complete_task(&id.to_string(), true, Vec::new(), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn stale_transition_is_a_conflict() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        let stale = f.store.get_task(id).await.unwrap();

        f.service.abort_task(&id.to_string()).await.unwrap();

        let err = f
            .service
            .transition(stale, StateChange::to(TaskState::Dispatched))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn expired_task_cannot_be_accepted_or_completed() {
        let f = fixture().await;
        let req = RegisterTask {
            expire_time: f.clock.now_ms() + 60_000,
            ..RegisterTask::new("media", "resize_image")
        };
        let id = f.service.register_task(req).await.unwrap();
        let running = run(&f, id).await;

        f.clock.advance(chrono::Duration::seconds(61));
        assert!(f.service.expire_task(&running).await.unwrap());

        // A worker holding the pre-expiry row loses the swap.
        let err = f
            .service
            .transition(running, StateChange::to(TaskState::Success))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // A fresh call sees the terminal state.
        let err = f
            .service
            .complete_task(&id.to_string(), true, Vec::new(), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn expire_ignores_tasks_not_due() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        let task = f.store.get_task(id).await.unwrap();
        assert!(!f.service.expire_task(&task).await.unwrap());

        let req = RegisterTask {
            expire_time: f.clock.now_ms() + 1_000,
            ..RegisterTask::new("media", "resize_image")
        };
        let id = f.service.register_task(req).await.unwrap();
        let task = f.store.get_task(id).await.unwrap();
        assert!(!f.service.expire_task(&task).await.unwrap());
        f.clock.advance(chrono::Duration::seconds(2));
        assert!(f.service.expire_task(&task).await.unwrap());
        assert_eq!(
            f.store.get_task(id).await.unwrap().state,
            TaskState::Expired
        );
    }

    #[tokio::test]
    async fn idle_long_poll_returns_empty_after_timeout() {
        let f = fixture().await;
        // Paused only now: the pool's acquire timeout runs on tokio time too.
        tokio::time::pause();
        let started = Instant::now();
        let got = f
            .service
            .long_poll("w1", "resize_image", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_long_poll_is_not_an_idle_result() {
        let f = fixture().await;
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let poll = tokio::spawn({
            let service = f.service.clone();
            async move {
                service
                    .long_poll_until("w1", "resize_image", Duration::from_secs(30), async {
                        let _ = cancel_rx.await;
                    })
                    .await
            }
        });
        while f.service.matcher().total_waiting_count() == 0 {
            tokio::task::yield_now().await;
        }

        cancel_tx.send(()).unwrap();
        let err = poll.await.unwrap().unwrap_err();
        assert!(matches!(err, ConductorError::Cancelled));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(f.service.matcher().total_waiting_count(), 0);
    }

    #[tokio::test]
    async fn long_poll_skips_a_stale_handoff() {
        let f = fixture().await;
        let id = register(&f, 0).await;
        let stale = f.store.get_task(id).await.unwrap();
        f.service.abort_task(&id.to_string()).await.unwrap();

        let poll = tokio::spawn({
            let service = f.service.clone();
            async move {
                service
                    .long_poll("w1", "resize_image", Duration::from_millis(200))
                    .await
            }
        });
        let t = TaskType::new("resize_image");
        while f.service.matcher().waiting_count(&t) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(f.service.matcher().dispatch_task(stale));
        assert!(poll.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn end_to_end_success_fires_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackPayload>();
        let app = Router::new()
            .route(
                "/done",
                post(
                    |State(tx): State<mpsc::UnboundedSender<CallbackPayload>>,
                     Json(payload): Json<CallbackPayload>| async move {
                        let _ = tx.send(payload);
                        axum::http::StatusCode::OK
                    },
                ),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/done", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let f = fixture().await;
        let req = RegisterTask {
            callback_url: url,
            max_retry_cnt: 3,
            expire_time: f.clock.now_ms() + 60_000,
            ..RegisterTask::new("media", "resize_image")
        };
        let id = f.service.register_task(req).await.unwrap();
        assert_eq!(
            f.service.get_task(&id.to_string()).await.unwrap().state,
            TaskState::Inited
        );

        let running = run(&f, id).await;
        assert_eq!(running.state, TaskState::Running);

        let done = f
            .service
            .complete_task(&id.to_string(), true, b"thumb".to_vec(), "")
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Success);

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.task_id, id.to_string());
        assert_eq!(payload.state, TaskState::Success);
        assert_eq!(
            serde_json::to_value(&payload).unwrap()["state"],
            "success"
        );
    }
}
