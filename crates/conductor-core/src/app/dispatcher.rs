//! Dispatcher - pending タスクをストレージから待機中の worker へ運ぶ
//!
//! 3 つのループが 1 本の有界 handoff channel を共有する:
//! - **scan**: 所有 shard の `inited` / `pending_retry` タスクを keyset で
//!   ページングし、channel に積む。channel が満杯なら scan が止まる（捨てない）。
//! - **dispatch**: channel から取り出して matcher に渡す。待機者のいない
//!   タスクは次の周回に回す。
//! - **expiry**: 期限切れの非終端タスクを定期的に expire する。
//!
//! 同じタスクが複数回渡されることはあるが、`long_poll` の確保時の version
//! チェックにより受け取る worker は 1 つだけ。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::matcher::WorkerMatcher;
use super::task::TaskService;
use crate::domain::{ConductorError, Task, TaskId, TaskState};
use crate::ports::{Clock, ShardOwnership, TaskStore};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub handoff_capacity: usize,
    pub scan_batch_size: u32,
    /// Pause after a pass that reached the end of both pending keyspaces.
    pub scan_interval: Duration,
    pub expire_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handoff_capacity: 10_000,
            scan_batch_size: 100,
            scan_interval: Duration::from_millis(500),
            expire_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub waiting_workers: usize,
    /// Tasks sitting in the handoff channel.
    pub queue_depth: usize,
    pub scanned: u64,
    pub handed_off: u64,
    pub undelivered: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    scanned: AtomicU64,
    handed_off: AtomicU64,
    undelivered: AtomicU64,
    expired: AtomicU64,
}

pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    service: Arc<TaskService>,
    matcher: Arc<WorkerMatcher>,
    shards: Arc<dyn ShardOwnership>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,

    /// Last id seen per pending state; `None` = start of keyspace.
    inited_cursor: Mutex<Option<TaskId>>,
    retry_cursor: Mutex<Option<TaskId>>,

    handoff_tx: mpsc::Sender<Task>,
    handoff_rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    counters: Counters,

    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        service: Arc<TaskService>,
        shards: Arc<dyn ShardOwnership>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        let (handoff_tx, handoff_rx) = mpsc::channel(config.handoff_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            matcher: service.matcher().clone(),
            tasks,
            service,
            shards,
            clock,
            config,
            inited_cursor: Mutex::new(None),
            retry_cursor: Mutex::new(None),
            handoff_tx,
            handoff_rx: tokio::sync::Mutex::new(handoff_rx),
            counters: Counters::default(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 3 つのループを起動する。2 回目以降の呼び出しは何もしない
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        handles.push(tokio::spawn(self.clone().scan_loop(self.shutdown_tx.subscribe())));
        handles.push(tokio::spawn(self.clone().dispatch_loop(self.shutdown_tx.subscribe())));
        handles.push(tokio::spawn(self.clone().expire_loop(self.shutdown_tx.subscribe())));
        info!(
            capacity = self.config.handoff_capacity,
            batch = self.config.scan_batch_size,
            "dispatcher started"
        );
    }

    /// 全ループに停止を通知し、終了を待つ
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher loop ended abnormally");
            }
        }
        info!("dispatcher stopped");
    }

    /// One batch from each pending cursor into the handoff channel. Returns
    /// the number of tasks queued.
    ///
    /// Blocks while the channel is full.
    pub async fn scan_once(&self) -> Result<usize, ConductorError> {
        let mut queued = 0;
        for state in TaskState::PENDING {
            let after = *self.cursor(state).lock();
            let batch = self
                .tasks
                .scan_by_state(state, after, self.config.scan_batch_size)
                .await
                .map_err(|e| ConductorError::internal(format!("scan {state} tasks"), e))?;

            // 件数不足のページはキー空間の終端。次回は先頭から
            let next = if batch.len() < self.config.scan_batch_size as usize {
                None
            } else {
                batch.last().map(|t| t.id)
            };
            *self.cursor(state).lock() = next;
            self.counters
                .scanned
                .fetch_add(batch.len() as u64, Ordering::Relaxed);

            for task in batch {
                if !self.shards.owns_task_type(&task.task_type) {
                    continue;
                }
                trace!(task_id = %task.id, %state, "queueing pending task");
                if self.handoff_tx.send(task).await.is_err() {
                    return Ok(queued);
                }
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Offers everything currently queued to the matcher, without waiting.
    /// Returns how many were handed to a worker.
    ///
    /// While the dispatch loop runs it owns the queue, and this returns 0.
    pub fn dispatch_ready(&self) -> usize {
        let Ok(mut rx) = self.handoff_rx.try_lock() else {
            debug!("dispatch loop is running; nothing drained");
            return 0;
        };
        let mut handed = 0;
        while let Ok(task) = rx.try_recv() {
            if self.offer(task) {
                handed += 1;
            }
        }
        handed
    }

    /// One full expiry pass. Returns the number of tasks expired.
    pub async fn sweep_expired_once(&self) -> Result<usize, ConductorError> {
        let now = self.clock.now_ms();
        let limit = self.config.scan_batch_size;
        let mut after = None;
        let mut expired = 0;

        loop {
            let batch = self
                .tasks
                .scan_expired(now, after, limit)
                .await
                .map_err(|e| ConductorError::internal("scan expired tasks", e))?;

            for task in &batch {
                if !self.shards.owns_task_type(&task.task_type) {
                    continue;
                }
                match self.service.expire_task(task).await {
                    Ok(true) => expired += 1,
                    Ok(false) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(task_id = %task.id, error = %e, "task moved before it could expire");
                    }
                    Err(e) => warn!(task_id = %task.id, error = %e, "expiring task failed"),
                }
            }

            if batch.len() < limit as usize {
                break;
            }
            after = batch.last().map(|t| t.id);
        }

        self.counters
            .expired
            .fetch_add(expired as u64, Ordering::Relaxed);
        Ok(expired)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            waiting_workers: self.matcher.total_waiting_count(),
            queue_depth: self.handoff_tx.max_capacity() - self.handoff_tx.capacity(),
            scanned: self.counters.scanned.load(Ordering::Relaxed),
            handed_off: self.counters.handed_off.load(Ordering::Relaxed),
            undelivered: self.counters.undelivered.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    fn cursor(&self, state: TaskState) -> &Mutex<Option<TaskId>> {
        match state {
            TaskState::PendingRetry => &self.retry_cursor,
            _ => &self.inited_cursor,
        }
    }

    fn at_keyspace_start(&self) -> bool {
        self.inited_cursor.lock().is_none() && self.retry_cursor.lock().is_none()
    }

    fn offer(&self, task: Task) -> bool {
        let task_id = task.id;
        if self.matcher.dispatch_task(task) {
            self.counters.handed_off.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            debug!(%task_id, "no worker waiting, left for the next scan");
            self.counters.undelivered.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    async fn scan_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let pass = tokio::select! {
                _ = shutdown_rx.changed() => break,
                pass = self.scan_once() => pass,
            };
            let pause = match pass {
                Ok(_) if self.at_keyspace_start() => Some(self.config.scan_interval),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "pending scan failed");
                    Some(self.config.scan_interval)
                }
            };
            match pause {
                Some(pause) => tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                },
                None => tokio::task::yield_now().await,
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }
        debug!("scan loop stopped");
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut rx = self.handoff_rx.lock().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                task = rx.recv() => match task {
                    Some(task) => {
                        self.offer(task);
                    }
                    None => break,
                },
            }
        }
        debug!("dispatch loop stopped");
    }

    async fn expire_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.expire_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {}
            }
            match self.sweep_expired_once().await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "expiry sweep finished"),
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            }
        }
        debug!("expiry loop stopped");
    }
}
