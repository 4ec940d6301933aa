//! WorkerMatcher - long-poll rendezvous between waiting workers and ready
//! tasks.
//!
//! Pure in-memory: nothing here touches storage. A task that finds no
//! waiting worker is simply not delivered; its durable state is unchanged
//! and the next scan pass offers it again.
//!
//! # Structure
//! - one FIFO per task type, all behind a single mutex
//! - each FIFO is an index-linked arena, so a waiter removes itself in O(1)
//!   through a `(slot, generation)` handle that never leaves this module
//! - each waiter owns a single-slot `oneshot` handoff and a `done` flag that
//!   is raised before it leaves, so a dispatch racing with a timeout skips it

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::domain::{Task, TaskType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("long poll cancelled")]
    Cancelled,
}

struct Waiter {
    worker_id: String,
    handoff: oneshot::Sender<Task>,
    done: Arc<AtomicBool>,
}

impl Waiter {
    fn is_live(&self) -> bool {
        !self.done.load(Ordering::Acquire) && !self.handoff.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handle {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    waiter: Option<Waiter>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO of waiters with O(1) push, pop and removal by handle.
#[derive(Default)]
struct WaitQueue {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl WaitQueue {
    fn push_back(&mut self, waiter: Waiter) -> Handle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    waiter: None,
                    prev: None,
                    next: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.waiter = Some(waiter);
        slot.prev = self.tail;
        slot.next = None;
        let generation = slot.generation;

        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        Handle { index, generation }
    }

    fn pop_front(&mut self) -> Option<Waiter> {
        let index = self.head?;
        self.unlink(index)
    }

    /// Stale handles (already popped or removed) are a no-op.
    fn remove(&mut self, handle: Handle) -> Option<Waiter> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation || slot.waiter.is_none() {
            return None;
        }
        self.unlink(handle.index)
    }

    fn unlink(&mut self, index: usize) -> Option<Waiter> {
        let (prev, next) = {
            let slot = &self.slots[index];
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }

        let slot = &mut self.slots[index];
        let waiter = slot.waiter.take();
        slot.prev = None;
        slot.next = None;
        slot.generation += 1;
        self.free.push(index);
        self.len -= 1;
        waiter
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Process-wide registry of workers blocked in a long poll.
#[derive(Default)]
pub struct WorkerMatcher {
    queues: Mutex<HashMap<TaskType, WaitQueue>>,
}

impl WorkerMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a task of `task_type` is handed over or `timeout`
    /// elapses. Timing out is the ordinary idle outcome: `Ok(None)`.
    pub async fn wait_for_task(
        &self,
        worker_id: &str,
        task_type: &TaskType,
        timeout: Duration,
    ) -> Result<Option<Task>, MatchError> {
        self.wait_for_task_until(worker_id, task_type, timeout, std::future::pending())
            .await
    }

    /// Like `wait_for_task`, but also gives up with `MatchError::Cancelled`
    /// once `cancelled` resolves.
    ///
    /// Dropping the returned future is equivalent to cancelling it: the
    /// registration is removed either way.
    pub async fn wait_for_task_until<F>(
        &self,
        worker_id: &str,
        task_type: &TaskType,
        timeout: Duration,
        cancelled: F,
    ) -> Result<Option<Task>, MatchError>
    where
        F: Future<Output = ()>,
    {
        let (handoff, mut rx) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));
        let handle = self.register(
            task_type,
            Waiter {
                worker_id: worker_id.to_string(),
                handoff,
                done: done.clone(),
            },
        );
        let guard = Registration {
            matcher: self,
            task_type: task_type.clone(),
            handle,
            done,
        };
        trace!(worker_id, %task_type, "worker waiting");

        tokio::pin!(cancelled);
        let outcome = tokio::select! {
            biased;
            delivered = &mut rx => return Ok(delivered.ok()),
            _ = tokio::time::sleep(timeout) => Ok(None),
            _ = &mut cancelled => Err(MatchError::Cancelled),
        };
        drop(guard);

        // A dispatch may have completed the handoff just before the guard
        // raised `done`.
        if let Ok(task) = rx.try_recv() {
            if outcome.is_ok() {
                return Ok(Some(task));
            }
            debug!(worker_id, task_id = %task.id, "task handed to a cancelled poll; left for rescan");
        }
        outcome
    }

    /// Hands `task` to the longest-waiting live worker of its type.
    ///
    /// Returns `false` when nobody is waiting; the task is then left for a
    /// later attempt.
    pub fn dispatch_task(&self, task: Task) -> bool {
        let task_type = task.task_type.clone();
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(&task_type) else {
            return false;
        };

        let mut task = task;
        let delivered = loop {
            let Some(waiter) = queue.pop_front() else {
                break false;
            };
            if !waiter.is_live() {
                trace!(worker_id = %waiter.worker_id, "skipping departed waiter");
                continue;
            }
            let worker_id = waiter.worker_id;
            match waiter.handoff.send(task) {
                Ok(()) => {
                    debug!(%worker_id, %task_type, "task handed to worker");
                    break true;
                }
                Err(returned) => task = returned,
            }
        };

        if queue.len() == 0 {
            queues.remove(&task_type);
        }
        delivered
    }

    pub fn waiting_count(&self, task_type: &TaskType) -> usize {
        self.queues.lock().get(task_type).map_or(0, WaitQueue::len)
    }

    pub fn total_waiting_count(&self) -> usize {
        self.queues.lock().values().map(WaitQueue::len).sum()
    }

    fn register(&self, task_type: &TaskType, waiter: Waiter) -> Handle {
        self.queues
            .lock()
            .entry(task_type.clone())
            .or_default()
            .push_back(waiter)
    }

    /// Idempotent: `false` when the handle was already gone.
    fn remove(&self, task_type: &TaskType, handle: Handle) -> bool {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(task_type) else {
            return false;
        };
        let removed = queue.remove(handle).is_some();
        if queue.len() == 0 {
            queues.remove(task_type);
        }
        removed
    }
}

/// Deregisters on drop, whichever way the poll ends.
struct Registration<'a> {
    matcher: &'a WorkerMatcher,
    task_type: TaskType,
    handle: Handle,
    done: Arc<AtomicBool>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        self.matcher.remove(&self.task_type, self.handle);
    }
}
