use async_trait::async_trait;
use onio_core::config::DispatchConfig;
use onio_core::{DedupKey, Error, Result, Task};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

const LANES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub executing: usize,
    pub capacity: usize,
}

/// Holding area between admission and execution.
///
/// A de-dup key stays reserved from `enqueue` until `mark_done` (or `cancel`),
/// so at most one task per agent and conversation is queued or running.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Fails with `AlreadyInProgress`, `BacklogFull`, or `Cancelled` once closed.
    async fn enqueue(&self, task: Task) -> Result<()>;

    /// Wait for the next eligible task. `None` once closed and drained.
    async fn dequeue(&self) -> Option<Task>;

    /// Release the de-dup key and agent slot held by a dequeued task.
    async fn mark_done(&self, task: &Task);

    /// Remove a task that is still waiting. Returns false if it was not queued.
    async fn cancel(&self, task_id: &str) -> bool;

    async fn close(&self);

    async fn stats(&self) -> QueueStats;
}

struct Entry {
    task: Task,
    enqueued_cycle: u64,
    seq: u64,
}

struct Running {
    key: DedupKey,
    agent_id: String,
}

#[derive(Default)]
struct Inner {
    lanes: [VecDeque<Entry>; LANES],
    /// De-dup key -> owning task id, for queued and executing tasks.
    keys: HashMap<DedupKey, String>,
    running: HashMap<String, Running>,
    per_agent: HashMap<String, usize>,
    cycle: u64,
    seq: u64,
    closed: bool,
}

impl Inner {
    fn queued(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn eligible(&self, entry: &Entry) -> bool {
        let running = self.per_agent.get(&entry.task.agent_id).copied().unwrap_or(0);
        running < entry.task.max_concurrency
    }

    /// Oldest promoted entry first, then lanes in priority order, FIFO within a lane.
    fn select(&self, starvation_threshold: u64) -> Option<(usize, usize)> {
        if starvation_threshold > 0 {
            let mut best: Option<(usize, usize, u64)> = None;
            for (lane, entries) in self.lanes.iter().enumerate() {
                for (pos, entry) in entries.iter().enumerate() {
                    let waited = self.cycle - entry.enqueued_cycle;
                    if waited >= starvation_threshold
                        && self.eligible(entry)
                        && best.map_or(true, |(_, _, seq)| entry.seq < seq)
                    {
                        best = Some((lane, pos, entry.seq));
                    }
                }
            }
            if let Some((lane, pos, _)) = best {
                return Some((lane, pos));
            }
        }
        self.lanes.iter().enumerate().find_map(|(lane, entries)| {
            entries
                .iter()
                .position(|e| self.eligible(e))
                .map(|pos| (lane, pos))
        })
    }

    fn take(&mut self, starvation_threshold: u64) -> Option<Task> {
        let (lane, pos) = self.select(starvation_threshold)?;
        let entry = self.lanes[lane].remove(pos)?;
        self.cycle += 1;
        let task = entry.task;
        *self.per_agent.entry(task.agent_id.clone()).or_insert(0) += 1;
        self.running.insert(
            task.id.clone(),
            Running {
                key: task.dedup_key.clone(),
                agent_id: task.agent_id.clone(),
            },
        );
        Some(task)
    }

    fn release_key(&mut self, key: &DedupKey, task_id: &str) {
        if self.keys.get(key).map(String::as_str) == Some(task_id) {
            self.keys.remove(key);
        }
    }
}

/// In-process queue: three priority lanes behind one mutex, woken through `Notify`.
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    starvation_threshold: u64,
}

impl MemoryTaskQueue {
    pub fn new(capacity: usize, starvation_threshold: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
            starvation_threshold,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.backlog_capacity, config.starvation_threshold)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Cancelled("task queue is closed".to_string()));
            }
            if inner.keys.contains_key(&task.dedup_key) {
                return Err(Error::AlreadyInProgress(task.dedup_key.to_string()));
            }
            if inner.queued() >= self.capacity {
                return Err(Error::BacklogFull(format!("{} tasks waiting", self.capacity)));
            }
            let seq = inner.seq;
            inner.seq += 1;
            let enqueued_cycle = inner.cycle;
            inner.keys.insert(task.dedup_key.clone(), task.id.clone());
            debug!(task_id = %task.id, priority = ?task.priority, "Task queued");
            inner.lanes[task.priority.lane()].push_back(Entry {
                task,
                enqueued_cycle,
                seq,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(task) = inner.take(self.starvation_threshold) {
                    return Some(task);
                }
                if inner.closed && inner.queued() == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    async fn mark_done(&self, task: &Task) {
        {
            let mut inner = self.lock();
            let Some(running) = inner.running.remove(&task.id) else {
                return;
            };
            inner.release_key(&running.key, &task.id);
            if let Some(n) = inner.per_agent.get_mut(&running.agent_id) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    inner.per_agent.remove(&running.agent_id);
                }
            }
        }
        self.notify.notify_waiters();
    }

    async fn cancel(&self, task_id: &str) -> bool {
        let removed = {
            let mut inner = self.lock();
            let found = inner.lanes.iter().enumerate().find_map(|(lane, entries)| {
                entries
                    .iter()
                    .position(|e| e.task.id == task_id)
                    .map(|pos| (lane, pos))
            });
            match found.and_then(|(lane, pos)| inner.lanes[lane].remove(pos)) {
                Some(entry) => {
                    inner.release_key(&entry.task.dedup_key, task_id);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify.notify_waiters();
        }
        removed
    }

    async fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    async fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            queued: inner.queued(),
            executing: inner.running.len(),
            capacity: self.capacity,
        }
    }
}
