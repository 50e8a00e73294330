use chrono::{DateTime, Utc};
use onio_core::{Task, TaskKind, TaskState};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle record of one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub agent_id: String,
    pub platform: String,
    pub conversation_id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Cumulative outcome counters for one task kind. Survive record cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStats {
    pub runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub total_execution_ms: u64,
}

impl KindStats {
    /// Share of executed tasks that completed. Rejections are not executions.
    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.completed as f64 / self.runs as f64
        }
    }

    pub fn avg_execution_ms(&self) -> u64 {
        if self.runs == 0 {
            0
        } else {
            self.total_execution_ms / self.runs
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub rejected: usize,
}

impl LedgerSummary {
    pub fn total(&self) -> usize {
        self.active + self.completed + self.failed + self.timed_out + self.rejected
    }
}

#[derive(Default)]
struct LedgerInner {
    records: HashMap<String, TaskRecord>,
    stats: HashMap<TaskKind, KindStats>,
}

/// Thread-safe history of dispatched tasks.
#[derive(Clone, Default)]
pub struct TaskLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_admitted(&self, task: &Task) {
        let record = TaskRecord {
            id: task.id.clone(),
            kind: task.kind,
            agent_id: task.agent_id.clone(),
            platform: task.event.platform.clone(),
            conversation_id: task.event.conversation_id.clone(),
            state: TaskState::Queued,
            attempts: 0,
            created_at: task.submitted_at,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let mut inner = self.inner.lock().await;
        inner.records.insert(task.id.clone(), record);
    }

    pub async fn set_executing(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(r) = inner.records.get_mut(task_id) {
            r.state = TaskState::Executing;
            r.started_at = Some(Utc::now());
        }
    }

    /// Record the terminal outcome. Unknown ids are ignored.
    pub async fn set_finished(&self, task_id: &str, state: TaskState, attempts: u32, error: Option<String>) {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(task_id) else {
            return;
        };
        let now = Utc::now();
        record.state = state;
        record.attempts = attempts;
        record.completed_at = Some(now);
        record.error = error;
        let kind = record.kind;
        let execution_ms = record
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);

        let stats = inner.stats.entry(kind).or_default();
        match state {
            TaskState::Completed => stats.completed += 1,
            TaskState::Failed => stats.failed += 1,
            TaskState::TimedOut => stats.timed_out += 1,
            TaskState::Rejected => stats.rejected += 1,
            _ => {}
        }
        if let Some(ms) = execution_ms {
            stats.runs += 1;
            stats.total_execution_ms += ms;
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.lock().await.records.get(task_id).cloned()
    }

    /// Records newest first, optionally filtered by state.
    pub async fn list(&self, state: Option<TaskState>) -> Vec<TaskRecord> {
        let inner = self.inner.lock().await;
        let mut out: Vec<TaskRecord> = inner
            .records
            .values()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub async fn stats(&self, kind: TaskKind) -> KindStats {
        self.inner
            .lock()
            .await
            .stats
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    pub async fn all_stats(&self) -> HashMap<TaskKind, KindStats> {
        self.inner.lock().await.stats.clone()
    }

    pub async fn summary(&self) -> LedgerSummary {
        let inner = self.inner.lock().await;
        let mut s = LedgerSummary::default();
        for r in inner.records.values() {
            match r.state {
                TaskState::Completed => s.completed += 1,
                TaskState::Failed => s.failed += 1,
                TaskState::TimedOut => s.timed_out += 1,
                TaskState::Rejected => s.rejected += 1,
                _ => s.active += 1,
            }
        }
        s
    }

    /// Remove terminal records finished more than `max_age` ago. Returns how many were removed.
    pub async fn cleanup(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut inner = self.inner.lock().await;
        let before = inner.records.len();
        inner.records.retain(|_, r| {
            if r.state.is_terminal() {
                r.completed_at.map_or(true, |c| c > cutoff)
            } else {
                true
            }
        });
        let removed = before - inner.records.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up old task records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onio_core::InboundEvent;
    use std::time::Duration;

    fn task(kind: TaskKind) -> Task {
        Task::new(
            kind,
            "a1",
            InboundEvent::new("test", "c", "u", "x"),
            None,
            String::new(),
            Duration::from_secs(10),
            1,
        )
    }

    #[tokio::test]
    async fn test_lifecycle_and_stats() {
        let ledger = TaskLedger::new();
        let ok = task(TaskKind::Joke);
        let bad = task(TaskKind::Joke);
        let never_ran = task(TaskKind::Joke);

        for t in [&ok, &bad, &never_ran] {
            ledger.record_admitted(t).await;
        }
        ledger.set_executing(&ok.id).await;
        ledger.set_executing(&bad.id).await;
        assert_eq!(ledger.get(&ok.id).await.unwrap().state, TaskState::Executing);

        ledger.set_finished(&ok.id, TaskState::Completed, 1, None).await;
        ledger
            .set_finished(&bad.id, TaskState::Failed, 4, Some("generator down".into()))
            .await;
        ledger.set_finished(&never_ran.id, TaskState::TimedOut, 0, None).await;

        let stats = ledger.stats(TaskKind::Joke).await;
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(ledger.get(&bad.id).await.unwrap().attempts, 4);

        let summary = ledger.summary().await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(ledger.list(Some(TaskState::Failed)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_active_and_stats() {
        let ledger = TaskLedger::new();
        let done = task(TaskKind::Help);
        let active = task(TaskKind::Help);
        ledger.record_admitted(&done).await;
        ledger.record_admitted(&active).await;
        ledger.set_executing(&done.id).await;
        ledger.set_finished(&done.id, TaskState::Completed, 1, None).await;

        assert_eq!(ledger.cleanup(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ledger.cleanup(Duration::ZERO).await, 1);
        assert!(ledger.get(&done.id).await.is_none());
        assert!(ledger.get(&active.id).await.is_some());
        assert_eq!(ledger.stats(TaskKind::Help).await.completed, 1);
    }
}
