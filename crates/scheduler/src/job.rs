use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
    /// Due, but a dependency has not succeeded yet.
    Waiting,
}

/// Run history of one job.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub runs: u32,
    pub successes: u32,
    pub total_execution_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobState {
    pub fn record(&mut self, success: bool, execution_ms: u64, error: Option<String>, at_ms: i64) {
        self.runs += 1;
        if success {
            self.successes += 1;
        }
        self.total_execution_ms += execution_ms;
        self.last_run_at_ms = Some(at_ms);
        self.last_status = Some(if success { JobStatus::Ok } else { JobStatus::Error });
        self.last_error = error;
    }

    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.successes as f64 / self.runs as f64
        }
    }

    pub fn avg_execution_ms(&self) -> u64 {
        if self.runs == 0 {
            0
        } else {
            self.total_execution_ms / self.runs as u64
        }
    }
}

/// Point-in-time view of a job for `status` output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub name: String,
    pub agent: String,
    pub enabled: bool,
    pub running: bool,
    pub state: JobState,
    pub success_rate: f64,
    pub avg_execution_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_accounting() {
        let mut state = JobState::default();
        assert_eq!(state.success_rate(), 0.0);
        state.record(true, 100, None, 1);
        state.record(false, 300, Some("boom".to_string()), 2);
        assert_eq!(state.runs, 2);
        assert_eq!(state.successes, 1);
        assert_eq!(state.success_rate(), 0.5);
        assert_eq!(state.avg_execution_ms(), 200);
        assert_eq!(state.last_status, Some(JobStatus::Error));
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert_eq!(state.last_run_at_ms, Some(2));
    }
}
