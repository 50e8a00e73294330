use chrono::Utc;
use onio_core::config::{DeliveryTarget, JobConfig};
use onio_core::{ConnectorAdapter, Error, InboundEvent, Response, Result};
use onio_dispatch::Dispatcher;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::{JobReport, JobState, JobStatus};

/// Platform name stamped on events produced by jobs.
pub const SCHEDULER_PLATFORM: &str = "scheduler";

const IDLE_WAKE: Duration = Duration::from_secs(3600);

struct JobEntry {
    config: JobConfig,
    interval: Duration,
    state: JobState,
    next_due: Option<Instant>,
    running: bool,
}

/// Runs configured jobs on their intervals by submitting synthetic events to
/// the dispatcher.
pub struct JobScheduler {
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<Vec<JobEntry>>,
    connectors: HashMap<String, Arc<dyn ConnectorAdapter>>,
    wake: Notify,
}

impl JobScheduler {
    /// Fails on unknown or cyclic dependencies, since such jobs could never run.
    pub fn new(jobs: Vec<JobConfig>, default_interval: Duration, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        check_dependencies(&jobs)?;
        let entries = jobs
            .into_iter()
            .map(|config| JobEntry {
                interval: config
                    .interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_interval),
                config,
                state: JobState::default(),
                next_due: None,
                running: false,
            })
            .collect();
        Ok(Self {
            dispatcher,
            jobs: Mutex::new(entries),
            connectors: HashMap::new(),
            wake: Notify::new(),
        })
    }

    /// Register a connector that job responses can be delivered to.
    pub fn with_connector(mut self, connector: Arc<dyn ConnectorAdapter>) -> Self {
        self.connectors.insert(connector.platform().to_string(), connector);
        self
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> Vec<JobReport> {
        let now = Instant::now();
        let now_ms = Utc::now().timestamp_millis();
        self.lock_jobs()
            .iter()
            .map(|job| JobReport {
                name: job.config.name.clone(),
                agent: job.config.agent.clone(),
                enabled: job.config.enabled,
                running: job.running,
                success_rate: job.state.success_rate(),
                avg_execution_ms: job.state.avg_execution_ms(),
                state: job.state.clone(),
                next_run_at_ms: job
                    .next_due
                    .map(|due| now_ms + due.saturating_duration_since(now).as_millis() as i64),
            })
            .collect()
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let start = Instant::now();
        let enabled = {
            let mut jobs = self.lock_jobs();
            for job in jobs.iter_mut().filter(|j| j.config.enabled) {
                job.next_due = Some(start + Duration::from_millis(job.config.start_delay_ms));
            }
            jobs.iter().filter(|j| j.config.enabled).count()
        };
        info!(jobs = enabled, "Scheduler started");

        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (due, next_wake, active) = self.collect_due(Instant::now());
            for config in due {
                let this = self.clone();
                tokio::spawn(async move { this.run_job(config).await });
            }
            if !active {
                info!("All scheduled jobs finished");
                break;
            }

            let deadline = next_wake.unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Mark due jobs as running. Returns them, the earliest future due time,
    /// and whether any job can still run.
    fn collect_due(&self, now: Instant) -> (Vec<JobConfig>, Option<Instant>, bool) {
        let mut jobs = self.lock_jobs();
        let succeeded: HashSet<String> = jobs
            .iter()
            .filter(|j| j.state.successes > 0)
            .map(|j| j.config.name.clone())
            .collect();

        let mut due = Vec::new();
        let mut next_wake: Option<Instant> = None;
        let mut active = false;

        for job in jobs.iter_mut() {
            if job.running {
                active = true;
                continue;
            }
            let Some(due_at) = job.next_due else {
                continue;
            };
            active = true;
            if due_at > now {
                next_wake = Some(next_wake.map_or(due_at, |w| w.min(due_at)));
                continue;
            }
            // Stays due; re-checked whenever another job finishes.
            if !job.config.depends_on.iter().all(|d| succeeded.contains(d)) {
                if job.state.last_status != Some(JobStatus::Waiting) {
                    debug!(job = %job.config.name, depends_on = ?job.config.depends_on, "Job waiting for dependencies");
                    job.state.last_status = Some(JobStatus::Waiting);
                }
                continue;
            }

            job.running = true;
            let last_run = job.config.max_runs.map_or(false, |max| job.state.runs + 1 >= max);
            job.next_due = if last_run { None } else { Some(now + job.interval) };
            due.push(job.config.clone());
        }
        (due, next_wake, active)
    }

    async fn run_job(&self, config: JobConfig) {
        debug!(job = %config.name, agent = %config.agent, "Running scheduled job");
        let started = Instant::now();
        let event = InboundEvent::new(
            SCHEDULER_PLATFORM,
            &format!("job:{}", config.name),
            SCHEDULER_PLATFORM,
            &config.text,
        )
        .with_metadata(serde_json::json!({
            "agentId": config.agent,
            "job": config.name,
        }));

        let response = self.dispatcher.submit(event).await;
        let execution_ms = started.elapsed().as_millis() as u64;
        let error = response.error.as_ref().map(|e| e.message.clone());

        if response.success {
            info!(job = %config.name, execution_ms, "Scheduled job completed");
        } else {
            warn!(job = %config.name, state = %response.state, error = ?error, "Scheduled job failed");
        }

        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.iter_mut().find(|j| j.config.name == config.name) {
                job.running = false;
                job.state
                    .record(response.success, execution_ms, error, Utc::now().timestamp_millis());
            }
        }

        if response.success {
            if let Some(target) = &config.deliver_to {
                self.deliver(&config.name, target, &response).await;
            }
        }
        self.wake.notify_one();
    }

    async fn deliver(&self, job: &str, target: &DeliveryTarget, response: &Response) {
        let Some(connector) = self.connectors.get(&target.platform) else {
            warn!(job = %job, platform = %target.platform, "No connector for job delivery");
            return;
        };
        if let Err(e) = connector.send(&target.conversation_id, response).await {
            error!(job = %job, platform = %target.platform, error = %e, "Failed to deliver job result");
        }
    }
}

fn check_dependencies(jobs: &[JobConfig]) -> Result<()> {
    let by_name: HashMap<&str, &JobConfig> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();
    for job in jobs {
        for dep in &job.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(Error::Config(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, dep
                )));
            }
        }
    }

    // Depth-first search with an explicit in-progress set.
    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a JobConfig>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name) {
            return Err(Error::Config(format!("job dependency cycle through '{}'", name)));
        }
        if let Some(&job) = by_name.get(name) {
            for dep in &job.depends_on {
                visit(dep.as_str(), by_name, visiting, done)?;
            }
        }
        visiting.remove(name);
        done.insert(name);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for job in jobs {
        visit(job.name.as_str(), &by_name, &mut visiting, &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use onio_core::config::DispatchConfig;
    use onio_core::{AgentDefinition, TaskKind};
    use onio_dispatch::AgentRegistry;

    fn job(name: &str, text: &str) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            agent: "onio".to_string(),
            text: text.to_string(),
            interval_ms: Some(1_000),
            start_delay_ms: 0,
            max_runs: None,
            depends_on: Vec::new(),
            deliver_to: None,
            enabled: true,
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = AgentRegistry::new(
            vec![AgentDefinition {
                id: "onio".to_string(),
                description: None,
                personality: serde_json::json!({"name": "Onio"}),
                tasks: TaskKind::ALL.to_vec(),
                max_concurrency: 5,
            }],
            10,
        )
        .unwrap();
        let d = Dispatcher::builder(DispatchConfig::default(), Arc::new(registry)).build();
        d.start();
        d
    }

    fn report<'a>(reports: &'a [JobReport], name: &str) -> &'a JobReport {
        reports.iter().find(|r| r.name == name).unwrap()
    }

    #[test]
    fn test_dependency_checks() {
        let mut a = job("a", "/help");
        let mut b = job("b", "/help");
        b.depends_on = vec!["a".to_string()];
        assert!(check_dependencies(&[a.clone(), b.clone()]).is_ok());

        a.depends_on = vec!["b".to_string()];
        let err = check_dependencies(&[a, b.clone()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        b.depends_on = vec!["ghost".to_string()];
        assert!(check_dependencies(&[b]).unwrap_err().to_string().contains("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_runs_stops_job() {
        let mut calc = job("calc", "/calc 1 + 1");
        calc.max_runs = Some(3);
        let mut disabled = job("off", "/help");
        disabled.enabled = false;
        let scheduler = Arc::new(JobScheduler::new(vec![calc, disabled], Duration::from_secs(30), dispatcher()).unwrap());

        // Returns once every enabled job has used up its runs
        scheduler.clone().run(CancellationToken::new()).await;

        let reports = scheduler.status();
        let calc = report(&reports, "calc");
        assert_eq!(calc.state.runs, 3);
        assert_eq!(calc.success_rate, 1.0);
        assert!(calc.next_run_at_ms.is_none());
        assert_eq!(report(&reports, "off").state.runs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_waits_for_first_success() {
        let mut setup = job("setup", "/help");
        setup.start_delay_ms = 500;
        setup.max_runs = Some(1);
        let mut report_job = job("report", "/status");
        report_job.depends_on = vec!["setup".to_string()];
        report_job.max_runs = Some(1);
        let scheduler = Arc::new(
            JobScheduler::new(vec![setup, report_job], Duration::from_secs(30), dispatcher()).unwrap(),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reports = scheduler.status();
        assert_eq!(report(&reports, "report").state.runs, 0);
        assert_eq!(report(&reports, "report").state.last_status, Some(JobStatus::Waiting));

        handle.await.unwrap();
        let reports = scheduler.status();
        assert_eq!(report(&reports, "setup").state.runs, 1);
        assert_eq!(report(&reports, "report").state.runs, 1);
        assert_eq!(report(&reports, "report").state.last_status, Some(JobStatus::Ok));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_blocks_dependents() {
        let mut broken = job("broken", "/calc 1 / 0");
        broken.max_runs = Some(2);
        let mut after = job("after", "/help");
        after.depends_on = vec!["broken".to_string()];
        let scheduler = Arc::new(
            JobScheduler::new(vec![broken, after], Duration::from_secs(30), dispatcher()).unwrap(),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let reports = scheduler.status();
        let broken = report(&reports, "broken");
        assert_eq!(broken.state.runs, 2);
        assert_eq!(broken.success_rate, 0.0);
        assert_eq!(broken.state.last_status, Some(JobStatus::Error));
        assert_eq!(report(&reports, "after").state.runs, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ConnectorAdapter for Recorder {
        fn platform(&self) -> &str {
            "mock"
        }

        fn receive(self: Arc<Self>) -> BoxStream<'static, InboundEvent> {
            Box::pin(futures::stream::empty())
        }

        async fn send(&self, conversation_id: &str, response: &Response) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), response.text.clone()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_response_to_connector() {
        let recorder = Arc::new(Recorder { sent: Mutex::new(Vec::new()) });
        let mut calc = job("calc", "/calc 6 * 7");
        calc.max_runs = Some(1);
        calc.deliver_to = Some(DeliveryTarget {
            platform: "mock".to_string(),
            conversation_id: "room-9".to_string(),
        });
        let scheduler = Arc::new(
            JobScheduler::new(vec![calc], Duration::from_secs(30), dispatcher())
                .unwrap()
                .with_connector(recorder.clone()),
        );
        scheduler.clone().run(CancellationToken::new()).await;

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("room-9".to_string(), "6 * 7 = 42".to_string())]);
    }
}
