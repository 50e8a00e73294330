use chrono::Utc;
use onio_core::config::{Config, DispatchConfig, RateLimitKey, RoutingConfig};
use onio_core::{AgentDefinition, Error, InboundEvent, Response, Result, Task, TaskKind, TaskState};
use onio_providers::{OfflineGenerator, ResponseGenerator};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{DispatchStatus, HandlerContext, HandlerTable, TaskHandler};
use crate::ledger::TaskLedger;
use crate::queue::{MemoryTaskQueue, TaskQueue};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::registry::AgentRegistry;
use crate::retry::RetryPolicy;
use crate::router::Router;

/// Bookkeeping for an admitted task that has not produced its response yet.
/// Whoever removes the entry owns the right to respond.
struct InFlight {
    tx: oneshot::Sender<Response>,
    event: InboundEvent,
    /// Definition captured at admission; later reloads don't affect this task.
    agent: Arc<AgentDefinition>,
    deadline: Instant,
    cancel: CancellationToken,
    admitted_at: Instant,
    executing: bool,
}

enum Resolution {
    Completed(String),
    Failed(Error),
    TimedOut,
}

impl Resolution {
    fn state(&self) -> TaskState {
        match self {
            Resolution::Completed(_) => TaskState::Completed,
            Resolution::Failed(_) => TaskState::Failed,
            Resolution::TimedOut => TaskState::TimedOut,
        }
    }
}

/// Awaitable result of an admitted task.
pub struct TaskHandle {
    task_id: String,
    event: InboundEvent,
    deadline: Instant,
    rx: oneshot::Receiver<Response>,
    dispatcher: Arc<Dispatcher>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the response. A task still queued at its deadline is pulled
    /// from the queue and answered `TimedOut`.
    pub async fn wait(mut self) -> Response {
        tokio::select! {
            biased;
            res = &mut self.rx => return self.unwrap_response(res),
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
        self.dispatcher.expire_waiting(&self.task_id).await;
        let res = (&mut self.rx).await;
        self.unwrap_response(res)
    }

    fn unwrap_response(&self, res: std::result::Result<Response, oneshot::error::RecvError>) -> Response {
        res.unwrap_or_else(|_| {
            Response::failed(
                &self.event,
                Some(&self.task_id),
                TaskState::Failed,
                &Error::Cancelled("dispatcher dropped the task".to_string()),
            )
        })
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<AgentRegistry>,
    router: Router,
    limiter: RateLimiter,
    retry: RetryPolicy,
    queue: Arc<dyn TaskQueue>,
    handlers: HandlerTable,
    ledger: TaskLedger,
    generator_name: String,
    slots: Arc<Semaphore>,
    inflight: Mutex<HashMap<String, InFlight>>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        registry: Arc<AgentRegistry>,
        generator: Arc<dyn ResponseGenerator>,
        queue: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        Self::builder(config.dispatch.clone(), registry)
            .routing(config.routing.clone())
            .generator(generator)
            .queue(queue)
            .build()
    }

    pub fn builder(config: DispatchConfig, registry: Arc<AgentRegistry>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            routing: RoutingConfig::default(),
            registry,
            generator: None,
            queue: None,
            handlers: Vec::new(),
            ledger: None,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn in_flight(&self) -> usize {
        self.lock_inflight().len()
    }

    pub async fn status(&self) -> DispatchStatus {
        DispatchStatus {
            queue: self.queue.stats().await,
            ledger: self.ledger.summary().await,
            agents: self.registry.snapshot().len(),
            uptime: self.started_at.elapsed(),
            generator: self.generator_name.clone(),
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rate_key(&self, agent_id: &str, sender_id: &str) -> String {
        match self.config.rate_limit_key {
            RateLimitKey::Agent => agent_id.to_string(),
            RateLimitKey::Sender => format!("{}:{}", agent_id, sender_id),
        }
    }

    /// Spawn the scheduling and maintenance loops. The returned handle
    /// completes when the scheduling loop stops after `shutdown`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let maintenance = self.clone();
        tokio::spawn(async move { maintenance.maintenance_loop().await });
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.schedule_loop().await })
    }

    /// Admission: route, look up the agent, check the task kind and rate limit,
    /// then queue. Errors here mean the task never entered the queue.
    pub async fn enqueue(self: &Arc<Self>, event: InboundEvent) -> Result<TaskHandle> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled("dispatcher is shutting down".to_string()));
        }
        let snapshot = self.registry.snapshot();
        let route = self.router.route(&event, &snapshot)?;
        let agent = snapshot
            .get(&route.agent_id)
            .ok_or_else(|| Error::UnknownAgent(route.agent_id.clone()))?;
        if !agent.supports(route.kind) {
            return Err(Error::Validation(format!(
                "agent '{}' does not handle {} tasks",
                agent.id, route.kind
            )));
        }

        let key = self.rate_key(&agent.id, &event.sender_id);
        if !self.limiter.admit(&key) {
            let wait_secs = self
                .limiter
                .retry_after(&key)
                .map_or(1, |d| d.as_secs_f64().ceil() as u64);
            return Err(Error::RateLimited(format!("{} (retry in {}s)", key, wait_secs)));
        }

        let timeout = self.config.task_timeout();
        let mut task = Task::new(
            route.kind,
            &agent.id,
            event,
            route.command,
            route.args,
            timeout,
            agent.max_concurrency,
        );
        task.state = TaskState::Admitted;

        let now = Instant::now();
        let deadline = now + timeout;
        let (tx, rx) = oneshot::channel();
        let task_id = task.id.clone();
        let event = task.event.clone();
        self.lock_inflight().insert(
            task_id.clone(),
            InFlight {
                tx,
                event: event.clone(),
                agent: agent.clone(),
                deadline,
                cancel: self.shutdown.child_token(),
                admitted_at: now,
                executing: false,
            },
        );
        self.ledger.record_admitted(&task).await;

        let kind = task.kind;
        task.state = TaskState::Queued;
        if let Err(e) = self.queue.enqueue(task).await {
            self.lock_inflight().remove(&task_id);
            self.ledger
                .set_finished(&task_id, TaskState::Rejected, 0, Some(e.to_string()))
                .await;
            return Err(e);
        }
        debug!(task_id = %task_id, agent_id = %agent.id, kind = %kind, "Task admitted");

        Ok(TaskHandle {
            task_id,
            event,
            deadline,
            rx,
            dispatcher: self.clone(),
        })
    }

    /// Entry point for connectors: always yields exactly one response.
    pub async fn submit(self: &Arc<Self>, event: InboundEvent) -> Response {
        let original = event.clone();
        match self.enqueue(event).await {
            Ok(handle) => handle.wait().await,
            Err(e) => {
                info!(
                    event_id = %original.id,
                    platform = %original.platform,
                    code = e.code(),
                    error = %e,
                    "Event rejected"
                );
                Response::rejected(&original, &e)
            }
        }
    }

    /// Close the queue and answer every unfinished task with a cancellation.
    pub async fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "Dispatcher shutting down");
        self.shutdown.cancel();
        self.queue.close().await;
        let entries: Vec<(String, InFlight)> = self.lock_inflight().drain().collect();
        for (task_id, entry) in entries {
            if !entry.executing {
                self.queue.cancel(&task_id).await;
            }
            entry.cancel.cancel();
            let err = Error::Cancelled("dispatcher shutting down".to_string());
            self.emit(&task_id, entry, Resolution::Failed(err), 0).await;
        }
    }

    async fn schedule_loop(self: Arc<Self>) {
        info!(
            slots = self.config.max_concurrent_tasks,
            backlog = self.config.backlog_capacity,
            "Dispatcher started"
        );
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                task = self.queue.dequeue() => match task {
                    Some(t) => t,
                    None => break,
                },
            };
            let this = self.clone();
            tokio::spawn(async move { this.execute(task, permit).await });
        }
        info!("Dispatcher scheduling loop stopped");
    }

    async fn execute(self: Arc<Self>, mut task: Task, permit: OwnedSemaphorePermit) {
        let claimed = self.lock_inflight().get_mut(&task.id).map(|e| {
            e.executing = true;
            (e.cancel.clone(), e.deadline, e.agent.clone())
        });
        let Some((cancel, deadline, agent)) = claimed else {
            debug!(task_id = %task.id, "Dequeued task was already resolved");
            self.queue.mark_done(&task).await;
            return;
        };

        // The wall-clock deadline travels with the task; the instant covers paused clocks.
        if Instant::now() >= deadline || task.is_expired_at(Utc::now()) {
            task.state = TaskState::TimedOut;
            self.queue.mark_done(&task).await;
            drop(permit);
            self.resolve(&task.id, Resolution::TimedOut, 0).await;
            return;
        }

        let Some(handler) = self.handlers.get(task.kind) else {
            task.state = TaskState::Failed;
            self.queue.mark_done(&task).await;
            drop(permit);
            let err = Error::Validation(format!("no handler registered for {}", task.kind));
            self.resolve(&task.id, Resolution::Failed(err), 0).await;
            return;
        };

        task.state = TaskState::Executing;
        self.ledger.set_executing(&task.id).await;
        info!(task_id = %task.id, agent_id = %task.agent_id, kind = %task.kind, "Task executing");

        let status = if task.kind == TaskKind::Status {
            self.status().await
        } else {
            DispatchStatus::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let mut work = tokio::spawn(run_handler(
            handler,
            task.clone(),
            agent,
            status,
            self.retry,
            cancel.clone(),
            attempts.clone(),
        ));

        let resolution = tokio::select! {
            biased;
            joined = &mut work => match joined {
                Ok(Ok(text)) => Resolution::Completed(text),
                Ok(Err(e)) => Resolution::Failed(e),
                Err(e) => Resolution::Failed(Error::Other(format!("handler panicked: {}", e))),
            },
            _ = tokio::time::sleep_until(deadline) => {
                // The handler keeps running until it notices the cancellation.
                cancel.cancel();
                Resolution::TimedOut
            }
            _ = cancel.cancelled() => {
                Resolution::Failed(Error::Cancelled(format!("task {} cancelled", task.id)))
            }
        };

        task.state = resolution.state();
        self.queue.mark_done(&task).await;
        drop(permit);
        self.resolve(&task.id, resolution, attempts.load(Ordering::SeqCst)).await;
    }

    /// Time out a task that is admitted but not executing. Returns false if it
    /// already started or finished.
    async fn expire_waiting(&self, task_id: &str) -> bool {
        let entry = {
            let mut map = self.lock_inflight();
            if map.get(task_id).map_or(false, |e| !e.executing) {
                map.remove(task_id)
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        self.queue.cancel(task_id).await;
        entry.cancel.cancel();
        self.emit(task_id, entry, Resolution::TimedOut, 0).await;
        true
    }

    async fn resolve(&self, task_id: &str, resolution: Resolution, attempts: u32) -> bool {
        let entry = self.lock_inflight().remove(task_id);
        match entry {
            Some(entry) => {
                self.emit(task_id, entry, resolution, attempts).await;
                true
            }
            None => false,
        }
    }

    async fn emit(&self, task_id: &str, entry: InFlight, resolution: Resolution, attempts: u32) {
        let duration_ms = entry.admitted_at.elapsed().as_millis() as u64;
        let state = resolution.state();
        let (mut response, error) = match resolution {
            Resolution::Completed(text) => (
                Response::completed(&entry.event, task_id, &text),
                None,
            ),
            Resolution::Failed(e) => (
                Response::failed(&entry.event, Some(task_id), TaskState::Failed, &e),
                Some(e.to_string()),
            ),
            Resolution::TimedOut => {
                let e = Error::Timeout(format!(
                    "task {} exceeded {} ms",
                    task_id, self.config.task_timeout_ms
                ));
                (
                    Response::failed(&entry.event, Some(task_id), TaskState::TimedOut, &e),
                    Some(e.to_string()),
                )
            }
        };
        response.attempts = attempts;
        response.duration_ms = duration_ms;

        match &error {
            None => info!(task_id = %task_id, agent_id = %entry.agent.id, attempts, duration_ms, "Task completed"),
            Some(e) => warn!(task_id = %task_id, agent_id = %entry.agent.id, state = %state, attempts, error = %e, "Task did not complete"),
        }
        self.ledger.set_finished(task_id, state, attempts, error).await;
        // The caller may have stopped waiting.
        let _ = entry.tx.send(response);
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.task_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_maintenance().await;
        }
    }

    /// Prune idle rate-limit buckets and old ledger records, and time out
    /// queued tasks nobody is waiting on.
    pub async fn run_maintenance(&self) {
        let retention = self.config.agent_timeout();
        let pruned = self.limiter.prune_idle(retention);
        let cleaned = self.ledger.cleanup(retention).await;

        let now = Instant::now();
        let overdue: Vec<String> = self
            .lock_inflight()
            .iter()
            .filter(|(_, e)| !e.executing && now >= e.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired = 0;
        for task_id in overdue {
            if self.expire_waiting(&task_id).await {
                expired += 1;
            }
        }
        debug!(pruned_buckets = pruned, cleaned_records = cleaned, expired, "Maintenance tick");
    }
}

/// Runs the handler under the retry policy. Each attempt sees its own copy of
/// the task with `retry_count` set; `attempts` tracks the highest count started.
async fn run_handler(
    handler: Arc<dyn TaskHandler>,
    task: Task,
    agent: Arc<AgentDefinition>,
    status: DispatchStatus,
    retry: RetryPolicy,
    cancel: CancellationToken,
    attempts: Arc<AtomicU32>,
) -> Result<String> {
    let handler = handler.as_ref();
    let agent = agent.as_ref();
    let status = &status;
    let token = &cancel;
    retry
        .execute(&cancel, |retry_count| {
            let mut attempt = task.clone();
            attempt.retry_count = retry_count;
            attempts.fetch_max(retry_count + 1, Ordering::SeqCst);
            async move {
                handler
                    .handle(
                        HandlerContext {
                            task: &attempt,
                            agent,
                            status,
                        },
                        token,
                    )
                    .await
            }
        })
        .await
}

pub struct DispatcherBuilder {
    config: DispatchConfig,
    routing: RoutingConfig,
    registry: Arc<AgentRegistry>,
    generator: Option<Arc<dyn ResponseGenerator>>,
    queue: Option<Arc<dyn TaskQueue>>,
    handlers: Vec<(TaskKind, Arc<dyn TaskHandler>)>,
    ledger: Option<TaskLedger>,
}

impl DispatcherBuilder {
    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Replace the built-in handler for one task kind.
    pub fn handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    pub fn ledger(mut self, ledger: TaskLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Arc<Dispatcher> {
        let generator = self
            .generator
            .unwrap_or_else(|| Arc::new(OfflineGenerator::new()));
        let generator_name = generator.name().to_string();
        let mut handlers = HandlerTable::standard(generator);
        for (kind, handler) in self.handlers {
            handlers.register(kind, handler);
        }
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryTaskQueue::from_config(&self.config)));
        let limiter = RateLimiter::new(RateLimitConfig::new(
            self.config.rate_limit_requests,
            self.config.rate_limit_period(),
        ));
        Arc::new(Dispatcher {
            retry: RetryPolicy::from_config(&self.config),
            slots: Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1))),
            router: Router::new(self.routing),
            registry: self.registry,
            limiter,
            queue,
            handlers,
            ledger: self.ledger.unwrap_or_default(),
            generator_name,
            inflight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use onio_core::FailureKind;
    use std::time::Duration;

    /// Sleeps `delay` (ignoring cancellation) then fails the first `fail_first` calls.
    struct ScriptedGenerator {
        delay: Duration,
        fail_first: u32,
        failure: FailureKind,
        calls: AtomicU32,
        retries_seen: Mutex<Vec<u32>>,
    }

    impl ScriptedGenerator {
        fn new(delay_ms: u64, fail_first: u32, failure: FailureKind) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail_first,
                failure,
                calls: AtomicU32::new(0),
                retries_seen: Mutex::new(Vec::new()),
            })
        }

        fn ok(delay_ms: u64) -> Arc<Self> {
            Self::new(delay_ms, 0, FailureKind::Recoverable)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn retries_seen(&self) -> Vec<u32> {
            self.retries_seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResponseGenerator for ScriptedGenerator {
        async fn generate(&self, task: &Task, _agent: &AgentDefinition, _cancel: &CancellationToken) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.retries_seen.lock().unwrap().push(task.retry_count);
            assert_eq!(task.state, TaskState::Executing);
            tokio::time::sleep(self.delay).await;
            if n < self.fail_first {
                return Err(match self.failure {
                    FailureKind::Recoverable => Error::recoverable("upstream unavailable"),
                    FailureKind::Terminal => Error::terminal("invalid api key"),
                });
            }
            Ok(format!("reply: {}", task.args))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn agent(id: &str, tasks: Vec<TaskKind>, max_concurrency: usize) -> AgentDefinition {
        AgentDefinition {
            id: id.to_string(),
            description: None,
            personality: serde_json::json!({"name": "Onio"}),
            tasks,
            max_concurrency,
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            max_concurrent_tasks: 4,
            backlog_capacity: 10,
            task_timeout_ms: 1_000,
            task_retry_limit: 3,
            task_retry_delay_ms: 10,
            retry_max_delay_ms: 100,
            rate_limit_requests: 100,
            rate_limit_period_ms: 60_000,
            ..DispatchConfig::default()
        }
    }

    fn dispatcher(config: DispatchConfig, generator: Arc<dyn ResponseGenerator>) -> Arc<Dispatcher> {
        let registry = AgentRegistry::new(vec![agent("onio", TaskKind::ALL.to_vec(), 5)], 10).unwrap();
        let d = Dispatcher::builder(config, Arc::new(registry))
            .generator(generator)
            .build();
        d.start();
        d
    }

    fn event(conv: &str, text: &str) -> InboundEvent {
        InboundEvent::new("test", conv, "user-1", text)
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_greetings() {
        let d = dispatcher(config(), ScriptedGenerator::ok(0));
        let first = d.submit(event("c1", "/start")).await;
        assert_eq!(first.state, TaskState::Completed);
        assert!(first.text.contains("Onio"));
        let second = d.submit(event("c1", "/start")).await;
        assert_eq!(second.state, TaskState::Completed);
        assert_ne!(first.task_id, second.task_id);
    }

    /// Greeting handler that takes `delay` to answer.
    struct SlowGreeting {
        delay: Duration,
    }

    #[async_trait]
    impl TaskHandler for SlowGreeting {
        async fn handle(&self, ctx: HandlerContext<'_>, _cancel: &CancellationToken) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("Hello from {}", ctx.agent.display_name()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_greeting_rejected_while_first_runs() {
        let cfg = DispatchConfig {
            max_concurrent_tasks: 1,
            ..config()
        };
        let registry = AgentRegistry::new(vec![agent("a1", TaskKind::ALL.to_vec(), 1)], 10).unwrap();
        let d = Dispatcher::builder(cfg, Arc::new(registry))
            .handler(
                TaskKind::Greeting,
                Arc::new(SlowGreeting {
                    delay: Duration::from_millis(300),
                }),
            )
            .build();
        d.start();

        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c1", "/start")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = d.submit(event("c1", "/start")).await;
        assert_eq!(second.state, TaskState::Rejected);
        assert_eq!(second.error_code(), Some("already_in_progress"));
        assert!(second.task_id.is_none());

        let first = first.await.unwrap();
        assert_eq!(first.state, TaskState::Completed);
        assert_eq!(first.text, "Hello from Onio");

        let third = d.submit(event("c1", "/start")).await;
        assert_eq!(third.state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_serialized() {
        let d = dispatcher(config(), ScriptedGenerator::ok(500));
        let slow = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c1", "tell me something")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dup = d.submit(event("c1", "/joke")).await;
        assert_eq!(dup.state, TaskState::Rejected);
        assert_eq!(dup.error_code(), Some("already_in_progress"));

        // A different conversation is unaffected
        let other = d.submit(event("c2", "/help")).await;
        assert_eq!(other.state, TaskState::Completed);

        assert_eq!(slow.await.unwrap().state, TaskState::Completed);
        let again = d.submit(event("c1", "/joke")).await;
        assert_eq!(again.state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let cfg = DispatchConfig {
            max_concurrent_tasks: 1,
            ..config()
        };
        let gen = ScriptedGenerator::ok(2_000);
        let d = dispatcher(cfg, gen.clone());
        let start = Instant::now();
        let resp = d.submit(event("c1", "slow question")).await;
        assert_eq!(resp.state, TaskState::TimedOut);
        assert_eq!(resp.error_code(), Some("timeout"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000) && elapsed < Duration::from_millis(1_050));
        assert_eq!(d.status().await.queue.executing, 0);
        assert_eq!(d.in_flight(), 0);

        // The only slot serves another conversation while the abandoned call still sleeps
        let next = d.submit(event("c2", "/help")).await;
        assert_eq!(next.state, TaskState::Completed);
        assert_eq!(gen.calls(), 1);
        assert!(start.elapsed() < Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit_three_means_four_calls() {
        let gen = ScriptedGenerator::new(0, u32::MAX, FailureKind::Recoverable);
        let d = dispatcher(config(), gen.clone());
        let resp = d.submit(event("c1", "/joke")).await;
        assert_eq!(resp.state, TaskState::Failed);
        assert_eq!(resp.error_code(), Some("generator_recoverable"));
        assert_eq!(gen.calls(), 4);
        assert_eq!(gen.retries_seen(), vec![0, 1, 2, 3]);
        assert_eq!(resp.attempts, 4);

        let record = d.ledger().get(resp.task_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(d.ledger().stats(TaskKind::Joke).await.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let gen = ScriptedGenerator::new(0, 2, FailureKind::Recoverable);
        let d = dispatcher(config(), gen.clone());
        let resp = d.submit(event("c1", "hello there")).await;
        assert_eq!(resp.state, TaskState::Completed);
        assert_eq!(resp.text, "reply: hello there");
        assert_eq!(resp.attempts, 3);
        assert_eq!(gen.retries_seen(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_not_retried() {
        let gen = ScriptedGenerator::new(0, u32::MAX, FailureKind::Terminal);
        let d = dispatcher(config(), gen.clone());
        let resp = d.submit(event("c1", "/joke")).await;
        assert_eq!(resp.state, TaskState::Failed);
        assert_eq!(resp.error_code(), Some("generator_terminal"));
        assert_eq!(gen.calls(), 1);
        assert!(!resp.text.contains("api key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sixth_request_rejected() {
        let cfg = DispatchConfig {
            rate_limit_requests: 5,
            rate_limit_period_ms: 60_000,
            rate_limit_key: RateLimitKey::Agent,
            ..config()
        };
        let d = dispatcher(cfg, ScriptedGenerator::ok(0));
        for i in 0..5 {
            let resp = d.submit(event(&format!("c{}", i), "/help")).await;
            assert_eq!(resp.state, TaskState::Completed);
        }
        let sixth = d.submit(event("c9", "/help")).await;
        assert_eq!(sixth.state, TaskState::Rejected);
        assert_eq!(sixth.error_code(), Some("rate_limited"));
        assert!(sixth.task_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_keyed_rate_limit_isolates_users() {
        let cfg = DispatchConfig {
            rate_limit_requests: 1,
            rate_limit_key: RateLimitKey::Sender,
            ..config()
        };
        let d = dispatcher(cfg, ScriptedGenerator::ok(0));
        assert_eq!(d.submit(InboundEvent::new("test", "c1", "alice", "/help")).await.state, TaskState::Completed);
        assert_eq!(d.submit(InboundEvent::new("test", "c1", "alice", "/help")).await.state, TaskState::Rejected);
        assert_eq!(d.submit(InboundEvent::new("test", "c1", "bob", "/help")).await.state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_rejections() {
        let registry = AgentRegistry::new(
            vec![
                agent("onio", TaskKind::ALL.to_vec(), 5),
                agent("greeter", vec![TaskKind::Greeting], 1),
            ],
            10,
        )
        .unwrap();
        let d = Dispatcher::builder(config(), Arc::new(registry)).build();
        d.start();

        let unknown = d
            .submit(event("c1", "/start").with_metadata(serde_json::json!({"agentId": "ghost"})))
            .await;
        assert_eq!(unknown.error_code(), Some("unknown_agent"));

        let unsupported = d
            .submit(event("c1", "/joke").with_metadata(serde_json::json!({"agentId": "greeter"})))
            .await;
        assert_eq!(unsupported.state, TaskState::Rejected);
        assert_eq!(unsupported.error_code(), Some("validation"));

        let empty = d.submit(event("c1", "   ")).await;
        assert_eq!(empty.state, TaskState::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_full() {
        let cfg = DispatchConfig {
            max_concurrent_tasks: 1,
            backlog_capacity: 1,
            task_timeout_ms: 10_000,
            ..config()
        };
        let d = dispatcher(cfg, ScriptedGenerator::ok(1_000));
        let running = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c1", "first")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c2", "second")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rejected = d.submit(event("c3", "/status")).await;
        assert_eq!(rejected.error_code(), Some("backlog_full"));

        assert_eq!(running.await.unwrap().state, TaskState::Completed);
        assert_eq!(queued.await.unwrap().state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_task_times_out_without_running() {
        let cfg = DispatchConfig {
            max_concurrent_tasks: 1,
            task_timeout_ms: 1_000,
            ..config()
        };
        let gen = ScriptedGenerator::ok(800);
        let d = dispatcher(cfg, gen.clone());
        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c1", "first")).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        // Waits 300ms for the slot, then has 700ms left for an 800ms generator
        let second = d.submit(event("c2", "second")).await;
        assert_eq!(first.await.unwrap().state, TaskState::Completed);
        assert_eq!(second.state, TaskState::TimedOut);
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_concurrency_cap_holds_back_tasks() {
        let registry = AgentRegistry::new(vec![agent("solo", TaskKind::ALL.to_vec(), 1)], 10).unwrap();
        let gen = ScriptedGenerator::ok(300);
        let d = Dispatcher::builder(config(), Arc::new(registry))
            .generator(gen.clone())
            .build();
        d.start();

        let start = Instant::now();
        let a = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c1", "one")).await })
        };
        let b = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c2", "two")).await })
        };
        assert_eq!(a.await.unwrap().state, TaskState::Completed);
        assert_eq!(b.await.unwrap().state, TaskState::Completed);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_command_reports_live_counters() {
        let d = dispatcher(config(), ScriptedGenerator::ok(0));
        d.submit(event("c1", "/start")).await;
        let resp = d.submit(event("c2", "/status")).await;
        assert_eq!(resp.state, TaskState::Completed);
        assert!(resp.text.contains("Onio is online."));
        assert!(resp.text.contains("Completed: 1"));
        assert!(resp.text.contains("Responder: scripted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calc_validation_failure_is_not_retried() {
        let d = dispatcher(config(), ScriptedGenerator::ok(0));
        let ok = d.submit(event("c1", "/calc 2 * (3 + 4)")).await;
        assert_eq!(ok.text, "2 * (3 + 4) = 14");
        let bad = d.submit(event("c1", "/calc 2 +")).await;
        assert_eq!(bad.state, TaskState::Failed);
        assert_eq!(bad.error_code(), Some("validation"));
        assert_eq!(bad.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_answers_in_flight_tasks() {
        let d = dispatcher(config(), ScriptedGenerator::ok(5_000));
        let pending = {
            let d = d.clone();
            tokio::spawn(async move { d.submit(event("c1", "long one")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        d.shutdown().await;
        let resp = pending.await.unwrap();
        assert_eq!(resp.state, TaskState::Failed);
        assert_eq!(resp.error_code(), Some("cancelled"));

        let late = d.submit(event("c2", "/help")).await;
        assert_eq!(late.state, TaskState::Rejected);
        assert_eq!(late.error_code(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_is_visible_to_new_admissions() {
        let d = dispatcher(config(), ScriptedGenerator::ok(0));
        let ev = || event("c1", "/start").with_metadata(serde_json::json!({"agentId": "late"}));
        assert_eq!(d.submit(ev()).await.error_code(), Some("unknown_agent"));

        let source = crate::registry::StaticSource(vec![
            agent("onio", TaskKind::ALL.to_vec(), 5),
            agent("late", vec![TaskKind::Greeting], 1),
        ]);
        d.registry().reload(&source).unwrap();
        assert_eq!(d.submit(ev()).await.state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_expires_abandoned_queued_tasks() {
        let registry = AgentRegistry::new(vec![agent("onio", TaskKind::ALL.to_vec(), 5)], 10).unwrap();
        // Not started, so nothing is ever dequeued
        let d = Dispatcher::builder(config(), Arc::new(registry)).build();
        let abandoned = d.enqueue(event("c2", "waiting")).await.unwrap();
        let id = abandoned.task_id().to_string();
        drop(abandoned);
        assert_eq!(d.status().await.queue.queued, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        d.run_maintenance().await;
        assert_eq!(d.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        d.run_maintenance().await;
        let record = d.ledger().get(&id).await.unwrap();
        assert_eq!(record.state, TaskState::TimedOut);
        assert_eq!(d.status().await.queue.queued, 0);
        assert_eq!(d.in_flight(), 0);
    }
}
