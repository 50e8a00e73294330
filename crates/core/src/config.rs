use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::task::TaskKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// `Some("")` forces a direct connection even when HTTPS_PROXY is set.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_model() -> String {
    "gpt-4".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            proxy: None,
        }
    }
}

/// A configured personality and the task kinds it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Opaque to the dispatcher; handlers and generators read well-known keys.
    #[serde(default)]
    pub personality: serde_json::Value,
    pub tasks: Vec<TaskKind>,
    #[serde(default = "default_agent_concurrency")]
    pub max_concurrency: usize,
}

fn default_agent_concurrency() -> usize {
    5
}

impl AgentDefinition {
    pub fn supports(&self, kind: TaskKind) -> bool {
        self.tasks.contains(&kind)
    }

    pub fn display_name(&self) -> &str {
        self.personality
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.id)
    }

    /// String entry of the personality blob, if present.
    pub fn personality_str(&self, key: &str) -> Option<&str> {
        self.personality.get(key).and_then(|v| v.as_str())
    }
}

fn default_agents() -> Vec<AgentDefinition> {
    vec![AgentDefinition {
        id: "onio".to_string(),
        description: Some("Default ONIO assistant".to_string()),
        personality: serde_json::json!({
            "name": "ONIO",
            "tone": "friendly",
            "style": "professional",
            "language": "en"
        }),
        tasks: TaskKind::ALL.to_vec(),
        max_concurrency: default_agent_concurrency(),
    }]
}

/// Which identity a rate-limit bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    Agent,
    #[default]
    Sender,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Retention for idle rate-limit buckets and finished task records.
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// Maintenance tick, and the default interval of scheduled jobs.
    #[serde(default = "default_task_interval_ms")]
    pub task_interval_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Queued-but-not-started bound, separate from execution slots.
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_task_retry_limit")]
    pub task_retry_limit: u32,
    #[serde(default = "default_task_retry_delay_ms")]
    pub task_retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_period_ms")]
    pub rate_limit_period_ms: u64,
    #[serde(default)]
    pub rate_limit_key: RateLimitKey,
    /// Dequeue cycles after which a waiting task jumps ahead of higher lanes. 0 = strict priority.
    #[serde(default = "default_starvation_threshold")]
    pub starvation_threshold: u64,
    #[serde(default)]
    pub distributed_tasks: bool,
}

fn default_max_agents() -> usize {
    10
}

fn default_agent_timeout_ms() -> u64 {
    3_600_000
}

fn default_task_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_backlog_capacity() -> usize {
    100
}

fn default_task_timeout_ms() -> u64 {
    1_800_000
}

fn default_task_retry_limit() -> u32 {
    3
}

fn default_task_retry_delay_ms() -> u64 {
    5_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_rate_limit_requests() -> u32 {
    60
}

fn default_rate_limit_period_ms() -> u64 {
    60_000
}

fn default_starvation_threshold() -> u64 {
    16
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            agent_timeout_ms: default_agent_timeout_ms(),
            task_interval_ms: default_task_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            backlog_capacity: default_backlog_capacity(),
            task_timeout_ms: default_task_timeout_ms(),
            task_retry_limit: default_task_retry_limit(),
            task_retry_delay_ms: default_task_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_period_ms: default_rate_limit_period_ms(),
            rate_limit_key: RateLimitKey::default(),
            starvation_threshold: default_starvation_threshold(),
            distributed_tasks: false,
        }
    }
}

impl DispatchConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn task_retry_delay(&self) -> Duration {
        Duration::from_millis(self.task_retry_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn rate_limit_period(&self) -> Duration {
        Duration::from_millis(self.rate_limit_period_ms)
    }

    pub fn task_interval(&self) -> Duration {
        Duration::from_millis(self.task_interval_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

/// Routes events from a platform and/or conversation to a specific agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBinding {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub agent: String,
}

impl RouteBinding {
    pub fn matches(&self, platform: &str, conversation_id: &str) -> bool {
        self.platform.as_deref().map_or(true, |p| p == platform)
            && self
                .conversation_id
                .as_deref()
                .map_or(true, |c| c == conversation_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_agent: Option<String>,
    /// First matching binding wins.
    #[serde(default)]
    pub bindings: Vec<RouteBinding>,
    #[serde(default = "default_command_prefixes")]
    pub command_prefixes: Vec<String>,
}

fn default_command_prefixes() -> Vec<String> {
    vec!["/".to_string(), "!".to_string()]
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_agent: None,
            bindings: Vec::new(),
            command_prefixes: default_command_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// User ids or usernames. Empty = allow all.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Chat ids. Empty = allow all.
    #[serde(default)]
    pub allowed_chats: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub parse_mode: Option<String>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u32,
}

fn default_poll_timeout() -> u32 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            allow_from: Vec::new(),
            allowed_chats: Vec::new(),
            proxy: None,
            parse_mode: None,
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Channel ids to monitor. Empty = all channels the bot can see.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default = "default_discord_max_length")]
    pub max_message_length: usize,
}

fn default_discord_max_length() -> usize {
    2000
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            channels: Vec::new(),
            allow_from: Vec::new(),
            max_message_length: default_discord_max_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_api_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    18790
}

fn default_api_request_timeout() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_api_host(),
            port: default_api_port(),
            api_token: None,
            request_timeout_secs: default_api_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Where a scheduled job's response is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTarget {
    pub platform: String,
    pub conversation_id: String,
}

/// A periodic job submitted through the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub name: String,
    pub agent: String,
    /// Message text, typically a command such as `/status`.
    pub text: String,
    /// Defaults to the dispatch `taskIntervalMs`.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub start_delay_ms: u64,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub deliver_to: Option<DeliveryTarget>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub schedule: Vec<JobConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            agents: default_agents(),
            routing: RoutingConfig::default(),
            channels: ChannelsConfig::default(),
            provider: ProviderConfig::default(),
            logging: LoggingConfig::default(),
            schedule: Vec::new(),
        }
    }
}

/// Deserialize a document picking the format from the file extension.
/// Anything other than `.yaml`, `.yml` or `.json5` is read as JSON.
pub fn parse_document<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(content)?),
        Some("json5") => Ok(json5::from_str(content)?),
        _ => Ok(serde_json::from_str(content)?),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        parse_document(path, &content)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply process environment overrides. Called once at startup; components
    /// never read the environment themselves.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = &mut self.dispatch;

        if let Some(v) = lookup("MAX_AGENTS") {
            d.max_agents = parse_number("MAX_AGENTS", &v)?;
        }
        if let Some(v) = lookup("AGENT_TIMEOUT") {
            d.agent_timeout_ms = parse_duration_ms("AGENT_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("TASK_INTERVAL") {
            d.task_interval_ms = parse_duration_ms("TASK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("THREAD_POOL_SIZE") {
            d.max_concurrent_tasks = parse_number("THREAD_POOL_SIZE", &v)?;
        }
        // The more specific setting wins when both are present.
        if let Some(v) = lookup("MAX_CONCURRENT_TASKS") {
            d.max_concurrent_tasks = parse_number("MAX_CONCURRENT_TASKS", &v)?;
        }
        if let Some(v) = lookup("TASK_TIMEOUT") {
            d.task_timeout_ms = parse_duration_ms("TASK_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("TASK_RETRY_LIMIT") {
            d.task_retry_limit = parse_number("TASK_RETRY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("TASK_RETRY_DELAY") {
            d.task_retry_delay_ms = parse_duration_ms("TASK_RETRY_DELAY", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_REQUESTS") {
            d.rate_limit_requests = parse_number("RATE_LIMIT_REQUESTS", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT_PERIOD") {
            d.rate_limit_period_ms = parse_duration_ms("RATE_LIMIT_PERIOD", &v)?;
        }
        if let Some(v) = lookup("FEATURE_DISTRIBUTED_TASKS") {
            d.distributed_tasks = parse_flag(&v);
        }

        if let Some(v) = lookup("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.token = v;
        }
        if let Some(v) = lookup("DISCORD_BOT_TOKEN") {
            self.channels.discord.bot_token = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.provider.api_key = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.max_concurrent_tasks == 0 {
            return Err(Error::Config("maxConcurrentTasks must be at least 1".to_string()));
        }
        if d.backlog_capacity == 0 {
            return Err(Error::Config("backlogCapacity must be at least 1".to_string()));
        }
        if d.task_timeout_ms == 0 {
            return Err(Error::Config("taskTimeoutMs must be greater than 0".to_string()));
        }
        if d.rate_limit_requests == 0 || d.rate_limit_period_ms == 0 {
            return Err(Error::Config(
                "rateLimitRequests and rateLimitPeriodMs must be greater than 0".to_string(),
            ));
        }
        if d.task_interval_ms == 0 {
            return Err(Error::Config("taskIntervalMs must be greater than 0".to_string()));
        }

        validate_agents(&self.agents, d.max_agents)?;

        let ids: HashSet<&str> = self.agents.iter().map(|a| a.id.as_str()).collect();
        if let Some(default) = &self.routing.default_agent {
            if !ids.contains(default.as_str()) {
                return Err(Error::Config(format!("routing.defaultAgent '{}' is not a configured agent", default)));
            }
        }
        for binding in &self.routing.bindings {
            if !ids.contains(binding.agent.as_str()) {
                return Err(Error::Config(format!("routing binding targets unknown agent '{}'", binding.agent)));
            }
        }

        let job_names: HashSet<&str> = self.schedule.iter().map(|j| j.name.as_str()).collect();
        if job_names.len() != self.schedule.len() {
            return Err(Error::Config("scheduled job names must be unique".to_string()));
        }
        for job in &self.schedule {
            if !ids.contains(job.agent.as_str()) {
                return Err(Error::Config(format!("job '{}' targets unknown agent '{}'", job.name, job.agent)));
            }
            if job.interval_ms == Some(0) {
                return Err(Error::Config(format!("job '{}' has a zero interval", job.name)));
            }
            if job.max_runs == Some(0) {
                return Err(Error::Config(format!(
                    "job '{}' has maxRuns 0; disable it with \"enabled\": false instead",
                    job.name
                )));
            }
            for dep in &job.depends_on {
                if !job_names.contains(dep.as_str()) {
                    return Err(Error::Config(format!("job '{}' depends on unknown job '{}'", job.name, dep)));
                }
            }
        }
        Ok(())
    }
}

/// Checks shared by startup validation and registry reloads.
pub fn validate_agents(agents: &[AgentDefinition], max_agents: usize) -> Result<()> {
    if agents.len() > max_agents {
        return Err(Error::Config(format!(
            "{} agents configured but maxAgents is {}",
            agents.len(),
            max_agents
        )));
    }
    let mut seen = HashSet::new();
    for agent in agents {
        if agent.id.trim().is_empty() {
            return Err(Error::Config("agent id cannot be empty".to_string()));
        }
        if !seen.insert(agent.id.as_str()) {
            return Err(Error::Config(format!("duplicate agent id '{}'", agent.id)));
        }
        if agent.tasks.is_empty() {
            return Err(Error::Config(format!("agent '{}' has no task kinds", agent.id)));
        }
        if agent.max_concurrency == 0 {
            return Err(Error::Config(format!("agent '{}' has maxConcurrency 0", agent.id)));
        }
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", name, value)))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_duration_ms(name: &str, value: &str) -> Result<u64> {
    parse_duration(value)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| Error::Config(format!("{} must be a duration like 30, 500ms, 2s or 5m, got '{}'", name, value)))
}

/// Parse `250ms`, `2s`, `5m`, `1h`, or a bare integer meaning seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let v = value.trim();
    let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
    let (digits, unit) = v.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration '{}'", value)))?;
    let d = match unit.trim() {
        "" | "s" => Duration::from_secs(n),
        "ms" => Duration::from_millis(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => return Err(Error::Config(format!("invalid duration unit in '{}'", value))),
    };
    Ok(d)
}
