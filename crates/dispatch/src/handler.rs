use async_trait::async_trait;
use onio_core::{AgentDefinition, Error, Result, Task, TaskKind};
use onio_providers::ResponseGenerator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ledger::LedgerSummary;
use crate::queue::QueueStats;

/// Live counters shown by `/status`.
#[derive(Debug, Clone, Default)]
pub struct DispatchStatus {
    pub queue: QueueStats,
    pub ledger: LedgerSummary,
    pub agents: usize,
    pub uptime: Duration,
    pub generator: String,
}

impl DispatchStatus {
    pub fn render(&self) -> String {
        let secs = self.uptime.as_secs();
        format!(
            "Uptime: {}h {}m {}s\nAgents: {}\nQueued: {}/{}\nExecuting: {}\nCompleted: {}\nFailed: {}\nTimed out: {}\nResponder: {}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60,
            self.agents,
            self.queue.queued,
            self.queue.capacity,
            self.queue.executing,
            self.ledger.completed,
            self.ledger.failed,
            self.ledger.timed_out,
            self.generator,
        )
    }
}

pub struct HandlerContext<'a> {
    pub task: &'a Task,
    pub agent: &'a AgentDefinition,
    pub status: &'a DispatchStatus,
}

/// Produces the reply text for one task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<'_>, cancel: &CancellationToken) -> Result<String>;
}

/// Replace `{key}` placeholders.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (k, v)| {
        acc.replace(&format!("{{{}}}", k), v)
    })
}

/// One line per command the agent answers.
pub fn command_list(agent: &AgentDefinition) -> String {
    let mut lines: Vec<String> = agent
        .tasks
        .iter()
        .filter_map(|k| k.command().map(|c| format!("/{} - {}", c, k.description())))
        .collect();
    if agent.supports(TaskKind::Chat) {
        lines.push("Or just send a message to chat.".to_string());
    }
    lines.join("\n")
}

pub struct GreetingHandler;

#[async_trait]
impl TaskHandler for GreetingHandler {
    async fn handle(&self, ctx: HandlerContext<'_>, _cancel: &CancellationToken) -> Result<String> {
        let template = ctx
            .agent
            .personality_str("greeting")
            .unwrap_or("Hello {user}! I'm {name}. Type /help to see what I can do.");
        let commands = command_list(ctx.agent);
        Ok(render_template(
            template,
            &[
                ("name", ctx.agent.display_name()),
                ("user", ctx.task.event.sender_name()),
                ("commands", &commands),
            ],
        ))
    }
}

pub struct HelpHandler;

#[async_trait]
impl TaskHandler for HelpHandler {
    async fn handle(&self, ctx: HandlerContext<'_>, _cancel: &CancellationToken) -> Result<String> {
        let template = ctx
            .agent
            .personality_str("help")
            .unwrap_or("{name} can help with:\n{commands}");
        let commands = command_list(ctx.agent);
        Ok(render_template(
            template,
            &[("name", ctx.agent.display_name()), ("commands", &commands)],
        ))
    }
}

pub struct StatusHandler;

#[async_trait]
impl TaskHandler for StatusHandler {
    async fn handle(&self, ctx: HandlerContext<'_>, _cancel: &CancellationToken) -> Result<String> {
        let template = ctx
            .agent
            .personality_str("status")
            .unwrap_or("{name} is online.\n{status}");
        let status = ctx.status.render();
        Ok(render_template(
            template,
            &[("name", ctx.agent.display_name()), ("status", &status)],
        ))
    }
}

pub struct CalculationHandler;

#[async_trait]
impl TaskHandler for CalculationHandler {
    async fn handle(&self, ctx: HandlerContext<'_>, _cancel: &CancellationToken) -> Result<String> {
        let expr = ctx.task.args.trim();
        if expr.is_empty() {
            return Err(Error::Validation("usage: /calc <expression>, e.g. /calc (2 + 3) * 4".to_string()));
        }
        let value = evaluate(expr)?;
        Ok(format!("{} = {}", expr, format_number(value)))
    }
}

/// Delegates to the response generator (jokes, chat, unknown commands).
pub struct GeneratorHandler {
    generator: Arc<dyn ResponseGenerator>,
}

impl GeneratorHandler {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl TaskHandler for GeneratorHandler {
    async fn handle(&self, ctx: HandlerContext<'_>, cancel: &CancellationToken) -> Result<String> {
        self.generator.generate(ctx.task, ctx.agent, cancel).await
    }
}

/// Task kind to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in handlers for every kind, with the generator behind joke, chat and custom.
    pub fn standard(generator: Arc<dyn ResponseGenerator>) -> Self {
        let gen: Arc<dyn TaskHandler> = Arc::new(GeneratorHandler::new(generator));
        let mut table = Self::new();
        table.register(TaskKind::Greeting, Arc::new(GreetingHandler));
        table.register(TaskKind::Help, Arc::new(HelpHandler));
        table.register(TaskKind::Status, Arc::new(StatusHandler));
        table.register(TaskKind::Calculation, Arc::new(CalculationHandler));
        table.register(TaskKind::Joke, gen.clone());
        table.register(TaskKind::Chat, gen.clone());
        table.register(TaskKind::Custom, gen);
        table
    }

    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

const MAX_EXPRESSION_LEN: usize = 256;

/// Evaluate `+ - * / % ^` with parentheses and unary signs.
/// `^` is right-associative and binds tighter than unary minus.
pub fn evaluate(expr: &str) -> Result<f64> {
    if expr.len() > MAX_EXPRESSION_LEN {
        return Err(Error::Validation("expression is too long".to_string()));
    }
    if expr.trim().is_empty() {
        return Err(Error::Validation("empty expression".to_string()));
    }
    let mut parser = Calc {
        chars: expr.chars().collect(),
        pos: 0,
    };
    let value = parser.expr()?;
    if let Some(c) = parser.peek() {
        return Err(Error::Validation(format!("unexpected '{}'", c)));
    }
    if !value.is_finite() {
        return Err(Error::Validation("result is not a finite number".to_string()));
    }
    Ok(value)
}

struct Calc {
    chars: Vec<char>,
    pos: usize,
}

impl Calc {
    /// Next non-whitespace character, without consuming it.
    fn peek(&mut self) -> Option<char> {
        while matches!(self.chars.get(self.pos), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn expr(&mut self) -> Result<f64> {
        let mut acc = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<f64> {
        let mut acc = self.unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            if rhs == 0.0 && op != '*' {
                return Err(Error::Validation("division by zero".to_string()));
            }
            acc = match op {
                '*' => acc * rhs,
                '/' => acc / rhs,
                _ => acc % rhs,
            };
        }
        Ok(acc)
    }

    fn unary(&mut self) -> Result<f64> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some('+') => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64> {
        let base = self.atom()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let v = self.expr()?;
                if self.bump() != Some(')') {
                    return Err(Error::Validation("missing ')'".to_string()));
                }
                Ok(v)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.chars.get(self.pos), Some(c) if c.is_ascii_digit() || *c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.chars[start..self.pos].iter().collect();
                literal
                    .parse::<f64>()
                    .map_err(|_| Error::Validation(format!("invalid number '{}'", literal)))
            }
            Some(c) => Err(Error::Validation(format!("unexpected '{}'", c))),
            None => Err(Error::Validation("unexpected end of expression".to_string())),
        }
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        let s = format!("{:.10}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
