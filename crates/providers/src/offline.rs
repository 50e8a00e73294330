use async_trait::async_trait;
use onio_core::{AgentDefinition, Error, Result, Task, TaskKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use crate::ResponseGenerator;

const BUILTIN_JOKES: &[&str] = &[
    "Why do programmers prefer dark mode? Because light attracts bugs.",
    "There are 10 kinds of people: those who understand binary and those who don't.",
    "I told my computer I needed a break, and it said: no problem, I'll go to sleep.",
    "Why did the developer go broke? Because they used up all their cache.",
    "A SQL query walks into a bar, walks up to two tables and asks: can I join you?",
];

/// Canned replies for running without a language model.
///
/// Jokes come from the personality's `jokes` array when present, otherwise a
/// built-in list, rotating so consecutive requests differ.
pub struct OfflineGenerator {
    next_joke: AtomicUsize,
}

impl OfflineGenerator {
    pub fn new() -> Self {
        Self {
            next_joke: AtomicUsize::new(0),
        }
    }

    fn joke(&self, agent: &AgentDefinition) -> String {
        let idx = self.next_joke.fetch_add(1, Ordering::Relaxed);
        let custom: Vec<&str> = agent
            .personality
            .get("jokes")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|j| j.as_str()).collect())
            .unwrap_or_default();
        if custom.is_empty() {
            BUILTIN_JOKES[idx % BUILTIN_JOKES.len()].to_string()
        } else {
            custom[idx % custom.len()].to_string()
        }
    }
}

impl Default for OfflineGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseGenerator for OfflineGenerator {
    async fn generate(&self, task: &Task, agent: &AgentDefinition, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("task {} cancelled", task.id)));
        }
        let name = agent.display_name();
        let text = match task.kind {
            TaskKind::Joke => self.joke(agent),
            TaskKind::Custom => format!(
                "Sorry, {} doesn't know the command /{} yet. Try /help.",
                name,
                task.command.as_deref().unwrap_or("?")
            ),
            _ => {
                let said = task.args.trim();
                if said.is_empty() {
                    format!("{} is listening. What would you like to talk about?", name)
                } else {
                    format!(
                        "{} here. I heard: \"{}\". I'm running without a language model, so try /help to see what I can do.",
                        name, said
                    )
                }
            }
        };
        Ok(text)
    }

    fn name(&self) -> &str {
        "offline"
    }
}
