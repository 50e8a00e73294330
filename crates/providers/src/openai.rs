use async_trait::async_trait;
use onio_core::{AgentDefinition, Error, Result, Task, TaskKind};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::build_http_client;
use crate::ResponseGenerator;

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Generator backed by any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiGenerator {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        proxy: Option<&str>,
    ) -> Self {
        let resolved_base = api_base
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        let client = build_http_client(proxy, &resolved_base, Duration::from_secs(120));
        Self {
            client,
            api_key: api_key.to_string(),
            api_base: resolved_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// System prompt assembled from the agent's personality keys.
    fn build_system_prompt(agent: &AgentDefinition) -> String {
        let name = agent.display_name();
        let tone = agent.personality_str("tone").unwrap_or("friendly");
        let style = agent.personality_str("style").unwrap_or("professional");
        let language = agent.personality_str("language").unwrap_or("en");

        let mut s = format!(
            "You are {}, a chat assistant. Keep a {} tone and a {} style. Reply in the language with code '{}'.",
            name, tone, style, language
        );
        if let Some(desc) = agent.description.as_deref() {
            s.push_str(&format!("\nAbout you: {}", desc));
        }
        if let Some(extra) = agent.personality_str("prompt") {
            s.push_str("\n\n");
            s.push_str(extra);
        }
        s.push_str("\nReplies are shown in a chat window, so keep them short.");
        s
    }

    fn build_user_prompt(task: &Task) -> String {
        let args = task.args.trim();
        match task.kind {
            TaskKind::Joke if args.is_empty() => "Tell me a short, clean joke.".to_string(),
            TaskKind::Joke => format!("Tell me a short, clean joke about {}.", args),
            TaskKind::Custom => {
                let command = task.command.as_deref().unwrap_or("command");
                if args.is_empty() {
                    format!("The user sent the command /{} with no arguments.", command)
                } else {
                    format!("The user sent the command /{} with: {}", command, args)
                }
            }
            _ if args.is_empty() => task.event.text.clone(),
            _ => args.to_string(),
        }
    }

    /// 429, 408 and 5xx are worth retrying. Other non-success statuses are not.
    fn classify_status(status: StatusCode, body: &str) -> Error {
        let end = truncate_at_char_boundary(body, 300);
        let message = format!("API error {}: {}", status, &body[..end]);
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Error::recoverable(message)
        } else {
            Error::terminal(message)
        }
    }

    async fn send_request(&self, agent: &AgentDefinition, task: &Task) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Self::build_system_prompt(agent),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::build_user_prompt(task),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        debug!(task_id = %task.id, model = %self.model, url = %url, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::recoverable(format!("Request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| Error::recoverable(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            warn!(task_id = %task.id, status = %status, "LLM API error");
            return Err(Self::classify_status(status, &raw_body));
        }

        let chat_response: ChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 300);
            Error::terminal(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
        })?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(Error::recoverable("Empty completion"));
        }
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn generate(&self, task: &Task, agent: &AgentDefinition, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("task {} cancelled", task.id))),
            result = self.send_request(agent, task) => result,
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}
