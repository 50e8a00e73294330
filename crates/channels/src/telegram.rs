use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use onio_core::config::TelegramConfig;
use onio_core::{ConnectorAdapter, Error, InboundEvent, Response, Result};
use reqwest::{Client, Proxy};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::split::split_message;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Long-polling Telegram connector.
pub struct TelegramConnector {
    config: TelegramConfig,
    client: Client,
    api_base: String,
}

impl TelegramConnector {
    pub fn new(config: TelegramConfig) -> Self {
        // Long polls hold the request open for poll_timeout_secs.
        let timeout = Duration::from_secs(config.poll_timeout_secs as u64 + 30);
        let mut builder = Client::builder().timeout(timeout);

        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            match Proxy::all(proxy) {
                Ok(p) => {
                    builder = builder.proxy(p);
                    info!(proxy = %proxy, "Telegram proxy configured");
                }
                Err(e) => {
                    warn!(error = %e, proxy = %proxy, "Invalid Telegram proxy, ignoring");
                }
            }
        }

        let client = builder.build().unwrap_or_else(|_| Client::new());

        Self {
            config,
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    /// Point the connector at a different Bot API server.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.config.token, method)
    }

    fn is_allowed(&self, user: &User) -> bool {
        let allow_from = &self.config.allow_from;
        if allow_from.is_empty() {
            return true;
        }

        let user_id = user.id.to_string();
        let username = user.username.as_deref().unwrap_or("");

        allow_from.iter().any(|allowed| {
            if allowed.contains('|') {
                let parts: Vec<&str> = allowed.split('|').collect();
                parts.contains(&user_id.as_str()) || (!username.is_empty() && parts.contains(&username))
            } else {
                allowed == &user_id || (!username.is_empty() && allowed == username)
            }
        })
    }

    fn is_chat_allowed(&self, chat_id: i64) -> bool {
        let allowed = &self.config.allowed_chats;
        allowed.is_empty() || allowed.iter().any(|c| c == &chat_id.to_string())
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Telegram request failed: {}", e)))?;

        let telegram_response: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Channel(format!("Failed to parse Telegram response: {}", e)))?;

        if !telegram_response.ok {
            return Err(Error::Channel(
                telegram_response
                    .description
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        telegram_response
            .result
            .ok_or_else(|| Error::Channel("Telegram response without result".to_string()))
    }

    async fn get_me(&self) -> Result<User> {
        self.call(self.client.get(self.api_url("getMe"))).await
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut params = vec![("timeout", self.config.poll_timeout_secs.to_string())];
        if let Some(off) = offset {
            params.push(("offset", off.to_string()));
        }
        self.call(self.client.get(self.api_url("getUpdates")).query(&params))
            .await
    }

    /// Normalize a message, or `None` when it is filtered out.
    fn to_event(&self, message: Message, bot_username: Option<&str>) -> Option<InboundEvent> {
        let user = message.from.as_ref()?;
        if user.is_bot {
            return None;
        }
        if !self.is_allowed(user) {
            debug!(user_id = user.id, "User not in allowlist, ignoring");
            return None;
        }
        if !self.is_chat_allowed(message.chat.id) {
            debug!(chat_id = message.chat.id, "Chat not in allowlist, ignoring");
            return None;
        }

        let raw = message.text.or(message.caption).unwrap_or_default();
        let text = strip_mention(&raw, bot_username);
        if text.is_empty() {
            return None;
        }

        let event = InboundEvent::new(
            "telegram",
            &message.chat.id.to_string(),
            &user.id.to_string(),
            text,
        )
        .with_metadata(serde_json::json!({
            "messageId": message.message_id,
            "username": user.username,
            "chatType": message.chat.kind,
        }));
        Some(event)
    }

    async fn send_chunk(&self, chat_id: &str, text: &str, parse_mode: Option<&str>) -> Result<()> {
        #[derive(Serialize)]
        struct SendMessageRequest<'a> {
            chat_id: &'a str,
            text: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            parse_mode: Option<&'a str>,
        }

        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode,
        };

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Failed to send Telegram message: {}", e)))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("Telegram API error: {}", body)));
        }
        Ok(())
    }
}

/// Drop a leading `@botname` so group mentions route like direct messages.
fn strip_mention<'a>(text: &'a str, bot_username: Option<&str>) -> &'a str {
    let text = text.trim();
    let Some(name) = bot_username else {
        return text;
    };
    let mention = format!("@{}", name);
    match text.strip_prefix(mention.as_str()) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => text,
    }
}

struct PollState {
    connector: Arc<TelegramConnector>,
    offset: Option<i64>,
    bot_username: Option<String>,
    identified: bool,
    pending: VecDeque<InboundEvent>,
}

#[async_trait]
impl ConnectorAdapter for TelegramConnector {
    fn platform(&self) -> &str {
        "telegram"
    }

    fn receive(self: Arc<Self>) -> BoxStream<'static, InboundEvent> {
        if self.config.token.is_empty() {
            warn!("Telegram token not configured");
            return stream::empty().boxed();
        }
        info!("Telegram channel started");

        let state = PollState {
            connector: self,
            offset: None,
            bot_username: None,
            identified: false,
            pending: VecDeque::new(),
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if !state.identified {
                    match state.connector.get_me().await {
                        Ok(me) => {
                            info!(username = ?me.username, "Telegram bot identified");
                            state.bot_username = me.username;
                        }
                        Err(e) => warn!(error = %e, "getMe failed, mentions will not be stripped"),
                    }
                    state.identified = true;
                }
                match state.connector.get_updates(state.offset).await {
                    Ok(updates) => {
                        for update in updates {
                            state.offset = Some(update.update_id + 1);
                            if let Some(message) = update.message {
                                if let Some(event) = state
                                    .connector
                                    .to_event(message, state.bot_username.as_deref())
                                {
                                    state.pending.push_back(event);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to get Telegram updates");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        })
        .boxed()
    }

    async fn send(&self, conversation_id: &str, response: &Response) -> Result<()> {
        let parse_mode = self.config.parse_mode.as_deref().filter(|m| !m.is_empty());
        for chunk in split_message(&response.text, TELEGRAM_MAX_MESSAGE_LEN) {
            if let Err(e) = self.send_chunk(conversation_id, &chunk, parse_mode).await {
                // Model output often breaks Markdown entity parsing.
                if parse_mode.is_none() {
                    return Err(e);
                }
                warn!(error = %e, "Formatted send failed, retrying as plain text");
                self.send_chunk(conversation_id, &chunk, None).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Mutex;

    fn config(allow_from: &[&str], allowed_chats: &[&str]) -> TelegramConfig {
        TelegramConfig {
            enabled: true,
            token: "test-token".to_string(),
            allow_from: allow_from.iter().map(|s| s.to_string()).collect(),
            allowed_chats: allowed_chats.iter().map(|s| s.to_string()).collect(),
            proxy: None,
            parse_mode: None,
            poll_timeout_secs: 1,
        }
    }

    fn message(user_id: i64, username: Option<&str>, chat_id: i64, text: &str) -> Message {
        serde_json::from_value(serde_json::json!({
            "message_id": 1,
            "from": {"id": user_id, "is_bot": false, "username": username},
            "chat": {"id": chat_id, "type": "private"},
            "text": text,
        }))
        .unwrap()
    }

    #[test]
    fn test_allow_lists() {
        let conn = TelegramConnector::new(config(&["42", "alice|7"], &[]));
        assert!(conn.to_event(message(42, None, 1, "hi"), None).is_some());
        assert!(conn.to_event(message(99, Some("alice"), 1, "hi"), None).is_some());
        assert!(conn.to_event(message(7, None, 1, "hi"), None).is_some());
        assert!(conn.to_event(message(8, Some("bob"), 1, "hi"), None).is_none());

        let conn = TelegramConnector::new(config(&[], &["-100"]));
        assert!(conn.to_event(message(1, None, -100, "hi"), None).is_some());
        assert!(conn.to_event(message(1, None, 5, "hi"), None).is_none());
    }

    #[test]
    fn test_event_fields_and_mentions() {
        let conn = TelegramConnector::new(config(&[], &[]));
        let ev = conn
            .to_event(message(42, Some("alice"), -5, "@onio_bot tell me a joke"), Some("onio_bot"))
            .unwrap();
        assert_eq!(ev.platform, "telegram");
        assert_eq!(ev.conversation_id, "-5");
        assert_eq!(ev.sender_id, "42");
        assert_eq!(ev.text, "tell me a joke");
        assert_eq!(ev.sender_name(), "alice");

        assert!(conn.to_event(message(42, None, 1, "@onio_bot"), Some("onio_bot")).is_none());
        assert_eq!(strip_mention("@onio_botty hi", Some("onio_bot")), "@onio_botty hi");
    }

    #[derive(Clone, Default)]
    struct Mock {
        sent: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn serve(mock: Mock) -> String {
        let router = Router::new()
            .route(
                "/bottest-token/getMe",
                get(|| async {
                    Json(serde_json::json!({"ok": true, "result": {"id": 1, "is_bot": true, "username": "onio_bot"}}))
                }),
            )
            .route(
                "/bottest-token/getUpdates",
                get(|| async {
                    Json(serde_json::json!({"ok": true, "result": [
                        {"update_id": 10, "message": {"message_id": 1, "from": {"id": 5, "is_bot": true}, "chat": {"id": 3}, "text": "from a bot"}},
                        {"update_id": 11, "message": {"message_id": 2, "from": {"id": 6, "username": "carol"}, "chat": {"id": 3}, "text": "/start@onio_bot"}},
                        {"update_id": 12}
                    ]}))
                }),
            )
            .route(
                "/bottest-token/sendMessage",
                post(|State(mock): State<Mock>, Json(body): Json<serde_json::Value>| async move {
                    mock.sent.lock().unwrap().push(body);
                    Json(serde_json::json!({"ok": true, "result": {}}))
                }),
            )
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_poll_and_send_against_local_server() {
        let mock = Mock::default();
        let base = serve(mock.clone()).await;
        let conn = Arc::new(TelegramConnector::new(config(&[], &[])).with_api_base(&base));

        let mut events = conn.clone().receive();
        let ev = events.next().await.unwrap();
        assert_eq!(ev.sender_id, "6");
        assert_eq!(ev.text, "/start@onio_bot");
        drop(events);

        let ev = InboundEvent::new("telegram", "3", "6", "/start");
        let long = format!("{}\n{}", "a".repeat(4000), "b".repeat(200));
        conn.send("3", &Response::completed(&ev, "t1", &long)).await.unwrap();
        let sent = mock.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["chat_id"], "3");
        assert!(sent[0].get("parse_mode").is_none());
        assert_eq!(sent[1]["text"], "b".repeat(200));
    }

    #[test]
    fn test_missing_token_yields_empty_stream() {
        let mut cfg = config(&[], &[]);
        cfg.token.clear();
        let conn = Arc::new(TelegramConnector::new(cfg));
        let items: Vec<InboundEvent> = futures::executor::block_on(conn.receive().collect());
        assert!(items.is_empty());
    }
}
