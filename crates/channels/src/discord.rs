use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use futures::SinkExt;
use onio_core::config::DiscordConfig;
use onio_core::{ConnectorAdapter, Error, InboundEvent, Response, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::split::split_message;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHUNK_DELAY: Duration = Duration::from_millis(500);

/// Discord Gateway opcodes
const GATEWAY_DISPATCH: u8 = 0;
const GATEWAY_HEARTBEAT: u8 = 1;
const GATEWAY_IDENTIFY: u8 = 2;
const GATEWAY_RECONNECT: u8 = 7;
const GATEWAY_INVALID_SESSION: u8 = 9;
const GATEWAY_HELLO: u8 = 10;
const GATEWAY_HEARTBEAT_ACK: u8 = 11;

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 12) | (1 << 15);

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Option<serde_json::Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Serialize)]
struct GatewayIdentify {
    op: u8,
    d: IdentifyData,
}

#[derive(Debug, Serialize)]
struct IdentifyData {
    token: String,
    intents: u64,
    properties: IdentifyProperties,
}

#[derive(Debug, Serialize)]
struct IdentifyProperties {
    os: String,
    browser: String,
    device: String,
}

#[derive(Debug, Serialize)]
struct GatewayHeartbeat {
    op: u8,
    d: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: DiscordUser,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot: Option<bool>,
}

/// Discord connector: Gateway WebSocket in, REST out.
pub struct DiscordConnector {
    config: DiscordConfig,
    client: Client,
    api_base: String,
}

impl DiscordConnector {
    pub fn new(config: DiscordConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            config,
            client,
            api_base: DISCORD_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn is_allowed(&self, user_id: &str) -> bool {
        let allow_from = &self.config.allow_from;
        allow_from.is_empty() || allow_from.iter().any(|allowed| allowed == user_id)
    }

    fn is_monitored_channel(&self, channel_id: &str) -> bool {
        let channels = &self.config.channels;
        channels.is_empty() || channels.iter().any(|ch| ch == channel_id)
    }

    async fn get_gateway_url(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Failed to get Discord gateway: {}", e)))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Channel(format!("Failed to parse gateway response: {}", e)))?;

        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| format!("{}/?v=10&encoding=json", s))
            .ok_or_else(|| Error::Channel("No gateway URL in response".to_string()))
    }

    async fn run_loop(self: Arc<Self>, tx: mpsc::Sender<InboundEvent>) {
        info!("Discord channel starting");
        while !tx.is_closed() {
            match self.connect_and_run(&tx).await {
                Ok(()) => info!("Discord connection closed"),
                Err(e) => error!(error = %e, "Discord connection error, reconnecting in 5s"),
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
        info!("Discord channel stopped");
    }

    async fn connect_and_run(&self, tx: &mpsc::Sender<InboundEvent>) -> Result<()> {
        let gateway_url = self.get_gateway_url().await?;
        info!(url = %gateway_url, "Connecting to Discord Gateway");

        let url = url::Url::parse(&gateway_url)
            .map_err(|e| Error::Channel(format!("Invalid gateway URL: {}", e)))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::Channel(format!("WebSocket connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let mut sequence: Option<u64> = None;
        let mut heartbeat_interval_ms: u64 = 41250;

        if let Some(Ok(WsMessage::Text(text))) = read.next().await {
            if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
                if payload.op == GATEWAY_HELLO {
                    if let Some(interval) = payload
                        .d
                        .as_ref()
                        .and_then(|d| d.get("heartbeat_interval"))
                        .and_then(|v| v.as_u64())
                    {
                        heartbeat_interval_ms = interval;
                        debug!(interval_ms = interval, "Received Hello");
                    }
                }
            }
        }

        let identify = GatewayIdentify {
            op: GATEWAY_IDENTIFY,
            d: IdentifyData {
                token: self.config.bot_token.clone(),
                intents: GATEWAY_INTENTS,
                properties: IdentifyProperties {
                    os: std::env::consts::OS.to_string(),
                    browser: "onio".to_string(),
                    device: "onio".to_string(),
                },
            },
        };
        let identify_json = serde_json::to_string(&identify)?;
        write
            .send(WsMessage::Text(identify_json))
            .await
            .map_err(|e| Error::Channel(format!("Failed to send identify: {}", e)))?;
        info!("Sent Identify to Discord Gateway");

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms.max(1)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) else {
                                continue;
                            };
                            if let Some(s) = payload.s {
                                sequence = Some(s);
                            }
                            match payload.op {
                                GATEWAY_DISPATCH => {
                                    if payload.t.as_deref() != Some("MESSAGE_CREATE") {
                                        continue;
                                    }
                                    let Some(d) = payload.d else { continue };
                                    match self.to_event(d) {
                                        Ok(Some(event)) => {
                                            if tx.send(event).await.is_err() {
                                                // Receiver dropped, nobody is listening any more
                                                return Ok(());
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(e) => error!(error = %e, "Failed to handle Discord message"),
                                    }
                                }
                                GATEWAY_HEARTBEAT_ACK => debug!("Heartbeat ACK received"),
                                GATEWAY_RECONNECT | GATEWAY_INVALID_SESSION => {
                                    warn!(op = payload.op, "Discord asked us to reconnect");
                                    return Ok(());
                                }
                                _ => {}
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            info!("Discord Gateway closed connection");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            return Err(Error::Channel(format!("WebSocket error: {}", e)));
                        }
                        None => return Ok(()),
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    let hb = serde_json::to_string(&GatewayHeartbeat { op: GATEWAY_HEARTBEAT, d: sequence })?;
                    write
                        .send(WsMessage::Text(hb))
                        .await
                        .map_err(|e| Error::Channel(format!("Failed to send heartbeat: {}", e)))?;
                }
                _ = tx.closed() => return Ok(()),
            }
        }
    }

    /// Normalize a MESSAGE_CREATE payload, or `None` when it is filtered out.
    fn to_event(&self, data: serde_json::Value) -> Result<Option<InboundEvent>> {
        let msg: DiscordMessage = serde_json::from_value(data)?;

        if msg.author.bot.unwrap_or(false) {
            return Ok(None);
        }
        if !self.is_allowed(&msg.author.id) {
            debug!(user_id = %msg.author.id, "Discord user not in allowlist, ignoring");
            return Ok(None);
        }
        if !self.is_monitored_channel(&msg.channel_id) {
            return Ok(None);
        }
        if msg.content.trim().is_empty() {
            return Ok(None);
        }

        let event = InboundEvent::new("discord", &msg.channel_id, &msg.author.id, &msg.content)
            .with_metadata(serde_json::json!({
                "messageId": msg.id,
                "username": msg.author.username,
                "guildId": msg.guild_id,
            }));
        Ok(Some(event))
    }
}

#[async_trait]
impl ConnectorAdapter for DiscordConnector {
    fn platform(&self) -> &str {
        "discord"
    }

    fn receive(self: Arc<Self>) -> BoxStream<'static, InboundEvent> {
        if self.config.bot_token.is_empty() {
            warn!("Discord bot token not configured");
            return stream::empty().boxed();
        }
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(self.run_loop(tx));
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed()
    }

    async fn send(&self, conversation_id: &str, response: &Response) -> Result<()> {
        #[derive(Serialize)]
        struct CreateMessage<'a> {
            content: &'a str,
        }

        let chunks = split_message(&response.text, self.config.max_message_length);
        let url = format!("{}/channels/{}/messages", self.api_base, conversation_id);

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(CHUNK_DELAY).await;
            }
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bot {}", self.config.bot_token))
                .json(&CreateMessage { content: chunk })
                .send()
                .await
                .map_err(|e| Error::Channel(format!("Failed to send Discord message: {}", e)))?;

            if !response.status().is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Channel(format!("Discord API error: {}", body)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;

    fn config(channels: &[&str], allow_from: &[&str]) -> DiscordConfig {
        DiscordConfig {
            enabled: true,
            bot_token: "bot-token".to_string(),
            channels: channels.iter().map(|s| s.to_string()).collect(),
            allow_from: allow_from.iter().map(|s| s.to_string()).collect(),
            max_message_length: 2000,
        }
    }

    fn payload(author: &str, bot: bool, channel: &str, content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "m1",
            "content": content,
            "author": {"id": author, "username": "dave", "bot": bot},
            "channel_id": channel,
            "guild_id": "g1",
            "attachments": []
        })
    }

    #[test]
    fn test_message_create_to_event() {
        let conn = DiscordConnector::new(config(&[], &[]));
        let ev = conn.to_event(payload("789", false, "456", "/joke cats")).unwrap().unwrap();
        assert_eq!(ev.platform, "discord");
        assert_eq!(ev.conversation_id, "456");
        assert_eq!(ev.sender_id, "789");
        assert_eq!(ev.text, "/joke cats");
        assert_eq!(ev.sender_name(), "dave");
        assert_eq!(ev.metadata["guildId"], "g1");
    }

    #[test]
    fn test_filters() {
        let conn = DiscordConnector::new(config(&["456"], &["789"]));
        assert!(conn.to_event(payload("789", true, "456", "hi")).unwrap().is_none());
        assert!(conn.to_event(payload("111", false, "456", "hi")).unwrap().is_none());
        assert!(conn.to_event(payload("789", false, "999", "hi")).unwrap().is_none());
        assert!(conn.to_event(payload("789", false, "456", "  ")).unwrap().is_none());
        assert!(conn.to_event(payload("789", false, "456", "hi")).unwrap().is_some());
        assert!(conn.to_event(serde_json::json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_gateway_identify_serialize() {
        let identify = GatewayIdentify {
            op: GATEWAY_IDENTIFY,
            d: IdentifyData {
                token: "test-token".to_string(),
                intents: GATEWAY_INTENTS,
                properties: IdentifyProperties {
                    os: "linux".to_string(),
                    browser: "onio".to_string(),
                    device: "onio".to_string(),
                },
            },
        };
        let json = serde_json::to_string(&identify).unwrap();
        assert!(json.contains("\"op\":2"));
        assert!(json.contains("\"intents\":37377"));
    }

    #[tokio::test]
    async fn test_send_splits_long_replies() {
        let sent: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let router = Router::new()
            .route(
                "/channels/:id/messages",
                post(
                    |State(sent): State<Arc<Mutex<Vec<(String, String)>>>>,
                     Path(id): Path<String>,
                     Json(body): Json<serde_json::Value>| async move {
                        let content = body["content"].as_str().unwrap_or_default().to_string();
                        sent.lock().unwrap().push((id, content));
                        Json(serde_json::json!({"id": "1"}))
                    },
                ),
            )
            .with_state(sent.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let conn = DiscordConnector::new(config(&[], &[])).with_api_base(&format!("http://{}", addr));
        let ev = InboundEvent::new("discord", "456", "789", "hi");
        let text = format!("{}\n{}", "x".repeat(1500), "y".repeat(1500));
        conn.send("456", &Response::completed(&ev, "t1", &text)).await.unwrap();

        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "456");
        assert_eq!(sent[0].1, format!("{}\n", "x".repeat(1500)));
        assert_eq!(sent[1].1, "y".repeat(1500));
    }
}
