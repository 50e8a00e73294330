use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, BoxStream, StreamExt};
use onio_core::config::ApiConfig;
use onio_core::{ConnectorAdapter, Error, InboundEvent, Response, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

/// Generic HTTP connector. Each `POST /v1/events` request waits for the
/// response to its own event id.
pub struct ApiConnector {
    config: ApiConfig,
    events_tx: mpsc::Sender<InboundEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRequest {
    conversation_id: String,
    sender_id: String,
    text: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn error_body(status: StatusCode, code: &str, message: &str) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

impl ApiConnector {
    pub fn new(config: ApiConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/v1/events", post(handle_event))
            .layer(middleware::from_fn_with_state(self.clone(), auth_middleware))
            // Public, outside the auth layer
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!(addr = %bind_addr, "API connector listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("API connector stopped");
        Ok(())
    }

    async fn submit(&self, event: InboundEvent) -> axum::response::Response {
        let event_id = event.id.clone();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(event_id.clone(), tx);

        if self.events_tx.send(event).await.is_err() {
            self.lock_pending().remove(&event_id);
            return error_body(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "dispatcher is not running");
        }

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Json(response).into_response(),
            Ok(Err(_)) => error_body(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "response channel closed"),
            Err(_) => {
                self.lock_pending().remove(&event_id);
                warn!(event_id = %event_id, "API request timed out waiting for a response");
                error_body(StatusCode::GATEWAY_TIMEOUT, "timeout", "no response in time")
            }
        }
    }
}

async fn auth_middleware(State(conn): State<Arc<ApiConnector>>, req: Request, next: Next) -> axum::response::Response {
    let token = match conn.config.api_token.as_deref() {
        Some(t) if !t.is_empty() => t,
        _ => return next.run(req).await,
    };

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map_or(false, |presented| secure_eq(presented, token));

    if authorized {
        next.run(req).await
    } else {
        error_body(StatusCode::UNAUTHORIZED, "unauthorized", "invalid or missing Bearer token")
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_event(State(conn): State<Arc<ApiConnector>>, Json(req): Json<EventRequest>) -> axum::response::Response {
    if req.conversation_id.trim().is_empty() || req.sender_id.trim().is_empty() {
        return error_body(
            StatusCode::BAD_REQUEST,
            "validation",
            "conversationId and senderId are required",
        );
    }
    let event = InboundEvent::new("api", &req.conversation_id, &req.sender_id, &req.text)
        .with_metadata(req.metadata);
    debug!(event_id = %event.id, conversation_id = %event.conversation_id, "API event received");
    conn.submit(event).await
}

#[async_trait]
impl ConnectorAdapter for ApiConnector {
    fn platform(&self) -> &str {
        "api"
    }

    /// Events accepted by the HTTP server. Only the first caller gets them.
    fn receive(self: Arc<Self>) -> BoxStream<'static, InboundEvent> {
        let rx = self.events_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match rx {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed(),
            None => {
                warn!("API connector stream already taken");
                stream::empty().boxed()
            }
        }
    }

    async fn send(&self, _conversation_id: &str, response: &Response) -> Result<()> {
        let waiter = self.lock_pending().remove(&response.event_id);
        match waiter {
            Some(tx) => tx
                .send(response.clone())
                .map_err(|_| Error::Channel(format!("API caller for event {} went away", response.event_id))),
            None => {
                debug!(event_id = %response.event_id, "No pending API request for response");
                Ok(())
            }
        }
    }
}
