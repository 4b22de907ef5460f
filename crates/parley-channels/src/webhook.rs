//! Webhook-style HTTP channel.
//!
//! Exposes a small HTTP surface sufficient to drive the orchestrator
//! end to end: `POST /messages` delivers an utterance synchronously and
//! returns the bot's reply in the response body; `GET /outbox/:user_id`
//! drains any replies queued by [`Channel::send`] for users who are not
//! waiting on a synchronous response. This is a reference shape, not a
//! reproduction of any specific platform's wire format.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use parley_types::error::ChannelError;

use crate::traits::{Channel, ChannelHost, ChannelMetadata, ChannelStatus, MessageId};

const CHANNEL_TYPE: &str = "webhook";

#[derive(Debug, Deserialize)]
struct InboundPayload {
    user_id: String,
    text: String,
    #[serde(default)]
    reset_dialog: bool,
    #[serde(default)]
    require_response: Option<bool>,
}

#[derive(Debug, Serialize)]
struct InboundReply {
    reply: Option<String>,
}

/// Shared state handed to axum handlers.
struct WebhookState {
    host: Arc<dyn ChannelHost>,
    /// Per-user queue of pushes produced by [`Channel::send`] while the
    /// user isn't in the middle of a synchronous request.
    outbox: AsyncMutex<HashMap<String, Vec<String>>>,
}

/// A channel that accepts utterances over HTTP and answers them inline.
pub struct WebhookChannel {
    bind_addr: String,
    state: Arc<AsyncMutex<Option<Arc<WebhookState>>>>,
}

impl WebhookChannel {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            state: Arc::new(AsyncMutex::new(None)),
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        CHANNEL_TYPE
    }

    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata {
            name: CHANNEL_TYPE.to_string(),
            display_name: "Webhook".to_string(),
            supports_push: true,
        }
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Running
    }

    fn is_allowed(&self, _sender_id: &str) -> bool {
        true
    }

    async fn start(
        &self,
        host: Arc<dyn ChannelHost>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        let shared = Arc::new(WebhookState {
            host,
            outbox: AsyncMutex::new(HashMap::new()),
        });
        *self.state.lock().await = Some(shared.clone());

        let app = Router::new()
            .route("/messages", post(handle_message))
            .route("/outbox/:user_id", get(handle_outbox))
            .with_state(shared);

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        info!(addr = %self.bind_addr, "webhook channel listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| ChannelError::Other(e.to_string()))?;

        *self.state.lock().await = None;
        Ok(())
    }

    async fn send(
        &self,
        user_id: &str,
        text: &str,
        _attrs: &HashMap<String, Value>,
    ) -> Result<MessageId, ChannelError> {
        let guard = self.state.lock().await;
        let shared = guard.as_ref().ok_or(ChannelError::NotConnected)?;
        shared
            .outbox
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(MessageId(format!("webhook-push-{user_id}")))
    }
}

async fn handle_message(
    State(state): State<Arc<WebhookState>>,
    Json(payload): Json<InboundPayload>,
) -> impl IntoResponse {
    let require_response = payload.require_response.unwrap_or(true);
    let result = state
        .host
        .register_msg(
            CHANNEL_TYPE,
            payload.text,
            payload.user_id,
            CHANNEL_TYPE.to_string(),
            require_response,
            HashMap::new(),
            payload.reset_dialog,
        )
        .await;

    match result {
        Ok(reply) => (StatusCode::OK, Json(InboundReply { reply })).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn handle_outbox(
    State(state): State<Arc<WebhookState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let mut outbox = state.outbox.lock().await;
    let messages = outbox.remove(&user_id).unwrap_or_default();
    Json(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_payload_defaults() {
        let raw = serde_json::json!({"user_id": "u1", "text": "hi"});
        let parsed: InboundPayload = serde_json::from_value(raw).unwrap();
        assert!(!parsed.reset_dialog);
        assert_eq!(parsed.require_response, None);
    }
}
