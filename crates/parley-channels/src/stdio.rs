//! Line-oriented stdio channel.
//!
//! Reads one utterance per line from stdin, synchronously registers it
//! with the host (`require_response = true`), and prints the reply to
//! stdout. Intended for local development and driving the orchestrator
//! end to end without a real platform integration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_types::error::ChannelError;

use crate::traits::{Channel, ChannelHost, ChannelMetadata, ChannelStatus, MessageId};

const CHANNEL_TYPE: &str = "stdio";

/// A channel that reads lines from stdin and writes replies to stdout.
///
/// `user_id` is fixed at construction time since stdio has exactly one
/// user per process.
pub struct StdioChannel {
    user_id: String,
}

impl StdioChannel {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }
}

#[async_trait]
impl Channel for StdioChannel {
    fn name(&self) -> &str {
        CHANNEL_TYPE
    }

    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata {
            name: CHANNEL_TYPE.to_string(),
            display_name: "Standard I/O".to_string(),
            supports_push: false,
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
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            let line = match line.map_err(|e| ChannelError::Other(e.to_string()))? {
                Some(line) => line,
                None => break,
            };
            if line.is_empty() {
                continue;
            }

            let reset_dialog = line.trim() == "/reset";
            let utterance = if reset_dialog { String::new() } else { line };

            let reply = host
                .register_msg(
                    CHANNEL_TYPE,
                    utterance,
                    self.user_id.clone(),
                    CHANNEL_TYPE.to_string(),
                    true,
                    HashMap::new(),
                    reset_dialog,
                )
                .await?;

            if let Some(text) = reply {
                stdout
                    .write_all(format!("{text}\n").as_bytes())
                    .await
                    .map_err(|e| ChannelError::Other(e.to_string()))?;
                stdout.flush().await.map_err(|e| ChannelError::Other(e.to_string()))?;
            }
        }

        info!("stdio channel stopped");
        Ok(())
    }

    async fn send(
        &self,
        _user_id: &str,
        text: &str,
        _attrs: &HashMap<String, Value>,
    ) -> Result<MessageId, ChannelError> {
        warn!("stdio channel does not support out-of-band push; printing anyway");
        println!("{text}");
        Ok(MessageId("stdio-push".to_string()))
    }
}
