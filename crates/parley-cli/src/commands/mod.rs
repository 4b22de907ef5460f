//! Shared command-line plumbing: configuration loading and the
//! in-process [`ChannelHost`](parley_channels::traits::ChannelHost)
//! adapter used by the `agent` role's local (non-broker) channels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use parley_channels::traits::ChannelHost;
use parley_core::AgentLoop;
use parley_types::config::Config;
use parley_types::error::ChannelError;
use parley_types::Utterance;

pub mod agent;
pub mod channel;
pub mod local_channels;
pub mod service;

/// Expand a leading `~/` to the user's home directory, so `--config`
/// arguments can be written the way a shell user expects. Paths that
/// don't start with `~/`, or where the home directory can't be
/// resolved, are returned unchanged.
pub fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Read and parse a configuration document, dispatching on its file
/// extension (`.json`, `.yaml`/`.yml`); anything else is parsed as YAML,
/// a strict superset of JSON. `path` may use a leading `~/` for the
/// user's home directory.
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let path = expand_path(path);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {path:?}"))?;

    let is_json = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {path:?} as JSON"))
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {path:?} as YAML"))
    }
}

/// Bridges [`ChannelHost`] to an in-process [`AgentLoop`], for channels
/// registered locally (not via the broker's `channel` role). This is the
/// one place `parley-channels` and `parley-core` are wired together, per
/// `parley-channels`' own module-level documentation.
pub struct LocalChannelHost {
    agent_loop: Arc<AgentLoop>,
}

impl LocalChannelHost {
    pub fn new(agent_loop: Arc<AgentLoop>) -> Self {
        Self { agent_loop }
    }
}

#[async_trait]
impl ChannelHost for LocalChannelHost {
    async fn register_msg(
        &self,
        channel_name: &str,
        utterance: String,
        user_id: String,
        channel_type: String,
        require_response: bool,
        message_attrs: std::collections::HashMap<String, Value>,
        reset_dialog: bool,
    ) -> Result<Option<String>, ChannelError> {
        let dialog = self
            .agent_loop
            .register_msg(
                utterance,
                user_id,
                channel_type,
                channel_name.to_string(),
                require_response,
                None,
                message_attrs,
                reset_dialog,
            )
            .await
            .map_err(|e| ChannelError::Other(e.to_string()))?;

        let Some(dialog) = dialog else { return Ok(None) };
        match dialog.last_utterance() {
            Some(Utterance::Bot(b)) => Ok(Some(b.text.clone())),
            _ => Ok(None),
        }
    }
}
