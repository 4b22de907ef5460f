//! Channel plugin trait definitions.
//!
//! - [`Channel`] -- implemented by each channel front-end (stdio, webhook,
//!   and any future platform integration).
//! - [`ChannelHost`] -- implemented by the process that owns an
//!   [`parley_core::AgentLoop`], consumed by channels to deliver inbound
//!   utterances without holding a direct dependency on `parley-core`.
//! - [`ChannelFactory`] -- implemented by channels, consumed by
//!   [`crate::host::PluginHost`] to build them from JSON configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use parley_types::error::ChannelError;

/// Metadata describing a channel's capabilities.
#[derive(Debug, Clone)]
pub struct ChannelMetadata {
    /// Channel identifier (e.g. `"stdio"`, `"webhook"`).
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Whether replies can be pushed to the user outside of an
    /// immediate request/response cycle.
    pub supports_push: bool,
}

/// Lifecycle status of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Stopped,
    Starting,
    Running,
    Error(String),
    Stopping,
}

/// Identifier of a message successfully delivered by [`Channel::send`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

/// The trait every channel front-end implements.
///
/// A channel represents one front door into the orchestrator: it reads
/// utterances from some transport and hands them to the host via
/// [`ChannelHost::register_msg`], and it implements [`Channel::send`] so
/// the host can push a reply back out once a workflow flushes.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel identifier.
    fn name(&self) -> &str;

    /// Capability metadata.
    fn metadata(&self) -> ChannelMetadata;

    /// Current lifecycle status.
    fn status(&self) -> ChannelStatus;

    /// `true` if `sender_id` is allowed to interact with this channel
    /// (an empty allow-list admits everyone).
    fn is_allowed(&self, sender_id: &str) -> bool;

    /// Start receiving messages. Long-lived: runs until `cancel` fires.
    async fn start(
        &self,
        host: Arc<dyn ChannelHost>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError>;

    /// Push `text` to `user_id` through this channel, outside of an
    /// in-flight request/response cycle.
    async fn send(
        &self,
        user_id: &str,
        text: &str,
        attrs: &HashMap<String, Value>,
    ) -> Result<MessageId, ChannelError>;
}

/// Services the host exposes to channels.
///
/// A thin, channel-agnostic facade over [`parley_core::AgentLoop::register_msg`]
/// so this crate never depends on `parley-core` directly -- the process
/// entry point (`parley-cli`) is the one place both are wired together.
#[async_trait]
pub trait ChannelHost: Send + Sync {
    /// Deliver an inbound utterance to the agent loop. Returns the bot's
    /// reply text when `require_response` is true and a reply was
    /// produced before the deadline; `None` in fire-and-forget mode.
    #[allow(clippy::too_many_arguments)]
    async fn register_msg(
        &self,
        channel_name: &str,
        utterance: String,
        user_id: String,
        channel_type: String,
        require_response: bool,
        message_attrs: HashMap<String, Value>,
        reset_dialog: bool,
    ) -> Result<Option<String>, ChannelError>;
}

/// Builds [`Channel`] instances from JSON configuration.
pub trait ChannelFactory: Send + Sync {
    /// The channel name this factory creates.
    fn channel_name(&self) -> &str;

    /// Create a channel instance from its JSON config section.
    fn build(&self, config: &Value) -> Result<Arc<dyn Channel>, ChannelError>;
}
