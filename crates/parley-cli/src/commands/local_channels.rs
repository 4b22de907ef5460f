//! [`ChannelFactory`] implementations for the two channel front-ends
//! shipped in `parley-channels`, used by the `agent` role when wiring
//! channels in-process rather than through the broker's `channel` role.

use std::sync::Arc;

use parley_channels::stdio::StdioChannel;
use parley_channels::traits::{Channel, ChannelFactory};
use parley_channels::webhook::WebhookChannel;
use parley_types::error::ChannelError;
use serde_json::Value;

pub struct StdioChannelFactory;

impl ChannelFactory for StdioChannelFactory {
    fn channel_name(&self) -> &str {
        "stdio"
    }

    fn build(&self, config: &Value) -> Result<Arc<dyn Channel>, ChannelError> {
        let user_id = config
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or("cli-user");
        Ok(Arc::new(StdioChannel::new(user_id)))
    }
}

pub struct WebhookChannelFactory;

impl ChannelFactory for WebhookChannelFactory {
    fn channel_name(&self) -> &str {
        "webhook"
    }

    fn build(&self, config: &Value) -> Result<Arc<dyn Channel>, ChannelError> {
        let bind_addr = config
            .get("bind_addr")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Other("webhook channel requires bind_addr".into()))?;
        Ok(Arc::new(WebhookChannel::new(bind_addr)))
    }
}
