//! The `channel` process role's broker gateway: bridges one local
//! [`parley_channels::Channel`] front-end to the broker, with no
//! synchronous round trip -- ingress is fire-and-forget, replies arrive
//! later as `to_channel` envelopes on this gateway's own queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::Channel as AmqpChannel;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use parley_channels::traits::{Channel as ChannelTrait, ChannelHost};
use parley_types::error::ChannelError;
use parley_types::transport::{Envelope, FromChannel};
use parley_types::OrchestratorError;

use crate::topology::{
    declare_and_bind, declare_exchanges, exchange_in, exchange_out, queue_channel,
    routing_key_agent, routing_key_channel_any,
};

/// Bridges `channel` (a local front-end) to the broker for one agent
/// namespace. Implements [`ChannelHost`] itself: every inbound utterance
/// is published as a `from_channel` envelope and answered with
/// `Ok(None)` immediately, since there is no correlation id on the wire
/// to block a synchronous caller on -- the eventual reply arrives
/// asynchronously via [`ChannelGateway::run`] and is pushed to the user
/// through [`ChannelTrait::send`].
pub struct ChannelGateway {
    namespace: String,
    agent_name: String,
    channel_name: String,
    channel: Arc<dyn ChannelTrait>,
    in_channel: AmqpChannel,
    out_channel: AmqpChannel,
}

impl ChannelGateway {
    pub fn new(
        namespace: impl Into<String>,
        agent_name: impl Into<String>,
        channel: Arc<dyn ChannelTrait>,
        in_channel: AmqpChannel,
        out_channel: AmqpChannel,
    ) -> Self {
        let channel_name = channel.name().to_string();
        Self {
            namespace: namespace.into(),
            agent_name: agent_name.into(),
            channel_name,
            channel,
            in_channel,
            out_channel,
        }
    }

    /// Run both halves of the bridge: the local channel's own ingress
    /// loop (started with `self` as its [`ChannelHost`]) and this
    /// gateway's egress consume loop, until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        declare_exchanges(&self.in_channel, &self.namespace).await?;

        let queue_name = queue_channel(&self.namespace, &self.agent_name, &self.channel_name);
        let exchange = exchange_out(&self.namespace);
        let routing_key = routing_key_channel_any(&self.agent_name, &self.channel_name);
        declare_and_bind(&self.in_channel, &queue_name, &exchange, &routing_key).await?;

        let consumer_tag = format!("{queue_name}-consumer");
        let mut consumer = self
            .in_channel
            .basic_consume(&queue_name, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        let host: Arc<dyn ChannelHost> = self.clone();
        let channel_task_cancel = cancel.clone();
        let channel_clone = self.channel.clone();
        let channel_task = tokio::spawn(async move {
            if let Err(e) = channel_clone.start(host, channel_task_cancel).await {
                error!(error = %e, "channel front-end exited with an error");
            }
        });

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(e) => {
                            error!(error = %e, "error receiving channel-queue delivery");
                            continue;
                        }
                    };

                    let envelope = match Envelope::from_json(&delivery.data) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(error = %e, "unparseable envelope on channel queue, rejecting");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                            continue;
                        }
                    };

                    match envelope {
                        Envelope::ToChannel(msg) => {
                            if let Err(e) = self.channel.send(&msg.user_id, &msg.response, &HashMap::new()).await {
                                error!(error = %e, "channel front-end failed to deliver reply");
                            }
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        }
                        _ => {
                            warn!("unexpected envelope variant on channel queue, rejecting");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                        }
                    }
                }
            }
        }

        channel_task.abort();
        Ok(())
    }
}

#[async_trait]
impl ChannelHost for ChannelGateway {
    async fn register_msg(
        &self,
        channel_name: &str,
        utterance: String,
        user_id: String,
        _channel_type: String,
        _require_response: bool,
        _message_attrs: HashMap<String, Value>,
        reset_dialog: bool,
    ) -> Result<Option<String>, ChannelError> {
        let msg = FromChannel {
            agent_name: self.agent_name.clone(),
            channel_id: channel_name.to_string(),
            user_id,
            utterance,
            reset_dialog,
        };
        let envelope = Envelope::FromChannel(msg);
        let body = envelope
            .to_json()
            .map_err(|e| ChannelError::Other(format!("failed to encode from_channel: {e}")))?;

        let exchange = exchange_in(&self.namespace);
        let routing_key = routing_key_agent(&self.agent_name);
        self.out_channel
            .basic_publish(&exchange, &routing_key, BasicPublishOptions::default(), &body, Default::default())
            .await
            .map_err(|e| ChannelError::Other(format!("failed to publish from_channel: {e}")))?;

        Ok(None)
    }
}
