//! The `agent` process role's broker gateway: consumes the agent's own
//! queue and routes each envelope to the right in-process collaborator.

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use parley_core::agent::AgentLoop;
use parley_types::transport::{Envelope, ToChannel};
use parley_types::{OrchestratorError, Utterance};

use crate::connector::PendingResponses;
use crate::topology::{
    declare_and_bind, declare_exchanges, exchange_in, exchange_out, queue_agent,
    routing_key_agent, routing_key_channel_any,
};

/// Consumes `ns_q_agent_<agent_name>` and, per envelope:
///
/// - `service_response` resolves the matching [`PendingResponses`]
///   waiter, which is what unblocks the in-flight [`BrokerConnector`](crate::connector::BrokerConnector)
///   call already running inside the ordinary [`AgentLoop`] dispatch
///   path -- no separate re-entry into the scheduler is needed.
/// - `from_channel` is a broker-mode channel's ingress message; answered
///   by calling [`AgentLoop::register_msg`] and publishing the resulting
///   bot reply back out as a `to_channel` envelope.
/// - `service_task` / `to_channel` arriving on this queue indicate a
///   misconfigured topology; logged and rejected without requeue.
pub struct AgentGateway {
    namespace: String,
    agent_name: String,
    in_channel: Channel,
    out_channel: Channel,
    pending: Arc<PendingResponses>,
    agent_loop: Arc<AgentLoop>,
}

impl AgentGateway {
    pub fn new(
        namespace: impl Into<String>,
        agent_name: impl Into<String>,
        in_channel: Channel,
        out_channel: Channel,
        pending: Arc<PendingResponses>,
        agent_loop: Arc<AgentLoop>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            agent_name: agent_name.into(),
            in_channel,
            out_channel,
            pending,
            agent_loop,
        }
    }

    /// Declare this agent's queue and consume it until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        declare_exchanges(&self.in_channel, &self.namespace).await?;

        let queue_name = queue_agent(&self.namespace, &self.agent_name);
        declare_and_bind(
            &self.in_channel,
            &queue_name,
            &exchange_in(&self.namespace),
            &routing_key_agent(&self.agent_name),
        )
        .await?;

        let consumer_tag = format!("{queue_name}-consumer");

        let mut consumer = self
            .in_channel
            .basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { return Ok(()) };
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(e) => {
                            error!(error = %e, "error receiving agent-queue delivery");
                            continue;
                        }
                    };

                    let envelope = match Envelope::from_json(&delivery.data) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(error = %e, "unparseable envelope on agent queue, rejecting");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                            continue;
                        }
                    };

                    match envelope {
                        Envelope::ServiceResponse(resp) => {
                            self.pending.resolve(resp);
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        }
                        Envelope::FromChannel(msg) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_from_channel(msg).await;
                            });
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        }
                        Envelope::ServiceTask(_) | Envelope::ToChannel(_) => {
                            warn!("unexpected envelope variant on agent queue, rejecting");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_from_channel(&self, msg: parley_types::transport::FromChannel) {
        let result = self
            .agent_loop
            .register_msg(
                msg.utterance,
                msg.user_id.clone(),
                msg.channel_id.clone(),
                msg.channel_id.clone(),
                true,
                None,
                Default::default(),
                msg.reset_dialog,
            )
            .await;

        let dialog = match result {
            Ok(dialog) => dialog,
            Err(e) => {
                error!(error = %e, "register_msg failed for broker-mode channel ingress");
                return;
            }
        };

        let Some(dialog) = dialog else { return };
        let response = match dialog.last_utterance() {
            Some(Utterance::Bot(b)) => b.text.clone(),
            _ => return,
        };

        let out = ToChannel {
            agent_name: self.agent_name.clone(),
            channel_id: msg.channel_id.clone(),
            user_id: msg.user_id,
            response,
        };
        let envelope = Envelope::ToChannel(out);
        let body = match envelope.to_json() {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode to_channel envelope");
                return;
            }
        };

        let exchange = exchange_out(&self.namespace);
        let routing_key = routing_key_channel_any(&self.agent_name, &msg.channel_id);
        if let Err(e) = self
            .out_channel
            .basic_publish(&exchange, &routing_key, BasicPublishOptions::default(), &body, Default::default())
            .await
        {
            error!(error = %e, "failed to publish to_channel envelope");
        }
    }
}
