//! Exchange, queue, and routing-key naming for one logical agent
//! namespace, plus declaration helpers shared by every gateway.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};

use parley_types::error::OrchestratorError;

/// Exchange carrying messages flowing *toward* the agent: service
/// responses and channel ingress.
pub fn exchange_in(namespace: &str) -> String {
    format!("{namespace}_e_in")
}

/// Exchange carrying messages flowing *away* from the agent: service
/// tasks and channel egress.
pub fn exchange_out(namespace: &str) -> String {
    format!("{namespace}_e_out")
}

/// Routing key for an agent's own inbound queue.
pub fn routing_key_agent(agent_name: &str) -> String {
    format!("agent.{agent_name}")
}

/// Routing key reaching any instance of service `service_name`.
pub fn routing_key_service_any(service_name: &str) -> String {
    format!("service.{service_name}.any")
}

/// Routing key reaching one specific service instance.
pub fn routing_key_service_instance(service_name: &str, instance_id: &str) -> String {
    format!("service.{service_name}.instance.{instance_id}")
}

/// Routing key reaching channel `channel_name` under agent `agent_name`.
pub fn routing_key_channel_any(agent_name: &str, channel_name: &str) -> String {
    format!("agent.{agent_name}.channel.{channel_name}.any")
}

/// Durable queue name for an agent.
pub fn queue_agent(namespace: &str, agent_name: &str) -> String {
    format!("{namespace}_q_agent_{agent_name}")
}

/// Durable, competing-consumer queue name for a service.
pub fn queue_service(namespace: &str, service_name: &str) -> String {
    format!("{namespace}_q_service_{service_name}")
}

/// Durable queue name for a channel under an agent.
pub fn queue_channel(namespace: &str, agent_name: &str, channel_name: &str) -> String {
    format!("{namespace}_{agent_name}_q_channel_{channel_name}")
}

/// Declare both topic exchanges for `namespace`, idempotently.
pub async fn declare_exchanges(channel: &Channel, namespace: &str) -> Result<(), OrchestratorError> {
    for exchange in [exchange_in(namespace), exchange_out(namespace)] {
        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
    }
    Ok(())
}

/// Declare a durable queue and bind it to `exchange` on `routing_key`.
/// Messages are expected to carry a per-message expiration set by the
/// publisher; this only configures the queue itself as durable.
pub async fn declare_and_bind(
    channel: &Channel,
    queue_name: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), OrchestratorError> {
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

    channel
        .queue_bind(
            queue_name,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_match_the_documented_scheme() {
        assert_eq!(routing_key_agent("main"), "agent.main");
        assert_eq!(routing_key_service_any("skill_x"), "service.skill_x.any");
        assert_eq!(
            routing_key_service_instance("skill_x", "i1"),
            "service.skill_x.instance.i1"
        );
        assert_eq!(
            routing_key_channel_any("main", "webhook"),
            "agent.main.channel.webhook.any"
        );
    }

    #[test]
    fn queue_names_are_namespaced() {
        assert_eq!(queue_agent("ns", "main"), "ns_q_agent_main");
        assert_eq!(queue_service("ns", "skill_x"), "ns_q_service_skill_x");
        assert_eq!(queue_channel("ns", "main", "webhook"), "ns_main_q_channel_webhook");
    }
}
