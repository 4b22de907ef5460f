//! `parley agent` -- runs the pipeline + workflow manager, fed by any
//! combination of local (in-process) channels and the broker's agent
//! gateway, per the process model's `agent` role.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use parley_broker::connection::{build_pool, get_channel};
use parley_broker::{AgentGateway, BrokerConnector, PendingResponses};
use parley_core::connector::Connector;
use parley_core::pipeline::build_pipeline_with_broker;
use parley_core::storage::InMemoryDialogRepository;
use parley_core::AgentLoop;
use parley_types::config::{Config, ConnectorConfig, ConnectorRef};
use parley_channels::PluginHost;

use super::local_channels::{StdioChannelFactory, WebhookChannelFactory};
use super::LocalChannelHost;

#[derive(Args)]
pub struct AgentArgs {
    /// Path to the configuration document (JSON or YAML).
    #[arg(short, long)]
    config: String,

    /// Broker namespace this agent's exchanges and queues live under.
    #[arg(long, default_value = "parley")]
    namespace: String,

    /// Register a local stdio channel for the given fixed user id.
    #[arg(long)]
    stdio_user: Option<String>,

    /// Register a local webhook channel bound to the given address.
    #[arg(long)]
    webhook_addr: Option<String>,
}

/// Resolve the service names whose connector is `ConnectorConfig::Broker`,
/// following a `Named` reference into `config.connectors` where needed.
fn broker_service_names(config: &Config) -> Vec<String> {
    config
        .services
        .iter()
        .filter(|(_, svc)| {
            let resolved = match &svc.connector {
                ConnectorRef::Inline(c) => Some(c),
                ConnectorRef::Named(name) => config.connectors.get(name),
            };
            matches!(resolved, Some(ConnectorConfig::Broker { .. }))
        })
        .map(|(name, _)| name.clone())
        .collect()
}

pub async fn run(args: AgentArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    let response_timeout = Duration::from_secs_f64(config.response_timeout_sec);

    let repository = Arc::new(InMemoryDialogRepository::new());
    let broker_services = broker_service_names(&config);

    let (pipeline, gateway_handle) = if broker_services.is_empty() {
        let pipeline = build_pipeline_with_broker(&config, &HashMap::new())?;
        (pipeline, None)
    } else {
        let pool = build_pool(&config.broker)?;
        let out_channel = get_channel(&pool).await;
        let pending = Arc::new(PendingResponses::new());

        let mut broker_connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();
        for service_name in &broker_services {
            let connector = BrokerConnector::new(
                args.namespace.as_str(),
                config.agent_name.as_str(),
                service_name.as_str(),
                out_channel.clone(),
                pending.clone(),
                response_timeout,
            );
            broker_connectors.insert(service_name.clone(), Arc::new(connector));
        }

        let pipeline = build_pipeline_with_broker(&config, &broker_connectors)?;
        let agent_in_channel = get_channel(&pool).await;

        (pipeline, Some((agent_in_channel, out_channel, pending)))
    };

    let agent_loop = AgentLoop::new(pipeline, repository, response_timeout);
    let cancel = CancellationToken::new();

    let broker_task = if let Some((in_channel, out_channel, pending)) = gateway_handle {
        let gateway = Arc::new(AgentGateway::new(
            args.namespace.clone(),
            config.agent_name.clone(),
            in_channel,
            out_channel,
            pending,
            agent_loop.clone(),
        ));
        let gateway_cancel = cancel.clone();
        Some(tokio::spawn(async move { gateway.run(gateway_cancel).await }))
    } else {
        None
    };

    let plugin_host = if args.stdio_user.is_some() || args.webhook_addr.is_some() {
        let host = Arc::new(PluginHost::new(Arc::new(LocalChannelHost::new(agent_loop.clone()))));
        host.register_factory(Arc::new(StdioChannelFactory)).await;
        host.register_factory(Arc::new(WebhookChannelFactory)).await;

        if let Some(user_id) = &args.stdio_user {
            host.init_channel("stdio", &serde_json::json!({ "user_id": user_id })).await?;
        }
        if let Some(addr) = &args.webhook_addr {
            host.init_channel("webhook", &serde_json::json!({ "bind_addr": addr })).await?;
        }
        host.start_all().await;
        Some(host)
    } else {
        None
    };

    info!(agent_name = %config.agent_name, "agent running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    if let Some(host) = &plugin_host {
        host.stop_all().await;
    }
    if let Some(handle) = broker_task {
        let _ = handle.await;
    }

    Ok(())
}
