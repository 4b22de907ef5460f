//! `parley service` -- runs one service's broker gateway, batching
//! `service_task`s into a registered [`ServiceCaller`], per the process
//! model's `service` role.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Args;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use parley_broker::connection::{build_pool, get_channel};
use parley_broker::{ServiceCaller, ServiceGateway};

#[derive(Args)]
pub struct ServiceArgs {
    /// Path to the configuration document (JSON or YAML); only `broker`
    /// settings are read.
    #[arg(short, long)]
    config: String,

    /// Broker namespace this service's queue lives under; must match the
    /// agent's `--namespace`.
    #[arg(long, default_value = "parley")]
    namespace: String,

    /// Service name, as referenced by `connector: { kind: broker }` in
    /// the agent's pipeline configuration.
    #[arg(long)]
    service_name: String,

    /// This instance's id, used for the `service.<name>.instance.<id>`
    /// routing key and reported on every `service_response`. Defaults to
    /// a freshly generated id.
    #[arg(long)]
    instance_id: Option<String>,

    /// Maximum batch size before a buffered batch is handed to inference.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Per-batch inference timeout, in seconds.
    #[arg(long, default_value_t = 5.0)]
    timeout_sec: f64,
}

/// Reference [`ServiceCaller`] that echoes each input back unchanged.
///
/// Stands in for a real inference backend so the broker wiring can be
/// exercised end to end; a production deployment registers its own
/// [`ServiceCaller`] in place of this one.
struct EchoServiceCaller;

#[async_trait]
impl ServiceCaller for EchoServiceCaller {
    async fn infer(&self, inputs: Vec<Value>) -> Result<Vec<Value>, String> {
        Ok(inputs)
    }
}

pub async fn run(args: ServiceArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    let instance_id = args.instance_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let pool = build_pool(&config.broker)?;
    let in_channel = get_channel(&pool).await;
    let out_channel = get_channel(&pool).await;

    let gateway = Arc::new(ServiceGateway::new(
        args.namespace,
        args.service_name.clone(),
        instance_id.clone(),
        args.batch_size,
        Duration::from_secs_f64(args.timeout_sec),
        in_channel,
        out_channel,
        Arc::new(EchoServiceCaller),
    ));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { gateway.run(run_cancel).await });

    info!(service = %args.service_name, %instance_id, "service running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    handle.await??;

    Ok(())
}
