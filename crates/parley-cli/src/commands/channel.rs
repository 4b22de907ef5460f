//! `parley channel` -- bridges a single channel front-end to the broker,
//! per the process model's `channel` role.

use std::sync::Arc;

use anyhow::bail;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use parley_broker::connection::{build_pool, get_channel};
use parley_broker::ChannelGateway;
use parley_channels::traits::Channel;
use parley_channels::stdio::StdioChannel;
use parley_channels::webhook::WebhookChannel;

#[derive(Args)]
pub struct ChannelArgs {
    /// Path to the configuration document (JSON or YAML); only `broker`
    /// settings are read.
    #[arg(short, long)]
    config: String,

    /// Broker namespace this channel's queue lives under; must match the
    /// agent's `--namespace`.
    #[arg(long, default_value = "parley")]
    namespace: String,

    /// Name of the agent this channel delivers utterances to.
    #[arg(long)]
    agent_name: String,

    /// Run a stdio channel for this fixed user id.
    #[arg(long)]
    stdio_user: Option<String>,

    /// Run a webhook channel bound to this address.
    #[arg(long)]
    webhook_addr: Option<String>,
}

pub async fn run(args: ChannelArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;

    let channel: Arc<dyn Channel> = match (&args.stdio_user, &args.webhook_addr) {
        (Some(user_id), None) => Arc::new(StdioChannel::new(user_id.clone())),
        (None, Some(addr)) => Arc::new(WebhookChannel::new(addr.clone())),
        (Some(_), Some(_)) => bail!("pass exactly one of --stdio-user or --webhook-addr"),
        (None, None) => bail!("pass one of --stdio-user or --webhook-addr"),
    };
    let channel_name = channel.name().to_string();

    let pool = build_pool(&config.broker)?;
    let in_channel = get_channel(&pool).await;
    let out_channel = get_channel(&pool).await;

    let gateway = Arc::new(ChannelGateway::new(
        args.namespace,
        args.agent_name.clone(),
        channel,
        in_channel,
        out_channel,
    ));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { gateway.run(run_cancel).await });

    info!(channel = %channel_name, agent_name = %args.agent_name, "channel running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    handle.await??;

    Ok(())
}
