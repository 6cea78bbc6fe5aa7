use anyhow::Result;
use beach_relay::{telemetry::Telemetry, Cli, ServerConfig};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        dev_mode = config.relay.dev_mode,
        "starting beach-relay"
    );

    beach_relay::run(config, Some(telemetry.metrics_handle())).await
}
