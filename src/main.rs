use anyhow::Context;
use clap::Parser;

use auth_gateway::cli::{Cli, LogFormat};
use auth_gateway::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    auth_gateway::setup_tracing(&cli.log_level, cli.log_format == LogFormat::Json);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    auth_gateway::server::serve(config)
        .await
        .context("server exited with an error")?;
    Ok(())
}
