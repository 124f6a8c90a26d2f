use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_fanout::{
    Server,
    cli::{Cli, Command, ServerArgs},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut server = Server::new(args.config());
    let addr = server.start().context("failed to start server")?;
    info!("server listening on {}", addr);

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }

    // Stopping joins the worker thread, so keep it off the async runtime.
    tokio::task::spawn_blocking(move || server.stop()).await?;
    Ok(())
}
