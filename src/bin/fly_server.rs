use clap::Parser;
use flybywire::config::{ServerArgs, ServerConfig};
use flybywire::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let config = ServerConfig::load(args).await?;

    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config.root.is_dir() {
        anyhow::bail!("Root directory not found: {}", config.root.display());
    }

    server::run(config).await
}
