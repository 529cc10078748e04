use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use memcached_router::{Config, Router};

const LISTEN_ADDR: &str = "0.0.0.0:11211";

#[derive(Parser)]
#[command(name = "router", about = "Transparent memcached binary-protocol router")]
struct Args {
    /// Config file path.
    #[arg(short = 'c', long = "config", default_value = "/etc/router/router.yaml")]
    config: PathBuf,
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;

    let router = Router::connect(LISTEN_ADDR, &config.servers)
        .await
        .context("starting router")?;
    router.serve().await.context("serving")?;
    Ok(())
}
