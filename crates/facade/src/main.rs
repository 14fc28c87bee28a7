mod config;
mod registry;

use std::path::PathBuf;

use clap::Parser;
use log::info;

use crate::{config::Config, registry::Registry};

#[derive(Parser, Debug)]
#[command(name = "facade", version, about = "A small VMess proxy")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `vmess=trace`. `RUST_LOG` overrides it.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let level = args
        .log_level
        .clone()
        .or_else(|| config.log.level.clone())
        .unwrap_or_else(|| "info".to_owned());
    env_logger::Builder::new()
        .parse_filters(&level)
        .parse_default_env()
        .init();

    info!(
        "loaded {} with {} inbounds and {} outbounds",
        args.config.display(),
        config.inbounds.len(),
        config.outbounds.len()
    );

    let registry = Registry::build(&config)?;
    registry.run().await?;

    Ok(())
}
