use std::{net::SocketAddr, path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Builds uploaded projects into containers and keeps them running.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "shipwright.toml")]
    pub config: PathBuf,
    /// Address to serve the HTTP API on. Overrides `server.listen`.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
