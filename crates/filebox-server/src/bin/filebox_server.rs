//! filebox-server: share one directory with every connected mount.
//!
//! # Usage
//!
//! ```bash
//! # Serve /srv/shared on the default port
//! filebox-server --path /srv/shared
//!
//! # Then on each host: filebox-mount /mnt/shared --server server:8763
//! ```

use clap::Parser;
use env_logger::Env;
use filebox_server::{serve, ServerConfig};
use log::{error, info};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;

/// Serve a shared directory to filebox mounts.
#[derive(Parser, Debug)]
#[command(name = "filebox-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the shared directory
    #[arg(short = 'd', long, value_name = "DIR")]
    path: Option<PathBuf>,

    /// TCP port to listen on (default: 8763)
    #[arg(short, long)]
    port: Option<u16>,

    /// IP address to bind (default: 0.0.0.0)
    #[arg(long)]
    bind: Option<IpAddr>,

    /// TOML config file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    let mut config = match &args.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    match args.path {
        Some(path) => config.root = path,
        None if args.config.is_none() => {
            error!("No shared directory given; pass --path or --config");
            process::exit(1);
        }
        None => {}
    }
    if let Some(port) = args.port {
        config.listen.set_port(port);
    }
    if let Some(ip) = args.bind {
        config.listen = SocketAddr::new(ip, config.listen.port());
    }

    if !config.root.is_dir() {
        error!("Not a directory: {}", config.root.display());
        process::exit(1);
    }

    info!("Shared directory: {}", config.root.display());
    if let Err(e) = serve(config).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
