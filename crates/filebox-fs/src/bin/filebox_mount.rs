//! filebox-mount: mount a filebox share through FUSE.
//!
//! # Usage
//!
//! ```bash
//! # Mount the share served on this host
//! filebox-mount /mnt/shared
//!
//! # Mount a remote share
//! filebox-mount /mnt/shared --server fileserver:8763
//!
//! # Unmount
//! fusermount -u /mnt/shared
//! ```

use clap::Parser;
use env_logger::Env;
use filebox_fs::{fuse, ClientAdapter, ClientConfig};
use log::{error, info};
use std::path::PathBuf;
use std::process;

/// Mount a filebox share as a local directory.
#[derive(Parser, Debug)]
#[command(name = "filebox-mount")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to mount the share on
    #[arg(value_name = "MOUNTPOINT")]
    mount_point: PathBuf,

    /// Server address (default: 127.0.0.1:8763)
    #[arg(short, long, value_name = "HOST:PORT")]
    server: Option<String>,

    /// TOML config file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    let mut config = match &args.config {
        Some(path) => match ClientConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server = server;
    }

    if !args.mount_point.is_dir() {
        error!("Mount point is not a directory: {}", args.mount_point.display());
        process::exit(1);
    }

    // FUSE callbacks block on this runtime from their own threads.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("filebox-net")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    info!("Connecting to {}", config.server);
    let adapter = match ClientAdapter::connect(config, runtime.handle().clone()) {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to connect: {}", e);
            process::exit(1);
        }
    };

    info!("Mounting at {}", args.mount_point.display());
    if let Err(e) = fuse::mount(adapter, &args.mount_point) {
        error!("{}", e);
        process::exit(1);
    }
    info!("Unmounted {}", args.mount_point.display());
}
