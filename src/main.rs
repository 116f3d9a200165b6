mod apps;
mod bootloader;
mod cli;
mod client;
mod config;
mod delta;
mod http;
mod metadata;
mod model;
mod orchestrator;
mod registry;
mod rootfs;
mod status;
mod storage;
#[cfg(test)]
mod testing;
mod tree_store;

use std::io;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::Config;
use status::StatusCode;

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(StatusCode::UnknownError.code());
        }
    };

    init_tracing(&config.logging.level);

    match cli::run(&cli, config) {
        Ok(code) => {
            tracing::debug!(%code, "done");
            process::exit(code.code());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(StatusCode::UnknownError.code());
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
