//! Feed Aggregator - multi-source crypto market data with fallbacks

use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use feed_aggregator::{
    cli::{Cli, Command},
    config::Config,
    feeds::Aggregator,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Config) => print_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
        Some(Command::Gas { network }) => {
            let Some(aggregator) = build_aggregator(&config) else {
                return ExitCode::FAILURE;
            };
            report(aggregator.gas.snapshot(Some(&network)).await.map(|c| c.value))
        }
        Some(Command::Liquidations) => {
            let Some(aggregator) = build_aggregator(&config) else {
                return ExitCode::FAILURE;
            };
            report(aggregator.liquidations.snapshot().await.map(|c| c.value))
        }
        Some(Command::Whales) => {
            let Some(aggregator) = build_aggregator(&config) else {
                return ExitCode::FAILURE;
            };
            report(aggregator.whales.snapshot().await.map(|c| c.value))
        }
        Some(Command::BlockHeight) => {
            let Some(aggregator) = build_aggregator(&config) else {
                return ExitCode::FAILURE;
            };
            report(aggregator.block_height.snapshot().await.map(|c| c.value))
        }
    }
}

/// Print the effective configuration as YAML
fn print_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(&config.redacted()) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_aggregator(config: &Config) -> Option<Aggregator> {
    Aggregator::from_config(config)
        .inspect_err(|e| eprintln!("❌ Failed to build feeds: {e}"))
        .ok()
}

/// Print a one-shot snapshot as pretty JSON
fn report<T: Serialize>(result: feed_aggregator::Result<T>) -> ExitCode {
    let rendered = result.and_then(|value| Ok(serde_json::to_string_pretty(&value)?));
    match rendered {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        networks = config.feeds.gas.networks.len(),
        "Starting feed aggregator"
    );

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}
