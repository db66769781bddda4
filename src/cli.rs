//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-source crypto market feed aggregator
#[derive(Parser, Debug)]
#[command(name = "feed-aggregator")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FEED_AGGREGATOR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "FEED_AGGREGATOR_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "FEED_AGGREGATOR_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "FEED_AGGREGATOR_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FEED_AGGREGATOR_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server (default)
    Serve,

    /// Fetch gas prices once and print them as JSON
    Gas {
        /// Network name, or `all`
        #[arg(short, long, default_value = "all")]
        network: String,
    },

    /// Fetch recent liquidations once and print them as JSON
    Liquidations,

    /// Fetch recent whale transactions once and print them as JSON
    Whales,

    /// Fetch the Bitcoin block height once and print it as JSON
    BlockHeight,

    /// Print the effective configuration with API keys masked
    Config,
}
