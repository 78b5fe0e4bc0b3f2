//! Gemini API MCP Server CLI entry point.

use clap::Parser;
use gemini_api_mcp::config::{Config, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_SECS};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Gemini API MCP Server - Exposes the Google Gemini REST API as MCP tools.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Gemini API base URL
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Gemini API key (falls back to GOOGLE_API_KEY)
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Per-request timeout in seconds (0 disables it)
    #[arg(long, env = "GEMINI_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Load the tool catalog from this OpenAPI-style YAML/JSON file
    #[arg(long, env = "GEMINI_MCP_CATALOG")]
    catalog: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; stdout carries MCP frames, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let api_key = args
        .api_key
        .or_else(|| std::env::var("GOOGLE_API_KEY").ok());

    let config = Config::new(&args.base_url)?
        .with_api_key(api_key)
        .with_timeout_secs(args.timeout_secs)
        .with_catalog(args.catalog);

    // Run the MCP server
    gemini_api_mcp::run_server(config).await
}
