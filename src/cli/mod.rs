//! Command-line interface for the roster binary.

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "roster", version, about = "WebSocket presence and broadcast gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server (default when no subcommand is given)
    Start,
    /// Query a running gateway's health endpoint
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print version information
    Version,
}

/// `roster status`: fetch and pretty-print `/v1/health`.
pub async fn handle_status(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("http://{host}:{port}/v1/health");
    let resp = reqwest::get(&url).await?;
    let status = resp.status();
    let body: Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        return Err(format!("gateway returned {status}").into());
    }
    Ok(())
}

/// `roster version`.
pub fn handle_version() {
    println!("roster {}", env!("CARGO_PKG_VERSION"));
}
