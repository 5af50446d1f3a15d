use clap::Parser;
use log::info;
use server::{Server, ServerConfig};
use std::time::Duration;

/// Invocation server: hosts the chat service for connected clients
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Longest single wait in the readiness loop, in milliseconds
    #[clap(long, default_value = "100")]
    select_timeout_ms: u64,
    /// Maximum number of logged on clients
    #[clap(short, long, default_value = "64")]
    max_clients: usize,
    /// Largest accepted frame, in bytes
    #[clap(long, default_value = "524288")]
    max_frame_len: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        select_timeout: Duration::from_millis(args.select_timeout_ms),
        max_clients: args.max_clients,
        max_frame_len: args.max_frame_len,
    };

    info!("Starting server on {}:{}", config.host, config.port);
    let server = Server::bind(config)?;
    server.run().await
}
