use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use turbosocks::{ConfigOptions, Server, TcpServer, config};

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy gateway", long_about = None)]
struct Args {
    /// Listen host
    #[arg(long, env = "TURBO_HOST")]
    host: Option<String>,

    /// Listen port (1-65535)
    #[arg(short, long, env = "TURBO_PORT", allow_negative_numbers = true)]
    port: Option<i64>,

    /// Maximum concurrent connections
    #[arg(short, long, env = "TURBO_MAX_CONNECTIONS", allow_negative_numbers = true)]
    max_connections: Option<i64>,

    /// Client read timeout in milliseconds
    #[arg(long, env = "TURBO_LOCAL_READ_TIMEOUT", allow_negative_numbers = true)]
    local_read_timeout: Option<i64>,

    /// Client write timeout in milliseconds
    #[arg(long, env = "TURBO_LOCAL_WRITE_TIMEOUT", allow_negative_numbers = true)]
    local_write_timeout: Option<i64>,

    /// Destination connect timeout in milliseconds
    #[arg(long, env = "TURBO_REMOTE_CONN_TIMEOUT", allow_negative_numbers = true)]
    remote_conn_timeout: Option<i64>,

    /// Destination read timeout in milliseconds
    #[arg(long, env = "TURBO_REMOTE_READ_TIMEOUT", allow_negative_numbers = true)]
    remote_read_timeout: Option<i64>,

    /// Destination write timeout in milliseconds
    #[arg(long, env = "TURBO_REMOTE_WRITE_TIMEOUT", allow_negative_numbers = true)]
    remote_write_timeout: Option<i64>,

    /// Debug flag; anything but "off" enables debug logging
    #[arg(long, env = config::DEBUG_ENV)]
    debug: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose || config::debug_enabled(args.debug.as_deref()) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let config = ConfigOptions {
        host: args.host,
        port: args.port,
        max_connections: args.max_connections,
        local_read_timeout_ms: args.local_read_timeout,
        local_write_timeout_ms: args.local_write_timeout,
        remote_connect_timeout_ms: args.remote_conn_timeout,
        remote_read_timeout_ms: args.remote_read_timeout,
        remote_write_timeout_ms: args.remote_write_timeout,
    }
    .validate()
    .context("invalid configuration")?;

    // Instantiate server
    let server = Arc::new(TcpServer::new(config));
    info!(
        "Starting SOCKS5 proxy: {}://{} (max {} connections)",
        server.proto(),
        server.address(),
        server.config().max_connections
    );

    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("failed to listen for ctrl-c: {}", e);
            }
            info!("shutting down");
            if let Err(e) = server.stop().await {
                warn!("stop: {}", e);
            }
        }
        res = &mut runner => {
            // run only returns early if it failed to start
            return res.context("server task panicked")?.context("server failed");
        }
    }

    runner.await.context("server task panicked")??;

    let stats = server.statistics();
    info!(
        "served {} connections ({} rejected, {} still open)",
        stats.total_connections, stats.rejected_connections, stats.live_connections
    );

    Ok(())
}
