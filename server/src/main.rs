use clap::Parser;
use log::{error, info};
use server::broker::BrokerServer;
use server::config::{BrokerConfig, PortMode};
use shared::{Delimiter, SessionKind, DEFAULT_TICK_RATE};
use std::time::Duration;
use tokio::sync::watch;

/// Session broker: creates, lists, joins and destroys echo and game sessions.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Interface to bind the broker and its sessions to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Broker port
    #[clap(short, long, default_value = "8765")]
    port: u16,
    /// Host advertised in session addresses (defaults to --host)
    #[clap(long)]
    public_host: Option<String>,
    /// Frame delimiter: newline or pipe
    #[clap(short, long, default_value = "newline")]
    delimiter: Delimiter,
    /// Largest accepted frame in bytes
    #[clap(long, default_value = "65536")]
    max_frame_len: usize,
    /// How session ports are chosen: offset or ephemeral
    #[clap(long, default_value = "offset")]
    port_mode: PortMode,
    /// First session port in offset mode
    #[clap(long, default_value = "9000")]
    base_port: u16,
    /// Session kind used when `create` names none: echo or game
    #[clap(short, long, default_value = "echo")]
    kind: SessionKind,
    /// Game tick rate (updates per second)
    #[clap(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,
    /// Destroy empty sessions idle for this many seconds
    #[clap(long)]
    idle_timeout: Option<u64>,
    /// Score that ends a game
    #[clap(long)]
    win_score: Option<u32>,
}

impl From<Args> for BrokerConfig {
    fn from(args: Args) -> Self {
        let public_host = args.public_host.unwrap_or_else(|| args.host.clone());
        BrokerConfig {
            host: args.host,
            port: args.port,
            public_host,
            delimiter: args.delimiter,
            max_frame_len: args.max_frame_len,
            port_mode: args.port_mode,
            base_port: args.base_port,
            default_kind: args.kind,
            tick_rate: args.tick_rate,
            idle_timeout: args.idle_timeout.map(Duration::from_secs),
            win_score: args.win_score,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = BrokerConfig::from(Args::parse());
    info!(
        "Starting broker on {}:{} ({} delimiter, {} ports, {} Hz)",
        config.host, config.port, config.delimiter, config.port_mode, config.tick_rate
    );

    let server = BrokerServer::bind(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_handle = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Broker stopped"),
                Ok(Err(e)) => error!("Broker failed: {}", e),
                Err(e) => error!("Broker task panicked: {}", e),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    let _ = shutdown_tx.send(true);
    match server_handle.await {
        Ok(Err(e)) => error!("Broker failed during shutdown: {}", e),
        Err(e) => error!("Broker task panicked: {}", e),
        Ok(Ok(())) => info!("All sessions stopped"),
    }

    Ok(())
}
