use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use ring_dht::dht::{read_peer_addr, write_cfg_file, DhtNode};

/// Node of a ring-structured distributed hash table storing string pairs,
/// speaking the DHTPv0.1 UDP protocol.
#[derive(Parser, Debug)]
#[command(name = "ring-dht", version)]
struct Cli {
    /// IP address to bind this node's UDP socket to
    my_ip: IpAddr,

    /// Maximum routing-table size; typically lg of the ring size
    num_routes: usize,

    /// File to publish this node's "<ip> <port>" line in
    cfg_file: PathBuf,

    /// Enable the read-through cache
    #[arg(long)]
    cache: bool,

    /// Echo every received and sent packet to standard error
    #[arg(long)]
    debug: bool,

    /// Bootstrap file of the predecessor to join through; without it this
    /// node starts a new ring
    #[arg(long)]
    pred_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // startup failures, bad usage included, exit with code 1
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let default_filter = if cli.debug { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let bind_addr = SocketAddr::new(cli.my_ip, 0).to_string();
    let node = match &cli.pred_file {
        Some(pred_file) => {
            let pred_addr = read_peer_addr(pred_file)?;
            DhtNode::start_joining(&bind_addr, pred_addr, cli.num_routes, cli.cache).await?
        }
        None => DhtNode::start_solo(&bind_addr, cli.num_routes, cli.cache).await?,
    };
    write_cfg_file(&cli.cfg_file, node.local_addr())?;
    info!(addr = %node.local_addr(), "serving");

    shutdown_signal().await?;
    info!("shutdown requested; leaving the ring");
    node.leave().await?;
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("installing ctrl-c handler")?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("installing ctrl-c handler")
    }
}
