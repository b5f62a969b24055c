use clap::Parser;
use log::{error, info};
use weft::network::{grpc::PeerConfig, node::WeftPeer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "weft")]
#[command(about = "A Tapestry-style object location and routing overlay node")]
struct Cli {
    /// TCP port for this node's RPC server (OS-assigned if not specified)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Comma-separated bootstrap addresses; empty starts a new overlay
    #[arg(short = 'b', long = "bootstrap", value_delimiter = ',')]
    bootstrap: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    // Initialize logging with timestamp
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config = PeerConfig {
        bind_port: cli.port,
    };

    let peer = WeftPeer::new(config)
        .await
        .map_err(|e| format!("failed to create node: {}", e))?;

    info!("node listening on {}", peer.address());

    if cli.bootstrap.is_empty() {
        info!("no bootstrap addresses given, starting a new overlay as genesis node");
        info!(
            "other nodes can join using: weft -b {} -p <PORT>",
            peer.address()
        );
    } else if let Err(e) = peer.join(&cli.bootstrap).await {
        error!("failed to join overlay: {}", e);
        return Err(format!("failed to join overlay: {}", e));
    } else {
        info!("successfully joined the overlay");
    }

    peer.spawn_workers();

    if let Err(e) = peer.run().await {
        error!("node error: {}", e);
        return Err(format!("node error: {}", e));
    }

    info!("node shut down gracefully");
    Ok(())
}
