pub mod client;
pub mod server;
pub mod thread;

pub use client::{ConnectionPool, WeftGrpcClient};
pub use server::WeftGrpcServer;
pub use thread::GrpcThread;

/// Configuration for a weft peer node
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Optional RPC port (OS-assigned if not specified)
    pub bind_port: Option<u16>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self { bind_port: None }
    }
}
