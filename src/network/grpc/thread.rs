use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::error::NetworkError;
use crate::network::grpc::server::WeftGrpcServer;
use crate::network::messages::tapestry::tapestry_node_server::TapestryNodeServer;
use crate::tapestry::types::TapestryNode;

/// Runs the node's gRPC server over an already-bound listener, so the
/// OS-assigned port is known before the server starts, and shuts it down
/// when the node's stop signal fires.
pub struct GrpcThread {
    node: Arc<TapestryNode>,
    listener: Option<TcpListener>,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl GrpcThread {
    pub fn new(
        node: Arc<TapestryNode>,
        listener: TcpListener,
        ready_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            node,
            listener: Some(listener),
            ready_tx: Some(ready_tx),
        }
    }

    pub async fn run(mut self) -> Result<(), NetworkError> {
        let listener = self.listener.take().expect("listener should be available");
        info!("starting gRPC server on {}", self.node.address);

        let service = WeftGrpcServer::new(self.node.clone());
        let mut shutdown = self.node.shutdown_rx();

        let server = Server::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .add_service(TapestryNodeServer::new(service));

        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(());
        }

        match server
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                if !*shutdown.borrow_and_update() {
                    let _ = shutdown.changed().await;
                }
            })
            .await
        {
            Ok(_) => {
                info!("gRPC server shut down gracefully");
                Ok(())
            }
            Err(e) => {
                error!("gRPC server encountered a fatal error: {:?}", e);
                Err(NetworkError::Grpc(format!("server error: {}", e)))
            }
        }
    }
}
