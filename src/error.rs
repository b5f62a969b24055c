use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeftError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("gRPC error: {0}")]
    Grpc(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("failed to join overlay: {0}")]
    JoinFailed(String),

    #[error("invalid identifier: {0}")]
    Routing(#[from] RoutingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("invalid identifier length: expected 20 bytes, got {0}")]
    InvalidIdLength(usize),

    #[error("invalid identifier encoding: {0}")]
    InvalidIdEncoding(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
}
