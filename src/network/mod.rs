pub mod grpc;
pub mod messages;
pub mod node;
