//! Weft: a decentralized object location and routing overlay.
//!
//! Every node owns a 160-bit identifier and routes messages toward target
//! identifiers by incremental hex-digit prefix matching. Objects are
//! advertised by depositing location pointers along the route to a
//! deterministic root node and retrieved by following those pointers back
//! to a publisher.

pub mod error;
pub mod network;
pub mod tapestry;
