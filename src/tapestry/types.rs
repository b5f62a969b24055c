use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::network::grpc::ConnectionPool;
use crate::tapestry::id::Id;
use crate::tapestry::routing::NeighborMap;

/*
The identifier determines a peer's place in the overlay; the address is what
we actually dial. The two travel together everywhere a peer is referenced.
*/

/// A known peer: identity plus the transport address used to reach it. The
/// latency is the most recently measured round trip and orders entries
/// within a neighbor-map slot.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: Id,
    pub address: String,
    pub latency: Duration,
}

impl Neighbor {
    pub fn new(id: Id, address: String) -> Self {
        Self {
            id,
            address,
            latency: Duration::ZERO,
        }
    }
}

/// An application object held in the local store.
#[derive(Debug, Clone)]
pub struct LocalObject {
    pub key: String,
    pub data: Vec<u8>,
}

/// Soft-state record naming one publisher of an object. Refreshed by
/// republish, expired by the maintenance sweep.
#[derive(Debug, Clone)]
pub struct PointerEntry {
    pub neighbor: Neighbor,
    pub last_updated: Instant,
}

// Shared state types for concurrent access from handlers and workers.
pub type SharedObjects = Arc<RwLock<HashMap<Id, LocalObject>>>;
pub type SharedPointers = Arc<RwLock<HashMap<Id, Vec<PointerEntry>>>>;
pub type SharedBackpointers = Arc<RwLock<HashMap<Id, Neighbor>>>;

/// Per-node state: identity, the prefix routing table, the local object
/// store, the location-pointer cache, and the set of peers that hold this
/// node in their own tables. One lock per concern; no lock is ever held
/// across an outbound RPC.
pub struct TapestryNode {
    pub id: Id,
    pub address: String,
    pub table: NeighborMap,
    pub objects: SharedObjects,
    pub pointers: SharedPointers,
    pub backpointers: SharedBackpointers,
    pub pool: ConnectionPool,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl TapestryNode {
    pub fn new(id: Id, address: String) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id,
            address,
            table: NeighborMap::new(id),
            objects: Arc::new(RwLock::new(HashMap::new())),
            pointers: Arc::new(RwLock::new(HashMap::new())),
            backpointers: Arc::new(RwLock::new(HashMap::new())),
            pool: ConnectionPool::new(),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// The local node described as a neighbor record.
    pub fn local_neighbor(&self) -> Neighbor {
        Neighbor::new(self.id, self.address.clone())
    }

    /// Signals the RPC server and the background workers to stop and drops
    /// the pooled connections. Safe to call more than once; only the first
    /// call has an effect.
    pub fn signal_shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.pool.clear();
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
