use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::{interval_at, Instant};

use crate::tapestry::types::{Neighbor, TapestryNode};

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(20);
pub const POINTER_TIMEOUT: Duration = Duration::from_secs(120);
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);

/// Probes every neighbor and backpointer on a fixed cadence, removing the
/// ones that stopped answering, and sweeps expired location pointers.
pub async fn run_maintenance_worker(node: Arc<TapestryNode>) {
    info!("starting maintenance worker");
    let mut shutdown = node.shutdown_rx();
    if *shutdown.borrow_and_update() {
        return;
    }
    let mut ticker = interval_at(Instant::now() + MAINTENANCE_INTERVAL, MAINTENANCE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                run_keepalives(&node).await;
                node.expire_pointers();
            }
        }
    }
}

/// Re-advertises every local object so pointer soft state stays fresh at
/// all intermediate nodes, masking publish losses caused by churn since the
/// previous cycle.
pub async fn run_republish_worker(node: Arc<TapestryNode>) {
    info!("starting republish worker");
    let mut shutdown = node.shutdown_rx();
    if *shutdown.borrow_and_update() {
        return;
    }
    let mut ticker = interval_at(Instant::now() + REPUBLISH_INTERVAL, REPUBLISH_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                let keys: Vec<String> = node
                    .objects
                    .read()
                    .unwrap()
                    .values()
                    .map(|o| o.key.clone())
                    .collect();
                for key in keys {
                    tokio::spawn(node.clone().publish_salted(key));
                }
            }
        }
    }
}

async fn run_keepalives(node: &Arc<TapestryNode>) {
    // Snapshot under the read lock, probe with no lock held.
    let neighbors = node.table.snapshot();
    for nb in neighbors {
        if !probe_alive(node, &nb.address).await {
            warn!("neighbor {} unreachable, removing", nb.address);
            node.table.remove(&nb.id);
        }
    }

    let backpointers: Vec<Neighbor> = node
        .backpointers
        .read()
        .unwrap()
        .values()
        .cloned()
        .collect();
    for bp in backpointers {
        if !probe_alive(node, &bp.address).await {
            warn!("backpointer {} unreachable, removing", bp.address);
            node.backpointers.write().unwrap().remove(&bp.id);
        }
    }
}

async fn probe_alive(node: &Arc<TapestryNode>, address: &str) -> bool {
    match node.pool.client(address).await {
        Ok(mut client) => client.ping().await.is_ok(),
        Err(_) => false,
    }
}
