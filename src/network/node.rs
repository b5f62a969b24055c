use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::timeout;

use crate::error::NetworkError;
use crate::network::grpc::{GrpcThread, PeerConfig};
use crate::tapestry::id::Id;
use crate::tapestry::types::{LocalObject, Neighbor, TapestryNode};
use crate::tapestry::workers::{run_maintenance_worker, run_republish_worker};
use crate::tapestry::BOOTSTRAP_PROBE_CONCURRENCY;

/// Neighbors receiving objects during a graceful exit.
const HANDOFF_FANOUT: usize = 3;
/// Cap on the whole handoff batch during a graceful exit.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);
/// Cap on the whole backpointer notification batch.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// A running overlay node: the shared node state plus its RPC server task.
pub struct WeftPeer {
    node: Arc<TapestryNode>,
    port: u16,
}

impl WeftPeer {
    /// Binds the RPC listener, creates the node state with a random
    /// identity, and starts the server task.
    pub async fn new(config: PeerConfig) -> Result<Self, NetworkError> {
        let listener =
            TcpListener::bind(("127.0.0.1", config.bind_port.unwrap_or(0))).await?;
        let port = listener.local_addr()?.port();
        let address = format!("127.0.0.1:{}", port);

        let node = Arc::new(TapestryNode::new(Id::random(), address));
        info!("node {} created on port {}", node.id, port);

        let (ready_tx, ready_rx) = oneshot::channel();
        let thread = GrpcThread::new(node.clone(), listener, ready_tx);
        tokio::spawn(async move {
            if let Err(e) = thread.run().await {
                error!("gRPC server task failed: {}", e);
            }
        });
        let _ = ready_rx.await;

        Ok(Self { node, port })
    }

    pub fn node(&self) -> Arc<TapestryNode> {
        self.node.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> &str {
        &self.node.address
    }

    /// Starts the maintenance and republish loops. They stop with the node.
    pub fn spawn_workers(&self) {
        tokio::spawn(run_maintenance_worker(self.node.clone()));
        tokio::spawn(run_republish_worker(self.node.clone()));
    }

    /// Joins the overlay through one of the bootstrap addresses: find a live
    /// gateway, locate the surrogate root for our identifier, bond with it,
    /// copy its table, and announce ourselves to every resulting neighbor.
    pub async fn join(&self, bootstrap_addrs: &[String]) -> Result<(), NetworkError> {
        let mut addrs: Vec<String> = bootstrap_addrs
            .iter()
            .filter(|a| a.as_str() != self.node.address)
            .cloned()
            .collect();
        {
            let mut rng = rand::thread_rng();
            addrs.shuffle(&mut rng);
        }

        let mut gateway = None;
        for addr in &addrs {
            debug!("attempting to join via {}", addr);
            match self.node.pool.client(addr).await {
                Ok(mut client) => match client.ping().await {
                    Ok(()) => {
                        gateway = Some((addr.clone(), client));
                        break;
                    }
                    Err(e) => debug!("gateway candidate {} not responding: {}", addr, e),
                },
                Err(e) => debug!("failed to dial gateway candidate {}: {}", addr, e),
            }
        }
        let (gateway_addr, mut gateway) = gateway.ok_or_else(|| {
            NetworkError::JoinFailed(format!(
                "no bootstrap node reachable in {:?}",
                bootstrap_addrs
            ))
        })?;
        info!("bonded with gateway {}", gateway_addr);

        let (surrogate, _) = gateway
            .get_next_hop(&self.node.id)
            .await
            .map_err(|e| NetworkError::JoinFailed(format!("surrogate route failed: {}", e)))?;

        // Bond with the surrogate; without it the node would be isolated.
        let mut bonded = false;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if self.node.add_neighbor_probed(surrogate.clone()).await {
                bonded = true;
                break;
            }
        }
        if !bonded {
            return Err(NetworkError::JoinFailed(format!(
                "could not bond with surrogate {}",
                surrogate.address
            )));
        }
        info!("added surrogate {} to the neighbor map", surrogate.id);

        match self.node.pool.client(&surrogate.address).await {
            Ok(mut client) => match client.get_routing_table().await {
                Ok(entries) => self.populate_table(entries).await,
                Err(e) => warn!("failed to copy the surrogate's routing table: {}", e),
            },
            Err(e) => warn!("failed to reconnect to surrogate {}: {}", surrogate.address, e),
        }

        self.notify_neighbors();
        Ok(())
    }

    /// Probes every candidate from the surrogate's table, a few dials at a
    /// time, inserting the ones that answer.
    async fn populate_table(&self, entries: Vec<Vec<Neighbor>>) {
        let sem = Arc::new(Semaphore::new(BOOTSTRAP_PROBE_CONCURRENCY));
        let mut probes = Vec::new();
        let mut count = 0;
        for slot in entries {
            for candidate in slot {
                if candidate.id == self.node.id {
                    continue;
                }
                count += 1;
                let node = self.node.clone();
                let sem = sem.clone();
                probes.push(tokio::spawn(async move {
                    if let Ok(_permit) = sem.acquire_owned().await {
                        node.add_neighbor_probed(candidate).await;
                    }
                }));
            }
        }
        join_all(probes).await;
        info!("bootstrap: processed {} candidates from the surrogate table", count);
    }

    /// Tells every neighbor to hold a backpointer to us, so they can warn
    /// us when they leave.
    fn notify_neighbors(&self) {
        let neighbors = self.node.table.snapshot();
        info!("notifying {} neighbors of our arrival", neighbors.len());

        let local = self.node.local_neighbor();
        for target in neighbors {
            let node = self.node.clone();
            let local = local.clone();
            tokio::spawn(async move {
                let level = local.id.shared_prefix_len(&target.id);
                match node.pool.client(&target.address).await {
                    Ok(mut client) => {
                        if let Err(e) = client.add_backpointer(&local, level).await {
                            debug!("backpointer notification to {} failed: {}", target.address, e);
                        }
                    }
                    Err(e) => debug!(
                        "could not reach {} for backpointer notification: {}",
                        target.address, e
                    ),
                }
            });
        }
    }

    /// Leaves the overlay gracefully: hand local objects to neighbors,
    /// notify everyone holding a backpointer, then stop.
    pub async fn leave(&self) {
        info!("node {} initiating graceful exit", self.node.id);
        self.redistribute_objects().await;
        self.notify_backpointers().await;
        self.node.signal_shutdown();
    }

    /// Pushes local objects to a few random neighbors round-robin before
    /// dying, bounded by HANDOFF_TIMEOUT.
    async fn redistribute_objects(&self) {
        let objects: Vec<LocalObject> =
            self.node.objects.read().unwrap().values().cloned().collect();
        if objects.is_empty() {
            return;
        }

        let candidates = self.node.table.random_neighbors(HANDOFF_FANOUT);
        if candidates.is_empty() {
            warn!("no neighbors available for handoff, {} objects will be lost", objects.len());
            return;
        }
        info!(
            "handing off {} objects to {} neighbors",
            objects.len(),
            candidates.len()
        );

        let mut transfers = Vec::with_capacity(objects.len());
        for (i, obj) in objects.into_iter().enumerate() {
            let target = candidates[i % candidates.len()].clone();
            let node = self.node.clone();
            transfers.push(async move {
                match node.pool.client(&target.address).await {
                    Ok(mut client) => match client.replicate(&obj.key, &obj.data).await {
                        Ok(()) => debug!("handed off '{}' to {}", obj.key, target.address),
                        Err(e) => {
                            warn!("handoff of '{}' to {} failed: {}", obj.key, target.address, e)
                        }
                    },
                    Err(e) => warn!(
                        "handoff of '{}' failed: could not reach {}: {}",
                        obj.key, target.address, e
                    ),
                }
            });
        }
        if timeout(HANDOFF_TIMEOUT, join_all(transfers)).await.is_err() {
            warn!("handoff timed out, some objects may be lost");
        }
    }

    /// Warns every node holding a backpointer to us, bounded by
    /// NOTIFY_TIMEOUT.
    async fn notify_backpointers(&self) {
        let backpointers: Vec<Neighbor> = self
            .node
            .backpointers
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        if backpointers.is_empty() {
            return;
        }

        let local = self.node.local_neighbor();
        let mut notifications = Vec::with_capacity(backpointers.len());
        for bp in backpointers {
            let node = self.node.clone();
            let local = local.clone();
            notifications.push(async move {
                if let Ok(mut client) = node.pool.client(&bp.address).await {
                    if let Err(e) = client.notify_leave(&local).await {
                        debug!("leave notification to {} failed: {}", bp.address, e);
                    }
                }
            });
        }
        if timeout(NOTIFY_TIMEOUT, join_all(notifications)).await.is_err() {
            warn!("backpointer notification timed out");
        }
    }

    /// Runs until interrupted, then performs the graceful exit.
    pub async fn run(&self) -> Result<(), NetworkError> {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received, leaving the overlay");
        self.leave().await;
        Ok(())
    }
}
