use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tonic::transport::{Channel, Endpoint};

use crate::error::NetworkError;
use crate::network::messages::tapestry as pb;
use crate::network::messages::tapestry::tapestry_node_client::TapestryNodeClient;
use crate::tapestry::id::Id;
use crate::tapestry::types::Neighbor;

/// Deadline for establishing a new transport connection.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for a liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for every other call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound channels cached by address and reused across calls, so repeated
/// RPCs to the same peer do not exhaust ports. Entries are discarded only
/// at process shutdown.
pub struct ConnectionPool {
    channels: RwLock<HashMap<String, Channel>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a client for the address, dialing at most once per address.
    /// Callers must not hold any node lock across this call.
    pub async fn client(&self, address: &str) -> Result<WeftGrpcClient, NetworkError> {
        if let Some(channel) = self.channels.read().unwrap().get(address).cloned() {
            return Ok(WeftGrpcClient::new(channel));
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", address, e)))?
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_nodelay(true);
        let channel = endpoint.connect().await.map_err(|e| {
            NetworkError::Transport(format!("failed to connect to {}: {}", address, e))
        })?;

        // Concurrent dials collapse onto whichever channel landed first.
        let mut channels = self.channels.write().unwrap();
        let channel = channels.entry(address.to_string()).or_insert(channel).clone();
        Ok(WeftGrpcClient::new(channel))
    }

    /// Drops every pooled channel. Used at process shutdown.
    pub fn clear(&self) {
        self.channels.write().unwrap().clear();
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits an RPC under its deadline. A missed deadline is indistinguishable
/// from peer failure.
async fn call<T, F>(deadline: Duration, fut: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(NetworkError::PeerUnreachable(status.to_string())),
        Err(_) => Err(NetworkError::PeerUnreachable(format!(
            "deadline exceeded after {:?}",
            deadline
        ))),
    }
}

pub struct WeftGrpcClient {
    inner: TapestryNodeClient<Channel>,
}

impl WeftGrpcClient {
    fn new(channel: Channel) -> Self {
        Self {
            inner: TapestryNodeClient::new(channel),
        }
    }

    pub async fn ping(&mut self) -> Result<(), NetworkError> {
        call(PROBE_TIMEOUT, self.inner.ping(pb::Nothing {})).await?;
        Ok(())
    }

    /// Ping with the round-trip time measured at the caller.
    pub async fn probe(&mut self) -> Result<Duration, NetworkError> {
        let start = Instant::now();
        self.ping().await?;
        Ok(start.elapsed())
    }

    pub async fn get_next_hop(&mut self, target: &Id) -> Result<(Neighbor, bool), NetworkError> {
        let response = call(
            REQUEST_TIMEOUT,
            self.inner.get_next_hop(pb::NextHopRequest {
                target: Some(target.into()),
            }),
        )
        .await?;
        let next_hop = response
            .next_hop
            .ok_or_else(|| NetworkError::Grpc("next hop missing from response".to_string()))?;
        Ok((Neighbor::try_from(next_hop)?, response.is_root))
    }

    pub async fn get_routing_table(&mut self) -> Result<Vec<Vec<Neighbor>>, NetworkError> {
        let response = call(REQUEST_TIMEOUT, self.inner.get_routing_table(pb::Nothing {})).await?;
        let mut entries = Vec::with_capacity(response.entries.len());
        for entry in response.entries {
            let mut slot = Vec::with_capacity(entry.neighbors.len());
            for neighbor in entry.neighbors {
                slot.push(Neighbor::try_from(neighbor)?);
            }
            entries.push(slot);
        }
        Ok(entries)
    }

    pub async fn add_backpointer(
        &mut self,
        from: &Neighbor,
        level: usize,
    ) -> Result<(), NetworkError> {
        call(
            REQUEST_TIMEOUT,
            self.inner.add_backpointer(pb::BackpointerRequest {
                from: Some(from.into()),
                level: level as u32,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn publish(
        &mut self,
        object_id: &Id,
        publisher: &Neighbor,
        hop_limit: u32,
    ) -> Result<(), NetworkError> {
        call(
            REQUEST_TIMEOUT,
            self.inner.publish(pb::PublishRequest {
                object_id: Some(object_id.into()),
                publisher: Some(publisher.into()),
                hop_limit,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn lookup(
        &mut self,
        object_id: &Id,
        hop_limit: u32,
    ) -> Result<(Vec<Neighbor>, bool), NetworkError> {
        let response = call(
            REQUEST_TIMEOUT,
            self.inner.lookup(pb::LookupRequest {
                object_id: Some(object_id.into()),
                hop_limit,
            }),
        )
        .await?;
        let mut publishers = Vec::with_capacity(response.publishers.len());
        for publisher in response.publishers {
            publishers.push(Neighbor::try_from(publisher)?);
        }
        Ok((publishers, response.found))
    }

    pub async fn fetch(&mut self, key: &str) -> Result<(Vec<u8>, bool), NetworkError> {
        let response = call(
            REQUEST_TIMEOUT,
            self.inner.fetch(pb::FetchRequest {
                key: key.to_string(),
            }),
        )
        .await?;
        Ok((response.data, response.found))
    }

    pub async fn replicate(&mut self, key: &str, data: &[u8]) -> Result<(), NetworkError> {
        let response = call(
            REQUEST_TIMEOUT,
            self.inner.replicate(pb::ReplicateRequest {
                key: key.to_string(),
                data: data.to_vec(),
            }),
        )
        .await?;
        if response.success {
            Ok(())
        } else {
            Err(NetworkError::Grpc(format!(
                "peer refused replica of '{}'",
                key
            )))
        }
    }

    pub async fn notify_leave(&mut self, leaving: &Neighbor) -> Result<(), NetworkError> {
        call(REQUEST_TIMEOUT, self.inner.notify_leave(pb::Neighbor::from(leaving))).await?;
        Ok(())
    }
}
