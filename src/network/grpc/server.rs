use std::sync::Arc;

use log::{debug, info};
use tonic::{Request, Response, Status};

use crate::network::messages::tapestry as pb;
use crate::network::messages::tapestry::tapestry_node_server::TapestryNode as TapestryNodeService;
use crate::tapestry::id::{Id, DIGITS, RADIX};
use crate::tapestry::types::{Neighbor, TapestryNode};

/// The node's RPC surface. Handlers complete promptly; anything that needs
/// further network traffic is dispatched onto a background task.
pub struct WeftGrpcServer {
    node: Arc<TapestryNode>,
}

impl WeftGrpcServer {
    pub fn new(node: Arc<TapestryNode>) -> Self {
        Self { node }
    }
}

fn id_from_proto(id: Option<pb::NodeId>) -> Result<Id, Status> {
    let id = id.ok_or_else(|| Status::invalid_argument("missing identifier"))?;
    Id::try_from(id).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn neighbor_from_proto(neighbor: Option<pb::Neighbor>) -> Result<Neighbor, Status> {
    let neighbor = neighbor.ok_or_else(|| Status::invalid_argument("missing neighbor"))?;
    Neighbor::try_from(neighbor).map_err(|e| Status::invalid_argument(e.to_string()))
}

#[tonic::async_trait]
impl TapestryNodeService for WeftGrpcServer {
    async fn ping(
        &self,
        _request: Request<pb::Nothing>,
    ) -> Result<Response<pb::Nothing>, Status> {
        Ok(Response::new(pb::Nothing {}))
    }

    async fn get_next_hop(
        &self,
        request: Request<pb::NextHopRequest>,
    ) -> Result<Response<pb::NextHopResponse>, Status> {
        let req = request.into_inner();
        let target = id_from_proto(req.target)?;
        let (next_hop, is_root) = self.node.compute_next_hop(&target);
        Ok(Response::new(pb::NextHopResponse {
            next_hop: Some((&next_hop).into()),
            is_root,
        }))
    }

    async fn get_routing_table(
        &self,
        _request: Request<pb::Nothing>,
    ) -> Result<Response<pb::RoutingTableResponse>, Status> {
        let entries = self
            .node
            .table
            .dump()
            .into_iter()
            .map(|slot| pb::RoutingTableEntry {
                neighbors: slot.iter().map(pb::Neighbor::from).collect(),
            })
            .collect();
        Ok(Response::new(pb::RoutingTableResponse {
            entries,
            rows: DIGITS as u32,
            cols: RADIX as u32,
        }))
    }

    async fn add_backpointer(
        &self,
        request: Request<pb::BackpointerRequest>,
    ) -> Result<Response<pb::Nothing>, Status> {
        let req = request.into_inner();
        let source = neighbor_from_proto(req.from)?;
        self.node
            .backpointers
            .write()
            .unwrap()
            .insert(source.id, source.clone());
        debug!("recorded backpointer from {}", source.id);

        // Reciprocal bond: probe the sender off the RPC path.
        let node = self.node.clone();
        tokio::spawn(async move {
            if node.add_neighbor_probed(source.clone()).await {
                debug!("bonded backpointer source {} into the neighbor map", source.id);
            }
        });

        Ok(Response::new(pb::Nothing {}))
    }

    async fn publish(
        &self,
        request: Request<pb::PublishRequest>,
    ) -> Result<Response<pb::Nothing>, Status> {
        let req = request.into_inner();
        let object_id = id_from_proto(req.object_id)?;
        let publisher = neighbor_from_proto(req.publisher)?;
        debug!(
            "handling publish for {} (hops_left={})",
            object_id, req.hop_limit
        );
        self.node
            .handle_publish(object_id, publisher, req.hop_limit)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(pb::Nothing {}))
    }

    async fn lookup(
        &self,
        request: Request<pb::LookupRequest>,
    ) -> Result<Response<pb::LookupResponse>, Status> {
        let req = request.into_inner();
        let object_id = id_from_proto(req.object_id)?;
        let (publishers, found) = self
            .node
            .handle_lookup(object_id, req.hop_limit)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(pb::LookupResponse {
            publishers: publishers.iter().map(pb::Neighbor::from).collect(),
            found,
        }))
    }

    async fn fetch(
        &self,
        request: Request<pb::FetchRequest>,
    ) -> Result<Response<pb::FetchResponse>, Status> {
        let req = request.into_inner();
        match self.node.handle_fetch(&req.key) {
            Some(obj) => Ok(Response::new(pb::FetchResponse {
                data: obj.data,
                found: true,
            })),
            None => Ok(Response::new(pb::FetchResponse {
                data: Vec::new(),
                found: false,
            })),
        }
    }

    async fn replicate(
        &self,
        request: Request<pb::ReplicateRequest>,
    ) -> Result<Response<pb::ReplicateResponse>, Status> {
        let req = request.into_inner();
        self.node.clone().handle_replicate(req.key, req.data);
        Ok(Response::new(pb::ReplicateResponse { success: true }))
    }

    async fn notify_leave(
        &self,
        request: Request<pb::Neighbor>,
    ) -> Result<Response<pb::Nothing>, Status> {
        let leaving = Neighbor::try_from(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        info!("node {} is leaving, pruning it", leaving.id);
        self.node.table.remove(&leaving.id);
        self.node.backpointers.write().unwrap().remove(&leaving.id);
        Ok(Response::new(pb::Nothing {}))
    }
}
