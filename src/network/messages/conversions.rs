use std::time::Duration;

use crate::error::RoutingError;
use crate::network::messages::tapestry as pb;
use crate::tapestry::id::Id;
use crate::tapestry::types::Neighbor;

impl From<&Id> for pb::NodeId {
    fn from(id: &Id) -> Self {
        pb::NodeId { bytes: id.to_vec() }
    }
}

impl TryFrom<pb::NodeId> for Id {
    type Error = RoutingError;

    fn try_from(id: pb::NodeId) -> Result<Self, Self::Error> {
        Id::from_bytes(&id.bytes)
    }
}

impl From<&Neighbor> for pb::Neighbor {
    fn from(neighbor: &Neighbor) -> Self {
        pb::Neighbor {
            id: Some((&neighbor.id).into()),
            address: neighbor.address.clone(),
        }
    }
}

impl TryFrom<pb::Neighbor> for Neighbor {
    type Error = RoutingError;

    fn try_from(neighbor: pb::Neighbor) -> Result<Self, Self::Error> {
        let id = neighbor.id.ok_or(RoutingError::InvalidIdLength(0))?;
        Ok(Neighbor {
            id: Id::from_bytes(&id.bytes)?,
            address: neighbor.address,
            latency: Duration::ZERO,
        })
    }
}
