use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::error::{NetworkError, StorageError, WeftError};
use crate::tapestry::id::Id;
use crate::tapestry::types::{LocalObject, Neighbor, PointerEntry, TapestryNode};
use crate::tapestry::workers::POINTER_TIMEOUT;
use crate::tapestry::{MAX_HOPS, REPLICATION_FACTOR, SALT_COUNT};

/// Derives the object identifier for one salted publish/lookup path. Each
/// salt yields an independent root and therefore an independent route.
fn salted_object_id(key: &str, salt: usize) -> Id {
    Id::hash(&format!("{}-{}", key, salt))
}

impl TapestryNode {
    /// Stores an object locally, advertises it along every salted path, and
    /// pushes replicas to up to REPLICATION_FACTOR - 1 random neighbors.
    /// Publish and replication failures are logged and left to the
    /// republish cycle; they do not fail the store.
    pub async fn store_and_publish(self: Arc<Self>, key: &str, data: Vec<u8>) {
        let object_id = Id::hash(key);
        self.objects.write().unwrap().insert(
            object_id,
            LocalObject {
                key: key.to_string(),
                data: data.clone(),
            },
        );
        info!("stored object '{}' locally", key);

        self.clone().publish_salted(key.to_string()).await;

        // Replication is best-effort and must not block the caller.
        for target in self.table.random_neighbors(REPLICATION_FACTOR - 1) {
            let node = self.clone();
            let key = key.to_string();
            let data = data.clone();
            tokio::spawn(async move {
                match node.pool.client(&target.address).await {
                    Ok(mut client) => {
                        if let Err(e) = client.replicate(&key, &data).await {
                            warn!("replication of '{}' to {} failed: {}", key, target.address, e);
                        }
                    }
                    Err(e) => warn!(
                        "replication of '{}' failed: could not reach {}: {}",
                        key, target.address, e
                    ),
                }
            });
        }
    }

    /// Advertises one key along every salted path concurrently.
    pub async fn publish_salted(self: Arc<Self>, key: String) {
        let publisher = self.local_neighbor();
        let mut publishes = Vec::with_capacity(SALT_COUNT);
        for salt in 0..SALT_COUNT {
            let target = salted_object_id(&key, salt);
            let node = self.clone();
            let publisher = publisher.clone();
            let key = key.clone();
            publishes.push(async move {
                if let Err(e) = node.handle_publish(target, publisher, MAX_HOPS).await {
                    warn!("publish of '{}' (salt {}) failed: {}", key, salt, e);
                }
            });
        }
        join_all(publishes).await;
    }

    /// Retrieves an object: the local store first, then salted lookups
    /// followed by a fetch from the first live publisher.
    pub async fn get(&self, key: &str) -> Result<LocalObject, WeftError> {
        let object_id = Id::hash(key);
        if let Some(obj) = self.objects.read().unwrap().get(&object_id).cloned() {
            debug!("found '{}' locally", key);
            return Ok(obj);
        }

        for salt in 0..SALT_COUNT {
            let target = salted_object_id(key, salt);
            let (publishers, found) = match self.handle_lookup(target, MAX_HOPS).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("lookup of '{}' (salt {}) failed: {}", key, salt, e);
                    continue;
                }
            };
            if !found {
                continue;
            }
            for publisher in publishers {
                let mut client = match self.pool.client(&publisher.address).await {
                    Ok(client) => client,
                    Err(e) => {
                        debug!("publisher {} unreachable: {}", publisher.address, e);
                        continue;
                    }
                };
                match client.fetch(key).await {
                    Ok((data, true)) => {
                        debug!("fetched '{}' from {}", key, publisher.address);
                        return Ok(LocalObject {
                            key: key.to_string(),
                            data,
                        });
                    }
                    Ok((_, false)) => {
                        debug!("publisher {} no longer holds '{}'", publisher.address, key)
                    }
                    Err(e) => debug!("fetch of '{}' from {} failed: {}", key, publisher.address, e),
                }
            }
        }

        Err(StorageError::NotFound(key.to_string()).into())
    }

    /// Deletes an object from the local store. Pointers elsewhere age out
    /// through the soft-state sweep.
    pub fn remove(&self, key: &str) {
        let object_id = Id::hash(key);
        self.objects.write().unwrap().remove(&object_id);
        info!("deleted '{}' locally", key);
    }

    /// Publish handler: deposit the location pointer, then forward toward
    /// the object's root unless routing terminates here.
    pub async fn handle_publish(
        &self,
        object_id: Id,
        publisher: Neighbor,
        hop_limit: u32,
    ) -> Result<(), NetworkError> {
        self.add_location_pointer(object_id, publisher.clone());

        let (next_hop, is_root) = self.compute_next_hop(&object_id);
        if is_root || next_hop.id == self.id || hop_limit <= 1 {
            debug!(
                "terminating publish for {} (root={}, hops_left={})",
                object_id, is_root, hop_limit
            );
            return Ok(());
        }

        let mut client = self.pool.client(&next_hop.address).await?;
        client.publish(&object_id, &publisher, hop_limit - 1).await
    }

    /// Lookup handler: answer from the pointer cache, otherwise forward.
    pub async fn handle_lookup(
        &self,
        object_id: Id,
        hop_limit: u32,
    ) -> Result<(Vec<Neighbor>, bool), NetworkError> {
        let publishers = self.location_pointers(&object_id);
        if !publishers.is_empty() {
            debug!(
                "{} pointers for {} in the local cache",
                publishers.len(),
                object_id
            );
            return Ok((publishers, true));
        }

        let (next_hop, is_root) = self.compute_next_hop(&object_id);
        if is_root || next_hop.id == self.id || hop_limit <= 1 {
            return Ok((Vec::new(), false));
        }

        let mut client = self.pool.client(&next_hop.address).await?;
        client.lookup(&object_id, hop_limit - 1).await
    }

    /// Fetch handler: serve the payload from the local store.
    pub fn handle_fetch(&self, key: &str) -> Option<LocalObject> {
        let object_id = Id::hash(key);
        self.objects.read().unwrap().get(&object_id).cloned()
    }

    /// Replicate handler: store the replica, then advertise ourselves as a
    /// publisher off the RPC path.
    pub fn handle_replicate(self: Arc<Self>, key: String, data: Vec<u8>) {
        let object_id = Id::hash(&key);
        self.objects.write().unwrap().insert(
            object_id,
            LocalObject {
                key: key.clone(),
                data,
            },
        );
        info!("stored replica of '{}'", key);
        tokio::spawn(self.clone().publish_salted(key));
    }

    /// Records a location pointer for the object, refreshing the timestamp
    /// when the publisher is already present.
    pub fn add_location_pointer(&self, object_id: Id, publisher: Neighbor) {
        let mut pointers = self.pointers.write().unwrap();
        let entries = pointers.entry(object_id).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.neighbor.id == publisher.id) {
            entry.last_updated = Instant::now();
            return;
        }
        entries.push(PointerEntry {
            neighbor: publisher,
            last_updated: Instant::now(),
        });
    }

    /// The publishers currently known for the object.
    pub fn location_pointers(&self, object_id: &Id) -> Vec<Neighbor> {
        self.pointers
            .read()
            .unwrap()
            .get(object_id)
            .map(|entries| entries.iter().map(|e| e.neighbor.clone()).collect())
            .unwrap_or_default()
    }

    /// Drops pointers older than POINTER_TIMEOUT and empties dead keys.
    pub fn expire_pointers(&self) {
        let mut pointers = self.pointers.write().unwrap();
        pointers.retain(|_, entries| {
            entries.retain(|e| e.last_updated.elapsed() < POINTER_TIMEOUT);
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_node() -> Arc<TapestryNode> {
        Arc::new(TapestryNode::new(Id::ZERO, "local".to_string()))
    }

    #[test]
    fn repeated_publish_refreshes_without_duplicating() {
        let node = test_node();
        let object_id = Id::hash("obj");
        let publisher = Neighbor::new(Id::ZERO.with_digit(0, 1), "peer".to_string());

        node.add_location_pointer(object_id, publisher.clone());
        let first = node.pointers.read().unwrap()[&object_id][0].last_updated;
        node.add_location_pointer(object_id, publisher);

        let cache = node.pointers.read().unwrap();
        let entries = &cache[&object_id];
        assert_eq!(entries.len(), 1);
        assert!(entries[0].last_updated >= first);
    }

    #[test]
    fn distinct_publishers_accumulate() {
        let node = test_node();
        let object_id = Id::hash("obj");
        node.add_location_pointer(
            object_id,
            Neighbor::new(Id::ZERO.with_digit(0, 1), "a".to_string()),
        );
        node.add_location_pointer(
            object_id,
            Neighbor::new(Id::ZERO.with_digit(0, 2), "b".to_string()),
        );
        assert_eq!(node.location_pointers(&object_id).len(), 2);
    }

    #[test]
    fn expired_pointers_are_swept() {
        let node = test_node();
        let object_id = Id::hash("obj");
        node.pointers.write().unwrap().insert(
            object_id,
            vec![PointerEntry {
                neighbor: Neighbor::new(Id::ZERO.with_digit(0, 1), "peer".to_string()),
                last_updated: Instant::now() - POINTER_TIMEOUT - Duration::from_secs(1),
            }],
        );

        node.expire_pointers();
        assert!(node.pointers.read().unwrap().get(&object_id).is_none());
    }

    #[test]
    fn fresh_pointers_survive_the_sweep() {
        let node = test_node();
        let object_id = Id::hash("obj");
        node.add_location_pointer(
            object_id,
            Neighbor::new(Id::ZERO.with_digit(0, 1), "peer".to_string()),
        );
        node.expire_pointers();
        assert_eq!(node.location_pointers(&object_id).len(), 1);
    }

    #[tokio::test]
    async fn publish_with_exhausted_hop_limit_only_caches() {
        let node = test_node();
        // A forwardable neighbor exists, but hop limit 1 must terminate
        // locally without any network traffic.
        node.table.add(Neighbor::new(
            Id::ZERO.with_digit(0, 5),
            "unreachable".to_string(),
        ));
        let object_id = Id::ZERO.with_digit(0, 5).with_digit(1, 1);
        let publisher = Neighbor::new(Id::ZERO.with_digit(0, 2), "pub".to_string());

        node.handle_publish(object_id, publisher, 1).await.unwrap();
        assert_eq!(node.location_pointers(&object_id).len(), 1);
    }

    #[tokio::test]
    async fn lookup_answers_from_the_cache_without_forwarding() {
        let node = test_node();
        node.table.add(Neighbor::new(
            Id::ZERO.with_digit(0, 5),
            "unreachable".to_string(),
        ));
        let object_id = Id::ZERO.with_digit(0, 5).with_digit(1, 2);
        let publisher = Neighbor::new(Id::ZERO.with_digit(0, 2), "pub".to_string());
        node.add_location_pointer(object_id, publisher.clone());

        let (publishers, found) = node.handle_lookup(object_id, MAX_HOPS).await.unwrap();
        assert!(found);
        assert_eq!(publishers.len(), 1);
        assert_eq!(publishers[0].id, publisher.id);
    }

    #[tokio::test]
    async fn lookup_misses_cleanly_at_the_root() {
        let node = test_node();
        let (publishers, found) = node
            .handle_lookup(Id::hash("nothing"), MAX_HOPS)
            .await
            .unwrap();
        assert!(!found);
        assert!(publishers.is_empty());
    }

    #[test]
    fn fetch_round_trip_through_the_local_store() {
        let node = test_node();
        node.objects.write().unwrap().insert(
            Id::hash("k"),
            LocalObject {
                key: "k".to_string(),
                data: b"v".to_vec(),
            },
        );

        assert_eq!(node.handle_fetch("k").unwrap().data, b"v");
        assert!(node.handle_fetch("missing").is_none());
        node.remove("k");
        assert!(node.handle_fetch("k").is_none());
    }

    #[test]
    fn salted_paths_are_distinct() {
        let ids: Vec<Id> = (0..SALT_COUNT).map(|s| salted_object_id("key", s)).collect();
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], Id::hash("key"));
    }
}
