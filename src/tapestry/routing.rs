use std::sync::RwLock;

use log::debug;
use rand::seq::SliceRandom;

use crate::tapestry::id::{Id, DIGITS, RADIX};
use crate::tapestry::types::{Neighbor, TapestryNode};
use crate::tapestry::K_BACKUPS;

/// The per-node prefix routing table: a DIGITS x RADIX matrix of slots.
/// Slot (level, digit) holds up to 1 + K_BACKUPS neighbors whose identifier
/// shares exactly `level` leading digits with the local identifier and whose
/// digit at `level` equals `digit`, ordered by ascending round-trip time.
/// The head of a slot is the primary route for that digit.
pub struct NeighborMap {
    local_id: Id,
    rows: RwLock<[[Vec<Neighbor>; RADIX]; DIGITS]>,
}

impl NeighborMap {
    pub fn new(local_id: Id) -> Self {
        Self {
            local_id,
            rows: RwLock::new(std::array::from_fn(|_| std::array::from_fn(|_| Vec::new()))),
        }
    }

    /// Inserts or refreshes a neighbor. An entry with the same identifier
    /// has its latency updated in place; otherwise the neighbor is appended.
    /// The slot is then re-sorted by latency and trimmed to capacity.
    /// Returns false only when the neighbor cannot be placed because it is
    /// the local node itself.
    pub fn add(&self, neighbor: Neighbor) -> bool {
        if neighbor.id == self.local_id {
            return false;
        }
        let level = self.local_id.shared_prefix_len(&neighbor.id);
        if level >= DIGITS {
            return false;
        }
        let digit = neighbor.id.digit(level);

        let mut rows = self.rows.write().unwrap();
        let slot = &mut rows[level][digit];
        if let Some(existing) = slot.iter_mut().find(|n| n.id == neighbor.id) {
            existing.latency = neighbor.latency;
            existing.address = neighbor.address;
        } else {
            slot.push(neighbor);
        }
        slot.sort_by_key(|n| n.latency);
        slot.truncate(1 + K_BACKUPS);
        true
    }

    /// Removes the neighbor with the given identifier, preserving the order
    /// of the remaining entries. Returns whether an entry was removed.
    pub fn remove(&self, id: &Id) -> bool {
        let level = self.local_id.shared_prefix_len(id);
        if level >= DIGITS {
            return false;
        }
        let digit = id.digit(level);

        let mut rows = self.rows.write().unwrap();
        let slot = &mut rows[level][digit];
        match slot.iter().position(|n| n.id == *id) {
            Some(idx) => {
                slot.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Returns a copy of the slot's entries; empty for out-of-range indices.
    pub fn get(&self, level: usize, digit: usize) -> Vec<Neighbor> {
        if level >= DIGITS || digit >= RADIX {
            return Vec::new();
        }
        self.rows.read().unwrap()[level][digit].clone()
    }

    /// Every neighbor currently in the table.
    pub fn snapshot(&self) -> Vec<Neighbor> {
        let rows = self.rows.read().unwrap();
        rows.iter()
            .flat_map(|row| row.iter())
            .flat_map(|slot| slot.iter().cloned())
            .collect()
    }

    /// The full table, row-major, one entry list per (level, digit) slot.
    pub fn dump(&self) -> Vec<Vec<Neighbor>> {
        let rows = self.rows.read().unwrap();
        rows.iter().flat_map(|row| row.iter().cloned()).collect()
    }

    /// Up to `count` distinct neighbors chosen uniformly at random.
    pub fn random_neighbors(&self, count: usize) -> Vec<Neighbor> {
        let all = self.snapshot();
        let mut rng = rand::thread_rng();
        all.choose_multiple(&mut rng, count).cloned().collect()
    }

    pub fn size(&self) -> usize {
        let rows = self.rows.read().unwrap();
        rows.iter()
            .flat_map(|row| row.iter())
            .map(|slot| slot.len())
            .sum()
    }
}

impl TapestryNode {
    /// Computes the next hop toward `target`. Returns the chosen neighbor
    /// and whether the local node terminates routing as the target's root.
    pub fn compute_next_hop(&self, target: &Id) -> (Neighbor, bool) {
        if self.id == *target {
            return (self.local_neighbor(), true);
        }
        let level = self.id.shared_prefix_len(target);
        if level >= DIGITS {
            return (self.local_neighbor(), true);
        }

        let wanted = target.digit(level);
        if let Some(head) = self.table.get(level, wanted).into_iter().next() {
            return (head, false);
        }

        // Hole at the primary digit: scan upward through the digit space,
        // wrapping modulo the radix. Reaching our own digit proves no
        // closer candidate exists at this level.
        let own = self.id.digit(level);
        for offset in 1..RADIX {
            let digit = (wanted + offset) % RADIX;
            if digit == own {
                return (self.local_neighbor(), true);
            }
            if let Some(head) = self.table.get(level, digit).into_iter().next() {
                return (head, false);
            }
        }

        // Alone at this level; terminate as root.
        (self.local_neighbor(), true)
    }

    /// Measures the round-trip time to the candidate and inserts it into
    /// the neighbor map on success.
    pub async fn add_neighbor_probed(&self, mut neighbor: Neighbor) -> bool {
        if neighbor.id == self.id {
            return false;
        }
        let mut client = match self.pool.client(&neighbor.address).await {
            Ok(client) => client,
            Err(e) => {
                debug!("could not dial {}: {}", neighbor.address, e);
                return false;
            }
        };
        match client.probe().await {
            Ok(rtt) => {
                neighbor.latency = rtt;
                self.table.add(neighbor)
            }
            Err(e) => {
                debug!("probe of {} failed: {}", neighbor.address, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn neighbor(id: Id, address: &str, latency_ms: u64) -> Neighbor {
        Neighbor {
            id,
            address: address.to_string(),
            latency: Duration::from_millis(latency_ms),
        }
    }

    fn test_node() -> TapestryNode {
        TapestryNode::new(Id::ZERO, "local".to_string())
    }

    #[test]
    fn add_places_by_prefix_and_digit() {
        let local = Id::random();
        let map = NeighborMap::new(local);
        let digit = (local.digit(0) + 1) % RADIX;
        let nb = neighbor(local.with_digit(0, digit), "a", 100);
        assert!(map.add(nb.clone()));

        let slot = map.get(0, digit);
        assert_eq!(slot.len(), 1);
        assert_eq!(slot[0].id, nb.id);
        assert_eq!(local.shared_prefix_len(&slot[0].id), 0);
        assert_eq!(slot[0].id.digit(0), digit);
    }

    #[test]
    fn add_rejects_the_local_node() {
        let local = Id::random();
        let map = NeighborMap::new(local);
        assert!(!map.add(neighbor(local, "self", 1)));
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn add_updates_latency_in_place() {
        let map = NeighborMap::new(Id::ZERO);
        let id = Id::ZERO.with_digit(0, 5);
        map.add(neighbor(id, "a", 100));
        map.add(neighbor(id, "a", 50));

        let slot = map.get(0, 5);
        assert_eq!(slot.len(), 1);
        assert_eq!(slot[0].latency, Duration::from_millis(50));
    }

    #[test]
    fn slot_sorts_by_latency_and_evicts_the_worst() {
        let map = NeighborMap::new(Id::ZERO);
        let base = Id::ZERO.with_digit(0, 5);
        for (i, latency) in [300u64, 100, 200, 400].into_iter().enumerate() {
            map.add(neighbor(base.with_digit(1, i + 1), "addr", latency));
        }

        let slot = map.get(0, 5);
        assert_eq!(slot.len(), 1 + K_BACKUPS);
        let latencies: Vec<u64> = slot.iter().map(|n| n.latency.as_millis() as u64).collect();
        assert_eq!(latencies, vec![100, 200, 300]);
    }

    #[test]
    fn remove_preserves_remaining_order() {
        let map = NeighborMap::new(Id::ZERO);
        let base = Id::ZERO.with_digit(0, 3);
        let a = base.with_digit(1, 1);
        let b = base.with_digit(1, 2);
        let c = base.with_digit(1, 3);
        map.add(neighbor(a, "a", 10));
        map.add(neighbor(b, "b", 20));
        map.add(neighbor(c, "c", 30));

        assert!(map.remove(&b));
        assert!(!map.remove(&b));
        let ids: Vec<Id> = map.get(0, 3).iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn singleton_node_is_root_for_everything() {
        let node = test_node();
        let target = Id::ZERO.with_digit(0, 5);
        let (next_hop, is_root) = node.compute_next_hop(&target);
        assert!(is_root);
        assert_eq!(next_hop.id, node.id);
    }

    #[test]
    fn exact_match_is_root() {
        let node = test_node();
        let (next_hop, is_root) = node.compute_next_hop(&Id::ZERO);
        assert!(is_root);
        assert_eq!(next_hop.id, node.id);
    }

    #[test]
    fn routes_to_a_matching_neighbor() {
        let node = test_node();
        let nb_id = Id::ZERO.with_digit(0, 5);
        node.table.add(neighbor(nb_id, "remote", 10));

        let (next_hop, is_root) = node.compute_next_hop(&nb_id);
        assert!(!is_root);
        assert_eq!(next_hop.id, nb_id);
    }

    #[test]
    fn surrogate_scan_finds_the_next_populated_digit() {
        let node = test_node();
        // Target digit 5 is a hole; digit 9 is populated and sits before the
        // local digit (0) in wrap order.
        let nb_id = Id::ZERO.with_digit(0, 9);
        node.table.add(neighbor(nb_id, "remote", 10));

        let target = Id::ZERO.with_digit(0, 5).with_digit(1, 1);
        let (next_hop, is_root) = node.compute_next_hop(&target);
        assert!(!is_root);
        assert_eq!(next_hop.id, nb_id);
    }

    #[test]
    fn own_digit_terminates_the_scan() {
        let node = test_node();
        // Digit 3 is populated, but scanning up from 5 reaches the local
        // digit 0 first, so the local node fills the hole.
        let nb_id = Id::ZERO.with_digit(0, 3);
        node.table.add(neighbor(nb_id, "remote", 10));

        let target = Id::ZERO.with_digit(0, 5);
        let (next_hop, is_root) = node.compute_next_hop(&target);
        assert!(is_root);
        assert_eq!(next_hop.id, node.id);
    }

    #[test]
    fn hops_never_shorten_the_shared_prefix() {
        let node = test_node();
        let target = Id::ZERO.with_digit(3, 7).with_digit(4, 2);
        let nb = Id::ZERO.with_digit(3, 7).with_digit(5, 1);
        node.table.add(neighbor(nb, "remote", 10));

        let (next_hop, is_root) = node.compute_next_hop(&target);
        assert!(!is_root);
        assert!(next_hop.id.shared_prefix_len(&target) > node.id.shared_prefix_len(&target));
    }
}
