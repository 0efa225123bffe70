use super::bucket::Bucket;
use super::node::{Node, NodeId};
use tracing::trace;

/// Nodes returned per lookup, the Kademlia `k` parameter.
pub const CLOSEST_K: usize = 20;

/// Kademlia routing table: a set of buckets tiling the 160-bit id space.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::root()],
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Inserts `node`, renewing it if already present. A full bucket splits
    /// only while its range covers the local id and is wide enough;
    /// otherwise the candidate is dropped.
    pub fn add(&mut self, node: Node) {
        loop {
            let Some(index) = self.buckets.iter().position(|b| b.contains(&node.id)) else {
                // The buckets tile the whole space; nothing to do if that
                // invariant is ever violated.
                return;
            };
            if self.buckets[index].add(node.clone()) {
                return;
            }

            let bucket = &self.buckets[index];
            if !(bucket.contains(&self.local_id) && bucket.can_split()) {
                trace!(node = %node, "bucket full, dropping candidate");
                return;
            }
            let (lower, upper) = self.buckets.swap_remove(index).split();
            self.buckets.push(lower);
            self.buckets.push(upper);
        }
    }

    /// The up-to-[`CLOSEST_K`] good nodes nearest `target` across all
    /// buckets.
    pub fn closest(&self, target: &NodeId) -> Vec<Node> {
        let all = self
            .buckets
            .iter()
            .flat_map(Bucket::good_nodes)
            .cloned()
            .collect::<Vec<_>>();
        Self::closest_from(target, all)
    }

    /// Sorts an arbitrary node collection by XOR distance to `target` and
    /// keeps the first [`CLOSEST_K`].
    pub fn closest_from(target: &NodeId, mut nodes: Vec<Node>) -> Vec<Node> {
        nodes.sort_by_key(|n| n.distance_to(target));
        nodes.truncate(CLOSEST_K);
        nodes
    }

    #[cfg(test)]
    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::node::tests::id_from_msb;
    use std::net::SocketAddrV4;

    fn node(msb: u8) -> Node {
        let addr: SocketAddrV4 = "127.0.0.1:6881".parse().unwrap();
        Node::new(id_from_msb(msb), addr)
    }

    /// End of a bucket's range as a 160-bit integer, or `None` for 2^160.
    fn bucket_end(bucket: &Bucket) -> Option<[u8; 20]> {
        if bucket.prefix_len() == 0 {
            return None;
        }
        let mut end = *bucket.range_min().as_bytes();
        // Add the bucket width: a 1 at the last fixed bit position.
        let bit = bucket.prefix_len() - 1;
        let mut byte = bit / 8;
        let mut carry = 0x80u16 >> (bit % 8);
        loop {
            let sum = end[byte] as u16 + carry;
            end[byte] = sum as u8;
            if sum < 0x100 {
                return Some(end);
            }
            if byte == 0 {
                return None;
            }
            byte -= 1;
            carry = 1;
        }
    }

    fn assert_tiles_id_space(table: &RoutingTable) {
        let mut buckets: Vec<&Bucket> = table.buckets().iter().collect();
        buckets.sort_by_key(|b| *b.range_min());

        assert_eq!(buckets[0].range_min(), &NodeId::MIN);
        for pair in buckets.windows(2) {
            assert_eq!(
                bucket_end(pair[0]),
                Some(*pair[1].range_min().as_bytes()),
                "gap or overlap between buckets"
            );
        }
        assert_eq!(bucket_end(buckets[buckets.len() - 1]), None);
    }

    #[test]
    fn ninth_insert_splits_the_root_bucket_once() {
        // Local id sits in the lower half.
        let mut table = RoutingTable::new(id_from_msb(0x01));

        // Five ids below the midpoint, four above: after one split neither
        // half exceeds capacity.
        for msb in [0x02, 0x0a, 0x21, 0x33, 0x90, 0xa0, 0xb5, 0xc2] {
            table.add(node(msb));
        }
        assert_eq!(table.buckets().len(), 1);

        table.add(node(0x44));
        assert_eq!(table.buckets().len(), 2, "exactly one split expected");
        assert!(table
            .buckets()
            .iter()
            .all(|b| b.prefix_len() == 1), "both halves span 2^159");
        assert_eq!(
            table.buckets().iter().map(|b| b.iter().count()).sum::<usize>(),
            9
        );
        assert_tiles_id_space(&table);
    }

    #[test]
    fn far_bucket_without_local_id_drops_instead_of_splitting() {
        let mut table = RoutingTable::new(id_from_msb(0x01));
        for msb in [0x02, 0x0a, 0x21, 0x33, 0x90, 0xa0, 0xb5, 0xc2, 0x44] {
            table.add(node(msb));
        }
        assert_eq!(table.buckets().len(), 2);

        // Fill the upper half (which does not contain 0x01...) to capacity,
        // then offer more: the table must not split it.
        for msb in [0x81, 0x85, 0x99, 0xd0] {
            table.add(node(msb));
        }
        let upper_count = |table: &RoutingTable| {
            table
                .buckets()
                .iter()
                .find(|b| b.contains(&id_from_msb(0x80)))
                .map(|b| b.iter().count())
                .unwrap_or(0)
        };
        assert_eq!(upper_count(&table), 8);

        table.add(node(0xee));
        assert_eq!(table.buckets().len(), 2, "unsplittable bucket must not split");
        assert_eq!(upper_count(&table), 8, "candidate must be dropped");
        assert_tiles_id_space(&table);
    }

    #[test]
    fn closest_sorts_by_xor_distance() {
        let mut table = RoutingTable::new(id_from_msb(0x01));
        for msb in [0xf0, 0x10, 0x80, 0x18] {
            table.add(node(msb));
        }
        let closest = table.closest(&id_from_msb(0x11));
        let order: Vec<u8> = closest.iter().map(|n| n.id.as_bytes()[0]).collect();
        // 0x10 ^ 0x11 = 1, 0x18 ^ 0x11 = 9, 0x80 ^ 0x11 = 0x91, 0xf0 ^ 0x11 = 0xe1.
        assert_eq!(order, vec![0x10, 0x18, 0x80, 0xf0]);
    }

    #[test]
    fn closest_from_caps_at_k() {
        let nodes: Vec<Node> = (0..64u8).map(node).collect();
        let closest = RoutingTable::closest_from(&NodeId::MIN, nodes);
        assert_eq!(closest.len(), CLOSEST_K);
        assert_eq!(closest[0].id, id_from_msb(0));
    }
}
