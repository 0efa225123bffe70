use super::node::{Node, NodeId};

/// Maximum number of nodes a bucket holds.
pub const BUCKET_CAPACITY: usize = 8;

/// One Kademlia bucket.
///
/// Buckets only ever arise by bisecting the root range, so every bucket
/// covers `[min, min + 2^(160 - prefix_len))` where `min` fixes the leading
/// `prefix_len` bits and zeroes the rest. Together the table's buckets tile
/// `[0, 2^160)` without overlap.
#[derive(Debug, Clone)]
pub struct Bucket {
    min: NodeId,
    prefix_len: usize,
    nodes: Vec<Node>,
}

impl Bucket {
    /// The initial bucket spanning the whole id space.
    pub fn root() -> Self {
        Self {
            min: NodeId::MIN,
            prefix_len: 0,
            nodes: Vec::new(),
        }
    }

    pub fn range_min(&self) -> &NodeId {
        &self.min
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        id.shares_prefix(&self.min, self.prefix_len)
    }

    /// A bucket may be bisected while its range width is at least
    /// [`BUCKET_CAPACITY`], i.e. 157 or fewer bits are fixed.
    pub fn can_split(&self) -> bool {
        self.prefix_len + 3 <= 160
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn good_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_good())
    }

    /// Inserts or refreshes `node`. Returns false when the bucket is full of
    /// good nodes and the caller must split or drop.
    ///
    /// A node already present is renewed in place. A full bucket first
    /// evicts its stale members and retries.
    pub fn add(&mut self, node: Node) -> bool {
        debug_assert!(self.contains(&node.id));

        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id) {
            existing.renew();
            return true;
        }
        if self.nodes.len() < BUCKET_CAPACITY {
            self.nodes.push(node);
            return true;
        }

        let before = self.nodes.len();
        self.nodes.retain(Node::is_good);
        if self.nodes.len() < before {
            self.nodes.push(node);
            return true;
        }
        false
    }

    /// Bisects the range. Good nodes are redistributed; stale ones are
    /// discarded.
    pub fn split(self) -> (Bucket, Bucket) {
        let mut lower = Bucket {
            min: self.min,
            prefix_len: self.prefix_len + 1,
            nodes: Vec::new(),
        };
        let mut upper = Bucket {
            min: self.min.with_bit(self.prefix_len),
            prefix_len: self.prefix_len + 1,
            nodes: Vec::new(),
        };

        for node in self.nodes.into_iter().filter(Node::is_good) {
            if node.id.bit(self.prefix_len) {
                upper.nodes.push(node);
            } else {
                lower.nodes.push(node);
            }
        }
        (lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::node::tests::id_from_msb;
    use crate::dht::node::GOOD_NODE_TTL;
    use std::net::SocketAddrV4;
    use std::time::Duration;

    fn node(msb: u8) -> Node {
        let addr: SocketAddrV4 = "127.0.0.1:6881".parse().unwrap();
        Node::new(id_from_msb(msb), addr)
    }

    #[test]
    fn root_bucket_accepts_up_to_capacity() {
        let mut bucket = Bucket::root();
        for i in 0..BUCKET_CAPACITY {
            assert!(bucket.add(node(i as u8)));
        }
        assert!(!bucket.add(node(0xff)));
        assert_eq!(bucket.iter().count(), BUCKET_CAPACITY);
    }

    #[test]
    fn re_adding_a_node_renews_instead_of_duplicating() {
        let mut bucket = Bucket::root();
        assert!(bucket.add(node(1)));
        assert!(bucket.add(node(1)));
        assert_eq!(bucket.iter().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_evicts_stale_nodes_for_newcomers() {
        let mut bucket = Bucket::root();
        for i in 0..BUCKET_CAPACITY {
            bucket.add(node(i as u8));
        }

        tokio::time::advance(GOOD_NODE_TTL + Duration::from_secs(1)).await;
        assert!(bucket.add(node(0xff)));
        // All stale members went away; only the newcomer remains.
        assert_eq!(bucket.iter().count(), 1);
        assert_eq!(bucket.iter().next().unwrap().id, id_from_msb(0xff));
    }

    #[test]
    fn split_bisects_and_redistributes() {
        let mut bucket = Bucket::root();
        bucket.add(node(0x10)); // below the midpoint
        bucket.add(node(0x90)); // above
        bucket.add(node(0xf0));

        let (lower, upper) = bucket.split();
        assert_eq!(lower.prefix_len(), 1);
        assert_eq!(upper.prefix_len(), 1);
        assert_eq!(upper.range_min(), &id_from_msb(0x80));
        assert_eq!(lower.iter().count(), 1);
        assert_eq!(upper.iter().count(), 2);
        assert!(lower.contains(&id_from_msb(0x7f)));
        assert!(upper.contains(&id_from_msb(0x80)));
        assert!(!upper.contains(&id_from_msb(0x7f)));
    }

    #[test]
    fn narrow_buckets_cannot_split() {
        let mut bucket = Bucket::root();
        for _ in 0..157 {
            bucket = bucket.split().0;
        }
        assert_eq!(bucket.prefix_len(), 157);
        assert!(bucket.can_split());
        let (bucket, _) = bucket.split();
        assert!(!bucket.can_split());
    }
}
