use super::krpc::{GetPeersReply, Krpc};
use super::node::{Node, NodeId};
use super::routing::RoutingTable;
use super::DhtResult;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Well-known routers used to seed an empty routing table.
pub const BOOTSTRAP_ROUTERS: [SocketAddrV4; 3] = [
    // router.bittorrent.com
    SocketAddrV4::new(Ipv4Addr::new(67, 215, 246, 10), 6881),
    // dht.transmissionbt.com
    SocketAddrV4::new(Ipv4Addr::new(87, 98, 162, 88), 6881),
    // router.utorrent.com
    SocketAddrV4::new(Ipv4Addr::new(82, 221, 103, 244), 6881),
];

/// Pause between lookup waves.
const WAVE_PAUSE: Duration = Duration::from_millis(100);

/// A DHT node: the KRPC endpoint plus the routing table it maintains.
///
/// Lookups proceed in waves. Every node of the current wavefront is queried
/// in parallel and the wave completes only when all of its queries have
/// resolved or timed out; the next wavefront is the 20 closest nodes that
/// have not been queried yet, so each wave makes strict progress toward the
/// target or terminates the lookup.
pub struct DhtServer {
    krpc: Krpc,
    routing_table: RoutingTable,
    routers: Vec<SocketAddrV4>,
}

impl DhtServer {
    /// Binds the UDP endpoint with the given local node id.
    pub async fn bind(bind: SocketAddr, local_id: NodeId) -> DhtResult<Self> {
        let krpc = Krpc::bind(bind, local_id).await?;
        info!(%local_id, ?bind, "DHT node up");
        Ok(Self {
            krpc,
            routing_table: RoutingTable::new(local_id),
            routers: BOOTSTRAP_ROUTERS.to_vec(),
        })
    }

    /// Fills the routing table by iteratively asking ever-closer nodes for
    /// nodes near our own id, starting from the fixed routers. Stops when a
    /// wave uncovers nothing new or `max_nodes` ids have been visited.
    #[instrument(skip(self), level = "debug")]
    pub async fn bootstrap(&mut self, max_nodes: usize) {
        let local_id = *self.routing_table.local_id();
        let mut known: HashSet<NodeId> = HashSet::new();
        // The routers' real ids are unknown until they answer; seed the
        // wavefront with placeholder entries carrying our own id.
        let mut wave: Vec<Node> = self
            .routers
            .iter()
            .map(|&addr| Node::new(local_id, addr))
            .collect();

        loop {
            let mut queries = JoinSet::new();
            for node in wave.drain(..) {
                let krpc = self.krpc.clone();
                queries.spawn(async move { krpc.find_node(node.addr, &local_id).await });
            }

            let mut candidates = Vec::new();
            let mut seen_this_wave = HashSet::new();
            while let Some(joined) = queries.join_next().await {
                let nodes = match joined {
                    Ok(Ok(nodes)) => nodes,
                    Ok(Err(e)) => {
                        debug!("find_node failed: {e}");
                        continue;
                    }
                    Err(e) => {
                        warn!("bootstrap query task failed: {e}");
                        continue;
                    }
                };
                for node in nodes {
                    self.routing_table.add(node.clone());
                    if !known.contains(&node.id) && seen_this_wave.insert(node.id) {
                        candidates.push(node);
                    }
                }
            }

            let closest = RoutingTable::closest_from(&local_id, candidates);
            if closest.is_empty() {
                break;
            }
            known.extend(closest.iter().map(|n| n.id));
            debug!(known = known.len(), wave = closest.len(), "bootstrap wave done");
            wave = closest;

            if known.len() > max_nodes {
                break;
            }
            tokio::time::sleep(WAVE_PAUSE).await;
        }
        info!(known = known.len(), "bootstrap finished");
    }

    /// Iterative `get_peers` lookup: walks toward `info_hash`, collecting
    /// peer endpoints from every node that has them, until a wave yields no
    /// node closer than what was already queried.
    #[instrument(skip(self, info_hash), level = "debug")]
    pub async fn get_peers(&mut self, info_hash: &[u8; 20]) -> HashSet<SocketAddrV4> {
        let target = NodeId::new(*info_hash);
        let mut known: HashSet<NodeId> = HashSet::new();
        let mut peers: HashSet<SocketAddrV4> = HashSet::new();
        let mut wave = self.routing_table.closest(&target);

        while !wave.is_empty() {
            let mut queries = JoinSet::new();
            for node in wave.drain(..) {
                let krpc = self.krpc.clone();
                let info_hash = *info_hash;
                queries.spawn(async move { krpc.get_peers(node.addr, &info_hash).await });
            }

            let mut candidates = Vec::new();
            let mut seen_this_wave = HashSet::new();
            while let Some(joined) = queries.join_next().await {
                match joined {
                    Ok(Ok(GetPeersReply::Peers(found))) => {
                        peers.extend(found);
                    }
                    Ok(Ok(GetPeersReply::Nodes(nodes))) => {
                        for node in nodes {
                            self.routing_table.add(node.clone());
                            if !known.contains(&node.id) && seen_this_wave.insert(node.id) {
                                candidates.push(node);
                            }
                        }
                    }
                    Ok(Err(e)) => debug!("get_peers failed: {e}"),
                    Err(e) => warn!("lookup query task failed: {e}"),
                }
            }

            let closest = RoutingTable::closest_from(&target, candidates);
            if closest.is_empty() {
                break;
            }
            known.extend(closest.iter().map(|n| n.id));
            debug!(
                known = known.len(),
                peers = peers.len(),
                "get_peers wave done"
            );
            wave = closest;
            tokio::time::sleep(WAVE_PAUSE).await;
        }

        info!(peers = peers.len(), "get_peers lookup finished");
        peers
    }

    #[cfg(test)]
    pub(crate) fn set_routers(&mut self, routers: Vec<SocketAddrV4>) {
        self.routers = routers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, encoder::encode_to_vec, BencodeValue};
    use tokio::net::UdpSocket;

    /// A single scripted DHT node. Answers `find_node` with itself as the
    /// only known node and `get_peers` with two fixed peer endpoints.
    async fn scripted_node(id: [u8; 20]) -> SocketAddrV4 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(query) = bencode::decode(&buf[..len]) else {
                    continue;
                };
                let tid = query.get(b"t").unwrap().as_bytes().unwrap().to_vec();
                let name = query.get(b"q").unwrap().as_bytes().unwrap().to_vec();

                let body = if name == b"find_node" {
                    let mut compact = id.to_vec();
                    compact.extend_from_slice(&addr.ip().octets());
                    compact.extend_from_slice(&addr.port().to_be_bytes());
                    BencodeValue::Dict(vec![
                        (b"id".to_vec(), BencodeValue::String(id.to_vec())),
                        (b"nodes".to_vec(), BencodeValue::String(compact)),
                    ])
                } else {
                    let peers = vec![
                        BencodeValue::String(vec![10, 0, 0, 1, 0x1a, 0xe1]),
                        BencodeValue::String(vec![10, 0, 0, 2, 0x1a, 0xe2]),
                    ];
                    BencodeValue::Dict(vec![
                        (b"id".to_vec(), BencodeValue::String(id.to_vec())),
                        (b"values".to_vec(), BencodeValue::List(peers)),
                    ])
                };

                let response = BencodeValue::Dict(vec![
                    (b"r".to_vec(), body),
                    (b"t".to_vec(), BencodeValue::String(tid)),
                    (b"y".to_vec(), BencodeValue::String(b"r".to_vec())),
                ]);
                socket
                    .send_to(&encode_to_vec(&response), from)
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn bootstrap_then_lookup_against_scripted_node() {
        let remote = scripted_node([0x42; 20]).await;

        let mut server = DhtServer::bind("127.0.0.1:0".parse().unwrap(), NodeId::random())
            .await
            .unwrap();
        server.set_routers(vec![remote]);

        // Wave 1 learns the scripted node's real id; wave 2 re-queries it
        // and uncovers nothing new, terminating the iteration.
        server.bootstrap(100).await;
        let closest = server.routing_table.closest(&NodeId::new([0x42; 20]));
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, NodeId::new([0x42; 20]));

        let peers = server.get_peers(&[0x99; 20]).await;
        let mut got: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        got.sort();
        assert_eq!(got, vec!["10.0.0.1:6881", "10.0.0.2:6882"]);
    }
}
