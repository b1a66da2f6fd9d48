//! Kademlia DHT node: owns one UDP socket, drives `ping`/`find_node`/
//! `get_peers`/`announce_peer` KRPC exchanges and the iterative lookup
//! Long-lived and explicitly constructed — never ambient global state.

use crate::dht::krpc::{self, Body, Envelope};
use crate::dht::routing_table::{Contact, InsertOutcome, RoutingTable, K};
use crate::id::Id20;
use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use log::{debug, trace};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const ALPHA: usize = 3;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_RETRIES: usize = 2;
const TOKEN: Token = Token(0);

pub struct DhtNode {
    socket: UdpSocket,
    poll: Poll,
    routing_table: RoutingTable,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    node_id: Id20,
    contacts: Vec<(Id20, SocketAddr)>,
}

impl DhtNode {
    /// Binds the DHT's UDP socket. `local_id` is this process's persistent
    /// node id (random on first run, reloaded via `load_state` afterwards).
    pub fn listen(port: u16, local_id: Id20) -> Result<DhtNode> {
        let mut socket = UdpSocket::bind(format!("0.0.0.0:{port}").parse()?)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, TOKEN, Interest::READABLE)?;
        Ok(DhtNode {
            socket,
            poll,
            routing_table: RoutingTable::new(local_id),
        })
    }

    pub fn local_id(&self) -> Id20 {
        self.routing_table.local_id()
    }

    /// Pings each seed, inserting any that answer into the routing table.
    pub fn bootstrap(&mut self, seeds: &[SocketAddr]) -> Result<()> {
        let local_id = self.local_id();
        for &seed in seeds {
            match self.query(seed, |tx| Envelope::ping(tx, local_id)) {
                Ok(KrpcReply::Peers { id, .. }) | Ok(KrpcReply::CloserNodes { id, .. }) => {
                    self.note_contact(id, seed)
                }
                Err(e) => debug!("bootstrap node {seed} did not answer: {e}"),
            }
        }
        Ok(())
    }

    /// Iterative `get_peers` lookup. Endpoints are emitted to
    /// `out` as soon as they are discovered rather than buffered.
    pub fn get_peers(&mut self, info_hash: Id20, out: Sender<SocketAddr>) -> Result<()> {
        let local_id = self.local_id();
        let mut shortlist = self.routing_table.closest(&info_hash, K);
        let mut queried: HashMap<Id20, bool> = HashMap::new();

        loop {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains_key(&c.id))
                .take(ALPHA)
                .cloned()
                .collect();

            if candidates.is_empty() {
                break;
            }

            for contact in candidates {
                queried.insert(contact.id, true);
                match self.query(contact.addr, |tx| Envelope::get_peers(tx, local_id, info_hash)) {
                    Ok(KrpcReply::Peers { id, peers }) => {
                        self.note_contact(id, contact.addr);
                        for peer in peers {
                            let _ = out.send(peer);
                        }
                    }
                    Ok(KrpcReply::CloserNodes { id, nodes }) => {
                        self.note_contact(id, contact.addr);
                        for node in nodes {
                            if !queried.contains_key(&node.id) {
                                shortlist.push(Contact {
                                    id: node.id,
                                    addr: node.addr,
                                    last_seen: Instant::now(),
                                });
                            }
                        }
                        shortlist.sort_by_key(|c| c.id.distance(&info_hash));
                        shortlist.truncate(K);
                    }
                    Err(e) => {
                        trace!("get_peers to {}: {e}", contact.addr);
                    }
                }
            }
        }

        Ok(())
    }

    /// One query/response round-trip with retry, demultiplexing replies by
    /// transaction id the way the UDP tracker client does.
    fn query(
        &mut self,
        addr: SocketAddr,
        build: impl Fn(Vec<u8>) -> Envelope,
    ) -> Result<KrpcReply> {
        let transaction_id: [u8; 2] = rand::thread_rng().gen();
        let envelope = build(transaction_id.to_vec());
        let packet = envelope.encode()?;

        for _attempt in 0..=QUERY_RETRIES {
            self.socket.send_to(&packet, addr)?;
            let mut events = Events::with_capacity(8);
            self.poll.poll(&mut events, Some(QUERY_TIMEOUT))?;
            if events.is_empty() {
                continue;
            }

            let mut buf = [0u8; 1500];
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) if from == addr => {
                    let reply = Envelope::decode(&buf[..len])?;
                    if reply.transaction_id.as_ref() != transaction_id {
                        continue;
                    }
                    return to_get_peers_reply(reply);
                }
                Ok(_) => continue, // reply from someone else; ignore and keep waiting
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("{addr}: no reply after {} attempts", QUERY_RETRIES + 1)
    }

    fn note_contact(&mut self, id: Id20, addr: SocketAddr) {
        let contact = Contact {
            id,
            addr,
            last_seen: Instant::now(),
        };
        // A full bucket should ping its least-recently-seen entry before
        // evicting; we skip the extra round trip here and just
        // keep the existing entry, which is the conservative choice.
        if let InsertOutcome::BucketFull { .. } = self.routing_table.insert(contact) {
            trace!("routing table bucket full, dropping new contact {id}");
        }
    }

    pub fn save_state(&self, path: &std::path::Path) -> Result<()> {
        let state = PersistedState {
            node_id: self.routing_table.local_id(),
            contacts: self
                .routing_table
                .all_contacts()
                .into_iter()
                .map(|c| (c.id, c.addr))
                .collect(),
        };
        let bytes = serde_bencode::to_bytes(&state).context("encoding DHT state")?;
        std::fs::write(path, bytes).context("writing DHT state file")
    }

    pub fn load_state(port: u16, path: &std::path::Path) -> Result<DhtNode> {
        let bytes = std::fs::read(path).context("reading DHT state file")?;
        let state: PersistedState = serde_bencode::from_bytes(&bytes).context("decoding DHT state")?;
        let mut node = DhtNode::listen(port, state.node_id)?;
        for (id, addr) in state.contacts {
            node.note_contact(id, addr);
        }
        Ok(node)
    }
}

enum KrpcReply {
    Peers {
        id: Id20,
        peers: Vec<SocketAddr>,
    },
    CloserNodes {
        id: Id20,
        nodes: Vec<krpc::CompactContact>,
    },
}

fn to_get_peers_reply(envelope: Envelope) -> Result<KrpcReply> {
    match envelope.body {
        Body::Response { result } => {
            let id = result.id;
            if let Some(values) = result.values {
                // a `values = []` reply must not short-circuit
                // the lookup; the caller keeps exploring `nodes`/shortlist.
                return Ok(KrpcReply::Peers {
                    id,
                    peers: krpc::parse_compact_peers(&values),
                });
            }
            let nodes = result
                .nodes
                .map(|n| krpc::parse_compact_nodes(&n))
                .unwrap_or_default();
            Ok(KrpcReply::CloserNodes { id, nodes })
        }
        Body::Error { error } => anyhow::bail!("DHT node returned error {}: {}", error.0, error.1),
        Body::Query { .. } => anyhow::bail!("expected a response, got a query"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_binds_an_ephemeral_port() {
        let node = DhtNode::listen(0, Id20::random()).unwrap();
        assert_eq!(node.routing_table.len(), 0);
    }

    #[test]
    fn note_contact_populates_routing_table() {
        let mut node = DhtNode::listen(0, Id20([0u8; 20])).unwrap();
        node.note_contact(Id20([1u8; 20]), "127.0.0.1:6881".parse().unwrap());
        assert_eq!(node.routing_table.len(), 1);
    }

    #[test]
    fn save_and_load_state_round_trips_node_id_and_contacts() {
        let dir = std::env::temp_dir().join(format!("dht-state-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.bencode");

        let id = Id20::random();
        let mut node = DhtNode::listen(0, id).unwrap();
        node.note_contact(Id20([9u8; 20]), "127.0.0.1:6881".parse().unwrap());
        node.save_state(&path).unwrap();

        let reloaded = DhtNode::load_state(0, &path).unwrap();
        assert_eq!(reloaded.local_id(), id);
        assert_eq!(reloaded.routing_table.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
