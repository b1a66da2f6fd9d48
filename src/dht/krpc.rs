//! Bencoded KRPC envelopes (BEP 5): `t`/`y`/`q`+`a` or `r` or `e`.

use crate::id::Id20;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub transaction_id: ByteBuf,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "y")]
pub enum Body {
    #[serde(rename = "q")]
    Query {
        #[serde(rename = "q")]
        method: String,
        #[serde(rename = "a")]
        args: QueryArgs,
    },
    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        result: ResponseResult,
    },
    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: (i64, String),
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryArgs {
    pub id: Id20,
    #[serde(default)]
    pub target: Option<Id20>,
    #[serde(default)]
    pub info_hash: Option<Id20>,
    #[serde(default)]
    pub token: Option<ByteBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub implied_port: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseResult {
    pub id: Id20,
    #[serde(default)]
    pub token: Option<ByteBuf>,
    #[serde(default)]
    pub nodes: Option<ByteBuf>,
    #[serde(default)]
    pub values: Option<Vec<ByteBuf>>,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        serde_bencode::from_bytes(bytes).context("malformed KRPC envelope")
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).context("encoding KRPC envelope")
    }

    pub fn ping(transaction_id: Vec<u8>, my_id: Id20) -> Envelope {
        Envelope {
            transaction_id: ByteBuf::from(transaction_id),
            body: Body::Query {
                method: "ping".to_string(),
                args: QueryArgs {
                    id: my_id,
                    target: None,
                    info_hash: None,
                    token: None,
                    port: None,
                    implied_port: None,
                },
            },
        }
    }

    pub fn find_node(transaction_id: Vec<u8>, my_id: Id20, target: Id20) -> Envelope {
        Envelope {
            transaction_id: ByteBuf::from(transaction_id),
            body: Body::Query {
                method: "find_node".to_string(),
                args: QueryArgs {
                    id: my_id,
                    target: Some(target),
                    info_hash: None,
                    token: None,
                    port: None,
                    implied_port: None,
                },
            },
        }
    }

    pub fn get_peers(transaction_id: Vec<u8>, my_id: Id20, info_hash: Id20) -> Envelope {
        Envelope {
            transaction_id: ByteBuf::from(transaction_id),
            body: Body::Query {
                method: "get_peers".to_string(),
                args: QueryArgs {
                    id: my_id,
                    target: None,
                    info_hash: Some(info_hash),
                    token: None,
                    port: None,
                    implied_port: None,
                },
            },
        }
    }

    pub fn announce_peer(
        transaction_id: Vec<u8>,
        my_id: Id20,
        info_hash: Id20,
        token: Vec<u8>,
        port: u16,
    ) -> Envelope {
        Envelope {
            transaction_id: ByteBuf::from(transaction_id),
            body: Body::Query {
                method: "announce_peer".to_string(),
                args: QueryArgs {
                    id: my_id,
                    target: None,
                    info_hash: Some(info_hash),
                    token: Some(ByteBuf::from(token)),
                    port: Some(port),
                    implied_port: Some(0),
                },
            },
        }
    }
}

/// One contact as carried in a compact `nodes` string: 20-byte id + 6-byte
/// IPv4 peer entry, repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactContact {
    pub id: Id20,
    pub addr: SocketAddr,
}

pub fn parse_compact_nodes(bytes: &[u8]) -> Vec<CompactContact> {
    bytes
        .chunks_exact(26)
        .filter_map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[0..20]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            if port == 0 {
                return None;
            }
            Some(CompactContact {
                id: Id20(id),
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
            })
        })
        .collect()
}

pub fn parse_compact_peers(bytes: &[ByteBuf]) -> Vec<SocketAddr> {
    bytes
        .iter()
        .filter_map(|entry| {
            if entry.len() != 6 {
                return None;
            }
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            // zero-port values entries are dropped.
            if port == 0 {
                return None;
            }
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        })
        .collect()
}

pub fn encode_compact_contact(id: Id20, addr: SocketAddr) -> Result<[u8; 26]> {
    let SocketAddr::V4(addr) = addr else {
        return Err(anyhow!("DHT contacts are IPv4-only"));
    };
    let mut out = [0u8; 26];
    out[0..20].copy_from_slice(id.as_bytes());
    out[20..24].copy_from_slice(&addr.ip().octets());
    out[24..26].copy_from_slice(&addr.port().to_be_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let env = Envelope::ping(vec![1, 2], Id20([3u8; 20]));
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        match decoded.body {
            Body::Query { method, args } => {
                assert_eq!(method, "ping");
                assert_eq!(args.id, Id20([3u8; 20]));
            }
            _ => panic!("expected a query"),
        }
    }

    #[test]
    fn get_peers_response_with_values_decodes() {
        let bytes = b"d1:rd2:id20:aaaaaaaaaaaaaaaaaaaa5:token1:x6:valuesl6:\x7f\x00\x00\x01\x1a\xe1ee1:t2:aa1:y1:re";
        let env = Envelope::decode(bytes).unwrap();
        match env.body {
            Body::Response { result } => {
                let peers = parse_compact_peers(&result.values.unwrap());
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
            }
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn zero_port_compact_peer_is_dropped() {
        let entries = vec![ByteBuf::from(vec![10, 0, 0, 1, 0, 0])];
        assert!(parse_compact_peers(&entries).is_empty());
    }

    #[test]
    fn compact_nodes_parses_repeated_26_byte_entries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[1u8; 20]);
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        bytes.extend_from_slice(&[2u8; 20]);
        bytes.extend_from_slice(&[127, 0, 0, 2, 0x1a, 0xe2]);
        let nodes = parse_compact_nodes(&bytes);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].id, Id20([2u8; 20]));
    }
}
