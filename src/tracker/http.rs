//! BEP 3 HTTP(S) tracker announces.
//!
//! The rest of this crate talks raw sockets (mio) because UDP tracker,
//! peer-wire and DHT are all framed binary protocols where a socket is the
//! natural abstraction. An HTTP(S) GET with bencoded body is not — and
//! supporting `https://` trackers (S1) means TLS, which `reqwest` already
//! gets right, so that's what this module reaches for.

use crate::id::Id20;
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::Duration;
use urlencoding::encode_binary;

#[derive(Debug, serde::Deserialize)]
struct AnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: peers::Peers,
}

/// Tolerant compact/dict peer-list decoding (a malformed
/// `peers` value is absorbed into an empty list, never a fatal error).
mod peers {
    use serde::de::{self, Deserialize, Deserializer, Visitor};
    use std::fmt;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[derive(Debug, Default, Clone)]
    pub struct Peers(pub Vec<SocketAddr>);

    struct PeersVisitor;

    #[derive(serde::Deserialize)]
    struct PeerDict {
        ip: String,
        port: u16,
    }

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Peers, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                // malformed compact string: tolerate, yield no peers.
                return Ok(Peers(Vec::new()));
            }
            let peers = v
                .chunks_exact(6)
                .map(|chunk| {
                    let addr = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::V4(SocketAddrV4::new(addr, port))
                })
                .collect();
            Ok(Peers(peers))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Peers, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(dict) = seq.next_element::<PeerDict>()? {
                if let Ok(ip) = dict.ip.parse() {
                    out.push(SocketAddr::new(ip, dict.port));
                }
            }
            Ok(Peers(out))
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(PeersVisitor)
        }
    }
}

/// Issues `GET <tracker_url>?info_hash=...&...` and returns the peers it
/// names, or an empty list if the tracker reported a `failure reason` or
/// sent an unparseable `peers` value. Non-2xx HTTP and network errors are
/// returned as `Err` — the Resolver treats that as a recoverable,
/// per-source failure.
pub fn announce(
    tracker_url: &str,
    info_hash: Id20,
    peer_id: [u8; 20],
    port: u16,
    timeout: Duration,
) -> Result<Vec<SocketAddr>> {
    let separator = if tracker_url.contains('?') { '&' } else { '?' };
    let url = format!(
        "{tracker_url}{separator}info_hash={}&peer_id={}&port={port}&uploaded=0&downloaded=0&left=16384&compact=1&event=started",
        encode_binary(info_hash.as_bytes()),
        encode_binary(&peer_id),
    );

    debug!("announcing to {tracker_url}");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client")?;
    let response = client.get(&url).send().context("tracker request failed")?;

    if !response.status().is_success() {
        return Err(anyhow!("tracker {tracker_url} returned HTTP {}", response.status()));
    }

    let body = response.bytes().context("reading tracker response body")?;
    let parsed: AnnounceResponse =
        serde_bencode::from_bytes(&body).context("tracker response is not valid bencode")?;

    if let Some(reason) = parsed.failure_reason {
        warn!("tracker {tracker_url} reported failure: {reason}");
        return Ok(Vec::new());
    }

    Ok(parsed.peers.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peers() {
        // d5:peers6:\x7f\x00\x00\x01\x1a\xe1e
        let body = b"d5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let parsed: AnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(parsed.peers.0.len(), 1);
        assert_eq!(parsed.peers.0[0].to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn failure_reason_yields_no_peers_and_no_error() {
        // d14:failure reason4:nopee (scenario S4)
        let body = b"d14:failure reason4:nopee";
        let parsed: AnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(parsed.failure_reason.as_deref(), Some("nope"));
        assert!(parsed.peers.0.is_empty());
    }

    #[test]
    fn malformed_compact_peers_is_tolerated() {
        let body = b"d5:peers5:\x01\x02\x03\x04\x05e";
        let parsed: AnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert!(parsed.peers.0.is_empty());
    }

    #[test]
    fn dict_form_peers_are_accepted() {
        let body = b"d5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let parsed: AnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(parsed.peers.0.len(), 1);
        assert_eq!(parsed.peers.0[0].to_string(), "127.0.0.1:6881");
    }

    #[test]
    #[ignore] // needs live network access
    fn live_ubuntu_tracker() {
        let info_hash = Id20::from_hex("e2467cbf021192c241367b892230dc1e05c0580e").unwrap();
        let peers = announce(
            "https://torrent.ubuntu.com/announce",
            info_hash,
            [1u8; 20],
            6881,
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(!peers.is_empty());
    }
}
