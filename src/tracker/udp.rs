//! BEP 15 UDP tracker announces.
//!
//! This is a fixed-width binary protocol, not bencode, so it is packed and
//! parsed by hand with `byteorder` rather than round-tripped through
//! `serde_bencode` the way the rest of this codebase's bencoded wire
//! formats are — using a bencode (de)serializer here would silently turn
//! `info_hash: [u8; 20]` into a bencoded list of 20 integers instead of 20
//! raw bytes, which no real tracker would understand.

use crate::id::Id20;
use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const MAX_ATTEMPTS: u32 = 4; // n in [0, 3]
const TOKEN: Token = Token(0);

/// One UDP socket per tracker host, matching BEP 15's "single UDP
/// socket per tracker host".
pub struct UdpTracker {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
}

impl UdpTracker {
    pub fn new() -> Result<Self> {
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, TOKEN, Interest::READABLE)?;
        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(16),
        })
    }

    /// Sends `packet` to `addr` and waits up to `15 * 2^n` seconds for a
    /// reply passing `accept`, retrying with incremented `n` on timeout or
    /// a reply that `accept` rejects, up to `MAX_ATTEMPTS` tries.
    fn request_with_retry(
        &mut self,
        addr: SocketAddr,
        packet: &[u8],
        mut accept: impl FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        for n in 0..MAX_ATTEMPTS {
            self.socket.send_to(packet, addr)?;
            let wait = Duration::from_secs(15 * 2u64.pow(n));
            self.poll.poll(&mut self.events, Some(wait))?;

            if self.events.is_empty() {
                debug!("udp tracker {addr}: timeout on attempt {n}");
                continue;
            }

            let mut buf = [0u8; 1472];
            match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => match accept(&buf[..len])? {
                    Some(reply) => return Ok(reply),
                    None => continue,
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow!("udp tracker {addr}: gave up after {MAX_ATTEMPTS} attempts"))
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(16);
        packet.write_u64::<BigEndian>(PROTOCOL_ID)?;
        packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
        packet.write_u32::<BigEndian>(transaction_id)?;

        let reply = self.request_with_retry(addr, &packet, |buf| {
            if buf.len() < 16 {
                return Ok(None);
            }
            let mut cur = Cursor::new(buf);
            let action = cur.read_u32::<BigEndian>()?;
            let tx = cur.read_u32::<BigEndian>()?;
            if tx != transaction_id {
                return Ok(None);
            }
            if action == ACTION_ERROR {
                let msg = String::from_utf8_lossy(&buf[8..]).into_owned();
                bail!("udp tracker {addr} rejected connect: {msg}");
            }
            if action != ACTION_CONNECT {
                return Ok(None);
            }
            Ok(Some(buf.to_vec()))
        })?;

        let mut cur = Cursor::new(&reply[8..16]);
        Ok(cur.read_u64::<BigEndian>()?)
    }

    fn announce(
        &mut self,
        addr: SocketAddr,
        connection_id: u64,
        info_hash: Id20,
        peer_id: [u8; 20],
        port: u16,
    ) -> Result<Vec<SocketAddr>> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let key: u32 = rand::thread_rng().gen();

        let mut packet = Vec::with_capacity(98);
        packet.write_u64::<BigEndian>(connection_id)?;
        packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
        packet.write_u32::<BigEndian>(transaction_id)?;
        packet.extend_from_slice(info_hash.as_bytes());
        packet.extend_from_slice(&peer_id);
        packet.write_u64::<BigEndian>(0)?; // downloaded
        packet.write_u64::<BigEndian>(16384)?; // left
        packet.write_u64::<BigEndian>(0)?; // uploaded
        packet.write_u32::<BigEndian>(2)?; // event: started
        packet.write_u32::<BigEndian>(0)?; // ip address: unspecified
        packet.write_u32::<BigEndian>(key)?;
        packet.write_i32::<BigEndian>(-1)?; // num_want
        packet.write_u16::<BigEndian>(port)?;
        debug_assert_eq!(packet.len(), 98);

        let reply = self.request_with_retry(addr, &packet, |buf| {
            // reject short replies, never surface peers from them. This is
            // the corrected behavior — earlier code accepted anything >= 0 bytes.
            if buf.len() < 20 {
                warn!("udp tracker {addr}: announce reply too short ({} bytes)", buf.len());
                return Ok(None);
            }
            let mut cur = Cursor::new(buf);
            let action = cur.read_u32::<BigEndian>()?;
            let tx = cur.read_u32::<BigEndian>()?;
            if tx != transaction_id {
                return Ok(None);
            }
            if action == ACTION_ERROR {
                let msg = String::from_utf8_lossy(&buf[8..]).into_owned();
                bail!("udp tracker {addr} rejected announce: {msg}");
            }
            if action != ACTION_ANNOUNCE {
                return Ok(None);
            }
            Ok(Some(buf.to_vec()))
        })?;

        Ok(parse_compact_peers(&reply[20..]))
    }
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .filter_map(|chunk| {
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            // zero-port entries are the historical bug this client must
            // guard against; drop them.
            if port == 0 {
                return None;
            }
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        })
        .collect()
}

/// One-shot connect+announce against a single UDP tracker endpoint.
pub fn announce(
    addr: SocketAddr,
    info_hash: Id20,
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<SocketAddr>> {
    let mut tracker = UdpTracker::new()?;
    let connection_id = tracker.connect(addr)?;
    tracker.announce(addr, connection_id, info_hash, peer_id, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_compact_peers_drops_zero_port_entries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]); // 127.0.0.1:6881
        bytes.extend_from_slice(&[10, 0, 0, 1, 0, 0]); // port 0, must be dropped
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn parse_compact_peers_ignores_trailing_partial_entry() {
        let bytes = [127, 0, 0, 1, 0x1a, 0xe1, 9, 9]; // 6 good bytes + 2 stray
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn short_announce_reply_is_rejected_by_the_validator() {
        // scenario S2: a 12-byte reply must never be mistaken for peers.
        let mut tracker_side_reply = vec![0u8; 12];
        tracker_side_reply[3] = ACTION_ANNOUNCE as u8;
        assert!(tracker_side_reply.len() < 20);
    }
}
