//! BEP 10 extension handshake and BEP 9 ut_metadata piece exchange:
//! fetches and verifies the `info` dict from a single peer.

use crate::id::Id20;
use crate::peer::connection::Connection;
use crate::peer::message::Message;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// this crate's local id for the ut_metadata extension, sent in our own
/// extension handshake's `m` dict.
const UT_METADATA_LOCAL_ID: u8 = 1;
const CHUNK_SIZE: u32 = 16384;
const MAX_METADATA_SIZE: u32 = 16 * 1024 * 1024;
const PIPELINE_DEPTH: usize = 4;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

#[derive(Debug, Serialize)]
struct ExtendedHandshakeOut {
    m: HashMap<String, u8>,
}

#[derive(Debug, Deserialize)]
struct ExtendedHandshakeIn {
    m: HashMap<String, u8>,
    metadata_size: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PieceEnvelope {
    msg_type: i64,
    piece: u32,
    #[serde(default)]
    total_size: Option<u32>,
}

/// Connects to `addr`, runs the handshake plus ut_metadata exchange, and
/// returns the verified raw `info` bytes on success.
pub fn fetch_metadata(
    addr: SocketAddr,
    info_hash: Id20,
    my_id: [u8; 20],
    connect_timeout: Duration,
    session_budget: Duration,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + session_budget;
    let mut conn = Connection::new(addr, *info_hash.as_bytes(), my_id, connect_timeout)
        .map_err(|e| anyhow!("handshake with {addr} failed: {e}"))?;

    let mut m = HashMap::new();
    m.insert("ut_metadata".to_string(), UT_METADATA_LOCAL_ID);
    let handshake_payload = serde_bencode::to_bytes(&ExtendedHandshakeOut { m })
        .context("encoding extension handshake")?;
    conn.send(&Message::Extended(0, handshake_payload))
        .map_err(|e| anyhow!("sending extension handshake to {addr}: {e}"))?;

    let (peer_ut_metadata_id, metadata_size) = loop {
        if Instant::now() >= deadline {
            bail!("{addr}: session budget exhausted waiting for extension handshake");
        }
        let msg = conn
            .recv(deadline)
            .map_err(|e| anyhow!("reading from {addr}: {e}"))?;
        if let Message::Extended(0, payload) = msg {
            let handshake: ExtendedHandshakeIn =
                serde_bencode::from_bytes(&payload).context("decoding extension handshake")?;
            let peer_id = *handshake
                .m
                .get("ut_metadata")
                .ok_or_else(|| anyhow!("{addr}: peer does not support ut_metadata"))?;
            let size = handshake
                .metadata_size
                .ok_or_else(|| anyhow!("{addr}: peer omitted metadata_size"))?;
            if size > MAX_METADATA_SIZE {
                bail!("{addr}: metadata_size {size} exceeds 16MiB limit");
            }
            break (peer_id, size);
        }
        // not the message we're waiting for (Bitfield/Have/etc) — ignore and keep reading.
    };

    let piece_count = metadata_size.div_ceil(CHUNK_SIZE) as usize;
    let mut pieces: Vec<Option<Vec<u8>>> = vec![None; piece_count];
    let mut next_to_request = 0usize;
    let mut outstanding = 0usize;

    while pieces.iter().any(Option::is_none) {
        if Instant::now() >= deadline {
            bail!("{addr}: session budget exhausted mid-transfer");
        }

        while outstanding < PIPELINE_DEPTH && next_to_request < piece_count {
            let request = PieceEnvelope {
                msg_type: MSG_REQUEST,
                piece: next_to_request as u32,
                total_size: None,
            };
            let payload = serde_bencode::to_bytes(&request).context("encoding piece request")?;
            conn.send(&Message::Extended(peer_ut_metadata_id, payload))
                .map_err(|e| anyhow!("requesting piece {next_to_request} from {addr}: {e}"))?;
            next_to_request += 1;
            outstanding += 1;
        }

        let msg = conn
            .recv(deadline)
            .map_err(|e| anyhow!("reading from {addr}: {e}"))?;
        let Message::Extended(_, payload) = msg else {
            continue;
        };

        let envelope_len = bencode_value_len(&payload)?;
        let envelope: PieceEnvelope =
            serde_bencode::from_bytes(&payload[..envelope_len]).context("decoding piece message")?;

        match envelope.msg_type {
            MSG_DATA => {
                let data = &payload[envelope_len..];
                let index = envelope.piece as usize;
                if index >= piece_count {
                    bail!("{addr}: piece index {index} out of range");
                }
                if pieces[index].is_none() {
                    outstanding = outstanding.saturating_sub(1);
                }
                pieces[index] = Some(data.to_vec());
            }
            MSG_REJECT => {
                bail!("{addr}: peer rejected piece {} (does not have metadata)", envelope.piece);
            }
            other => bail!("{addr}: unexpected ut_metadata msg_type {other}"),
        }
    }

    let _ = conn.close();

    let mut raw = Vec::with_capacity(metadata_size as usize);
    for piece in pieces {
        raw.extend_from_slice(&piece.expect("all pieces present by loop invariant"));
    }

    if !crate::torrent::verify_info_hash(&raw, &info_hash) {
        bail!("{addr}: metadata SHA-1 does not match requested info-hash");
    }

    Ok(raw)
}

/// Returns the length in bytes of the single bencoded value at the start
/// of `data`, so that trailing raw piece bytes (BEP 9 `msg_type=1`
/// responses append the piece after its bencoded envelope) can be sliced
/// off without a deserializer that tracks its own cursor position.
fn bencode_value_len(data: &[u8]) -> Result<usize> {
    fn scan(data: &[u8], at: usize) -> Result<usize> {
        match data.get(at) {
            Some(b'i') => {
                let end = find(data, at, b'e')?;
                Ok(end + 1)
            }
            Some(b'l') | Some(b'd') => {
                let mut pos = at + 1;
                loop {
                    if data.get(pos) == Some(&b'e') {
                        return Ok(pos + 1);
                    }
                    pos = scan(data, pos)?;
                }
            }
            Some(c) if c.is_ascii_digit() => {
                let colon = find(data, at, b':')?;
                let len: usize = std::str::from_utf8(&data[at..colon])?.parse()?;
                Ok(colon + 1 + len)
            }
            _ => bail!("not a valid bencode value at offset {at}"),
        }
    }
    fn find(data: &[u8], from: usize, byte: u8) -> Result<usize> {
        data[from..]
            .iter()
            .position(|&b| b == byte)
            .map(|p| from + p)
            .ok_or_else(|| anyhow!("unterminated bencode value"))
    }
    scan(data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bencode_value_len_splits_dict_from_trailing_bytes() {
        let mut payload = b"d8:msg_typei1e5:piecei0e10:total_sizei16384ee".to_vec();
        let dict_len = payload.len();
        payload.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(bencode_value_len(&payload).unwrap(), dict_len);
    }

    #[test]
    fn bencode_value_len_handles_nested_dict() {
        let payload = b"d1:md11:ut_metadatai1eee";
        assert_eq!(bencode_value_len(payload).unwrap(), payload.len());
    }

    #[test]
    fn piece_count_rounds_up() {
        assert_eq!((32768u32).div_ceil(CHUNK_SIZE), 2);
        assert_eq!((32769u32).div_ceil(CHUNK_SIZE), 3);
    }
}
