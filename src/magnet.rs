//! Thin magnet-URI parsing. The real magnet-URI parser is an external
//! collaborator to the engine this crate implements; this module exists
//! only so `Resolver::retrieve_torrent` has a concrete input type and so
//! the CLI binary has something to build that type from.

use crate::id::Id20;
use url::Url;

#[derive(Debug, Clone)]
pub struct MagnetRequest {
    pub info_hash: Id20,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetRequest {
    pub fn parse(uri: &str) -> anyhow::Result<MagnetRequest> {
        let url = Url::parse(uri).map_err(|e| anyhow::anyhow!("invalid magnet uri: {e}"))?;
        if url.scheme() != "magnet" {
            anyhow::bail!("not a magnet uri: scheme is {}", url.scheme());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let rest = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| anyhow::anyhow!("unsupported xt urn: {value}"))?;
                    info_hash = Some(decode_info_hash(rest)?);
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| anyhow::anyhow!("magnet uri is missing xt=urn:btih:…"))?;

        Ok(MagnetRequest {
            info_hash,
            display_name,
            trackers,
        })
    }
}

fn decode_info_hash(s: &str) -> anyhow::Result<Id20> {
    match s.len() {
        40 => Id20::from_hex(s),
        32 => decode_base32(s),
        n => anyhow::bail!("info-hash has unexpected length {n}"),
    }
}

/// RFC 4648 base32 decode (no padding), just enough to read the
/// alternate `xt=urn:btih:` encoding some magnet links use.
fn decode_base32(s: &str) -> anyhow::Result<Id20> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(20);

    for c in s.chars() {
        let c = c.to_ascii_uppercase();
        let idx = ALPHABET
            .iter()
            .position(|&b| b == c as u8)
            .ok_or_else(|| anyhow::anyhow!("invalid base32 character: {c}"))?;
        bits = (bits << 5) | idx as u64;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    if out.len() != 20 {
        anyhow::bail!("base32 info-hash decoded to {} bytes, expected 20", out.len());
    }
    let mut buf = [0u8; 20];
    buf.copy_from_slice(&out);
    Ok(Id20(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_info_hash_with_trackers_and_name() {
        let uri = "magnet:?xt=urn:btih:e2467cbf021192c241367b892230dc1e05c0580e&dn=ubuntu-19.10-desktop-amd64.iso&tr=https%3A%2F%2Ftorrent.ubuntu.com%2Fannounce&tr=udp%3A%2F%2Ftracker.example.org%3A80";
        let req = MagnetRequest::parse(uri).unwrap();
        assert_eq!(req.info_hash.to_hex(), "e2467cbf021192c241367b892230dc1e05c0580e");
        assert_eq!(req.display_name.as_deref(), Some("ubuntu-19.10-desktop-amd64.iso"));
        assert_eq!(req.trackers.len(), 2);
    }

    #[test]
    fn rejects_non_magnet_scheme() {
        assert!(MagnetRequest::parse("http://example.com").is_err());
    }

    #[test]
    fn rejects_missing_info_hash() {
        assert!(MagnetRequest::parse("magnet:?dn=foo").is_err());
    }

    #[test]
    fn base32_and_hex_agree() {
        let hex_uri = "magnet:?xt=urn:btih:e2467cbf021192c241367b892230dc1e05c0580e";
        let hex_hash = MagnetRequest::parse(hex_uri).unwrap().info_hash;

        // base32 encoding of the same 20 bytes, computed by hand for this fixture.
        let b32 = to_base32(hex_hash.as_bytes());
        let b32_uri = format!("magnet:?xt=urn:btih:{b32}");
        let b32_hash = MagnetRequest::parse(&b32_uri).unwrap().info_hash;

        assert_eq!(hex_hash, b32_hash);
    }

    fn to_base32(bytes: &[u8; 20]) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
        let mut bits: u64 = 0;
        let mut bit_count = 0u32;
        let mut out = String::new();
        for &b in bytes {
            bits = (bits << 8) | b as u64;
            bit_count += 8;
            while bit_count >= 5 {
                bit_count -= 5;
                out.push(ALPHABET[((bits >> bit_count) & 0x1f) as usize] as char);
            }
        }
        if bit_count > 0 {
            out.push(ALPHABET[((bits << (5 - bit_count)) & 0x1f) as usize] as char);
        }
        out
    }
}
