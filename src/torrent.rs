//! The `.torrent` file shape: the `info` dictionary fetched from peers,
//! wrapped in the top-level dict together with the magnet's trackers.
//!
//! Reading whole `.torrent` files (rather than just their `info` blob) is
//! kept here too since it is useful for tests and for inspecting the
//! output this crate produces.

use crate::id::Id20;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;

#[derive(Debug, Deserialize, Serialize)]
pub struct Node(pub String, pub i64);

/// One entry of a multi-file torrent's file list.
#[derive(Debug, Deserialize, Serialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

/// The metadata dictionary a magnet link resolves to. Its bencoded form is
/// exactly the blob peers hand over piece by piece during the ut_metadata
/// exchange — its SHA-1 is the info-hash.
#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// concatenation of all 20-byte SHA1 piece hashes
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<File>>,
    #[serde(default)]
    pub private: Option<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Torrent {
    pub info: Info,
    #[serde(default)]
    pub announce: Option<String>,
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    #[serde(default)]
    #[serde(rename = "comment")]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent")
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Self::from_path(std::path::Path::new(path))
    }

    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        to_bytes(self).context("failed to bencode torrent")
    }

    pub fn info_hash(&self) -> Id20 {
        let bytes = to_bytes(&self.info).expect("Info always bencodes");
        Id20(Sha1::digest(bytes).into())
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Assembles a `.torrent` file from a verified raw `info` blob and the
    /// trackers the magnet link carried. `raw_info` must already have been
    /// checked against the requested info-hash by the caller (the
    /// verification step) — this only decodes it.
    pub fn assemble(raw_info: &[u8], trackers: &[String]) -> anyhow::Result<Torrent> {
        let info: Info = from_bytes(raw_info).context("peer metadata is not a valid info dict")?;
        let announce = trackers.first().cloned();
        let announce_list = if trackers.is_empty() {
            None
        } else {
            Some(trackers.iter().map(|t| vec![t.clone()]).collect())
        };
        Ok(Torrent {
            info,
            announce,
            nodes: None,
            encoding: None,
            announce_list,
            creation_date: None,
            comment: None,
            created_by: Some("magnet2torrent".to_string()),
        })
    }
}

/// SHA-1 of raw, not-yet-decoded metadata bytes, compared directly against
/// the requested info-hash (the verification step happens before
/// the bytes are trusted enough to decode).
pub fn verify_info_hash(raw: &[u8], expected: &Id20) -> bool {
    let digest: [u8; 20] = Sha1::digest(raw).into();
    digest == expected.0
}

/// `dn`/`info.name` → filename, with path separators and NULs stripped so
/// the result is safe to join onto an output directory.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| *c != '\0' && *c != '/' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "unnamed.torrent".to_string()
    } else {
        format!("{cleaned}.torrent")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info_bytes() -> Vec<u8> {
        let info = Info {
            name: "example".to_string(),
            pieces: ByteBuf::from(vec![0u8; 20]),
            piece_length: 16384,
            md5sum: None,
            length: Some(16384),
            files: None,
            private: None,
        };
        to_bytes(&info).unwrap()
    }

    #[test]
    fn info_hash_is_sha1_of_bencoded_info() {
        let raw = sample_info_bytes();
        let expected = Id20(Sha1::digest(&raw).into());
        assert!(verify_info_hash(&raw, &expected));

        let torrent = Torrent::assemble(&raw, &[]).unwrap();
        assert_eq!(torrent.info_hash(), expected);
    }

    #[test]
    fn assemble_populates_announce_and_announce_list() {
        let raw = sample_info_bytes();
        let trackers = vec![
            "https://torrent.ubuntu.com/announce".to_string(),
            "udp://tracker.example.org:80".to_string(),
        ];
        let torrent = Torrent::assemble(&raw, &trackers).unwrap();
        assert_eq!(torrent.announce.as_deref(), Some("https://torrent.ubuntu.com/announce"));
        assert_eq!(torrent.announce_list.unwrap().len(), 2);
    }

    #[test]
    fn round_trip_bencode() {
        let raw = sample_info_bytes();
        let torrent = Torrent::assemble(&raw, &["http://tracker.example.org/announce".into()]).unwrap();
        let bytes = torrent.to_bytes().unwrap();
        let decoded = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.name(), "example");
        assert_eq!(decoded.info_hash(), torrent.info_hash());
    }

    #[test]
    fn sanitize_strips_separators_and_nuls() {
        assert_eq!(sanitize_filename("a/b\\c\0d"), "abcd.torrent");
        assert_eq!(sanitize_filename(""), "unnamed.torrent");
    }

    #[test]
    fn mismatched_hash_fails_verification() {
        let raw = sample_info_bytes();
        let wrong = Id20([0xFF; 20]);
        assert!(!verify_info_hash(&raw, &wrong));
    }
}
