//! Crate-wide error type for the Resolver boundary. Leaf modules (tracker
//! clients, the DHT node, peer-wire sessions) use `anyhow::Result`
//! internally and are never allowed to turn a per-source failure into
//! anything other than a log line — see `resolver.rs`. Only the two
//! outcomes below ever reach a caller of `Resolver::retrieve_torrent`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed magnet request: {0}")]
    MalformedInput(String),

    #[error("no source produced valid metadata for this info-hash")]
    Exhausted,
}
