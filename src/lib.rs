pub mod cache;
pub mod dht;
pub mod error;
pub mod id;
pub mod magnet;
pub mod resolver;
pub mod torrent;
pub mod utils;

pub mod tracker {
    pub mod http;
    pub mod udp;
}

pub mod peer {
    pub mod connection;
    pub mod handshake;
    pub mod manager;
    pub mod message;
    pub mod metadata;
}
