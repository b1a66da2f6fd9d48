//! The race coordinator: fans a magnet request out to every
//! tracker plus the DHT, funnels discovered endpoints into a deduplicated
//! bounded worker pool, and returns whichever worker recovers valid
//! metadata first.

use crate::cache::MetadataCache;
use crate::dht::DhtNode;
use crate::error::Error;
use crate::id::Id20;
use crate::magnet::MagnetRequest;
use crate::peer::manager::{self, PeerManagerConfig};
use crate::torrent::{sanitize_filename, Torrent};
use crate::tracker::{http, udp};
use crossbeam_channel::{bounded, unbounded};
use log::{info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub struct ResolverConfig {
    pub peer_pool: PeerManagerConfig,
    pub http_tracker_timeout: Duration,
    /// overall wall-clock budget for a single `retrieve_torrent` call.
    pub request_budget: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            peer_pool: PeerManagerConfig::default(),
            http_tracker_timeout: Duration::from_secs(10),
            request_budget: Duration::from_secs(120),
        }
    }
}

pub struct Resolver {
    config: ResolverConfig,
    dht: Option<Arc<Mutex<DhtNode>>>,
    cache: Option<Box<dyn MetadataCache>>,
    my_id: [u8; 20],
}

impl Resolver {
    pub fn new(config: ResolverConfig, dht: Option<DhtNode>, cache: Option<Box<dyn MetadataCache>>) -> Self {
        Self {
            config,
            dht: dht.map(|n| Arc::new(Mutex::new(n))),
            cache,
            my_id: crate::utils::generate_peer_id(),
        }
    }

    /// Resolves `magnet` into a `(filename, bencoded torrent bytes)` pair.
    pub fn retrieve_torrent(&self, magnet: &MagnetRequest) -> Result<(String, Vec<u8>), Error> {
        if let Some(cache) = &self.cache {
            if let Some(raw_info) = cache.get(&magnet.info_hash) {
                info!("cache hit for {}", magnet.info_hash);
                let torrent = Torrent::assemble(&raw_info, &magnet.trackers)
                    .map_err(|e| Error::MalformedInput(e.to_string()))?;
                return Ok((filename_for(magnet, &torrent), encode(&torrent)?));
            }
        }

        let (endpoint_tx, endpoint_rx) = unbounded::<SocketAddr>();
        let (result_tx, result_rx) = bounded::<Vec<u8>>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let seen: Arc<Mutex<HashSet<SocketAddr>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut source_handles = Vec::new();

        for tracker_url in &magnet.trackers {
            let tracker_url = tracker_url.clone();
            let info_hash = magnet.info_hash;
            let my_id = self.my_id;
            let tx = endpoint_tx.clone();
            let seen = seen.clone();
            let cancel = cancel.clone();
            let timeout = self.config.http_tracker_timeout;

            source_handles.push(thread::spawn(move || {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                let endpoints = if tracker_url.starts_with("udp://") {
                    resolve_udp_tracker(&tracker_url, info_hash, my_id)
                } else {
                    http::announce(&tracker_url, info_hash, my_id, 6881, timeout)
                };
                match endpoints {
                    Ok(peers) => forward_new_endpoints(peers, &seen, &tx),
                    Err(e) => warn!("tracker {tracker_url} failed: {e}"),
                }
            }));
        }

        if let Some(dht) = &self.dht {
            let dht = dht.clone();
            let info_hash = magnet.info_hash;
            let seen = seen.clone();
            let tx = endpoint_tx.clone();
            source_handles.push(thread::spawn(move || {
                let (dht_tx, dht_rx) = unbounded();
                let lookup = thread::spawn(move || {
                    if let Ok(mut node) = dht.lock() {
                        if let Err(e) = node.get_peers(info_hash, dht_tx) {
                            warn!("dht lookup failed: {e}");
                        }
                    }
                });
                for addr in dht_rx {
                    forward_new_endpoints(vec![addr], &seen, &tx);
                }
                let _ = lookup.join();
            }));
        }
        drop(endpoint_tx);

        let worker_handles = manager::spawn_pool(
            PeerManagerConfig {
                pool_size: self.config.peer_pool.pool_size,
                connect_timeout: self.config.peer_pool.connect_timeout,
                session_budget: self.config.peer_pool.session_budget,
            },
            magnet.info_hash,
            self.my_id,
            endpoint_rx,
            result_tx,
            cancel.clone(),
        );

        let deadline = Instant::now() + self.config.request_budget;
        let raw_info = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                cancel.store(true, Ordering::Relaxed);
                break None;
            }
            match result_rx.recv_timeout(remaining.min(Duration::from_millis(500))) {
                Ok(raw_info) => break Some(raw_info),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if source_handles.iter().all(|h| h.is_finished())
                        && worker_handles.iter().all(|h| h.is_finished())
                    {
                        break None;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break None,
            }
        };

        cancel.store(true, Ordering::Relaxed);
        for handle in source_handles {
            let _ = handle.join();
        }
        for handle in worker_handles {
            let _ = handle.join();
        }

        let raw_info = raw_info.ok_or(Error::Exhausted)?;

        if let Some(cache) = &self.cache {
            cache.put(&magnet.info_hash, &raw_info);
        }

        let torrent = Torrent::assemble(&raw_info, &magnet.trackers)
            .map_err(|e| Error::MalformedInput(e.to_string()))?;
        let filename = filename_for(magnet, &torrent);
        let bytes = encode(&torrent)?;
        Ok((filename, bytes))
    }
}

fn resolve_udp_tracker(tracker_url: &str, info_hash: Id20, my_id: [u8; 20]) -> anyhow::Result<Vec<SocketAddr>> {
    let host_port = tracker_url
        .strip_prefix("udp://")
        .ok_or_else(|| anyhow::anyhow!("not a udp:// url"))?;
    let host_port = host_port.split('/').next().unwrap_or(host_port);
    let addr = std::net::ToSocketAddrs::to_socket_addrs(&host_port)?
        .next()
        .ok_or_else(|| anyhow::anyhow!("{tracker_url}: could not resolve"))?;
    udp::announce(addr, info_hash, my_id, 6881)
}

fn forward_new_endpoints(
    endpoints: Vec<SocketAddr>,
    seen: &Arc<Mutex<HashSet<SocketAddr>>>,
    tx: &crossbeam_channel::Sender<SocketAddr>,
) {
    let mut seen = seen.lock().expect("dedup set poisoned");
    for addr in endpoints {
        if addr.port() != 0 && seen.insert(addr) {
            let _ = tx.send(addr);
        }
    }
}

fn filename_for(magnet: &MagnetRequest, torrent: &Torrent) -> String {
    let name = magnet.display_name.clone().unwrap_or_else(|| torrent.name().to_string());
    sanitize_filename(&name)
}

fn encode(torrent: &Torrent) -> Result<Vec<u8>, Error> {
    torrent
        .to_bytes()
        .map_err(|e| Error::MalformedInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_prefers_magnet_display_name() {
        let magnet = MagnetRequest {
            info_hash: Id20([0u8; 20]),
            display_name: Some("custom-name".to_string()),
            trackers: vec![],
        };
        let raw = serde_bencode::to_bytes(&crate::torrent::Info {
            name: "fallback".to_string(),
            pieces: serde_bytes::ByteBuf::from(vec![0u8; 20]),
            piece_length: 16384,
            md5sum: None,
            length: Some(1),
            files: None,
            private: None,
        })
        .unwrap();
        let torrent = Torrent::assemble(&raw, &[]).unwrap();
        assert_eq!(filename_for(&magnet, &torrent), "custom-name.torrent");
    }

    #[test]
    fn exhausted_error_when_no_trackers_and_no_dht() {
        let config = ResolverConfig {
            request_budget: Duration::from_millis(300),
            ..ResolverConfig::default()
        };
        let resolver = Resolver::new(config, None, None);
        let magnet = MagnetRequest {
            info_hash: Id20::random(),
            display_name: None,
            trackers: vec![],
        };
        let result = resolver.retrieve_torrent(&magnet);
        assert!(matches!(result, Err(Error::Exhausted)));
    }
}
