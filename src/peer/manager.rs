//! Bounded pool of peer-wire workers: dequeues
//! deduplicated endpoints and races them for valid metadata, first
//! success wins.

use crate::id::Id20;
use crate::peer::metadata;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct PeerManagerConfig {
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub session_budget: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: 50,
            connect_timeout: Duration::from_secs(10),
            session_budget: Duration::from_secs(30),
        }
    }
}

/// Spawns `config.pool_size` worker threads that drain `endpoints` and
/// attempt the ut_metadata exchange against each one. The first worker to
/// recover and verify metadata sends it on `result_tx`; `cancel` is set so
/// the remaining workers stop picking up new endpoints and exit.
pub fn spawn_pool(
    config: PeerManagerConfig,
    info_hash: Id20,
    my_id: [u8; 20],
    endpoints: Receiver<SocketAddr>,
    result_tx: Sender<Vec<u8>>,
    cancel: Arc<AtomicBool>,
) -> Vec<thread::JoinHandle<()>> {
    (0..config.pool_size)
        .map(|worker_index| {
            let endpoints = endpoints.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let connect_timeout = config.connect_timeout;
            let session_budget = config.session_budget;

            thread::Builder::new()
                .name(format!("peer-worker-{worker_index}"))
                .spawn(move || {
                    while !cancel.load(Ordering::Relaxed) {
                        let addr = match endpoints.recv_timeout(Duration::from_millis(250)) {
                            Ok(addr) => addr,
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        };

                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }

                        match metadata::fetch_metadata(
                            addr,
                            info_hash,
                            my_id,
                            connect_timeout,
                            session_budget,
                        ) {
                            Ok(raw_info) => {
                                debug!("worker {worker_index}: recovered metadata from {addr}");
                                cancel.store(true, Ordering::Relaxed);
                                let _ = result_tx.send(raw_info);
                                break;
                            }
                            Err(e) => {
                                warn!("worker {worker_index}: {addr} failed: {e}");
                            }
                        }
                    }
                })
                .expect("spawning a peer worker thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn pool_drains_endpoints_and_exits_when_channel_closes() {
        let (endpoint_tx, endpoint_rx) = unbounded();
        let (result_tx, _result_rx) = unbounded();
        let cancel = Arc::new(AtomicBool::new(false));

        endpoint_tx.send("127.0.0.1:1".parse().unwrap()).unwrap();
        drop(endpoint_tx);

        let handles = spawn_pool(
            PeerManagerConfig {
                pool_size: 2,
                connect_timeout: Duration::from_millis(100),
                session_budget: Duration::from_millis(100),
            },
            Id20([0u8; 20]),
            [0u8; 20],
            endpoint_rx,
            result_tx,
            cancel,
        );

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
