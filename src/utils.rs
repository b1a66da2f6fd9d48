//! Small crate-wide helpers with no more natural home.

use rand::Rng;

/// A fresh random 20-byte peer id, as handed to every tracker/peer-wire
/// handshake this process makes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    rng.fill(&mut peer_id);
    peer_id
}
