//! Kademlia DHT (BEP 5): KRPC wire format, routing table, and the node
//! that drives bootstrapping and `get_peers` lookups.

pub mod krpc;
pub mod node;
pub mod routing_table;

pub use node::DhtNode;
