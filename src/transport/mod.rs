//! Transport layer: dialing Telegram datacenters and pooling the resulting
//! connections.

pub mod pool;
pub mod tcp;

pub use pool::{PeerPool, PoolConfig};
