//! MTProto wire protocol: secrets, the datacenter table, the obfuscated2
//! handshake and FakeTLS record framing.
//!
//! Everything here is pure byte manipulation; sockets never appear below
//! this module.

pub mod dc;
pub mod faketls;
pub mod obfuscated;
pub mod secret;

pub use dc::Datacenter;
pub use obfuscated::TransportTag;
pub use secret::{Secret, SecretTag};
