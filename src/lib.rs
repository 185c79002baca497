//! Mirage - an MTProto proxy that hides Telegram traffic behind TLS
//!
//! # Architecture
//!
//! ```text
//! client socket
//! → FakeTLS unwrap (protocol::faketls)
//! → obfuscated2 derive (protocol::obfuscated)
//! → anti-replay gate (antireplay)
//! → datacenter pool checkout (transport::pool)
//! → fresh upstream handshake
//! → bidirectional relay (app::relay)
//! ```
//!
//! ## Core principles
//!
//! - The protocol layer is pure byte manipulation; sockets stay in
//!   `transport` and `app`
//! - Shared state (secret, cache, pool) is injected into sessions, never
//!   ambient
//! - One task per session, two pump tasks per relay, a broadcast channel
//!   for shutdown
//!
//! ## Module structure
//!
//! ```text
//! src/
//! ├── antireplay.rs    # handshake fingerprint cache
//! ├── config.rs        # environment configuration
//! ├── crypto/          # AES-256-CTR, SHA-256, randomness
//! ├── protocol/        # secrets, DC table, obfuscated2, FakeTLS records
//! ├── transport/       # dialing and the per-DC connection pool
//! └── app/             # runtime, session state machine, relay, metrics
//! ```

pub mod antireplay;
pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use app::Runtime;
pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{Datacenter, Secret, SecretTag, TransportTag};
