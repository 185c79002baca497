//! Error types for Mirage

use thiserror::Error;

/// Main error type for Mirage
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Client closed or stalled before completing the handshake")]
    HandshakeRead,

    #[error("Handshake matched a known non-MTProto prefix")]
    ObviousMarker,

    #[error("Unknown transport tag {0:#010x}")]
    UnknownTransport(u32),

    #[error("Unknown datacenter id {0}")]
    UnknownDatacenter(i16),

    #[error("Replayed handshake")]
    Replay,

    #[error("Peer dial failed: {0}")]
    PeerDial(String),

    #[error("Upstream rejected the handshake: {0}")]
    PeerHandshake(String),

    #[error("Malformed TLS record: {0}")]
    FakeTlsFrame(String),

    #[error("Relay IO error: {0}")]
    RelayIo(std::io::Error),

    #[error("Session limit reached")]
    Overload,
}

impl Error {
    /// Label used for the `errors_total{kind}` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::InvalidSecret(_) => "invalid_secret",
            Error::HandshakeRead => "handshake_read",
            Error::ObviousMarker => "obvious_marker",
            Error::UnknownTransport(_) => "unknown_transport",
            Error::UnknownDatacenter(_) => "unknown_dc",
            Error::Replay => "replay",
            Error::PeerDial(_) => "peer_dial",
            Error::PeerHandshake(_) => "peer_handshake",
            Error::FakeTlsFrame(_) => "faketls_frame",
            Error::RelayIo(_) => "relay_io",
            Error::Overload => "overload",
        }
    }
}

/// Result type alias for Mirage
pub type Result<T> = std::result::Result<T, Error>;
