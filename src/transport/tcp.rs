//! TCP dialing toward Telegram datacenters.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::dc::Datacenter;

/// Per-address connect budget
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial one datacenter. IPv6 goes first when preferred, with IPv4 as the
/// fallback; otherwise IPv4 only.
pub async fn dial(dc: &Datacenter, prefer_ipv6: bool) -> Result<TcpStream> {
    if prefer_ipv6 {
        match dial_addr(dc.addr_v6()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!(dc = dc.id, error = %e, "IPv6 dial failed, trying IPv4"),
        }
    }
    dial_addr(dc.addr_v4()).await
}

async fn dial_addr(addr: SocketAddr) -> Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::PeerDial(format!("connect {} timed out", addr)))?
        .map_err(|e| Error::PeerDial(format!("connect {}: {}", addr, e)))?;

    // Disable Nagle's algorithm for lower latency
    stream.set_nodelay(true)?;
    Ok(stream)
}
