//! Datacenter connection pool.
//!
//! Keeps a small number of idle, pre-handshake TCP connections per
//! datacenter so a fresh session does not always pay the dial latency.
//! Sockets come back "clean": once a session has written its upstream
//! handshake the socket carries stream state and must never return here.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::Result;
use crate::protocol::dc::Datacenter;

use super::tcp;

/// Default max idle connections per datacenter
pub const DEFAULT_SLOTS_PER_DC: usize = 10;

/// Health probe budget; a socket that stays quiet this long is healthy
const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Max idle connections kept per datacenter
    pub slots_per_dc: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { slots_per_dc: DEFAULT_SLOTS_PER_DC }
    }
}

/// Per-datacenter pool of idle upstream connections.
pub struct PeerPool {
    config: PoolConfig,
    slots: [Mutex<Vec<TcpStream>>; 5],
}

impl PeerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    fn slot(&self, dc: &Datacenter) -> &Mutex<Vec<TcpStream>> {
        &self.slots[usize::from(dc.id) - 1]
    }

    /// Take a live connection to `dc`, reusing an idle one when its health
    /// probe passes, dialing otherwise.
    pub async fn checkout(&self, dc: &Datacenter, prefer_ipv6: bool) -> Result<TcpStream> {
        loop {
            let candidate = self.slot(dc).lock().pop();
            let Some(stream) = candidate else { break };

            if probe_idle(&stream).await {
                trace!(dc = dc.id, "pool: reusing idle connection");
                return Ok(stream);
            }
            debug!(dc = dc.id, "pool: discarding stale connection");
        }

        tcp::dial(dc, prefer_ipv6).await
    }

    /// Return a clean connection; dropped silently when the slot is full.
    pub fn checkin(&self, dc: &Datacenter, stream: TcpStream) {
        let mut slot = self.slot(dc).lock();
        if slot.len() < self.config.slots_per_dc {
            slot.push(stream);
        } else {
            debug!(dc = dc.id, "pool: slot full, dropping connection");
        }
    }

    /// Idle connections currently held for `dc`.
    pub fn idle_count(&self, dc: &Datacenter) -> usize {
        self.slot(dc).lock().len()
    }
}

/// Non-consuming health probe: peek for up to [`PROBE_TIMEOUT`]. Pending
/// bytes mean the socket is useless for a fresh handshake; EOF or an error
/// mean it is dead. Only silence passes.
async fn probe_idle(stream: &TcpStream) -> bool {
    let mut scratch = [0u8; 1];
    match timeout(PROBE_TIMEOUT, stream.peek(&mut scratch)).await {
        Err(_) => true,
        Ok(Ok(_)) | Ok(Err(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::dc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn test_pool_config_default() {
        assert_eq!(PoolConfig::default().slots_per_dc, DEFAULT_SLOTS_PER_DC);
    }

    #[tokio::test]
    async fn test_checkin_respects_capacity() {
        let pool = PeerPool::new(PoolConfig { slots_per_dc: 1 });
        let dc = dc::by_id(1).unwrap();

        let (a, _keep_a) = local_pair().await;
        let (b, _keep_b) = local_pair().await;

        pool.checkin(dc, a);
        assert_eq!(pool.idle_count(dc), 1);

        // Slot full: second connection is dropped, not queued.
        pool.checkin(dc, b);
        assert_eq!(pool.idle_count(dc), 1);
    }

    #[tokio::test]
    async fn test_checkout_reuses_quiet_connection() {
        let pool = PeerPool::new(PoolConfig::default());
        let dc = dc::by_id(2).unwrap();

        let (conn, _server) = local_pair().await;
        let local = conn.local_addr().unwrap();
        pool.checkin(dc, conn);

        let reused = pool.checkout(dc, false).await.unwrap();
        assert_eq!(reused.local_addr().unwrap(), local);
        assert_eq!(pool.idle_count(dc), 0);
    }

    #[tokio::test]
    async fn test_probe_discards_noisy_connection() {
        let (conn, mut server) = local_pair().await;

        assert!(probe_idle(&conn).await);

        // A stray byte poisons the idle socket.
        server.write_all(b"x").await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!probe_idle(&conn).await);

        // The probe must not have consumed the byte.
        let mut scratch = [0u8; 1];
        assert_eq!(conn.peek(&mut scratch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_probe_discards_closed_connection() {
        let (conn, server) = local_pair().await;
        drop(server);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!probe_idle(&conn).await);
    }
}
