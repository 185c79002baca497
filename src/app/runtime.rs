//! Proxy runtime: the accept loop and lifecycle management.
//!
//! The runtime owns the shared collaborators (secret, anti-replay cache,
//! peer pool), accepts client sockets, enforces the in-flight session cap
//! and fans a shutdown signal out to every task it spawned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

use crate::antireplay::{self, ReplayCache};
use crate::config::Config;
use crate::error::Result;
use crate::transport::{PeerPool, PoolConfig};

use super::metrics;
use super::session::{Session, SessionContext};
use super::stats_api;

/// Grace window for in-flight sessions after shutdown is signalled
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The long-running proxy server.
pub struct Runtime {
    config: Config,
    ctx: Arc<SessionContext>,
    shutdown_tx: broadcast::Sender<()>,
    session_permits: Arc<Semaphore>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);

        let cache = Arc::new(ReplayCache::new(config.antireplay_bytes));
        let pool = Arc::new(PeerPool::new(PoolConfig::default()));
        let ctx = Arc::new(SessionContext {
            secret: config.secret.clone(),
            cache,
            pool,
            prefer_ipv6: config.prefer_ipv6,
            allow_dc_fallback: config.allow_dc_fallback,
            middle_secret: config.middle_secret,
        });
        let session_permits = Arc::new(Semaphore::new(config.max_sessions));

        Self { config, ctx, shutdown_tx, session_permits }
    }

    /// Handle for asserting shutdown from outside (tests, signal handlers).
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown. Accepts clients, spawns one session task each.
    pub async fn run(&self) -> Result<()> {
        metrics::init_metrics();

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        info!(
            "Telegram client URL: {}",
            self.config
                .secret
                .invite_url(&self.config.advertised_host, self.config.bind_addr.port())
        );

        antireplay::spawn_sweeper(self.ctx.cache.clone(), self.shutdown_tx.subscribe());
        tokio::spawn(stats_api::start_api_server(
            self.config.metrics_addr,
            self.shutdown_tx.subscribe(),
        ));

        // Ctrl-C flips the global shutdown flag.
        let signal_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = signal_tx.send(());
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut accepted: u64 = 0;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            accepted += 1;
                            match self.session_permits.clone().try_acquire_owned() {
                                Ok(permit) => {
                                    let session = Session::new(self.ctx.clone(), stream, remote);
                                    let shutdown = self.shutdown_tx.subscribe();
                                    tokio::spawn(async move {
                                        session.run(shutdown).await;
                                        drop(permit);
                                    });
                                }
                                Err(_) => {
                                    metrics::record_error(crate::Error::Overload.kind());
                                    warn!(remote = %remote, "session cap reached, refusing connection");
                                }
                            }
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("listener stopping (accepted {} connections)", accepted);
                    break;
                }
            }
        }

        self.await_drain().await;
        Ok(())
    }

    /// Give in-flight sessions up to [`SHUTDOWN_GRACE`] to wind down.
    async fn await_drain(&self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.session_permits.available_permits() < self.config.max_sessions {
            if Instant::now() >= deadline {
                warn!("shutdown grace expired with sessions still open");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.metrics_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_runtime_stops_on_shutdown() {
        let runtime = Runtime::new(test_config());
        let shutdown = runtime.shutdown_handle();

        let handle = tokio::spawn(async move { runtime.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_runtime_new_wires_context() {
        let runtime = Runtime::new(test_config());
        assert!(runtime.ctx.cache.is_empty());
        assert_eq!(
            runtime.session_permits.available_permits(),
            runtime.config.max_sessions
        );
    }
}
