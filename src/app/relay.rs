//! Bidirectional relay pumps.
//!
//! One session runs two independent pumps, client-to-peer and
//! peer-to-client. Each strips one obfuscation layer and applies the other;
//! FakeTLS sessions additionally lose their record framing on the way up
//! and regain it on the way down. The pumps share nothing but a cancel
//! flag: when either direction ends, the other is asked to stop and given a
//! short drain window.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::crypto::Aes256Ctr;
use crate::error::{Error, Result};
use crate::protocol::faketls::{self, RecordDecoder};

use super::metrics;

/// Relay buffer size (64 KiB)
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Idle deadline on relay reads
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline on relay writes
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the surviving pump gets to drain after its twin stops
pub const DRAIN_WAIT: Duration = Duration::from_secs(1);

pub const DIR_CLIENT_TO_PEER: &str = "client_to_peer";
pub const DIR_PEER_TO_CLIENT: &str = "peer_to_client";

/// Shared stop signal between the two pumps of one session.
pub struct RelayState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl RelayState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled_wait(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a concurrent cancel cannot slip
            // between the test and the wait.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-session byte counters. Single-writer: one pump owns each field.
#[derive(Default)]
pub struct SessionCounters {
    client_to_peer: AtomicU64,
    peer_to_client: AtomicU64,
}

impl SessionCounters {
    pub fn client_to_peer(&self) -> u64 {
        self.client_to_peer.load(Ordering::Relaxed)
    }

    pub fn peer_to_client(&self) -> u64 {
        self.peer_to_client.load(Ordering::Relaxed)
    }
}

/// Client-to-peer transform state.
pub struct ClientToPeer {
    /// Inverts the client's stream cipher
    pub decryptor: Aes256Ctr,
    /// Applies the upstream stream cipher
    pub encryptor: Aes256Ctr,
    /// Record decoder for FakeTLS sessions, with any bytes read past the
    /// handshake still buffered inside
    pub framing: Option<RecordDecoder>,
    /// Payload bytes that arrived inside the handshake records, still
    /// encrypted under the client cipher
    pub pending: BytesMut,
}

/// Peer-to-client transform state.
pub struct PeerToClient {
    /// Inverts the upstream stream cipher
    pub decryptor: Aes256Ctr,
    /// Applies the client's stream cipher
    pub encryptor: Aes256Ctr,
    /// Re-frame into ApplicationData records
    pub faketls: bool,
}

/// Bytes moved in each direction by a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub client_to_peer: u64,
    pub peer_to_client: u64,
}

/// Read with the idle deadline, waking early on cancellation. `Ok(0)` means
/// EOF or an advisory stop.
async fn read_some<R: AsyncRead + Unpin>(
    src: &mut R,
    buf: &mut [u8],
    state: &RelayState,
) -> Result<usize> {
    tokio::select! {
        _ = state.cancelled_wait() => Ok(0),
        result = timeout(READ_IDLE_TIMEOUT, src.read(buf)) => match result {
            Err(_) => Err(Error::RelayIo(io::Error::new(
                io::ErrorKind::TimedOut,
                "relay read idle timeout",
            ))),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(Error::RelayIo(e)),
        },
    }
}

async fn write_all_deadline<W: AsyncWrite + Unpin>(dst: &mut W, data: &[u8]) -> Result<()> {
    timeout(WRITE_TIMEOUT, async {
        dst.write_all(data).await?;
        dst.flush().await
    })
    .await
    .map_err(|_| Error::RelayIo(io::Error::new(io::ErrorKind::TimedOut, "relay write timed out")))?
    .map_err(Error::RelayIo)
}

async fn pump_client_to_peer<R, W>(
    mut src: R,
    mut dst: W,
    mut ctx: ClientToPeer,
    state: Arc<RelayState>,
    counters: Arc<SessionCounters>,
    dc_label: &'static str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    // Payload that arrived inside the handshake records goes upstream first.
    if !ctx.pending.is_empty() {
        let mut chunk = ctx.pending.split();
        ctx.decryptor.apply(&mut chunk);
        ctx.encryptor.apply(&mut chunk);
        write_all_deadline(&mut dst, &chunk).await?;
        counters.client_to_peer.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        metrics::record_transfer(DIR_CLIENT_TO_PEER, dc_label, chunk.len() as u64);
    }

    loop {
        // Drain every complete record already buffered before reading more.
        if let Some(decoder) = ctx.framing.as_mut() {
            while let Some(mut payload) = decoder.next_payload()? {
                ctx.decryptor.apply(&mut payload);
                ctx.encryptor.apply(&mut payload);
                write_all_deadline(&mut dst, &payload).await?;
                counters.client_to_peer.fetch_add(payload.len() as u64, Ordering::Relaxed);
                metrics::record_transfer(DIR_CLIENT_TO_PEER, dc_label, payload.len() as u64);
            }
        }

        if state.is_cancelled() {
            break;
        }
        let n = read_some(&mut src, &mut buf, &state).await?;
        if n == 0 {
            break;
        }

        match ctx.framing.as_mut() {
            Some(decoder) => decoder.extend(&buf[..n]),
            None => {
                let chunk = &mut buf[..n];
                ctx.decryptor.apply(chunk);
                ctx.encryptor.apply(chunk);
                write_all_deadline(&mut dst, chunk).await?;
                counters.client_to_peer.fetch_add(n as u64, Ordering::Relaxed);
                metrics::record_transfer(DIR_CLIENT_TO_PEER, dc_label, n as u64);
            }
        }
    }

    let _ = dst.shutdown().await;
    Ok(())
}

async fn pump_peer_to_client<R, W>(
    mut src: R,
    mut dst: W,
    mut ctx: PeerToClient,
    state: Arc<RelayState>,
    counters: Arc<SessionCounters>,
    dc_label: &'static str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut framed = BytesMut::new();

    loop {
        if state.is_cancelled() {
            break;
        }
        let n = read_some(&mut src, &mut buf, &state).await?;
        if n == 0 {
            break;
        }

        let chunk = &mut buf[..n];
        ctx.decryptor.apply(chunk);
        ctx.encryptor.apply(chunk);

        if ctx.faketls {
            framed.clear();
            faketls::frame_app_data(chunk, &mut framed);
            write_all_deadline(&mut dst, &framed).await?;
        } else {
            write_all_deadline(&mut dst, chunk).await?;
        }

        counters.peer_to_client.fetch_add(n as u64, Ordering::Relaxed);
        metrics::record_transfer(DIR_PEER_TO_CLIENT, dc_label, n as u64);
    }

    let _ = dst.shutdown().await;
    Ok(())
}

fn flatten(join: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match join {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::RelayIo(io::Error::new(io::ErrorKind::Other, e.to_string()))),
    }
}

async fn drain(state: &RelayState, handle: &mut JoinHandle<Result<()>>) -> Result<()> {
    state.cancel();
    match timeout(DRAIN_WAIT, &mut *handle).await {
        Ok(join) => flatten(join),
        Err(_) => {
            handle.abort();
            Ok(())
        }
    }
}

/// Drive both pumps until either direction ends, then stop and drain the
/// other. A global shutdown signal cancels both.
#[allow(clippy::too_many_arguments)]
pub async fn run<CR, CW, PR, PW>(
    client_read: CR,
    client_write: CW,
    peer_read: PR,
    peer_write: PW,
    up: ClientToPeer,
    down: PeerToClient,
    counters: Arc<SessionCounters>,
    dc_label: &'static str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<RelaySummary>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    PR: AsyncRead + Unpin + Send + 'static,
    PW: AsyncWrite + Unpin + Send + 'static,
{
    let state = RelayState::new();

    let mut up_task = tokio::spawn(pump_client_to_peer(
        client_read,
        peer_write,
        up,
        state.clone(),
        counters.clone(),
        dc_label,
    ));
    let mut down_task = tokio::spawn(pump_peer_to_client(
        peer_read,
        client_write,
        down,
        state.clone(),
        counters.clone(),
        dc_label,
    ));

    let (first, second) = tokio::select! {
        r = &mut up_task => (flatten(r), drain(&state, &mut down_task).await),
        r = &mut down_task => (flatten(r), drain(&state, &mut up_task).await),
        _ = shutdown.recv() => (
            drain(&state, &mut up_task).await,
            drain(&state, &mut down_task).await,
        ),
    };

    let summary = RelaySummary {
        client_to_peer: counters.client_to_peer(),
        peer_to_client: counters.peer_to_client(),
    };

    first?;
    second?;
    Ok(summary)
}
