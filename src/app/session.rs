//! Per-connection session state machine.
//!
//! One session drives one client from accept to teardown:
//!
//! ```text
//! AwaitHandshake → Deriving → AwaitPeer → Relaying → Draining → Closed
//! ```
//!
//! Errors transition straight to Closed and increment a typed counter; the
//! client only ever sees a plausible FakeTLS exchange followed by opaque
//! bytes, or a TCP close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::antireplay::ReplayCache;
use crate::error::{Error, Result};
use crate::protocol::dc::{self, Datacenter};
use crate::protocol::faketls::{self, RecordDecoder};
use crate::protocol::obfuscated::{self, TransportTag, HANDSHAKE_LEN};
use crate::protocol::secret::{Secret, SECRET_KEY_LEN};
use crate::transport::PeerPool;

use super::metrics;
use super::relay::{self, ClientToPeer, PeerToClient, RelaySummary, SessionCounters};

/// Deadline for the whole client handshake, FakeTLS exchange included
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared collaborators injected into every session at accept time.
pub struct SessionContext {
    pub secret: Secret,
    pub cache: Arc<ReplayCache>,
    pub pool: Arc<PeerPool>,
    pub prefer_ipv6: bool,
    pub allow_dc_fallback: bool,
    pub middle_secret: Option<[u8; SECRET_KEY_LEN]>,
}

/// What AwaitHandshake produced.
enum HandshakeInput {
    Plain {
        frame: [u8; HANDSHAKE_LEN],
    },
    FakeTls {
        frame: [u8; HANDSHAKE_LEN],
        /// Decoder still holding any raw bytes read past the handshake
        decoder: RecordDecoder,
        /// Payload bytes beyond the 64-byte frame, still client-encrypted
        pending: BytesMut,
    },
}

impl HandshakeInput {
    fn frame(&self) -> &[u8; HANDSHAKE_LEN] {
        match self {
            Self::Plain { frame } => frame,
            Self::FakeTls { frame, .. } => frame,
        }
    }
}

/// One client connection being proxied.
pub struct Session {
    ctx: Arc<SessionContext>,
    client: TcpStream,
    remote: SocketAddr,
    id: String,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>, client: TcpStream, remote: SocketAddr) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            ctx,
            client,
            remote,
            id: format!("{}/{}", remote, nanos),
        }
    }

    /// Drive the session to completion, recording metrics on the way out.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) {
        let started = Instant::now();
        metrics::CONNECTIONS_ACTIVE.inc();

        let id = self.id.clone();
        let remote = self.remote;
        let outcome = self.drive(shutdown).await;

        metrics::CONNECTIONS_ACTIVE.dec();
        match outcome {
            Ok((dc, summary)) => {
                metrics::CONNECTIONS_TOTAL.with_label_values(&["ok"]).inc();
                metrics::CONNECTION_DURATION
                    .with_label_values(&[dc.label()])
                    .observe(started.elapsed().as_secs_f64());
                info!(
                    session = %id,
                    dc = dc.id,
                    up = summary.client_to_peer,
                    down = summary.peer_to_client,
                    "session closed"
                );
            }
            Err(e) => {
                metrics::record_error(e.kind());
                metrics::CONNECTIONS_TOTAL.with_label_values(&["error"]).inc();
                debug!(session = %id, remote = %remote, error = %e, "session failed");
            }
        }
    }

    async fn drive(
        mut self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(&'static Datacenter, RelaySummary)> {
        // AwaitHandshake
        let input = timeout(
            HANDSHAKE_TIMEOUT,
            await_handshake(&mut self.client, &self.ctx.secret, &self.ctx.cache),
        )
        .await
        .map_err(|_| Error::HandshakeRead)??;

        // Deriving: witness first, derive second. A replayed frame never
        // reaches the codec, let alone the dialer.
        if !self.ctx.cache.witness(input.frame()) {
            return Err(Error::Replay);
        }
        let hs = obfuscated::client_handshake(input.frame(), &self.ctx.secret)?;
        debug!(
            session = %self.id,
            transport = hs.transport.name(),
            dc_id = hs.dc_id,
            "handshake derived"
        );

        let (faketls_carry, is_faketls) = match input {
            HandshakeInput::Plain { .. } => (None, false),
            HandshakeInput::FakeTls { decoder, pending, .. } => (Some((decoder, pending)), true),
        };

        // AwaitPeer
        let requested = resolve_dc(hs.dc_id, self.ctx.allow_dc_fallback)?;
        let prefer_ipv6 = hs.dc_id < 0 || self.ctx.prefer_ipv6;
        let (mut peer, dc) = self.connect_peer(requested, prefer_ipv6).await?;
        metrics::record_datacenter_connection(dc);
        debug!(session = %self.id, dc = dc.id, location = dc.location, "peer connected");

        let upstream = obfuscated::peer_handshake(
            TransportTag::PaddedIntermediate,
            i16::from(dc.id),
            self.ctx.middle_secret.as_ref(),
        );
        timeout(relay::WRITE_TIMEOUT, peer.write_all(&upstream.frame))
            .await
            .map_err(|_| Error::PeerHandshake("handshake write timed out".into()))?
            .map_err(|e| Error::PeerHandshake(e.to_string()))?;

        // Relaying
        let (framing, pending) = match faketls_carry {
            Some((decoder, pending)) => (Some(decoder), pending),
            None => (None, BytesMut::new()),
        };
        let up = ClientToPeer {
            decryptor: hs.decryptor,
            encryptor: upstream.encryptor,
            framing,
            pending,
        };
        let down = PeerToClient {
            decryptor: upstream.decryptor,
            encryptor: hs.encryptor,
            faketls: is_faketls,
        };

        let counters = Arc::new(SessionCounters::default());
        let (client_read, client_write) = self.client.into_split();
        let (peer_read, peer_write) = peer.into_split();
        let summary = relay::run(
            client_read,
            client_write,
            peer_read,
            peer_write,
            up,
            down,
            counters,
            dc.label(),
            shutdown,
        )
        .await?;

        Ok((dc, summary))
    }

    /// Check a peer out of the pool, walking the fallback candidates once
    /// each when allowed.
    async fn connect_peer(
        &self,
        dc: &'static Datacenter,
        prefer_ipv6: bool,
    ) -> Result<(TcpStream, &'static Datacenter)> {
        match self.ctx.pool.checkout(dc, prefer_ipv6).await {
            Ok(stream) => return Ok((stream, dc)),
            Err(e) if !self.ctx.allow_dc_fallback => return Err(e),
            Err(e) => {
                debug!(session = %self.id, dc = dc.id, error = %e, "dial failed, trying fallback candidates");
            }
        }

        for candidate in dc::dial_candidates(dc.id) {
            match self.ctx.pool.checkout(candidate, prefer_ipv6).await {
                Ok(stream) => return Ok((stream, candidate)),
                Err(e) => {
                    debug!(session = %self.id, dc = candidate.id, error = %e, "fallback dial failed");
                }
            }
        }

        Err(Error::PeerDial("all datacenter candidates failed".into()))
    }
}

/// Map a client-supplied datacenter id onto the table, honoring the
/// fallback policy for unknown ids.
fn resolve_dc(dc_id: i16, allow_fallback: bool) -> Result<&'static Datacenter> {
    match dc::by_id(dc_id) {
        Some(dc) => Ok(dc),
        None if allow_fallback => {
            let fallback = dc::fallback();
            debug!(dc_id, fallback = fallback.id, "unknown datacenter, using priority-1 fallback");
            Ok(fallback)
        }
        None => Err(Error::UnknownDatacenter(dc_id)),
    }
}

/// Read the client handshake: 64 raw bytes, or a full FakeTLS hello
/// exchange when the first bytes form a TLS 1.2 handshake record.
async fn await_handshake<S>(
    stream: &mut S,
    secret: &Secret,
    cache: &ReplayCache,
) -> Result<HandshakeInput>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut first)
        .await
        .map_err(|_| Error::HandshakeRead)?;

    if first[0] == faketls::REC_HANDSHAKE && first[1..3] == faketls::TLS12 {
        faketls_handshake(stream, first, secret, cache).await
    } else {
        Ok(HandshakeInput::Plain { frame: first })
    }
}

async fn faketls_handshake<S>(
    stream: &mut S,
    first: [u8; HANDSHAKE_LEN],
    secret: &Secret,
    cache: &ReplayCache,
) -> Result<HandshakeInput>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = faketls::RecordHeader::parse(&first[..faketls::RECORD_HEADER_LEN])?;
    let record_end = faketls::RECORD_HEADER_LEN + header.len;

    // Pull in the rest of the ClientHello record; anything already read
    // beyond it belongs to the next records.
    let mut record = vec![0u8; record_end.max(HANDSHAKE_LEN)];
    record[..HANDSHAKE_LEN].copy_from_slice(&first);
    if record_end > HANDSHAKE_LEN {
        stream
            .read_exact(&mut record[HANDSHAKE_LEN..])
            .await
            .map_err(|_| Error::HandshakeRead)?;
    }

    let hello = faketls::parse_client_hello(&record[faketls::RECORD_HEADER_LEN..record_end])?;

    // A replayed hello dies before the inner frame is even read.
    if !cache.witness(&hello.random) {
        return Err(Error::Replay);
    }

    let trio = faketls::server_hello_trio(secret.key(), &hello);
    stream
        .write_all(&trio)
        .await
        .map_err(|_| Error::HandshakeRead)?;
    stream.flush().await.map_err(|_| Error::HandshakeRead)?;

    let mut decoder = RecordDecoder::new();
    if record.len() > record_end {
        decoder.extend(&record[record_end..]);
    }

    // The obfuscated2 frame arrives inside the first ApplicationData
    // records.
    let mut payload = BytesMut::with_capacity(HANDSHAKE_LEN);
    let mut read_buf = [0u8; 4096];
    loop {
        faketls::drain_payload(&mut decoder, &mut payload, HANDSHAKE_LEN)?;
        if payload.len() >= HANDSHAKE_LEN {
            break;
        }
        let n = stream
            .read(&mut read_buf)
            .await
            .map_err(|_| Error::HandshakeRead)?;
        if n == 0 {
            return Err(Error::HandshakeRead);
        }
        decoder.extend(&read_buf[..n]);
    }

    let mut frame = [0u8; HANDSHAKE_LEN];
    frame.copy_from_slice(&payload[..HANDSHAKE_LEN]);
    payload.advance(HANDSHAKE_LEN);

    Ok(HandshakeInput::FakeTls { frame, decoder, pending: payload })
}
