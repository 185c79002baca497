//! FakeTLS record framing.
//!
//! The obfuscated2 stream travels inside TLS 1.2 records so the wire looks
//! like HTTPS to a passive observer. The camouflage is record-deep only:
//! one ClientHello/ServerHello exchange up front, a tolerated dummy
//! ChangeCipherSpec, then ApplicationData records carrying the obfuscated
//! payload. Nothing here is real TLS.

use bytes::{Buf, BufMut, BytesMut};

use crate::crypto;
use crate::error::{Error, Result};
use crate::protocol::secret::SECRET_KEY_LEN;

pub const REC_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const REC_HANDSHAKE: u8 = 0x16;
pub const REC_APPLICATION_DATA: u8 = 0x17;

/// Record version on every frame (TLS 1.2)
pub const TLS12: [u8; 2] = [0x03, 0x03];

pub const RECORD_HEADER_LEN: usize = 5;

/// Maximum record payload
pub const MAX_RECORD_LEN: usize = 16 * 1024;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

/// A parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u8,
    pub len: usize,
}

impl RecordHeader {
    /// Parse and validate the five header bytes.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        debug_assert!(raw.len() >= RECORD_HEADER_LEN);

        let record_type = raw[0];
        if !matches!(
            record_type,
            REC_CHANGE_CIPHER_SPEC | REC_HANDSHAKE | REC_APPLICATION_DATA
        ) {
            return Err(Error::FakeTlsFrame(format!(
                "unexpected record type {:#04x}",
                record_type
            )));
        }
        if raw[1..3] != TLS12 {
            return Err(Error::FakeTlsFrame(format!(
                "unexpected record version {:02x}{:02x}",
                raw[1], raw[2]
            )));
        }

        let len = usize::from(u16::from_be_bytes([raw[3], raw[4]]));
        if len > MAX_RECORD_LEN {
            return Err(Error::FakeTlsFrame(format!("record length {} exceeds 16 KiB", len)));
        }

        Ok(Self { record_type, len })
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let len = self.len as u16;
        [self.record_type, TLS12[0], TLS12[1], (len >> 8) as u8, len as u8]
    }
}

/// The fields of a ClientHello the proxy actually cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
}

/// Parse a ClientHello handshake message (the payload of the first record).
pub fn parse_client_hello(payload: &[u8]) -> Result<ClientHello> {
    // type(1) length(3) version(2) random(32) session_id_len(1)
    if payload.len() < 39 {
        return Err(Error::FakeTlsFrame("ClientHello too short".into()));
    }
    if payload[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(Error::FakeTlsFrame(format!(
            "expected ClientHello, got handshake type {:#04x}",
            payload[0]
        )));
    }

    let declared = usize::from(payload[1]) << 16 | usize::from(payload[2]) << 8 | usize::from(payload[3]);
    if declared + 4 != payload.len() {
        return Err(Error::FakeTlsFrame("ClientHello length mismatch".into()));
    }

    let mut random = [0u8; 32];
    random.copy_from_slice(&payload[6..38]);

    let sid_len = usize::from(payload[38]);
    if sid_len > 32 || payload.len() < 39 + sid_len {
        return Err(Error::FakeTlsFrame("bad session id".into()));
    }
    let session_id = payload[39..39 + sid_len].to_vec();

    Ok(ClientHello { random, session_id })
}

/// Build the canned server response: ServerHello, a dummy ChangeCipherSpec
/// and an encrypted-looking ApplicationData record. Every variable field is
/// chained off `SHA-256(secret key ‖ client random)`, so the trio is
/// bit-reproducible per client.
pub fn server_hello_trio(secret_key: &[u8; SECRET_KEY_LEN], hello: &ClientHello) -> Vec<u8> {
    let mut seed_input = [0u8; SECRET_KEY_LEN + 32];
    seed_input[..SECRET_KEY_LEN].copy_from_slice(secret_key);
    seed_input[SECRET_KEY_LEN..].copy_from_slice(&hello.random);
    let server_random = crypto::sha256(&seed_input);
    let key_share = crypto::sha256(&server_random);

    // ServerHello body: a TLS 1.3 hello carried in 1.2 records, the shape
    // every modern server answers with.
    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&TLS12);
    body.extend_from_slice(&server_random);
    body.push(hello.session_id.len() as u8);
    body.extend_from_slice(&hello.session_id);
    body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.push(0x00); // no compression

    let mut exts = Vec::with_capacity(46);
    exts.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]); // key_share, x25519
    exts.extend_from_slice(&key_share);
    exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]); // supported_versions, 1.3
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut message = Vec::with_capacity(body.len() + 4);
    message.push(HANDSHAKE_SERVER_HELLO);
    message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    message.extend_from_slice(&body);

    // Fake handshake-finished data: length and content both keyed, so a
    // repeated probe sees an identical exchange.
    let app_len = 1024 + usize::from(server_random[0]) * 4;
    let mut app = vec![0u8; app_len];
    let mut block = key_share;
    for chunk in app.chunks_mut(32) {
        block = crypto::sha256(&block);
        chunk.copy_from_slice(&block[..chunk.len()]);
    }

    let mut out = Vec::with_capacity(message.len() + app.len() + 3 * RECORD_HEADER_LEN + 1);
    put_record(&mut out, REC_HANDSHAKE, &message);
    put_record(&mut out, REC_CHANGE_CIPHER_SPEC, &[0x01]);
    put_record(&mut out, REC_APPLICATION_DATA, &app);
    out
}

fn put_record(out: &mut Vec<u8>, record_type: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_RECORD_LEN);
    out.extend_from_slice(&RecordHeader { record_type, len: payload.len() }.encode());
    out.extend_from_slice(payload);
}

/// Wrap `payload` into ApplicationData records of at most 16 KiB each.
pub fn frame_app_data(payload: &[u8], out: &mut BytesMut) {
    for chunk in payload.chunks(MAX_RECORD_LEN) {
        out.put_slice(&RecordHeader { record_type: REC_APPLICATION_DATA, len: chunk.len() }.encode());
        out.put_slice(chunk);
    }
}

/// Incremental record decoder for the client-to-proxy direction.
///
/// Feed raw socket bytes with [`extend`](Self::extend), pop complete
/// ApplicationData payloads with [`next_payload`](Self::next_payload). A
/// partial record at a read boundary stays buffered until the rest arrives.
/// One dummy ChangeCipherSpec is tolerated; anything else is a framing
/// error.
#[derive(Default)]
pub struct RecordDecoder {
    buf: BytesMut,
    seen_change_cipher_spec: bool,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete ApplicationData payload; `Ok(None)` means more
    /// bytes are needed.
    pub fn next_payload(&mut self) -> Result<Option<BytesMut>> {
        loop {
            if self.buf.len() < RECORD_HEADER_LEN {
                return Ok(None);
            }
            let header = RecordHeader::parse(&self.buf[..RECORD_HEADER_LEN])?;
            if self.buf.len() < RECORD_HEADER_LEN + header.len {
                return Ok(None);
            }

            match header.record_type {
                REC_CHANGE_CIPHER_SPEC if !self.seen_change_cipher_spec => {
                    self.seen_change_cipher_spec = true;
                    self.buf.advance(RECORD_HEADER_LEN + header.len);
                }
                REC_APPLICATION_DATA => {
                    self.buf.advance(RECORD_HEADER_LEN);
                    return Ok(Some(self.buf.split_to(header.len)));
                }
                other => {
                    return Err(Error::FakeTlsFrame(format!(
                        "unexpected mid-session record type {:#04x}",
                        other
                    )));
                }
            }
        }
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Collect payload bytes from a decoder into `out` until it holds at least
/// `want` bytes or the decoder runs dry. Used while the first ApplicationData
/// records trickle in during the handshake.
pub fn drain_payload(decoder: &mut RecordDecoder, out: &mut BytesMut, want: usize) -> Result<()> {
    while out.len() < want {
        match decoder.next_payload()? {
            Some(payload) => out.extend_from_slice(&payload),
            None => break,
        }
    }
    Ok(())
}

/// Build a minimal plausible ClientHello record: version, random, session
/// id, one cipher suite, null compression. Test scaffolding only.
#[cfg(test)]
pub(crate) fn build_client_hello_record(random: [u8; 32], session_id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&TLS12);
    body.extend_from_slice(&random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(&session_id);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
    body.extend_from_slice(&[0x01, 0x00]); // compression

    let mut message = vec![HANDSHAKE_CLIENT_HELLO];
    message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    message.extend_from_slice(&body);

    let mut record = Vec::new();
    put_record(&mut record, REC_HANDSHAKE, &message);
    record
}

/// Wrap a payload in records, test scaffolding for the handshake phase.
#[cfg(test)]
pub(crate) fn build_record(record_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::new();
    put_record(&mut record, record_type, payload);
    record
}
