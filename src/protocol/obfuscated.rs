//! The obfuscated2 handshake.
//!
//! The first 64 bytes of a connection carry the stream-cipher keying
//! material in the clear and, inside the encrypted tail, the transport tag
//! plus the target datacenter id. Bytes 8..56 key the client-to-proxy
//! stream; the same 48 bytes reversed key the proxy-to-client stream. When a
//! shared secret is in play each 32-byte key is mixed as
//! `SHA-256(key ‖ secret)` before use.
//!
//! [Transport obfuscation](https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation)

use crate::crypto::{self, Aes256Ctr};
use crate::error::{Error, Result};
use crate::protocol::secret::{Secret, SECRET_KEY_LEN};

/// Handshake frame length
pub const HANDSHAKE_LEN: usize = 64;

const MATERIAL_OFFSET: usize = 8;
const MATERIAL_LEN: usize = 48;
const TAG_OFFSET: usize = 56;
const DC_OFFSET: usize = 60;

/// Inner MTProto framing selected by the client and forwarded opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportTag {
    Abridged,
    Intermediate,
    PaddedIntermediate,
    Full,
}

impl TransportTag {
    pub fn from_wire(tag: [u8; 4]) -> Option<Self> {
        match tag {
            [0xef, 0xef, 0xef, 0xef] => Some(Self::Abridged),
            [0xee, 0xee, 0xee, 0xee] => Some(Self::Intermediate),
            [0xdd, 0xdd, 0xdd, 0xdd] => Some(Self::PaddedIntermediate),
            [0x00, 0x00, 0x00, 0x00] => Some(Self::Full),
            _ => None,
        }
    }

    pub fn to_wire(self) -> [u8; 4] {
        match self {
            Self::Abridged => [0xef; 4],
            Self::Intermediate => [0xee; 4],
            Self::PaddedIntermediate => [0xdd; 4],
            Self::Full => [0x00; 4],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Abridged => "abridged",
            Self::Intermediate => "intermediate",
            Self::PaddedIntermediate => "padded-intermediate",
            Self::Full => "full",
        }
    }
}

/// Derived state for the client leg of a session.
pub struct ClientHandshake {
    /// Decrypts client-to-proxy bytes
    pub decryptor: Aes256Ctr,
    /// Encrypts proxy-to-client bytes
    pub encryptor: Aes256Ctr,
    pub transport: TransportTag,
    /// Signed id as the client sent it; negative asks for IPv6
    pub dc_id: i16,
}

/// Freshly generated state for the proxy-to-datacenter leg.
pub struct PeerHandshake {
    /// The 64 bytes to send upstream, tail already encrypted
    pub frame: [u8; HANDSHAKE_LEN],
    /// Encrypts proxy-to-peer bytes
    pub encryptor: Aes256Ctr,
    /// Decrypts peer-to-proxy bytes
    pub decryptor: Aes256Ctr,
}

/// Plaintext prefixes that reveal a non-MTProto protocol. A handshake
/// starting with one of these is either a scanner or a misdirected client.
fn has_obvious_marker(frame: &[u8; HANDSHAKE_LEN]) -> bool {
    const FORBIDDEN_PREFIXES: [[u8; 4]; 5] =
        [[0xef; 4], *b"GET ", *b"POST", *b"HEAD", [0xee; 4]];

    let mut head = [0u8; 4];
    head.copy_from_slice(&frame[..4]);
    FORBIDDEN_PREFIXES.contains(&head) || frame[..8] == [0u8; 8]
}

/// Extract the 48 bytes of keying material, optionally reversed for the
/// opposite direction.
fn key_material(frame: &[u8; HANDSHAKE_LEN], reverse: bool) -> [u8; MATERIAL_LEN] {
    let mut out = [0u8; MATERIAL_LEN];
    out.copy_from_slice(&frame[MATERIAL_OFFSET..MATERIAL_OFFSET + MATERIAL_LEN]);
    if reverse {
        out.reverse();
    }
    out
}

/// Split key material into an AES key and counter block, mixing in the
/// shared secret when one applies.
fn stream_keys(
    material: &[u8; MATERIAL_LEN],
    secret: Option<&[u8; SECRET_KEY_LEN]>,
) -> ([u8; 32], [u8; 16]) {
    let mut key = [0u8; 32];
    key.copy_from_slice(&material[..32]);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&material[32..]);

    if let Some(secret) = secret {
        let mut mix = [0u8; 48];
        mix[..32].copy_from_slice(&key);
        mix[32..].copy_from_slice(secret);
        key = crypto::sha256(&mix);
    }

    (key, iv)
}

fn derive(frame: &[u8; HANDSHAKE_LEN], secret: Option<&[u8; SECRET_KEY_LEN]>) -> Result<ClientHandshake> {
    if has_obvious_marker(frame) {
        return Err(Error::ObviousMarker);
    }

    let (dec_key, dec_iv) = stream_keys(&key_material(frame, false), secret);
    let (enc_key, enc_iv) = stream_keys(&key_material(frame, true), secret);

    let mut decryptor = Aes256Ctr::new(&dec_key, &dec_iv);
    let encryptor = Aes256Ctr::new(&enc_key, &enc_iv);

    // The client encrypted the whole frame before splicing the tail into the
    // wire form, so the decryptor must consume all 64 bytes to stay in step
    // with the client's stream position.
    let mut plain = *frame;
    decryptor.apply(&mut plain);

    let mut tag = [0u8; 4];
    tag.copy_from_slice(&plain[TAG_OFFSET..TAG_OFFSET + 4]);
    let transport =
        TransportTag::from_wire(tag).ok_or(Error::UnknownTransport(u32::from_be_bytes(tag)))?;

    let dc_id = i16::from_le_bytes([plain[DC_OFFSET], plain[DC_OFFSET + 1]]);

    Ok(ClientHandshake { decryptor, encryptor, transport, dc_id })
}

/// Process a client handshake frame: reject obvious markers, derive both
/// stream states, recover the transport tag and datacenter id.
pub fn client_handshake(frame: &[u8; HANDSHAKE_LEN], secret: &Secret) -> Result<ClientHandshake> {
    derive(frame, Some(secret.key()))
}

/// Build a fresh handshake for the upstream leg. The optional out-of-band
/// secret is mixed into the key derivation exactly like a client secret;
/// without one the raw material keys the streams, which is what a direct
/// datacenter connection expects.
pub fn peer_handshake(
    transport: TransportTag,
    dc_id: i16,
    secret: Option<&[u8; SECRET_KEY_LEN]>,
) -> PeerHandshake {
    let mut frame = [0u8; HANDSHAKE_LEN];
    loop {
        crypto::fill_random(&mut frame);
        // A lone 0xef selects abridged framing and a zero word selects full,
        // which would make the encoded tail ambiguous; re-roll those too.
        if frame[0] != 0xef && frame[4..8] != [0u8; 4] && !has_obvious_marker(&frame) {
            break;
        }
    }

    frame[TAG_OFFSET..TAG_OFFSET + 4].copy_from_slice(&transport.to_wire());
    frame[DC_OFFSET..DC_OFFSET + 2].copy_from_slice(&dc_id.to_le_bytes());
    // bytes 62..64 stay random: the datacenter ignores them

    let (enc_key, enc_iv) = stream_keys(&key_material(&frame, false), secret);
    let (dec_key, dec_iv) = stream_keys(&key_material(&frame, true), secret);

    let mut encryptor = Aes256Ctr::new(&enc_key, &enc_iv);
    let decryptor = Aes256Ctr::new(&dec_key, &dec_iv);

    // Mirror the client side of the protocol: encrypt the full frame, then
    // splice the encrypted tail over the plaintext head.
    let mut encrypted = frame;
    encryptor.apply(&mut encrypted);
    frame[TAG_OFFSET..].copy_from_slice(&encrypted[TAG_OFFSET..]);

    PeerHandshake { frame, encryptor, decryptor }
}
