//! Proxy secrets.
//!
//! The wire form is hex: `ee` + key + SNI host bytes for FakeTLS,
//! `dd` + key for secured, the bare key for simple. Clients carry the full
//! hex string, so the invite URL embeds it unchanged.

use crate::crypto;
use crate::error::{Error, Result};

/// Key length shared by every secret flavor
pub const SECRET_KEY_LEN: usize = 16;

const TAG_SECURED: u8 = 0xdd;
const TAG_FAKE_TLS: u8 = 0xee;

/// Which outer camouflage the secret selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretTag {
    /// Bare obfuscated2
    Simple,
    /// Obfuscated2 behind the `dd` marker
    Secured,
    /// Obfuscated2 wrapped in TLS 1.2 records, camouflaged as `host`
    FakeTls { host: String },
}

/// A parsed proxy secret. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    key: [u8; SECRET_KEY_LEN],
    tag: SecretTag,
}

impl Secret {
    /// Parse the hex wire form.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| Error::InvalidSecret(format!("not hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (tag, key_bytes) = match bytes.first() {
            Some(&TAG_FAKE_TLS) => {
                if bytes.len() < 1 + SECRET_KEY_LEN {
                    return Err(Error::InvalidSecret("FakeTLS secret shorter than 17 bytes".into()));
                }
                let host = String::from_utf8(bytes[1 + SECRET_KEY_LEN..].to_vec())
                    .map_err(|_| Error::InvalidSecret("SNI host is not UTF-8".into()))?;
                (SecretTag::FakeTls { host }, &bytes[1..1 + SECRET_KEY_LEN])
            }
            Some(&TAG_SECURED) => {
                if bytes.len() < 1 + SECRET_KEY_LEN {
                    return Err(Error::InvalidSecret("secured secret shorter than 17 bytes".into()));
                }
                (SecretTag::Secured, &bytes[1..1 + SECRET_KEY_LEN])
            }
            Some(_) => {
                if bytes.len() < SECRET_KEY_LEN {
                    return Err(Error::InvalidSecret("simple secret shorter than 16 bytes".into()));
                }
                (SecretTag::Simple, &bytes[..SECRET_KEY_LEN])
            }
            None => return Err(Error::InvalidSecret("empty secret".into())),
        };

        let mut key = [0u8; SECRET_KEY_LEN];
        key.copy_from_slice(key_bytes);
        Ok(Self { key, tag })
    }

    /// Generate a FakeTLS secret with a fresh random key.
    pub fn generate(host: &str) -> Self {
        let mut key = [0u8; SECRET_KEY_LEN];
        crypto::fill_random(&mut key);
        Self {
            key,
            tag: SecretTag::FakeTls { host: host.to_string() },
        }
    }

    pub fn key(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.key
    }

    pub fn tag(&self) -> &SecretTag {
        &self.tag
    }

    pub fn is_fake_tls(&self) -> bool {
        matches!(self.tag, SecretTag::FakeTls { .. })
    }

    /// SNI host, present only for FakeTLS secrets.
    pub fn host(&self) -> Option<&str> {
        match &self.tag {
            SecretTag::FakeTls { host } => Some(host),
            _ => None,
        }
    }

    /// Hex wire form; inverse of [`Secret::parse`].
    pub fn hex(&self) -> String {
        match &self.tag {
            SecretTag::Simple => hex::encode(self.key),
            SecretTag::Secured => format!("dd{}", hex::encode(self.key)),
            SecretTag::FakeTls { host } => {
                format!("ee{}{}", hex::encode(self.key), hex::encode(host.as_bytes()))
            }
        }
    }

    /// Invite URL understood by Telegram clients.
    pub fn invite_url(&self, server: &str, port: u16) -> String {
        format!("tg://proxy?server={}&port={}&secret={}", server, port, self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let secret = Secret::parse("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(secret.tag(), &SecretTag::Simple);
        assert_eq!(secret.key()[0], 0x00);
        assert_eq!(secret.key()[15], 0xff);
        assert_eq!(secret.hex(), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_parse_secured() {
        let secret = Secret::parse("dd00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(secret.tag(), &SecretTag::Secured);
        assert_eq!(secret.hex(), "dd00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_parse_fake_tls() {
        let hex = format!("eeaabbccddeeff00112233445566778899{}", hex::encode("google.com"));
        let secret = Secret::parse(&hex).unwrap();
        assert_eq!(secret.host(), Some("google.com"));
        assert!(secret.is_fake_tls());
        assert_eq!(secret.hex(), hex);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(Secret::parse("").is_err());
        assert!(Secret::parse("0011").is_err());
        // 16 bytes behind a dd marker leaves only 15 key bytes
        assert!(Secret::parse("dd112233445566778899aabbccddeeff").is_err());
        assert!(Secret::parse("ee112233445566778899aabbccddeeff").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(Secret::parse("zz112233445566778899aabbccddeeff").is_err());
    }

    #[test]
    fn test_generate_round_trips() {
        let secret = Secret::generate("google.com");
        assert_eq!(Secret::parse(&secret.hex()).unwrap(), secret);
    }

    #[test]
    fn test_generate_keys_differ() {
        assert_ne!(Secret::generate("a.com").key(), Secret::generate("a.com").key());
    }

    #[test]
    fn test_invite_url() {
        let secret = Secret::parse("dd00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(
            secret.invite_url("proxy.example.org", 443),
            "tg://proxy?server=proxy.example.org&port=443&secret=dd00112233445566778899aabbccddeeff"
        );
    }
}
