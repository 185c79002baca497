//! Configuration for Mirage.
//!
//! Everything comes from the environment and every variable is optional;
//! a bare `mirage` starts a FakeTLS proxy with a freshly generated secret.
//!
//! | Variable | Effect | Default |
//! |---|---|---|
//! | `BIND_ADDR` | client listen address | `0.0.0.0:443` |
//! | `SECRET` | hex secret | generated FakeTLS secret |
//! | `SNI_DOMAIN` | SNI host for a generated secret | `google.com` |
//! | `ADVERTISED_HOST` | host in the printed invite URL | `127.0.0.1` |
//! | `PREFER_IP` | `prefer-ipv6` or `prefer-ipv4` | `prefer-ipv6` |
//! | `ANTIREPLAY_MB` | anti-replay cache capacity in MiB | `64` |
//! | `METRICS_ADDR` | metrics listen address | `0.0.0.0:8080` |
//! | `MAX_SESSIONS` | in-flight session cap | `10000` |
//! | `ALLOW_DC_FALLBACK` | datacenter fallback on unknown id or dial failure | `true` |
//! | `MIDDLE_SECRET` | out-of-band upstream handshake secret, 16 hex bytes | unset |

use std::net::SocketAddr;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::secret::{Secret, SECRET_KEY_LEN};

const DEFAULT_BIND: &str = "0.0.0.0:443";
const DEFAULT_METRICS: &str = "0.0.0.0:8080";
const DEFAULT_SNI: &str = "google.com";
const DEFAULT_ADVERTISED_HOST: &str = "127.0.0.1";
const DEFAULT_ANTIREPLAY_MB: usize = 64;
const DEFAULT_MAX_SESSIONS: usize = 10_000;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub secret: Secret,
    pub advertised_host: String,
    pub prefer_ipv6: bool,
    pub antireplay_bytes: usize,
    pub metrics_addr: SocketAddr,
    pub max_sessions: usize,
    pub allow_dc_fallback: bool,
    pub middle_secret: Option<[u8; SECRET_KEY_LEN]>,
}

impl Config {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup; the seam the tests use.
    pub(crate) fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = parse_listen_addr(&get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND.into()))?;
        let metrics_addr =
            parse_listen_addr(&get("METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS.into()))?;

        let secret = match get("SECRET") {
            Some(hex) => Secret::parse(&hex)?,
            None => {
                let sni = get("SNI_DOMAIN").unwrap_or_else(|| DEFAULT_SNI.into());
                info!("no SECRET provided, generating a FakeTLS secret for {}", sni);
                Secret::generate(&sni)
            }
        };

        let prefer_ipv6 = match get("PREFER_IP").as_deref() {
            None | Some("prefer-ipv6") => true,
            Some("prefer-ipv4") => false,
            Some(other) => {
                warn!("unknown PREFER_IP value {:?}, defaulting to prefer-ipv6", other);
                true
            }
        };

        let antireplay_mb = get("ANTIREPLAY_MB")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_ANTIREPLAY_MB);

        let max_sessions = get("MAX_SESSIONS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_SESSIONS);

        let allow_dc_fallback = match get("ALLOW_DC_FALLBACK").as_deref() {
            None => true,
            Some(v) => !matches!(v, "0" | "false" | "no" | "off"),
        };

        let middle_secret = match get("MIDDLE_SECRET") {
            None => None,
            Some(raw) => {
                let bytes = hex::decode(raw.trim())
                    .map_err(|e| Error::Config(format!("MIDDLE_SECRET is not hex: {}", e)))?;
                let key: [u8; SECRET_KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| Error::Config("MIDDLE_SECRET must be 16 bytes".into()))?;
                Some(key)
            }
        };

        Ok(Self {
            bind_addr,
            secret,
            advertised_host: get("ADVERTISED_HOST")
                .unwrap_or_else(|| DEFAULT_ADVERTISED_HOST.into()),
            prefer_ipv6,
            antireplay_bytes: antireplay_mb << 20,
            metrics_addr,
            max_sessions,
            allow_dc_fallback,
            middle_secret,
        })
    }
}

/// Accept `:443`, `0.0.0.0:443` or `[::]:443`.
fn parse_listen_addr(s: &str) -> Result<SocketAddr> {
    let candidate = if let Some(stripped) = s.strip_prefix(':') {
        format!("0.0.0.0:{}", stripped)
    } else {
        s.to_string()
    };
    candidate
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:443");
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:8080");
        assert!(config.prefer_ipv6);
        assert!(config.allow_dc_fallback);
        assert_eq!(config.antireplay_bytes, 64 << 20);
        assert_eq!(config.max_sessions, 10_000);
        assert_eq!(config.advertised_host, "127.0.0.1");
        assert!(config.middle_secret.is_none());
        // Without SECRET a FakeTLS secret is generated for the default SNI.
        assert_eq!(config.secret.host(), Some("google.com"));
    }

    #[test]
    fn test_bare_port_bind_addr() {
        let config = from_map(&[("BIND_ADDR", ":8443")]).unwrap();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8443");
    }

    #[test]
    fn test_invalid_bind_addr() {
        assert!(from_map(&[("BIND_ADDR", "nonsense")]).is_err());
    }

    #[test]
    fn test_explicit_secret() {
        let config = from_map(&[("SECRET", "dd00112233445566778899aabbccddeeff")]).unwrap();
        assert!(!config.secret.is_fake_tls());
        assert!(from_map(&[("SECRET", "not-hex")]).is_err());
    }

    #[test]
    fn test_sni_domain_feeds_generated_secret() {
        let config = from_map(&[("SNI_DOMAIN", "example.org")]).unwrap();
        assert_eq!(config.secret.host(), Some("example.org"));
    }

    #[test]
    fn test_prefer_ip() {
        assert!(!from_map(&[("PREFER_IP", "prefer-ipv4")]).unwrap().prefer_ipv6);
        assert!(from_map(&[("PREFER_IP", "prefer-ipv6")]).unwrap().prefer_ipv6);
        // Unknown values fall back to the default rather than failing.
        assert!(from_map(&[("PREFER_IP", "both")]).unwrap().prefer_ipv6);
    }

    #[test]
    fn test_antireplay_size() {
        let config = from_map(&[("ANTIREPLAY_MB", "8")]).unwrap();
        assert_eq!(config.antireplay_bytes, 8 << 20);
        // Garbage keeps the default, matching the lenient original wiring.
        let config = from_map(&[("ANTIREPLAY_MB", "lots")]).unwrap();
        assert_eq!(config.antireplay_bytes, 64 << 20);
    }

    #[test]
    fn test_fallback_toggle() {
        assert!(!from_map(&[("ALLOW_DC_FALLBACK", "false")]).unwrap().allow_dc_fallback);
        assert!(!from_map(&[("ALLOW_DC_FALLBACK", "0")]).unwrap().allow_dc_fallback);
        assert!(from_map(&[("ALLOW_DC_FALLBACK", "true")]).unwrap().allow_dc_fallback);
    }

    #[test]
    fn test_middle_secret() {
        let config = from_map(&[("MIDDLE_SECRET", "00112233445566778899aabbccddeeff")]).unwrap();
        assert_eq!(config.middle_secret.unwrap()[1], 0x11);

        assert!(from_map(&[("MIDDLE_SECRET", "0011")]).is_err());
        assert!(from_map(&[("MIDDLE_SECRET", "xx112233445566778899aabbccddeeff")]).is_err());
    }
}
