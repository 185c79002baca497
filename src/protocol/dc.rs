//! Telegram datacenter address table.
//!
//! Five fixed ingress clusters; the table never changes at runtime. Clients
//! select a datacenter by signed id inside the obfuscated2 handshake.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Upstream port for every datacenter
pub const DC_PORT: u16 = 443;

/// One Telegram ingress cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datacenter {
    pub id: u8,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub location: &'static str,
    pub priority: u8,
}

static TABLE: [Datacenter; 5] = [
    Datacenter {
        id: 1,
        ipv4: Ipv4Addr::new(149, 154, 175, 53),
        ipv6: Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf001, 0, 0, 0, 0x000a),
        location: "MIA",
        priority: 3,
    },
    Datacenter {
        id: 2,
        ipv4: Ipv4Addr::new(149, 154, 167, 51),
        ipv6: Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf002, 0, 0, 0, 0x000a),
        location: "AMS",
        priority: 2,
    },
    Datacenter {
        id: 3,
        ipv4: Ipv4Addr::new(149, 154, 175, 100),
        ipv6: Ipv6Addr::new(0x2001, 0x0b28, 0xf23d, 0xf003, 0, 0, 0, 0x000a),
        location: "MIA",
        priority: 3,
    },
    Datacenter {
        id: 4,
        ipv4: Ipv4Addr::new(149, 154, 167, 91),
        ipv6: Ipv6Addr::new(0x2001, 0x067c, 0x04e8, 0xf004, 0, 0, 0, 0x000a),
        location: "AMS",
        priority: 2,
    },
    Datacenter {
        id: 5,
        ipv4: Ipv4Addr::new(91, 108, 56, 130),
        ipv6: Ipv6Addr::new(0x2001, 0x0b28, 0xf23f, 0xf005, 0, 0, 0, 0x000a),
        location: "SIN",
        priority: 1,
    },
];

/// The full table.
pub fn table() -> &'static [Datacenter; 5] {
    &TABLE
}

/// Look up a datacenter by the signed id a client sent. The sign carries
/// address-family preference, not identity.
pub fn by_id(id: i16) -> Option<&'static Datacenter> {
    let abs = id.unsigned_abs();
    TABLE.iter().find(|dc| u16::from(dc.id) == abs)
}

/// The priority-1 datacenter, used when an unknown id may fall back.
pub fn fallback() -> &'static Datacenter {
    let mut best = &TABLE[0];
    for dc in &TABLE[1..] {
        if dc.priority < best.priority {
            best = dc;
        }
    }
    best
}

/// Remaining datacenters to try after `failed` could not be dialed, ordered
/// by priority descending then id ascending. Keeps retries on the failed
/// cluster's siblings before burning the priority-1 ingress.
pub fn dial_candidates(failed: u8) -> Vec<&'static Datacenter> {
    let mut rest: Vec<_> = TABLE.iter().filter(|dc| dc.id != failed).collect();
    rest.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    rest
}

impl Datacenter {
    pub fn addr_v4(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ipv4), DC_PORT)
    }

    pub fn addr_v6(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(self.ipv6), DC_PORT)
    }

    /// Metric label, e.g. `DC5`.
    pub fn label(&self) -> &'static str {
        match self.id {
            1 => "DC1",
            2 => "DC2",
            3 => "DC3",
            4 => "DC4",
            _ => "DC5",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        assert_eq!(table().len(), 5);
        for (i, dc) in table().iter().enumerate() {
            assert_eq!(usize::from(dc.id), i + 1);
        }
    }

    #[test]
    fn test_by_id_ignores_sign() {
        assert_eq!(by_id(2).map(|dc| dc.id), Some(2));
        assert_eq!(by_id(-2).map(|dc| dc.id), Some(2));
        assert_eq!(by_id(0), None);
        assert_eq!(by_id(42), None);
    }

    #[test]
    fn test_fallback_is_priority_one() {
        let dc = fallback();
        assert_eq!(dc.id, 5);
        assert_eq!(dc.location, "SIN");
        assert_eq!(dc.priority, 1);
    }

    #[test]
    fn test_dial_candidate_order() {
        let order: Vec<u8> = dial_candidates(1).iter().map(|dc| dc.id).collect();
        assert_eq!(order, vec![3, 2, 4, 5]);

        let order: Vec<u8> = dial_candidates(5).iter().map(|dc| dc.id).collect();
        assert_eq!(order, vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_dc5_addresses() {
        let dc = by_id(5).unwrap();
        assert_eq!(dc.addr_v4().to_string(), "91.108.56.130:443");
        assert_eq!(dc.addr_v6().ip().to_string(), "2001:b28:f23f:f005::a");
        assert_eq!(dc.label(), "DC5");
    }
}
