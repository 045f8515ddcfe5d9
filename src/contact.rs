//! Remote-peer contact information and routing-table entries (§3).
//! Grounded on `original_source/theseus/contactinfo.py`'s `ContactInfo`.

use crate::constants::L_BYTES;
use crate::nodeaddr::NodeAddress;
use std::convert::TryInto;
use std::net::Ipv4Addr;

/// Network-reachable identity of a remote peer: its host, the TCP port it
/// listens on, and its static Noise public key.
///
/// Equality and hashing compare all three fields. The original Python
/// `ContactInfo.__eq__` compared `self.port == other.host` by mistake; this
/// is deliberately not reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContactInfo {
    pub host: Ipv4Addr,
    pub port: u16,
    pub key: [u8; 32],
}

impl ContactInfo {
    pub fn new(host: Ipv4Addr, port: u16, key: [u8; 32]) -> ContactInfo {
        ContactInfo { host, port, key }
    }
}

/// A routing-table entry: a contact plus the node address it was reached
/// under. `node_addr.addr` is the keyspace coordinate the routing table
/// sorts and buckets on; `node_addr.preimage` is retained for eventual
/// re-verification.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub contact: ContactInfo,
    pub node_addr: NodeAddress,
}

impl RoutingEntry {
    pub fn new(contact: ContactInfo, node_addr: NodeAddress) -> RoutingEntry {
        RoutingEntry { contact, node_addr }
    }

    /// Wire form: `node_addr(34) || port(2, BE) || key(32)` -- 68 bytes.
    /// The host isn't included: it's implicit in the connection the entry
    /// was learned over, or supplied out of band by whoever's relaying it.
    pub fn to_bytes(&self) -> [u8; 68] {
        let mut out = [0u8; 68];
        out[0..34].copy_from_slice(&self.node_addr.as_bytes());
        out[34..36].copy_from_slice(&self.contact.port.to_be_bytes());
        out[36..68].copy_from_slice(&self.contact.key);
        out
    }

    pub fn node_distance_to(&self, target: &[u8; L_BYTES]) -> [u8; L_BYTES] {
        crate::nodeaddr::xor_distance(&self.node_addr.addr, target)
    }
}

impl PartialEq for RoutingEntry {
    // Two entries are "the same" for routing-table dedup purposes when
    // they name the same contact, independent of which node address the
    // contact happened to be reached under.
    fn eq(&self, other: &Self) -> bool {
        self.contact == other.contact
    }
}

pub fn port_and_key_from_bytes(bytes: &[u8]) -> Option<(u16, [u8; 32])> {
    if bytes.len() != 34 {
        return None;
    }
    let port = u16::from_be_bytes(bytes[0..2].try_into().ok()?);
    let key: [u8; 32] = bytes[2..34].try_into().ok()?;
    Some((port, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_does_not_reproduce_the_original_port_host_typo() {
        let a = ContactInfo::new(Ipv4Addr::new(1, 2, 3, 4), 100, [0u8; 32]);
        let b = ContactInfo::new(Ipv4Addr::new(1, 2, 3, 4), 200, [0u8; 32]);
        assert_ne!(a, b);
    }
}
