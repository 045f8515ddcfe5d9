//! Node-address generation and verification (§3, §4.2). Grounded on the
//! original `theseus/nodeaddr.py`'s `Preimage`/`NodeAddress` pair, rewritten
//! against the hasher's `enqueue`/`check` contract instead of chained
//! deferreds.

use crate::constants::{L_BYTES, MAX_VERIFY_AGE_SECS};
use crate::error::ValidationError;
use crate::hasher::{HashPriority, Hasher};
use rand::RngCore;
use std::convert::TryInto;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// 14-byte preimage: `ts(4) || ip4(4) || entropy(6)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preimage {
    pub ts: u32,
    pub ip: Ipv4Addr,
    pub entropy: [u8; 6],
}

impl Preimage {
    pub fn new(ts: u32, ip: Ipv4Addr, entropy: [u8; 6]) -> Preimage {
        Preimage { ts, ip, entropy }
    }

    pub fn generate(ip: Ipv4Addr) -> Preimage {
        let ts = now_secs_truncated();
        let mut entropy = [0u8; 6];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        Preimage::new(ts, ip, entropy)
    }

    pub fn as_bytes(&self) -> [u8; 14] {
        let mut out = [0u8; 14];
        out[0..4].copy_from_slice(&self.ts.to_be_bytes());
        out[4..8].copy_from_slice(&self.ip.octets());
        out[8..14].copy_from_slice(&self.entropy);
        out
    }

    pub fn from_bytes(b: &[u8; 14]) -> Preimage {
        let ts = u32::from_be_bytes(b[0..4].try_into().unwrap());
        let ip = Ipv4Addr::new(b[4], b[5], b[6], b[7]);
        let mut entropy = [0u8; 6];
        entropy.copy_from_slice(&b[8..14]);
        Preimage { ts, ip, entropy }
    }

    /// `(message, salt)` pair fed to the hasher: `ts||ip`, `entropy||zeros(10)`.
    pub fn to_hash_inputs(&self) -> (Vec<u8>, Vec<u8>) {
        let mut message = Vec::with_capacity(8);
        message.extend_from_slice(&self.ts.to_be_bytes());
        message.extend_from_slice(&self.ip.octets());
        let mut salt = Vec::with_capacity(16);
        salt.extend_from_slice(&self.entropy);
        salt.extend_from_slice(&[0u8; 10]);
        (message, salt)
    }

    /// Age relative to "now", saturating at zero for preimages from the
    /// future (a clock-skewed but not malicious peer).
    pub fn age_secs(&self) -> u64 {
        let now = now_secs_truncated();
        now.saturating_sub(self.ts) as u64
    }
}

fn now_secs_truncated() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();
    secs as u32
}

/// A node address: a keyspace placement plus the preimage it was derived
/// from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub addr: [u8; L_BYTES],
    pub preimage: Preimage,
    /// `false` = trusted/deferred (accepted without recomputation), `true`
    /// = the hash image has actually been recomputed and matches.
    pub verified: bool,
}

impl NodeAddress {
    /// Wire form: 34 bytes, `preimage || addr`.
    pub fn as_bytes(&self) -> [u8; 34] {
        let mut out = [0u8; 34];
        out[0..14].copy_from_slice(&self.preimage.as_bytes());
        out[14..34].copy_from_slice(&self.addr);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<(Preimage, [u8; L_BYTES]), ValidationError> {
        if bytes.len() != 34 {
            return Err(ValidationError::MalformedInfo(format!(
                "node address must be 34 bytes, got {}",
                bytes.len()
            )));
        }
        let preimage_bytes: [u8; 14] = bytes[0..14].try_into().unwrap();
        let addr: [u8; L_BYTES] = bytes[14..34].try_into().unwrap();
        Ok((Preimage::from_bytes(&preimage_bytes), addr))
    }

    /// Generates a fresh node address for `ip`, hashing at `priority`.
    pub async fn new(hasher: &Hasher, ip: Ipv4Addr, priority: HashPriority) -> NodeAddress {
        let preimage = Preimage::generate(ip);
        let addr = hasher.enqueue(preimage, priority).await;
        NodeAddress {
            addr,
            preimage,
            verified: true,
        }
    }

    /// Accepts or re-derives a node address received from a peer.
    ///
    /// When `trusted` is true, the address is accepted immediately with
    /// `verified = false` (naive trust, matching the lookup engine's
    /// decode-at-recursion step pending a future paranoia flag per §4.7
    /// step 6). Otherwise the preimage's timestamp is checked against
    /// `MAX_VERIFY_AGE_SECS` and the hash is recomputed and compared.
    pub async fn from_preimage(
        hasher: &Hasher,
        addr: [u8; L_BYTES],
        preimage: Preimage,
        trusted: bool,
        priority: HashPriority,
    ) -> Result<NodeAddress, ValidationError> {
        if trusted {
            return Ok(NodeAddress {
                addr,
                preimage,
                verified: false,
            });
        }
        if preimage.age_secs() > MAX_VERIFY_AGE_SECS {
            return Err(ValidationError::ExpiredTimestamp);
        }
        let recomputed = hasher.enqueue(preimage, priority).await;
        if recomputed != addr {
            return Err(ValidationError::AddressMismatch);
        }
        Ok(NodeAddress {
            addr,
            preimage,
            verified: true,
        })
    }

    pub async fn from_wire(
        hasher: &Hasher,
        bytes: &[u8],
        trusted: bool,
        priority: HashPriority,
    ) -> Result<NodeAddress, ValidationError> {
        let (preimage, addr) = NodeAddress::from_bytes(bytes)?;
        NodeAddress::from_preimage(hasher, addr, preimage, trusted, priority).await
    }
}

/// Big-endian XOR distance between two `L`-bit addresses, as an integer
/// wide enough to hold the full 160 bits.
pub fn xor_distance(a: &[u8; L_BYTES], b: &[u8; L_BYTES]) -> [u8; L_BYTES] {
    let mut out = [0u8; L_BYTES];
    for i in 0..L_BYTES {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_round_trips_through_bytes() {
        let p = Preimage::new(0x69696969, Ipv4Addr::new(127, 0, 0, 1), [0u8; 6]);
        let bytes = p.as_bytes();
        assert_eq!(Preimage::from_bytes(&bytes), p);
    }

    #[test]
    fn hash_inputs_split_message_and_salt() {
        let p = Preimage::new(1, Ipv4Addr::new(10, 0, 0, 1), [9u8; 6]);
        let (message, salt) = p.to_hash_inputs();
        assert_eq!(message.len(), 8);
        assert_eq!(salt.len(), 16);
        assert_eq!(&salt[0..6], &[9u8; 6]);
        assert_eq!(&salt[6..16], &[0u8; 10]);
    }

    #[test]
    fn xor_distance_is_zero_for_identical_addrs() {
        let a = [1u8; L_BYTES];
        assert_eq!(xor_distance(&a, &a), [0u8; L_BYTES]);
    }
}
