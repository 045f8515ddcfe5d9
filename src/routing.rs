//! Binary-trie Kademlia routing table (§3, §4.3). Grounded on
//! `original_source/theseus/routing.py`'s `RoutingTable`/`Bucket`, re-expressed
//! as an enum trie (per `SPEC_FULL.md` §9's design note) instead of the
//! original's `lower`/`upper` integer-interval bookkeeping -- the interval
//! the original tracks is always a contiguous bit-prefix range produced by
//! repeated midpoint bisection, so a `Leaf`/`Internal` enum keyed on the
//! address's own bits carries the same invariants without needing 160-bit
//! integer arithmetic.

use crate::constants::{K, L};
use crate::contact::{ContactInfo, RoutingEntry};
use crate::nodeaddr::xor_distance;
use rand::seq::SliceRandom;
use std::collections::HashMap;

type Addr = [u8; crate::constants::L_BYTES];

fn bit_at(addr: &Addr, index: usize) -> bool {
    let byte = index / 8;
    let shift = 7 - (index % 8);
    (addr[byte] >> shift) & 1 == 1
}

enum Bucket {
    Leaf(Vec<RoutingEntry>),
    Internal(Box<Bucket>, Box<Bucket>),
}

impl Bucket {
    fn insert(&mut self, entry: RoutingEntry, depth: usize, local_addrs: &[Addr]) -> bool {
        match self {
            Bucket::Internal(left, right) => {
                let target_bit = bit_at(&entry.node_addr.addr, depth);
                let (left_locals, right_locals): (Vec<Addr>, Vec<Addr>) = local_addrs
                    .iter()
                    .copied()
                    .partition(|a| !bit_at(a, depth));
                if target_bit {
                    right.insert(entry, depth + 1, &right_locals)
                } else {
                    left.insert(entry, depth + 1, &left_locals)
                }
            }
            Bucket::Leaf(contents) => {
                if contents.iter().any(|e| *e == entry) {
                    return true;
                }
                if contents.len() < K {
                    contents.push(entry);
                    return true;
                }
                if local_addrs.is_empty() {
                    return false;
                }
                // Split, then reinsert every existing entry plus the new
                // one through the fresh children so a still-overfull child
                // (every drained entry sharing this depth's bit) cascades
                // into a further split instead of silently exceeding `K`.
                let mut drained = std::mem::take(contents);
                drained.push(entry);
                *self = Bucket::Internal(
                    Box::new(Bucket::Leaf(Vec::new())),
                    Box::new(Bucket::Leaf(Vec::new())),
                );
                let (left, right) = match self {
                    Bucket::Internal(left, right) => (left, right),
                    Bucket::Leaf(_) => unreachable!(),
                };
                let mut all_inserted = true;
                for e in drained {
                    let bit = bit_at(&e.node_addr.addr, depth);
                    let child_locals: Vec<Addr> = local_addrs
                        .iter()
                        .copied()
                        .filter(|a| bit_at(a, depth) == bit)
                        .collect();
                    let child = if bit { &mut *right } else { &mut *left };
                    if !child.insert(e, depth + 1, &child_locals) {
                        all_inserted = false;
                    }
                }
                all_inserted
            }
        }
    }

    fn query(&self, target: &Addr, depth: usize, limit: usize, out: &mut Vec<RoutingEntry>) {
        if out.len() >= limit {
            return;
        }
        match self {
            Bucket::Leaf(contents) => {
                let mut sorted: Vec<&RoutingEntry> = contents.iter().collect();
                sorted.sort_by_key(|e| xor_distance(&e.node_addr.addr, target));
                out.extend(sorted.into_iter().take(limit - out.len()).cloned());
            }
            Bucket::Internal(left, right) => {
                let (closer, further) = if bit_at(target, depth) {
                    (right, left)
                } else {
                    (left, right)
                };
                closer.query(target, depth + 1, limit, out);
                if out.len() < limit {
                    further.query(target, depth + 1, limit, out);
                }
            }
        }
    }

    fn contents_into(&self, out: &mut Vec<RoutingEntry>) {
        match self {
            Bucket::Leaf(contents) => out.extend(contents.iter().cloned()),
            Bucket::Internal(left, right) => {
                left.contents_into(out);
                right.contents_into(out);
            }
        }
    }
}

/// Kademlia routing table over the `L`-bit address space.
pub struct RoutingTable {
    root: Bucket,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable {
            root: Bucket::Leaf(Vec::new()),
        }
    }

    /// Inserts `contact` at `node_addr`. `local_addrs` are the peer's own
    /// current node addresses, consulted to decide whether a full leaf is
    /// eligible to split. Returns `false` only when the bucket is full and
    /// not splittable.
    pub fn insert(
        &mut self,
        contact: ContactInfo,
        node_addr: crate::nodeaddr::NodeAddress,
        local_addrs: &[Addr],
    ) -> bool {
        let entry = RoutingEntry::new(contact, node_addr);
        self.root.insert(entry, 0, local_addrs)
    }

    /// Best-first lookup of the `limit` (default `k`) entries closest to
    /// `target`, deduplicated by contact (keeping whichever node address was
    /// closer).
    pub fn query(&self, target: &Addr, limit: Option<usize>) -> Vec<RoutingEntry> {
        let limit = limit.unwrap_or(K);
        let mut raw = Vec::new();
        self.root.query(target, 0, limit.max(K * 4), &mut raw);

        let mut by_contact: HashMap<ContactInfo, RoutingEntry> = HashMap::new();
        for entry in raw {
            by_contact
                .entry(entry.contact)
                .and_modify(|existing| {
                    if xor_distance(&entry.node_addr.addr, target)
                        < xor_distance(&existing.node_addr.addr, target)
                    {
                        *existing = entry.clone();
                    }
                })
                .or_insert(entry);
        }
        let mut deduped: Vec<RoutingEntry> = by_contact.into_values().collect();
        deduped.sort_by_key(|e| xor_distance(&e.node_addr.addr, target));
        deduped.truncate(limit);
        deduped
    }

    /// Rebuilds the trie from scratch: flattens every leaf, shuffles to
    /// avoid a deterministic bias in which entries survive repeated splits,
    /// and reinserts against the (possibly changed) local address set.
    pub fn reload(&mut self, local_addrs: &[Addr]) {
        let mut flat = Vec::new();
        self.root.contents_into(&mut flat);
        flat.shuffle(&mut rand::thread_rng());
        self.root = Bucket::Leaf(Vec::new());
        for entry in flat {
            self.root.insert(entry, 0, local_addrs);
        }
    }
}

impl Default for RoutingTable {
    fn default() -> RoutingTable {
        RoutingTable::new()
    }
}

/// Full keyspace width, exposed for callers building a target address from
/// a prefix (e.g. the self-lookup scheduler).
pub const KEYSPACE_BITS: usize = L;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeaddr::{NodeAddress, Preimage};
    use std::net::Ipv4Addr;

    fn entry_at(addr: Addr, port: u16) -> (ContactInfo, NodeAddress) {
        let contact = ContactInfo::new(Ipv4Addr::new(10, 0, 0, 1), port, [0u8; 32]);
        let node_addr = NodeAddress {
            addr,
            preimage: Preimage::new(0, Ipv4Addr::new(10, 0, 0, 1), [0u8; 6]),
            verified: true,
        };
        (contact, node_addr)
    }

    #[test]
    fn insert_and_query_round_trips() {
        let mut table = RoutingTable::new();
        for i in 0..4u8 {
            let mut addr = [0u8; 20];
            addr[0] = i;
            let (contact, node_addr) = entry_at(addr, 1000 + i as u16);
            assert!(table.insert(contact, node_addr, &[]));
        }
        let results = table.query(&[0u8; 20], Some(4));
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn full_unsplittable_leaf_rejects_insert() {
        let mut table = RoutingTable::new();
        for i in 0..(K as u8) {
            let mut addr = [0u8; 20];
            addr[19] = i;
            let (contact, node_addr) = entry_at(addr, 2000 + i as u16);
            assert!(table.insert(contact, node_addr, &[]));
        }
        let mut addr = [0u8; 20];
        addr[19] = K as u8;
        let (contact, node_addr) = entry_at(addr, 9999);
        assert!(!table.insert(contact, node_addr, &[]));
    }

    #[test]
    fn local_addr_in_range_allows_split() {
        let mut table = RoutingTable::new();
        let local = [0u8; 20];
        for i in 0..(K as u8 + 1) {
            let mut addr = [0u8; 20];
            addr[19] = i;
            let (contact, node_addr) = entry_at(addr, 3000 + i as u16);
            assert!(table.insert(contact, node_addr, &[local]));
        }
    }
}
