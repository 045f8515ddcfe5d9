//! Per-node-address data store with a memory budget and tag-bucketed TTL
//! expiry (§4.9). Grounded on `original_source/theseus/datastore.py`'s
//! `DataStore`, with its `_get_distance` bug (XORing `local_addr` against
//! itself, always zero) fixed to actually measure distance from the
//! candidate address to the store's own local address.

use crate::constants::{DATASTORE_DEFAULT_DURATION, DATASTORE_MEMLIMIT, DATASTORE_SWEEP_INTERVAL, L};
use crate::nodeaddr::xor_distance;
use async_std::task;
use log::debug;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type Addr = [u8; crate::constants::L_BYTES];
type TagSet = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone)]
pub struct StoredDatum {
    pub value: Vec<u8>,
    pub tags: TagSet,
}

impl StoredDatum {
    /// Heuristic byte size used for the memory budget; not an exact
    /// accounting of in-process representation, just a stable proxy for
    /// "how much of the budget this consumes".
    fn approx_size(&self) -> u64 {
        let tags_size: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.value.len() + tags_size + crate::constants::L_BYTES) as u64
    }
}

struct HeapItem {
    expiry: u64,
    addr: Addr,
    datum: StoredDatum,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

struct State {
    buckets: HashMap<TagSet, BinaryHeap<Reverse<HeapItem>>>,
    running_total: u64,
    sweeping: bool,
}

/// A single local node-address's share of the DHT's stored data.
pub struct DataStore {
    local_addr: Option<Addr>,
    memlimit: u64,
    default_duration: Duration,
    state: Arc<Mutex<State>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// `distance / 2^L` as an `f64`, taken from the leading 8 bytes of the
/// XOR distance. The original computes this exactly with Python's
/// arbitrary-precision integers; collapsing a 160-bit fraction to the
/// ~53 bits an `f64` mantissa can hold only discards distance precision
/// far below anything the duration formula's weighting is sensitive to.
fn fractional_distance(distance: &Addr) -> f64 {
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&distance[0..8]);
    (u64::from_be_bytes(leading) as f64) / (u64::MAX as f64 + 1.0)
}

impl DataStore {
    pub fn new(local_addr: Option<Addr>) -> DataStore {
        DataStore {
            local_addr,
            memlimit: DATASTORE_MEMLIMIT,
            default_duration: DATASTORE_DEFAULT_DURATION,
            state: Arc::new(Mutex::new(State {
                buckets: HashMap::new(),
                running_total: 0,
                sweeping: false,
            })),
        }
    }

    pub fn with_limits(local_addr: Option<Addr>, memlimit: u64, default_duration: Duration) -> DataStore {
        DataStore {
            local_addr,
            memlimit,
            default_duration,
            state: Arc::new(Mutex::new(State {
                buckets: HashMap::new(),
                running_total: 0,
                sweeping: false,
            })),
        }
    }

    fn distance(&self, addr: &Addr) -> f64 {
        match &self.local_addr {
            None => 0.0,
            Some(local) => fractional_distance(&xor_distance(addr, local)),
        }
    }

    /// This store's own node address, if it has one (a store built with
    /// `local_addr: None` never wins a closest-store routing decision).
    pub fn local_addr(&self) -> Option<Addr> {
        self.local_addr
    }

    /// Raw XOR distance from `addr` to this store's local address, used to
    /// pick the closest of several local stores to route a `put` to.
    /// Maximal (all-ones) when this store has no local address, so it's
    /// never preferred over one that does.
    pub fn distance_to(&self, addr: &Addr) -> Addr {
        match &self.local_addr {
            Some(local) => xor_distance(addr, local),
            None => [0xffu8; crate::constants::L_BYTES],
        }
    }

    fn choose_duration(&self, addr: &Addr, size: u64, running_total: u64) -> Duration {
        if running_total + size >= self.memlimit {
            return Duration::from_secs(0);
        }
        let memfactor = 1.0 - (running_total as f64 / self.memlimit as f64);
        // distance / 2^(L-4) == fractional_distance(addr) * 16, since
        // fractional_distance is already distance / 2^L.
        let addrfactor = 1.0 - self.distance(addr) * (1u64 << 4) as f64;
        let seconds = self.default_duration.as_secs_f64() * memfactor * addrfactor;
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Stores `datum` under `addr`, returning the duration actually
    /// granted (zero means rejected). Starts the expiry sweep loop on the
    /// first successful store.
    pub fn put(
        &self,
        addr: Addr,
        value: Vec<u8>,
        tags: TagSet,
        suggested_duration: Duration,
    ) -> Duration {
        let size = StoredDatum { value: value.clone(), tags: tags.clone() }.approx_size();
        let mut state = self.state.lock();
        let policy_duration = self.choose_duration(&addr, size, state.running_total);
        let duration = suggested_duration.min(policy_duration);
        if duration.is_zero() {
            return duration;
        }

        let expiry = now_secs() + duration.as_secs().max(1);
        state
            .buckets
            .entry(tags.clone())
            .or_insert_with(BinaryHeap::new)
            .push(Reverse(HeapItem {
                expiry,
                addr,
                datum: StoredDatum { value, tags },
            }));
        state.running_total += size;

        let needs_sweeper = !state.sweeping;
        if needs_sweeper {
            state.sweeping = true;
        }
        drop(state);
        if needs_sweeper {
            self.spawn_sweeper();
        }
        duration
    }

    /// `addr = None` dumps every stored address to its data, across every
    /// tag bucket. `addr = Some(_), tags = None` flattens across all tag
    /// buckets for that one address. Both given filters to the exact tag
    /// set.
    pub fn get(&self, addr: Option<&Addr>, tags: Option<&TagSet>) -> GetResult {
        let state = self.state.lock();
        match (addr, tags) {
            (None, _) => {
                let mut out: HashMap<Addr, Vec<StoredDatum>> = HashMap::new();
                for heap in state.buckets.values() {
                    for Reverse(item) in heap.iter() {
                        out.entry(item.addr).or_default().push(item.datum.clone());
                    }
                }
                GetResult::Map(out)
            }
            (Some(addr), Some(tags)) => {
                let list = state
                    .buckets
                    .get(tags)
                    .map(|heap| {
                        heap.iter()
                            .filter(|Reverse(item)| &item.addr == addr)
                            .map(|Reverse(item)| item.datum.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                GetResult::List(list)
            }
            (Some(addr), None) => {
                let mut list = Vec::new();
                for heap in state.buckets.values() {
                    for Reverse(item) in heap.iter() {
                        if &item.addr == addr {
                            list.push(item.datum.clone());
                        }
                    }
                }
                GetResult::List(list)
            }
        }
    }

    fn spawn_sweeper(&self) {
        let state = self.state.clone();
        task::spawn(async move {
            loop {
                task::sleep(DATASTORE_SWEEP_INTERVAL).await;
                let mut guard = state.lock();
                let now = now_secs();
                let mut emptied = Vec::new();
                for (tags, heap) in guard.buckets.iter_mut() {
                    while let Some(Reverse(top)) = heap.peek() {
                        if top.expiry >= now {
                            break;
                        }
                        if let Some(Reverse(expired)) = heap.pop() {
                            let size = expired.datum.approx_size();
                            // Safe even if `running_total` drifted below
                            // `size` due to floating accounting elsewhere.
                            guard.running_total = guard.running_total.saturating_sub(size);
                        }
                    }
                    if heap.is_empty() {
                        emptied.push(tags.clone());
                    }
                }
                for tags in emptied {
                    guard.buckets.remove(&tags);
                }
                if guard.buckets.is_empty() {
                    guard.sweeping = false;
                    debug!("data store sweep found nothing left, stopping");
                    return;
                }
            }
        });
    }
}

pub enum GetResult {
    Map(HashMap<Addr, Vec<StoredDatum>>),
    List(Vec<StoredDatum>),
}

/// Keyspace width, re-exported for callers computing `2^(L-4)`-style
/// constants without reaching into `routing.rs`.
pub const KEYSPACE_BITS: usize = L;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_put_exceeding_memlimit() {
        let store = DataStore::with_limits(None, 10, Duration::from_secs(60));
        let duration = store.put([0u8; 20], vec![0u8; 20], TagSet::new(), Duration::from_secs(60));
        assert!(duration.is_zero());
    }

    #[test]
    fn accepts_small_put_under_budget() {
        let store = DataStore::new(None);
        let duration = store.put([1u8; 20], vec![1, 2, 3], TagSet::new(), Duration::from_secs(30));
        assert!(duration.as_secs() > 0);
    }

    #[test]
    fn get_without_addr_returns_full_map() {
        let store = DataStore::new(None);
        store.put([2u8; 20], vec![9], TagSet::new(), Duration::from_secs(30));
        match store.get(None, None) {
            GetResult::Map(m) => assert_eq!(m.len(), 1),
            _ => panic!("expected map"),
        }
    }
}
