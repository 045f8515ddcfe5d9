//! Multi-path iterative node lookup (§4.7). Grounded on
//! `original_source/theseus/lookup.py`'s `AddrLookup`: several
//! independent search paths probe the keyspace around the target
//! concurrently, sharing one seen-contact set so no path re-queries a
//! contact another path already reached, then get merged and trimmed to
//! the closest `num_peers` results.

use crate::constants::{
    LOOKUP_NUM_PATHS, LOOKUP_NUM_PEERS, LOOKUP_PATH_WIDTH, LOOKUP_QUERY_TIMEOUT,
    LOOKUP_SEEN_SET_CAP, LOOKUP_START_RETRY_MAX, LOOKUP_START_RETRY_MIN, LOOKUP_START_RETRY_STEP,
};
use crate::contact::{ContactInfo, RoutingEntry};
use crate::error::{DhtError, SchedulingError};
use crate::nodeaddr::xor_distance;
use async_std::sync::Mutex as AsyncMutex;
use async_trait::async_trait;
use futures::channel::oneshot;
use futures::future::join_all;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

type Addr = [u8; crate::constants::L_BYTES];

/// Asks a single remote peer for the contacts it knows closest to
/// `target`. Abstracted the way `peertracker.rs::Dialer` is: the actual
/// `find` KRPC call belongs to `protocol.rs`, wired up in `service.rs`.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn find(&self, peer: &ContactInfo, target: &Addr) -> Result<Vec<RoutingEntry>, DhtError>;
}

enum RunState {
    Idle,
    Running(Vec<oneshot::Sender<Result<Vec<RoutingEntry>, SchedulingError>>>),
}

struct Shared {
    target: Addr,
    seen: Mutex<HashSet<ContactInfo>>,
    run: AsyncMutex<RunState>,
}

/// One lookup run for a fixed target. Cheap to construct; `start` may be
/// called repeatedly or concurrently -- a call arriving while a run is
/// already in flight coalesces onto that run's result instead of starting
/// a second one, matching the original's `self.callbacks.append(Deferred())`.
pub struct AddrLookup {
    shared: Arc<Shared>,
}

impl AddrLookup {
    pub fn new(target: Addr) -> AddrLookup {
        AddrLookup {
            shared: Arc::new(Shared {
                target,
                seen: Mutex::new(HashSet::new()),
                run: AsyncMutex::new(RunState::Idle),
            }),
        }
    }

    pub fn target(&self) -> &Addr {
        &self.shared.target
    }

    /// Runs (or joins an in-flight run of) the lookup, seeded with
    /// `initial` candidates -- normally the routing table's own closest
    /// entries to the target. Fails with
    /// [`SchedulingError::LookupConfigIncomplete`] if `initial` is empty;
    /// callers should back off and retry with [`next_start_retry_delay`]
    /// rather than treat that as a hard failure.
    pub async fn start(
        &self,
        querier: &dyn Querier,
        initial: Vec<RoutingEntry>,
    ) -> Result<Vec<RoutingEntry>, SchedulingError> {
        {
            let mut run = self.shared.run.lock().await;
            match &mut *run {
                RunState::Running(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    drop(run);
                    return rx.await.unwrap_or(Err(SchedulingError::Cancelled));
                }
                RunState::Idle => {
                    *run = RunState::Running(Vec::new());
                }
            }
        }

        let result = self.run_paths(querier, initial).await;

        let waiters = {
            let mut run = self.shared.run.lock().await;
            match std::mem::replace(&mut *run, RunState::Idle) {
                RunState::Running(w) => w,
                RunState::Idle => Vec::new(),
            }
        };
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn run_paths(
        &self,
        querier: &dyn Querier,
        initial: Vec<RoutingEntry>,
    ) -> Result<Vec<RoutingEntry>, SchedulingError> {
        if initial.is_empty() {
            return Err(SchedulingError::LookupConfigIncomplete);
        }

        let mut sorted = initial;
        sorted.sort_by_key(|e| xor_distance(&e.node_addr.addr, &self.shared.target));
        for entry in &sorted {
            self.admit_seen(&entry.contact);
        }

        let mut path_frontiers: Vec<Vec<RoutingEntry>> = vec![Vec::new(); LOOKUP_NUM_PATHS];
        for (i, entry) in sorted.iter().enumerate() {
            path_frontiers[i % LOOKUP_NUM_PATHS].push(entry.clone());
        }
        // A path with nothing of its own still starts from the full known
        // set, so a thin routing table doesn't silently leave paths idle.
        for frontier in &mut path_frontiers {
            if frontier.is_empty() {
                *frontier = sorted.clone();
            }
        }

        let results = join_all(
            path_frontiers
                .into_iter()
                .map(|frontier| self.lookup_path(querier, frontier)),
        )
        .await;

        let mut by_contact: HashMap<ContactInfo, RoutingEntry> = HashMap::new();
        for entry in results.into_iter().flatten() {
            by_contact
                .entry(entry.contact)
                .and_modify(|existing| {
                    if xor_distance(&entry.node_addr.addr, &self.shared.target)
                        < xor_distance(&existing.node_addr.addr, &self.shared.target)
                    {
                        *existing = entry.clone();
                    }
                })
                .or_insert(entry);
        }
        let mut merged: Vec<RoutingEntry> = by_contact.into_values().collect();
        merged.sort_by_key(|e| xor_distance(&e.node_addr.addr, &self.shared.target));
        merged.truncate(LOOKUP_NUM_PEERS);
        Ok(merged)
    }

    /// Drives one independent search path: repeatedly queries the
    /// `path_width` not-yet-queried candidates closest to the target,
    /// folding any newly learned contacts into the frontier, until a round
    /// yields nothing new.
    async fn lookup_path(&self, querier: &dyn Querier, mut frontier: Vec<RoutingEntry>) -> Vec<RoutingEntry> {
        let mut queried: HashSet<ContactInfo> = HashSet::new();
        let mut best: Vec<RoutingEntry> = frontier.clone();

        loop {
            frontier.sort_by_key(|e| xor_distance(&e.node_addr.addr, &self.shared.target));
            let candidates: Vec<RoutingEntry> = frontier
                .iter()
                .filter(|e| !queried.contains(&e.contact))
                .take(LOOKUP_PATH_WIDTH)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.contact);
            }

            let responses = join_all(candidates.iter().map(|c| {
                let contact = c.contact;
                async move {
                    match async_std::future::timeout(LOOKUP_QUERY_TIMEOUT, querier.find(&contact, &self.shared.target)).await
                    {
                        Ok(Ok(entries)) => entries,
                        Ok(Err(e)) => {
                            debug!("lookup query to {:?} failed: {}", contact, e);
                            Vec::new()
                        }
                        Err(_) => {
                            debug!("lookup query to {:?} timed out", contact);
                            Vec::new()
                        }
                    }
                }
            }))
            .await;

            let mut progressed = false;
            for entries in responses {
                for entry in entries {
                    if !self.admit_seen(&entry.contact) {
                        continue;
                    }
                    frontier.push(entry.clone());
                    best.push(entry);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        best
    }

    /// Records a contact as seen, returning `false` if it was already
    /// known to this lookup (by any path) or the shared safety cap has
    /// been hit -- mirrors the original's
    /// `if len(self.seen_set) > 10000: raise Exception("something's
    /// fucky")`, treated here as a quiet stop condition rather than a
    /// panic.
    fn admit_seen(&self, contact: &ContactInfo) -> bool {
        let mut seen = self.shared.seen.lock();
        if seen.len() >= LOOKUP_SEEN_SET_CAP {
            return false;
        }
        seen.insert(*contact)
    }
}

/// Backoff delay before retrying a lookup `start()` that failed for lack
/// of starting peers, per the original's
/// `_start_retry_min=0, _start_retry_max=30, _start_retry_delta=5`.
pub fn next_start_retry_delay(attempt: u32) -> Duration {
    let secs = LOOKUP_START_RETRY_MIN + attempt as u64 * LOOKUP_START_RETRY_STEP;
    Duration::from_secs(secs.min(LOOKUP_START_RETRY_MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeaddr::{NodeAddress, Preimage};
    use std::net::Ipv4Addr;

    fn entry(byte: u8, port: u16) -> RoutingEntry {
        let mut addr = [0u8; 20];
        addr[0] = byte;
        RoutingEntry::new(
            ContactInfo::new(Ipv4Addr::new(10, 0, 0, 1), port, [byte; 32]),
            NodeAddress {
                addr,
                preimage: Preimage::new(0, Ipv4Addr::new(10, 0, 0, 1), [0u8; 6]),
                verified: true,
            },
        )
    }

    struct StaticQuerier;

    #[async_trait]
    impl Querier for StaticQuerier {
        async fn find(&self, _peer: &ContactInfo, _target: &Addr) -> Result<Vec<RoutingEntry>, DhtError> {
            Ok(Vec::new())
        }
    }

    #[async_std::test]
    async fn empty_initial_set_is_config_incomplete() {
        let lookup = AddrLookup::new([0u8; 20]);
        let err = lookup.start(&StaticQuerier, Vec::new()).await.unwrap_err();
        assert_eq!(err, SchedulingError::LookupConfigIncomplete);
    }

    #[async_std::test]
    async fn terminates_and_returns_seed_peers_with_no_new_contacts() {
        let lookup = AddrLookup::new([0u8; 20]);
        let seed = vec![entry(1, 1001), entry(2, 1002)];
        let result = lookup.start(&StaticQuerier, seed).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn retry_backoff_is_capped() {
        assert_eq!(next_start_retry_delay(0), Duration::from_secs(0));
        assert_eq!(next_start_retry_delay(100), Duration::from_secs(30));
    }
}
