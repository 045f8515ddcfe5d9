//! Priority-scheduled Argon2id node-address hashing (§3, §4.2, §5).
//! Grounded on the original `theseus/hasher.py`'s priority-queue/dedup/
//! LRU-cache worker, rewritten around a fixed pool of OS threads (not
//! async-std's elastic blocking pool -- see `SPEC_FULL.md` §5) so that a
//! burst of hashing work can never starve the single-threaded event loop
//! of CPU, and a `crossbeam-channel` relay carries completions back across
//! the thread boundary into waiting futures.

use crate::constants::{HASH_CACHE_SIZE, MAX_HASH_THREADS, L_BYTES};
use crate::nodeaddr::Preimage;
use argon2::{self, Config, ThreadMode, Variant, Version};
use crossbeam_channel::{unbounded, Sender};
use futures::channel::oneshot;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Relative urgency of a hash request. `Critical` jobs are dispatched to a
/// free worker ahead of everything else; `Low` is used for the routine
/// background re-verification sweep (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashPriority {
    Low,
    Medium,
    High,
    Critical,
}

type PreimageKey = [u8; 14];
type CacheKey = (Vec<u8>, Vec<u8>);

struct JobState {
    priority: HashPriority,
    dispatched: bool,
    alive: Arc<AtomicBool>,
    waiters: Vec<oneshot::Sender<[u8; L_BYTES]>>,
}

struct HeapEntry {
    priority: HashPriority,
    seq: u64,
    key: PreimageKey,
    alive: Arc<AtomicBool>,
    message: Vec<u8>,
    salt: Vec<u8>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // `BinaryHeap` is a max-heap: higher priority pops first; within equal
    // priority, earlier insertion (smaller `seq`) pops first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    jobs: HashMap<PreimageKey, JobState>,
    heap: std::collections::BinaryHeap<HeapEntry>,
    active_count: usize,
}

/// Argon2id parameters equivalent to libsodium's `crypto_pwhash_argon2id`
/// at the `INTERACTIVE` limits: 2 passes, 64 MiB, single lane.
fn kdf_config() -> Config<'static> {
    Config {
        variant: Variant::Argon2id,
        version: Version::Version13,
        mem_cost: 65536,
        time_cost: 2,
        lanes: 1,
        thread_mode: ThreadMode::Sequential,
        secret: &[],
        ad: &[],
        hash_length: L_BYTES as u32,
    }
}

struct WorkItem {
    key: PreimageKey,
    message: Vec<u8>,
    salt: Vec<u8>,
}

/// Scheduler + fixed worker pool for memory-hard node-address derivation.
///
/// Concurrent requests for the *same* preimage are deduplicated onto a
/// single in-flight job; a caller arriving with a higher priority than an
/// already-queued (not yet dispatched) job takes it over, carrying along
/// every existing waiter. Completed hashes are cached by `(message, salt)`
/// so re-verifying an already-seen address is free.
pub struct Hasher {
    inner: Arc<Mutex<Inner>>,
    cache: Arc<Mutex<LruCache<CacheKey, [u8; L_BYTES]>>>,
    work_tx: Sender<WorkItem>,
    next_seq: AtomicU64,
}

impl Hasher {
    pub fn new() -> Hasher {
        let inner = Arc::new(Mutex::new(Inner {
            jobs: HashMap::new(),
            heap: std::collections::BinaryHeap::new(),
            active_count: 0,
        }));
        let cache: Arc<Mutex<LruCache<CacheKey, [u8; L_BYTES]>>> =
            Arc::new(Mutex::new(LruCache::new(HASH_CACHE_SIZE)));
        let (work_tx, work_rx) = unbounded::<WorkItem>();
        let (done_tx, done_rx) = unbounded::<(PreimageKey, [u8; L_BYTES])>();

        for _ in 0..MAX_HASH_THREADS {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let cache = cache.clone();
            thread::spawn(move || {
                let config = kdf_config();
                while let Ok(item) = work_rx.recv() {
                    let cache_key = (item.message.clone(), item.salt.clone());
                    let addr = {
                        let hit = cache.lock().get(&cache_key).copied();
                        match hit {
                            Some(addr) => addr,
                            None => {
                                let raw = argon2::hash_raw(&item.message, &item.salt, &config)
                                    .expect("argon2id parameters are statically valid");
                                let mut addr = [0u8; L_BYTES];
                                addr.copy_from_slice(&raw);
                                cache.lock().put(cache_key, addr);
                                addr
                            }
                        }
                    };
                    if done_tx.send((item.key, addr)).is_err() {
                        break;
                    }
                }
            });
        }

        {
            let inner = inner.clone();
            let work_tx = work_tx.clone();
            thread::spawn(move || {
                while let Ok((key, addr)) = done_rx.recv() {
                    let waiters = {
                        let mut guard = inner.lock();
                        guard.active_count = guard.active_count.saturating_sub(1);
                        let waiters = guard
                            .jobs
                            .remove(&key)
                            .map(|job| job.waiters)
                            .unwrap_or_default();
                        dispatch_ready_with(&mut guard, &work_tx);
                        waiters
                    };
                    for waiter in waiters {
                        let _ = waiter.send(addr);
                    }
                }
            });
        }

        Hasher {
            inner,
            cache,
            work_tx,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Resolves a node address for `preimage`, scheduling an Argon2id
    /// computation at `priority` if the result isn't already cached or
    /// already in flight.
    pub async fn enqueue(&self, preimage: Preimage, priority: HashPriority) -> [u8; L_BYTES] {
        let (message, salt) = preimage.to_hash_inputs();
        if let Some(addr) = self.cache.lock().get(&(message.clone(), salt.clone())).copied() {
            return addr;
        }

        let key = preimage.as_bytes();
        let (rx, should_dispatch) = {
            let mut guard = self.inner.lock();
            let (tx, rx) = oneshot::channel();

            match guard.jobs.get_mut(&key) {
                Some(job) if job.priority >= priority => {
                    job.waiters.push(tx);
                    (rx, false)
                }
                Some(job) if !job.dispatched => {
                    job.alive.store(false, Ordering::Relaxed);
                    let alive = Arc::new(AtomicBool::new(true));
                    job.alive = alive.clone();
                    job.priority = priority;
                    job.waiters.push(tx);
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    guard.heap.push(HeapEntry {
                        priority,
                        seq,
                        key,
                        alive,
                        message: message.clone(),
                        salt: salt.clone(),
                    });
                    (rx, true)
                }
                Some(job) => {
                    // Already dispatched to a worker: nothing left to
                    // reschedule, just raise the bookkeeping priority and
                    // attach.
                    job.priority = priority;
                    job.waiters.push(tx);
                    (rx, false)
                }
                None => {
                    let alive = Arc::new(AtomicBool::new(true));
                    guard.jobs.insert(
                        key,
                        JobState {
                            priority,
                            dispatched: false,
                            alive: alive.clone(),
                            waiters: vec![tx],
                        },
                    );
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    guard.heap.push(HeapEntry {
                        priority,
                        seq,
                        key,
                        alive,
                        message: message.clone(),
                        salt: salt.clone(),
                    });
                    (rx, true)
                }
            }
        };

        if should_dispatch {
            self.try_dispatch();
        }

        rx.await.expect("hasher worker pool never drops a waiter")
    }

    fn try_dispatch(&self) {
        let mut guard = self.inner.lock();
        dispatch_ready_with(&mut guard, &self.work_tx);
    }
}

impl Default for Hasher {
    fn default() -> Hasher {
        Hasher::new()
    }
}

/// Pops live heap entries and dispatches them until either the worker
/// budget or the heap is exhausted. Stale entries (superseded by a
/// higher-priority re-enqueue) are dropped without counting against the
/// budget.
fn dispatch_ready_with(guard: &mut Inner, work_tx: &Sender<WorkItem>) {
    while guard.active_count < MAX_HASH_THREADS {
        let entry = match guard.heap.pop() {
            Some(e) => e,
            None => break,
        };
        if !entry.alive.load(Ordering::Relaxed) {
            continue;
        }
        if let Some(job) = guard.jobs.get_mut(&entry.key) {
            job.dispatched = true;
        } else {
            continue;
        }
        guard.active_count += 1;
        let _ = work_tx.send(WorkItem {
            key: entry.key,
            message: entry.message,
            salt: entry.salt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[async_std::test]
    async fn hashes_the_published_test_vector() {
        let hasher = Hasher::new();
        let preimage = Preimage::new(0x6969_6969, Ipv4Addr::new(127, 0, 0, 1), [0u8; 6]);
        let addr = hasher.enqueue(preimage, HashPriority::Critical).await;
        let expected = hex_decode("cd4b1f2c9f94fa0f42d5991bbc9e92c1c3580c73");
        assert_eq!(addr.to_vec(), expected);
    }

    fn hex_decode(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[async_std::test]
    async fn repeated_requests_for_same_preimage_share_one_computation() {
        let hasher = Hasher::new();
        let preimage = Preimage::new(1, Ipv4Addr::new(10, 0, 0, 1), [7u8; 6]);
        let (a, b) = futures::join!(
            hasher.enqueue(preimage, HashPriority::Low),
            hasher.enqueue(preimage, HashPriority::High)
        );
        assert_eq!(a, b);
    }

    #[async_std::test]
    async fn cache_short_circuits_repeated_preimages() {
        let hasher = Hasher::new();
        let preimage = Preimage::new(2, Ipv4Addr::new(10, 0, 0, 2), [3u8; 6]);
        let first = hasher.enqueue(preimage, HashPriority::Medium).await;
        let second = hasher.enqueue(preimage, HashPriority::Medium).await;
        assert_eq!(first, second);
    }

    #[test]
    fn priority_ordering_places_critical_above_low() {
        assert!(HashPriority::Critical > HashPriority::Low);
        assert!(HashPriority::High > HashPriority::Medium);
    }
}
