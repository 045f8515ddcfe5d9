// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Process-wide tuning constants shared across modules.

use std::time::Duration;

/// Width of the keyspace, in bits. Node addresses, routing distances and
/// lookup targets are all `L`-bit byte strings.
pub const L: usize = 160;
pub const L_BYTES: usize = L / 8;

/// Maximum entries held by a routing-table leaf before it must split.
pub const K: usize = 8;

/// Worker threads dedicated to Argon2id hashing. Fixed for the process
/// lifetime; never grown or shrunk.
pub const MAX_HASH_THREADS: usize = 3;

/// Capacity of the hasher's LRU result cache, keyed on `(input, salt)`.
pub const HASH_CACHE_SIZE: usize = 500;

/// How long an unverified node-address preimage's timestamp may lag "now".
pub const TIMEOUT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Verification rejects any preimage whose age exceeds this, regardless of
/// `TIMEOUT_WINDOW` (kept distinct per spec: `2^16` seconds).
pub const MAX_VERIFY_AGE_SECS: u64 = 1 << 16;

/// Default number of local node-addresses a peer service maintains.
pub const DEFAULT_NUM_NODES: usize = 5;

/// Idle timeout for a DHT connection with no traffic.
pub const PROTOCOL_IDLE_TIMEOUT: Duration = Duration::from_secs(34);

/// Default per-query retry budget.
pub const DEFAULT_QUERY_RETRIES: u32 = 2;

/// Lookup engine parameters (§4.7).
pub const LOOKUP_NUM_PATHS: usize = K / 2;
pub const LOOKUP_PATH_WIDTH: usize = 2;
pub const LOOKUP_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOOKUP_NUM_PEERS: usize = K;
pub const LOOKUP_SEEN_SET_CAP: usize = 10_000;
pub const LOOKUP_START_RETRY_MIN: u64 = 0;
pub const LOOKUP_START_RETRY_STEP: u64 = 5;
pub const LOOKUP_START_RETRY_MAX: u64 = 30;

/// Data store tuning (§4.9).
pub const DATASTORE_MEMLIMIT: u64 = 1 << 20;
pub const DATASTORE_DEFAULT_DURATION: Duration = Duration::from_secs(3600);
pub const DATASTORE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Stats tracker tuning (§4.10).
pub const STATS_TIME_WINDOW: Duration = Duration::from_secs(3600);
pub const STATS_MIN_SAMPLE_SIZE: usize = 3;
pub const STATS_MAX_MEASUREMENTS: usize = 1024;

/// Blacklist capacity (bounded ring, append-only).
pub const BLACKLIST_SIZE: usize = 500;

/// Allowed range for an advertised `listen_port`.
pub const LISTEN_PORT_RANGE: (u16, u16) = (1024, 65535);
