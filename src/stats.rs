//! Network-size estimation from completed lookups (§4.10). Grounded on
//! `original_source/theseus/statstracker.py`'s `StatsTracker`.

use crate::constants::{K, L, STATS_MAX_MEASUREMENTS, STATS_MIN_SAMPLE_SIZE, STATS_TIME_WINDOW};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
#[error("not enough completed lookups to estimate network size")]
pub struct NotEnoughLookupsError;

struct Measurement {
    at: Instant,
    /// Sorted ascending XOR distances, one per routing entry the lookup
    /// returned.
    distances: Vec<u64>,
}

/// Bounded sliding window of per-lookup distance vectors, used to produce
/// a rough Kademlia network-size estimate.
pub struct StatsTracker {
    measurements: Mutex<VecDeque<Measurement>>,
}

impl StatsTracker {
    pub fn new() -> StatsTracker {
        StatsTracker {
            measurements: Mutex::new(VecDeque::with_capacity(STATS_MAX_MEASUREMENTS)),
        }
    }

    /// Records a completed lookup's result set, keyed by XOR distance from
    /// the lookup target (scaled into a `u64` the same way
    /// `datastore.rs::fractional_distance` does, since the estimate formula
    /// only needs relative ordering and rank-weighted magnitude, not exact
    /// 160-bit precision).
    pub fn register_lookup(&self, target: &[u8; crate::constants::L_BYTES], result_addrs: &[[u8; crate::constants::L_BYTES]]) {
        let mut distances: Vec<u64> = result_addrs
            .iter()
            .map(|addr| distance_scalar(&crate::nodeaddr::xor_distance(addr, target)))
            .collect();
        distances.sort_unstable();

        let mut guard = self.measurements.lock();
        if guard.len() == STATS_MAX_MEASUREMENTS {
            guard.pop_front();
        }
        guard.push_back(Measurement { at: Instant::now(), distances });
    }

    fn trim_old(&self, guard: &mut VecDeque<Measurement>) {
        while let Some(front) = guard.front() {
            if front.at.elapsed() > STATS_TIME_WINDOW {
                guard.pop_front();
            } else {
                break;
            }
        }
    }

    /// Kademlia network-size estimate: `k(k+1)(2k+1) / (6 * sum(i*d_i /
    /// 2^L))`, where `d_i` is the per-rank XOR distance averaged across
    /// the retained measurements.
    pub fn get_size(&self) -> Result<f64, NotEnoughLookupsError> {
        let mut guard = self.measurements.lock();
        self.trim_old(&mut guard);

        let sample_size = guard.len();
        if sample_size < STATS_MIN_SAMPLE_SIZE {
            return Err(NotEnoughLookupsError);
        }

        let mut d_i = vec![0f64; K];
        for measurement in guard.iter() {
            for (i, &d) in measurement.distances.iter().take(K).enumerate() {
                d_i[i] += (d as f64) / sample_size as f64;
            }
        }

        let scale = (u64::MAX as f64 + 1.0) / (2f64.powi(L as i32 - 64));
        let denom: f64 = d_i
            .iter()
            .enumerate()
            .map(|(i, d)| ((i + 1) as f64) * d / scale)
            .sum();
        if denom <= 0.0 {
            return Err(NotEnoughLookupsError);
        }
        let k = K as f64;
        Ok(k * (k + 1.0) * (2.0 * k + 1.0) / (6.0 * denom))
    }
}

impl Default for StatsTracker {
    fn default() -> StatsTracker {
        StatsTracker::new()
    }
}

/// Collapses a 160-bit XOR distance to a `u64` using its leading 8 bytes,
/// matching `datastore.rs`'s precision tradeoff.
fn distance_scalar(distance: &[u8; crate::constants::L_BYTES]) -> u64 {
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&distance[0..8]);
    u64::from_be_bytes(leading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_estimate_below_minimum_sample_size() {
        let tracker = StatsTracker::new();
        tracker.register_lookup(&[0u8; 20], &[[1u8; 20]]);
        assert!(tracker.get_size().is_err());
    }

    #[test]
    fn estimates_after_enough_samples() {
        let tracker = StatsTracker::new();
        for i in 0..STATS_MIN_SAMPLE_SIZE {
            let mut addr = [0u8; 20];
            addr[0] = i as u8 + 1;
            tracker.register_lookup(&[0u8; 20], &[addr]);
        }
        assert!(tracker.get_size().is_ok());
    }
}
