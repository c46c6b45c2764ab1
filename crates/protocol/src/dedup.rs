//! Bloom-filter set of already-seen message ids.
//!
//! No false negatives: anything inserted is reported as present until
//! [`DuplicateFilter::reset`]. False positives happen at roughly the
//! configured rate once the filter holds its capacity.

use std::f64::consts::LN_2;

use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Capacities below this use the small tier in [`DuplicateFilter::adaptive`].
pub const ADAPTIVE_SMALL_CAPACITY: usize = 500;

const SMALL_TIER_FALSE_POSITIVE_RATE: f64 = 0.01;
const LARGE_TIER_FALSE_POSITIVE_RATE: f64 = 0.0001;

/// Probabilistic duplicate filter.
#[derive(Debug, Clone)]
pub struct DuplicateFilter {
    bits: Vec<u64>,
    bit_count: usize,
    hash_count: u32,
    capacity: usize,
    target_false_positive_rate: f64,
    inserted: usize,
}

impl DuplicateFilter {
    /// Sizes a filter for `capacity` items at `false_positive_rate`.
    pub fn new(capacity: usize, false_positive_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(ProtocolError::invalid("capacity must be positive"));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(ProtocolError::invalid(
                "false_positive_rate must be between 0 and 1",
            ));
        }

        let n = capacity as f64;
        let bit_count = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil() as usize;
        let bit_count = bit_count.max(1);
        let hash_count = ((bit_count as f64 / n) * LN_2).round().max(1.0) as u32;

        Ok(Self {
            bits: vec![0u64; bit_count.div_ceil(64)],
            bit_count,
            hash_count,
            capacity,
            target_false_positive_rate: false_positive_rate,
            inserted: 0,
        })
    }

    /// Picks a false-positive tier from `capacity`: small filters stay tiny,
    /// large ones trade memory for a tighter rate.
    pub fn adaptive(capacity: usize) -> Result<Self> {
        let rate = if capacity < ADAPTIVE_SMALL_CAPACITY {
            SMALL_TIER_FALSE_POSITIVE_RATE
        } else {
            LARGE_TIER_FALSE_POSITIVE_RATE
        };
        Self::new(capacity, rate)
    }

    /// Adds `item`.
    pub fn insert(&mut self, item: impl AsRef<[u8]>) {
        let (h1, h2) = Self::hashes(item.as_ref());
        for i in 0..self.hash_count {
            self.set(self.position(h1, h2, i));
        }
        self.inserted += 1;
    }

    /// Whether `item` may have been inserted.
    pub fn contains(&self, item: impl AsRef<[u8]>) -> bool {
        let (h1, h2) = Self::hashes(item.as_ref());
        (0..self.hash_count).all(|i| self.get(self.position(h1, h2, i)))
    }

    /// Inserts `item` and reports whether it was already present, in one
    /// step.
    pub fn check_and_insert(&mut self, item: impl AsRef<[u8]>) -> bool {
        let (h1, h2) = Self::hashes(item.as_ref());
        let mut present = true;
        for i in 0..self.hash_count {
            let position = self.position(h1, h2, i);
            if !self.get(position) {
                present = false;
                self.set(position);
            }
        }
        if !present {
            self.inserted += 1;
        }
        present
    }

    /// Clears every bit. Size and hash count are kept.
    pub fn reset(&mut self) {
        self.bits.fill(0);
        self.inserted = 0;
    }

    /// False-positive probability given the current insert count.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = f64::from(self.hash_count);
        let exponent = -k * self.inserted as f64 / self.bit_count as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    /// Size of the bit array in bytes.
    pub fn memory_size_bytes(&self) -> usize {
        self.bit_count.div_ceil(8)
    }

    /// Number of bits (m).
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Number of hash functions (k).
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Configured capacity (n).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured false-positive rate (p).
    pub fn target_false_positive_rate(&self) -> f64 {
        self.target_false_positive_rate
    }

    /// Inserts since construction or the last reset.
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    fn hashes(item: &[u8]) -> (u64, u64) {
        let digest = Sha256::digest(item);
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[..8]);
        h2.copy_from_slice(&digest[8..16]);
        // Non-zero stride.
        (u64::from_be_bytes(h1), u64::from_be_bytes(h2) | 1)
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.bit_count as u64) as usize
    }

    fn get(&self, position: usize) -> bool {
        self.bits[position / 64] & (1u64 << (position % 64)) != 0
    }

    fn set(&mut self, position: usize) {
        self.bits[position / 64] |= 1u64 << (position % 64);
    }
}
