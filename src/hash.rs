//! Stable 32-bit hash over UTF-16 code units.
//!
//! MurmurHash2-style multiply-xor mixing, one round per code unit. The hash
//! is seed-free on purpose: peers attaching to the same region must compute
//! identical slot indices, so anything randomly seeded per process is out.
//! Reduction modulo the capacity happens at the call site and is the only
//! place capacity participates.

const M: u32 = 0x5bd1_e995;
const SEED: u32 = 0x811c_9dc5;

/// Hash a key's UTF-16 code units.
pub fn hash_units(units: &[u16]) -> u32 {
    let mut h = SEED ^ units.len() as u32;
    for &unit in units {
        let mut k = u32::from(unit);
        k = k.wrapping_mul(M);
        k ^= k >> 24;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M) ^ k;
    }
    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^ (h >> 15)
}

/// Slot index for a precomputed hash.
pub fn slot_for(hash: u32, capacity: u32) -> u32 {
    hash % capacity
}
