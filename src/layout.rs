//! Byte layout of the shared region.
//!
//! The region is one contiguous allocation carved into fixed subregions:
//!
//! ```text
//! [0..16)    Header — capacity, key_units, value_units, length (u32 each)
//! [16..)     Keys   — capacity × key_units u16 code units
//!            Values — capacity × value_units u16 code units
//!            Chain  — capacity u32 words (UNDEFINED = no successor)
//!            Slot-lock bitmap — ceil(capacity/32) u32 words
//!            Map-lock triple  — SHARED, EXCLUSIVE, READERS (u32 each)
//! ```
//!
//! The layout is a pure function of the three configuration numbers, so a
//! peer that knows them can map the same bytes and attach.

use std::sync::atomic::AtomicU32;

use crate::error::Error;

/// Chain sentinel: slot has no collision successor.
pub const UNDEFINED: u32 = 0xFFFF_FFFF;

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 16;

/// Header lives at offset 0 of the region.
///
/// `length` is the only mutable word; it is read lock-free and updated
/// under either the exclusive map lock or shared-plus-slot locks. The
/// remaining words are immutable after construction and double as the
/// attach-time validation record.
#[repr(C)]
pub struct Header {
    pub capacity: u32,    // 0..4
    pub key_units: u32,   // 4..8
    pub value_units: u32, // 8..12
    pub length: AtomicU32, // 12..16
}

// Compile-time assertion that Header is exactly HEADER_SIZE bytes.
const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// Validated and rounded construction parameters.
///
/// Capacity rounds up to a multiple of 4, unit counts to a multiple of 2,
/// so every subregion and every per-slot span starts 4-byte aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub capacity: u32,
    pub key_units: u32,
    pub value_units: u32,
}

impl Geometry {
    pub fn new(capacity: u32, key_units: u32, value_units: u32) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("capacity must be positive"));
        }
        if key_units == 0 {
            return Err(Error::InvalidArgument("key_units must be positive"));
        }
        if value_units == 0 {
            return Err(Error::InvalidArgument("value_units must be positive"));
        }
        let capacity =
            round_up(capacity, 4).ok_or(Error::InvalidArgument("capacity is out of range"))?;
        if capacity >= UNDEFINED {
            return Err(Error::InvalidArgument("capacity exceeds the chain sentinel"));
        }
        Ok(Geometry {
            capacity,
            key_units: round_up(key_units, 2)
                .ok_or(Error::InvalidArgument("key_units is out of range"))?,
            value_units: round_up(value_units, 2)
                .ok_or(Error::InvalidArgument("value_units is out of range"))?,
        })
    }

    /// Number of u32 words in the slot-lock bitmap.
    pub fn lock_words(&self) -> usize {
        (self.capacity as usize + 31) / 32
    }

    pub fn keys_offset(&self) -> usize {
        HEADER_SIZE
    }

    pub fn values_offset(&self) -> usize {
        self.keys_offset() + 2 * self.key_units as usize * self.capacity as usize
    }

    pub fn chain_offset(&self) -> usize {
        self.values_offset() + 2 * self.value_units as usize * self.capacity as usize
    }

    pub fn slot_locks_offset(&self) -> usize {
        self.chain_offset() + 4 * self.capacity as usize
    }

    pub fn map_lock_offset(&self) -> usize {
        self.slot_locks_offset() + 4 * self.lock_words()
    }

    /// Total size of the region in bytes.
    pub fn region_size(&self) -> usize {
        self.map_lock_offset() + 12
    }
}

/// Round up to a multiple of `to`, or `None` when that leaves `u32`.
fn round_up(value: u32, to: u32) -> Option<u32> {
    value.div_ceil(to).checked_mul(to)
}
