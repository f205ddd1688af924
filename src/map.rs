//! The public map handle.
//!
//! Every keyed operation follows the same envelope: validate and encode at
//! the boundary, take the shared map lock, run the chain engine with slot
//! locks, and — if the sliding-lock rule tripped the deadlock signal —
//! retry once under the exclusive map lock, where the engine takes no slot
//! locks at all. Removal and `clear` go straight to exclusive.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::hash;
use crate::layout::Geometry;
use crate::region::Region;
use crate::table::{EngineError, Table};

/// A fixed-capacity string map inside one contiguous shared memory region.
///
/// Threads share a handle behind `Arc`; processes each map the same
/// backing file via [`SharedMap::create`] / [`SharedMap::open`]. All slot
/// storage, chain links and lock words live inside the region, so no
/// allocation is shared outside it.
pub struct SharedMap {
    region: Region,
    deadlocks: AtomicU64,
}

/// Worker-local counters for one handle. Nothing here lives in the shared
/// region; peers keep their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Traversals that hit the sliding-lock order violation and were
    /// retried under the exclusive map lock.
    pub deadlock_retries: u64,
}

impl SharedMap {
    /// Create a map over an anonymous region, for threads of one process.
    ///
    /// `capacity` rounds up to a multiple of 4, the unit counts to a
    /// multiple of 2; see [`SharedMap::capacity`] for the effective values.
    pub fn new(capacity: u32, key_units: u32, value_units: u32) -> Result<SharedMap, Error> {
        let geometry = Geometry::new(capacity, key_units, value_units)?;
        Ok(SharedMap {
            region: Region::anonymous(geometry)?,
            deadlocks: AtomicU64::new(0),
        })
    }

    /// Create a map in a new file-backed region at `path`, truncating any
    /// existing file.
    pub fn create(
        path: impl AsRef<Path>,
        capacity: u32,
        key_units: u32,
        value_units: u32,
    ) -> Result<SharedMap, Error> {
        let geometry = Geometry::new(capacity, key_units, value_units)?;
        Ok(SharedMap {
            region: Region::create(path.as_ref(), geometry)?,
            deadlocks: AtomicU64::new(0),
        })
    }

    /// Attach to a region created by a peer. The caller passes the same
    /// three numbers the creator used; the mapping is validated against
    /// them before any operation touches it.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: u32,
        key_units: u32,
        value_units: u32,
    ) -> Result<SharedMap, Error> {
        let geometry = Geometry::new(capacity, key_units, value_units)?;
        Ok(SharedMap {
            region: Region::open(path.as_ref(), geometry)?,
            deadlocks: AtomicU64::new(0),
        })
    }

    /// Insert or replace `key`.
    pub fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        let hashv = hash::hash_units(&key);
        self.set_units(&key, &value, hashv)
    }

    /// [`SharedMap::set`] with a caller-supplied hash replacing the
    /// built-in one for this call.
    ///
    /// Entries displaced by a later removal are reinserted under the
    /// built-in hash of their stored key, so custom-hashed entries migrate
    /// to their natural chain when a delete rechains them.
    pub fn set_with_hash(&self, key: &str, value: &str, hashv: u32) -> Result<(), Error> {
        let key = self.encode_key(key)?;
        let value = self.encode_value(value)?;
        self.set_units(&key, &value, hashv)
    }

    /// Look up `key`, returning a copy of its value.
    pub fn get(&self, key: &str) -> Option<String> {
        let key = self.lookup_units(key)?;
        let hashv = hash::hash_units(&key);
        self.get_units(&key, hashv)
    }

    /// [`SharedMap::get`] with a caller-supplied hash.
    pub fn get_with_hash(&self, key: &str, hashv: u32) -> Option<String> {
        let key = self.lookup_units(key)?;
        self.get_units(&key, hashv)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> bool {
        match self.lookup_units(key) {
            Some(key) => {
                let hashv = hash::hash_units(&key);
                self.has_units(&key, hashv)
            }
            None => false,
        }
    }

    /// [`SharedMap::has`] with a caller-supplied hash.
    pub fn has_with_hash(&self, key: &str, hashv: u32) -> bool {
        match self.lookup_units(key) {
            Some(key) => self.has_units(&key, hashv),
            None => false,
        }
    }

    /// Remove `key`, rechaining any displaced collision successors.
    pub fn remove(&self, key: &str) -> Result<(), Error> {
        match self.lookup_units(key) {
            Some(key) => {
                let hashv = hash::hash_units(&key);
                self.remove_units(&key, hashv)
            }
            None => Err(Error::KeyNotFound),
        }
    }

    /// [`SharedMap::remove`] with a caller-supplied hash.
    pub fn remove_with_hash(&self, key: &str, hashv: u32) -> Result<(), Error> {
        match self.lookup_units(key) {
            Some(key) => self.remove_units(&key, hashv),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Lazily yield the keys present as each slot is visited.
    ///
    /// Each slot is snapshotted under consistent locks, but the sequence
    /// as a whole is only a union of per-slot snapshots: keys inserted or
    /// removed mid-iteration may appear once, or not at all.
    pub fn keys(&self) -> Keys<'_> {
        Keys {
            map: self,
            index: 0,
        }
    }

    /// Empty the map.
    pub fn clear(&self) {
        let locks = self.region.locks();
        locks.lock_exclusive();
        Table::new(&self.region).clear_entries();
        locks.unlock_exclusive();
    }

    /// Current entry count. Read without any lock; may run ahead of or
    /// behind a concurrent mutation by one.
    pub fn len(&self) -> usize {
        self.region.length().load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Effective capacity after rounding.
    pub fn capacity(&self) -> usize {
        self.region.geometry().capacity as usize
    }

    /// Effective per-slot key span in UTF-16 code units.
    pub fn key_units(&self) -> usize {
        self.region.geometry().key_units as usize
    }

    /// Effective per-slot value span in UTF-16 code units.
    pub fn value_units(&self) -> usize {
        self.region.geometry().value_units as usize
    }

    /// Counters local to this handle.
    pub fn stats(&self) -> Stats {
        Stats {
            deadlock_retries: self.deadlocks.load(Ordering::Relaxed),
        }
    }

    // ---- envelope internals ----

    fn set_units(&self, key: &[u16], value: &[u16], hashv: u32) -> Result<(), Error> {
        let locks = self.region.locks();
        let table = Table::new(&self.region);

        locks.lock_shared();
        let attempt = table.set_entry(key, value, hashv, false);
        locks.unlock_shared();

        match attempt {
            Ok(()) => Ok(()),
            Err(EngineError::Full) => Err(self.full_error()),
            Err(EngineError::Deadlock) => {
                self.note_escalation();
                locks.lock_exclusive();
                let retry = table.set_entry(key, value, hashv, true);
                locks.unlock_exclusive();
                match retry {
                    Ok(()) => Ok(()),
                    Err(EngineError::Full) => Err(self.full_error()),
                    Err(_) => unreachable!("exclusive set cannot raise the deadlock signal"),
                }
            }
            Err(EngineError::NotFound) => unreachable!("set does not report absence"),
        }
    }

    fn get_units(&self, key: &[u16], hashv: u32) -> Option<String> {
        let locks = self.region.locks();
        let table = Table::new(&self.region);

        locks.lock_shared();
        match table.find_entry(key, hashv, false) {
            Ok(Some(found)) => {
                // The matched slot's lock was handed to us: decode the
                // value before releasing it so the bytes cannot change
                // mid-read.
                let value = table.read_value(found.pos);
                locks.unlock_slot(found.pos);
                locks.unlock_shared();
                Some(String::from_utf16_lossy(&value))
            }
            Ok(None) => {
                locks.unlock_shared();
                None
            }
            Err(_) => {
                locks.unlock_shared();
                self.note_escalation();
                locks.lock_exclusive();
                let value = match table.find_entry(key, hashv, true) {
                    Ok(Some(found)) => Some(table.read_value(found.pos)),
                    Ok(None) => None,
                    Err(_) => unreachable!("exclusive find cannot raise the deadlock signal"),
                };
                locks.unlock_exclusive();
                value.map(|units| String::from_utf16_lossy(&units))
            }
        }
    }

    fn has_units(&self, key: &[u16], hashv: u32) -> bool {
        let locks = self.region.locks();
        let table = Table::new(&self.region);

        locks.lock_shared();
        match table.find_entry(key, hashv, false) {
            Ok(Some(found)) => {
                locks.unlock_slot(found.pos);
                locks.unlock_shared();
                true
            }
            Ok(None) => {
                locks.unlock_shared();
                false
            }
            Err(_) => {
                locks.unlock_shared();
                self.note_escalation();
                locks.lock_exclusive();
                let present = matches!(table.find_entry(key, hashv, true), Ok(Some(_)));
                locks.unlock_exclusive();
                present
            }
        }
    }

    fn remove_units(&self, key: &[u16], hashv: u32) -> Result<(), Error> {
        let locks = self.region.locks();
        let table = Table::new(&self.region);

        locks.lock_exclusive();
        let result = table.delete_entry(key, hashv);
        locks.unlock_exclusive();

        match result {
            Ok(()) => Ok(()),
            Err(EngineError::NotFound) => Err(Error::KeyNotFound),
            // A rechain frees more slots than it refills, so this cannot
            // happen; propagate rather than swallow if it ever does.
            Err(EngineError::Full) => Err(self.full_error()),
            Err(EngineError::Deadlock) => {
                unreachable!("exclusive delete cannot raise the deadlock signal")
            }
        }
    }

    fn note_escalation(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
        log::trace!("slot-lock order violated; retrying under the exclusive map lock");
    }

    fn full_error(&self) -> Error {
        Error::CapacityExceeded {
            capacity: self.region.geometry().capacity,
        }
    }

    fn encode_key(&self, key: &str) -> Result<Vec<u16>, Error> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must be non-empty"));
        }
        let units: Vec<u16> = key.encode_utf16().collect();
        if units.contains(&0) {
            return Err(Error::InvalidArgument("key must not contain NUL"));
        }
        if units.len() > self.key_units() {
            return Err(Error::InvalidArgument("key exceeds the configured key span"));
        }
        Ok(units)
    }

    fn encode_value(&self, value: &str) -> Result<Vec<u16>, Error> {
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.contains(&0) {
            return Err(Error::InvalidArgument("value must not contain NUL"));
        }
        if units.len() > self.value_units() {
            return Err(Error::InvalidArgument(
                "value exceeds the configured value span",
            ));
        }
        Ok(units)
    }

    /// Encode a key for the read paths: anything unrepresentable is
    /// simply not in the map.
    fn lookup_units(&self, key: &str) -> Option<Vec<u16>> {
        if key.is_empty() {
            return None;
        }
        let units: Vec<u16> = key.encode_utf16().collect();
        if units.contains(&0) || units.len() > self.key_units() {
            return None;
        }
        Some(units)
    }
}

/// Lazy key iterator, see [`SharedMap::keys`].
pub struct Keys<'a> {
    map: &'a SharedMap,
    index: u32,
}

impl Iterator for Keys<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let table = Table::new(&self.map.region);
        let capacity = self.map.region.geometry().capacity;
        while self.index < capacity {
            let slot = self.index;
            self.index += 1;
            if let Some(units) = table.snapshot_key(slot) {
                return Some(String::from_utf16_lossy(&units));
            }
        }
        None
    }
}
