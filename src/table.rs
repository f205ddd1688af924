//! Coalesced-chaining engine over the raw region.
//!
//! Collision successors live in any free slot, found by linear probing and
//! linked through the chain array, so chains from different head slots can
//! coalesce. Traversals under the shared map lock hold at most two slot
//! locks at a time — the sliding current lock plus, while probing, the lock
//! on the future chain predecessor — and only ever acquire upward in slot
//! order. A step that would acquire downward raises the deadlock signal and
//! the caller retries under the exclusive map lock, where no slot locks are
//! taken at all.

use std::ptr;
use std::sync::atomic::Ordering;

use crate::hash;
use crate::layout::UNDEFINED;
use crate::lock::Locks;
use crate::region::Region;

/// The atomic ordering used for chain and length words.
const ORDERING: Ordering = Ordering::SeqCst;

/// Engine-level failure. `Deadlock` never escapes the public surface; the
/// envelope converts it into an exclusive-lock retry.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    Deadlock,
    Full,
    NotFound,
}

/// A located entry: the slot holding the key and its chain predecessor
/// (`UNDEFINED` when the slot is the chain head).
pub struct Found {
    pub pos: u32,
    pub previous: u32,
}

/// Slot locks held by one traversal.
///
/// Disabled entirely under the exclusive map lock, which turns every
/// method into a no-op so the engine code reads the same on both paths.
struct Held<'a> {
    locks: Locks<'a>,
    enabled: bool,
    current: Option<u32>,
    anchor: Option<u32>,
}

impl<'a> Held<'a> {
    fn new(locks: Locks<'a>, enabled: bool) -> Self {
        Held {
            locks,
            enabled,
            current: None,
            anchor: None,
        }
    }

    /// Acquire the traversal's first lock. No ordering rule applies since
    /// nothing is held yet.
    fn first(&mut self, slot: u32) {
        if self.enabled {
            self.locks.lock_slot(slot);
            self.current = Some(slot);
        }
    }

    /// Slide the current lock to `to`, escalating if that would acquire
    /// downward in slot order.
    fn slide(&mut self, to: u32) -> Result<(), EngineError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(from) = self.current {
            if !self.locks.slide_slot(from, to) {
                self.release_all();
                return Err(EngineError::Deadlock);
            }
            self.current = Some(to);
        }
        Ok(())
    }

    /// Turn the current lock into the probe anchor: it stays held on the
    /// future chain predecessor while the probe lock slides past it.
    fn anchor_current(&mut self) {
        if self.enabled {
            self.anchor = self.current.take();
        }
    }

    /// Acquire the first probe lock after anchoring. Subject to the same
    /// ordering rule as a slide: wrapping past the end of the table would
    /// acquire at or below the anchor, so it escalates instead.
    fn acquire_above(&mut self, slot: u32) -> Result<(), EngineError> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(anchor) = self.anchor {
            if slot <= anchor {
                self.release_all();
                return Err(EngineError::Deadlock);
            }
        }
        self.locks.lock_slot(slot);
        self.current = Some(slot);
        Ok(())
    }

    /// Hand the current lock to the caller: it stays held, and the caller
    /// is responsible for releasing it after reading the slot.
    fn forget_current(&mut self) {
        self.current = None;
        self.release_all();
    }

    fn release_all(&mut self) {
        if let Some(slot) = self.current.take() {
            self.locks.unlock_slot(slot);
        }
        if let Some(slot) = self.anchor.take() {
            self.locks.unlock_slot(slot);
        }
    }
}

/// The chain engine. A transient view over the region, like the lock
/// handle; geometry is unpacked once per operation.
pub struct Table<'a> {
    region: &'a Region,
    capacity: u32,
    key_units: usize,
    value_units: usize,
}

impl<'a> Table<'a> {
    pub fn new(region: &'a Region) -> Self {
        let g = region.geometry();
        Table {
            region,
            capacity: g.capacity,
            key_units: g.key_units as usize,
            value_units: g.value_units as usize,
        }
    }

    // ---- slot cells ----

    fn key_ptr(&self, slot: u32) -> *mut u16 {
        unsafe { self.region.keys_ptr().add(slot as usize * self.key_units) }
    }

    fn value_ptr(&self, slot: u32) -> *mut u16 {
        unsafe { self.region.values_ptr().add(slot as usize * self.value_units) }
    }

    /// A slot is occupied iff its first key unit is non-zero.
    fn occupied(&self, slot: u32) -> bool {
        unsafe { self.key_ptr(slot).read() != 0 }
    }

    fn key_equals(&self, slot: u32, key: &[u16]) -> bool {
        if key.len() > self.key_units {
            return false;
        }
        let stored = self.key_ptr(slot);
        for (j, &unit) in key.iter().enumerate() {
            if unsafe { stored.add(j).read() } != unit {
                return false;
            }
        }
        // A key that fills the span exactly has no terminator.
        key.len() == self.key_units || unsafe { stored.add(key.len()).read() } == 0
    }

    fn write_key(&self, slot: u32, key: &[u16]) {
        unsafe { write_units(self.key_ptr(slot), key, self.key_units) }
    }

    fn write_value(&self, slot: u32, value: &[u16]) {
        unsafe { write_units(self.value_ptr(slot), value, self.value_units) }
    }

    /// Zeroing the first key unit is what frees a slot; the rest of the
    /// span is garbage until the slot is claimed again.
    fn clear_key(&self, slot: u32) {
        unsafe { self.key_ptr(slot).write(0) }
    }

    pub fn read_key(&self, slot: u32) -> Vec<u16> {
        read_units(self.key_ptr(slot), self.key_units)
    }

    pub fn read_value(&self, slot: u32) -> Vec<u16> {
        read_units(self.value_ptr(slot), self.value_units)
    }

    fn chain_at(&self, slot: u32) -> u32 {
        self.region.chain()[slot as usize].load(ORDERING)
    }

    fn set_chain(&self, slot: u32, next: u32) {
        self.region.chain()[slot as usize].store(next, ORDERING);
    }

    fn length(&self) -> u32 {
        self.region.length().load(ORDERING)
    }

    // ---- operations ----

    /// Insert or replace.
    ///
    /// Walks the chain from the key's head slot; replaces in place on a
    /// key match, otherwise remembers the chain tail as the link target
    /// and linear-probes upward for a free slot to claim and link.
    pub fn set_entry(
        &self,
        key: &[u16],
        value: &[u16],
        hashv: u32,
        exclusive: bool,
    ) -> Result<(), EngineError> {
        // Size checks live at the public boundary; the engine trusts them.
        debug_assert!(!key.is_empty() && key.len() <= self.key_units);
        debug_assert!(value.len() <= self.value_units);

        let mut held = Held::new(self.region.locks(), !exclusive);
        let mut p = hash::slot_for(hashv, self.capacity);
        let mut to_chain: Option<u32> = None;
        held.first(p);

        while self.occupied(p) {
            if self.key_equals(p, key) {
                self.write_value(p, value);
                held.release_all();
                return Ok(());
            }
            if to_chain.is_some() {
                // Probing: step to the next slot, wrapping only on the
                // exclusive path (a shared-path wrap escalates).
                let probe = (p + 1) % self.capacity;
                held.slide(probe)?;
                p = probe;
            } else {
                let next = self.chain_at(p);
                if next != UNDEFINED {
                    held.slide(next)?;
                    p = next;
                } else {
                    // Diverge at the chain tail. The map cannot shrink
                    // while we hold the shared lock, so a full map here is
                    // a definitive failure, and it bounds the exclusive
                    // probe loop as well.
                    if self.length() == self.capacity {
                        held.release_all();
                        return Err(EngineError::Full);
                    }
                    to_chain = Some(p);
                    held.anchor_current();
                    let probe = (p + 1) % self.capacity;
                    held.acquire_above(probe)?;
                    p = probe;
                }
            }
        }

        if self.length() == self.capacity {
            held.release_all();
            return Err(EngineError::Full);
        }

        self.write_key(p, key);
        self.write_value(p, value);
        self.set_chain(p, UNDEFINED);
        self.region.length().fetch_add(1, ORDERING);
        if let Some(tail) = to_chain {
            self.set_chain(tail, p);
        }
        held.release_all();
        Ok(())
    }

    /// Locate a key along its primary chain.
    ///
    /// On a hit in the shared path the matched slot's lock is *still held*
    /// on return; the caller decodes the value under it and then releases
    /// it, keeping the bytes stable through the decode. Absence at the end
    /// of the chain is definitive — lookups never probe.
    pub fn find_entry(
        &self,
        key: &[u16],
        hashv: u32,
        exclusive: bool,
    ) -> Result<Option<Found>, EngineError> {
        let mut held = Held::new(self.region.locks(), !exclusive);
        let mut p = hash::slot_for(hashv, self.capacity);
        let mut previous = UNDEFINED;
        held.first(p);

        loop {
            if !self.occupied(p) {
                held.release_all();
                return Ok(None);
            }
            if self.key_equals(p, key) {
                held.forget_current();
                return Ok(Some(Found { pos: p, previous }));
            }
            let next = self.chain_at(p);
            if next == UNDEFINED {
                held.release_all();
                return Ok(None);
            }
            held.slide(next)?;
            previous = p;
            p = next;
        }
    }

    /// Delete a key. Caller holds the exclusive map lock.
    ///
    /// Unlinks the matched slot, then rechains the displaced tail:
    /// successors were placed by probing from positions that no longer
    /// exist, so they are collected in chain order, freed and reinserted.
    /// Freeing `1 + tail` slots before reinserting `tail` entries means
    /// the reinserts cannot run out of capacity.
    pub fn delete_entry(&self, key: &[u16], hashv: u32) -> Result<(), EngineError> {
        let found = match self.find_entry(key, hashv, true)? {
            Some(found) => found,
            None => return Err(EngineError::NotFound),
        };

        let next = self.chain_at(found.pos);
        self.clear_key(found.pos);
        if found.previous != UNDEFINED {
            self.set_chain(found.previous, UNDEFINED);
        }
        self.region.length().fetch_sub(1, ORDERING);

        if next == UNDEFINED {
            return Ok(());
        }

        let mut displaced: Vec<(Vec<u16>, Vec<u16>)> = Vec::new();
        let mut q = next;
        while q != UNDEFINED {
            let successor = self.chain_at(q);
            displaced.push((self.read_key(q), self.read_value(q)));
            self.clear_key(q);
            self.region.length().fetch_sub(1, ORDERING);
            q = successor;
        }
        for (k, v) in &displaced {
            self.set_entry(k, v, hash::hash_units(k), true)?;
        }
        Ok(())
    }

    /// Empty the map. Caller holds the exclusive map lock.
    ///
    /// Chain words are left as-is: they are meaningful only for occupied
    /// slots and every claim rewrites its own.
    pub fn clear_entries(&self) {
        unsafe {
            ptr::write_bytes(self.region.keys_ptr(), 0, self.capacity as usize * self.key_units);
            ptr::write_bytes(
                self.region.values_ptr(),
                0,
                self.capacity as usize * self.value_units,
            );
        }
        self.region.length().store(0, ORDERING);
    }

    /// Snapshot slot `index` for iteration: shared map lock plus the slot
    /// lock, decode if occupied, release both.
    pub fn snapshot_key(&self, index: u32) -> Option<Vec<u16>> {
        let locks = self.region.locks();
        locks.lock_shared();
        locks.lock_slot(index);
        let key = if self.occupied(index) {
            Some(self.read_key(index))
        } else {
            None
        };
        locks.unlock_slot(index);
        locks.unlock_shared();
        key
    }
}

/// Write `units` into a span of `span` units, zero-terminated only when
/// shorter than the span.
unsafe fn write_units(dst: *mut u16, units: &[u16], span: usize) {
    ptr::copy_nonoverlapping(units.as_ptr(), dst, units.len());
    if units.len() < span {
        dst.add(units.len()).write(0);
    }
}

/// Read a span back up to its terminator or full length.
fn read_units(src: *const u16, span: usize) -> Vec<u16> {
    let mut out = Vec::with_capacity(span);
    for j in 0..span {
        let unit = unsafe { src.add(j).read() };
        if unit == 0 {
            break;
        }
        out.push(unit);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Geometry;

    fn table(region: &Region) -> Table<'_> {
        Table::new(region)
    }

    fn units(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn region(capacity: u32, key_units: u32, value_units: u32) -> Region {
        Region::anonymous(Geometry::new(capacity, key_units, value_units).unwrap()).unwrap()
    }

    #[test]
    fn forced_collisions_build_a_chain() {
        let r = region(4, 4, 4);
        let t = table(&r);

        // All three keys claim hash 0, so they chain off slot 0.
        t.set_entry(&units("k0"), &units("a"), 0, false).unwrap();
        t.set_entry(&units("k1"), &units("b"), 0, false).unwrap();
        t.set_entry(&units("k2"), &units("c"), 0, false).unwrap();

        assert_eq!(r.length().load(Ordering::SeqCst), 3);
        assert_eq!(t.chain_at(0), 1);
        assert_eq!(t.chain_at(1), 2);
        assert_eq!(t.chain_at(2), UNDEFINED);

        // Lookups walk the chain from the forced head.
        let f = t.find_entry(&units("k2"), 0, true).unwrap().unwrap();
        assert_eq!(f.pos, 2);
        assert_eq!(f.previous, 1);
        assert!(t.find_entry(&units("k3"), 0, true).unwrap().is_none());
    }

    #[test]
    fn replace_keeps_slot_and_length() {
        let r = region(4, 4, 4);
        let t = table(&r);

        t.set_entry(&units("k"), &units("v1"), 0, false).unwrap();
        t.set_entry(&units("k"), &units("v2"), 0, false).unwrap();
        assert_eq!(r.length().load(Ordering::SeqCst), 1);
        assert_eq!(t.read_value(0), units("v2"));
    }

    #[test]
    fn delete_rechains_displaced_tail() {
        let r = region(4, 4, 4);
        let t = table(&r);

        t.set_entry(&units("k0"), &units("a"), 0, false).unwrap();
        t.set_entry(&units("k1"), &units("b"), 0, false).unwrap();
        t.set_entry(&units("k2"), &units("c"), 0, false).unwrap();

        t.delete_entry(&units("k0"), 0).unwrap();
        assert_eq!(r.length().load(Ordering::SeqCst), 2);

        // Survivors moved to their natural chains and stayed retrievable.
        for (k, v) in [("k1", "b"), ("k2", "c")] {
            let h = crate::hash::hash_units(&units(k));
            let f = t.find_entry(&units(k), h, true).unwrap().unwrap();
            assert_eq!(t.read_value(f.pos), units(v));
        }
        assert!(t.find_entry(&units("k0"), 0, true).unwrap().is_none());
    }

    #[test]
    fn full_map_rejects_fresh_keys_but_replaces() {
        let r = region(4, 4, 4);
        let t = table(&r);

        // One entry per slot, no chains, so the walks below are fixed.
        for i in 0..4u32 {
            let k = format!("k{i}");
            t.set_entry(&units(&k), &units("v"), i, false).unwrap();
        }
        assert_eq!(r.length().load(Ordering::SeqCst), 4);

        assert_eq!(
            t.set_entry(&units("xx"), &units("v"), 0, false),
            Err(EngineError::Full)
        );
        // The exclusive path must terminate with the same answer.
        assert_eq!(
            t.set_entry(&units("xx"), &units("v"), 0, true),
            Err(EngineError::Full)
        );

        t.set_entry(&units("k2"), &units("w"), 2, false).unwrap();
        assert_eq!(r.length().load(Ordering::SeqCst), 4);
        assert_eq!(t.read_value(2), units("w"));
    }

    #[test]
    fn shared_path_wrap_raises_deadlock_signal() {
        let r = region(4, 4, 4);
        let t = table(&r);

        // Occupy the last slot so an insert hashed there must probe past
        // the end of the table.
        t.set_entry(&units("tail"), &units("v"), 3, false).unwrap();
        assert_eq!(
            t.set_entry(&units("wrap"), &units("v"), 3, false),
            Err(EngineError::Deadlock)
        );
        // The exclusive retry wraps modulo capacity and succeeds.
        t.set_entry(&units("wrap"), &units("v"), 3, true).unwrap();
        let f = t.find_entry(&units("wrap"), 3, true).unwrap().unwrap();
        assert_eq!(f.pos, 0);
        assert_eq!(f.previous, 3);
    }

    #[test]
    fn exact_span_keys_and_values_round_trip() {
        let r = region(4, 4, 4);
        let t = table(&r);

        // Four units exactly fill the span, leaving no terminator.
        let k = units("abcd");
        let v = units("wxyz");
        let h = crate::hash::hash_units(&k);
        t.set_entry(&k, &v, h, false).unwrap();
        let f = t.find_entry(&k, h, true).unwrap().unwrap();
        assert_eq!(t.read_key(f.pos), k);
        assert_eq!(t.read_value(f.pos), v);

        // A prefix of the stored key is a different key.
        assert!(t.find_entry(&units("abc"), h, true).unwrap().is_none());
    }
}
