//! Shared memory region management.
//!
//! A region is either an anonymous mapping (threads of one process sharing
//! a handle) or a mapped file (independent processes attaching by path).
//! Creation zeroes the whole region and stamps the header; attaching
//! validates the header against the geometry the caller supplied, since
//! the layout is reconstructed from those numbers alone.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicU32;

use memmap2::MmapMut;

use crate::error::Error;
use crate::layout::{Geometry, Header};
use crate::lock::Locks;

/// The mapped region, owning the mmap handle and providing the typed
/// accessors the engine works through.
pub struct Region {
    mmap: MmapMut,
    geometry: Geometry,
}

impl Region {
    /// Create an anonymous region. The mapping is zero-filled by the OS;
    /// only the header needs stamping.
    pub fn anonymous(geometry: Geometry) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(geometry.region_size())?;
        let region = Region { mmap, geometry };
        region.stamp_header();
        Ok(region)
    }

    /// Create a new file-backed region, truncating any previous file.
    pub fn create(path: &Path, geometry: Geometry) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(geometry.region_size() as u64)?;

        // Safety: we just created and truncated this file and size it
        // ourselves; concurrent attachers are expected to use `open`.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);

        let region = Region { mmap, geometry };
        region.stamp_header();
        region.mmap.flush()?;

        log::debug!(
            "created shared region {} ({} bytes, capacity {})",
            path.display(),
            geometry.region_size(),
            geometry.capacity
        );
        Ok(region)
    }

    /// Attach to an existing file-backed region.
    ///
    /// The caller supplies the same three numbers the creator used; the
    /// header must agree, otherwise the mapping is not the layout we would
    /// compute and nothing in it can be trusted.
    pub fn open(path: &Path, geometry: Geometry) -> Result<Self, Error> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if mmap.len() < geometry.region_size() {
            return Err(Error::RegionMismatch("region file is too small"));
        }

        let region = Region { mmap, geometry };
        let header = region.header();
        if header.capacity != geometry.capacity {
            return Err(Error::RegionMismatch("capacity differs"));
        }
        if header.key_units != geometry.key_units {
            return Err(Error::RegionMismatch("key_units differs"));
        }
        if header.value_units != geometry.value_units {
            return Err(Error::RegionMismatch("value_units differs"));
        }

        log::debug!("attached shared region {}", path.display());
        Ok(region)
    }

    fn stamp_header(&self) {
        let header = unsafe { &mut *(self.base_ptr() as *mut Header) };
        header.capacity = self.geometry.capacity;
        header.key_units = self.geometry.key_units;
        header.value_units = self.geometry.value_units;
        // length is already zero from the fresh mapping.
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.base_ptr() as *const Header) }
    }

    /// The atomic entry counter in the header.
    pub fn length(&self) -> &AtomicU32 {
        &self.header().length
    }

    /// Base of the key unit storage.
    pub fn keys_ptr(&self) -> *mut u16 {
        unsafe { self.base_ptr().add(self.geometry.keys_offset()) as *mut u16 }
    }

    /// Base of the value unit storage.
    pub fn values_ptr(&self) -> *mut u16 {
        unsafe { self.base_ptr().add(self.geometry.values_offset()) as *mut u16 }
    }

    /// The chain array, one word per slot.
    pub fn chain(&self) -> &[AtomicU32] {
        unsafe {
            std::slice::from_raw_parts(
                self.base_ptr().add(self.geometry.chain_offset()) as *const AtomicU32,
                self.geometry.capacity as usize,
            )
        }
    }

    /// Lock handle over the slot bitmap and the map-lock triple.
    pub fn locks(&self) -> Locks<'_> {
        unsafe {
            let slots = std::slice::from_raw_parts(
                self.base_ptr().add(self.geometry.slot_locks_offset()) as *const AtomicU32,
                self.geometry.lock_words(),
            );
            let triple = self.base_ptr().add(self.geometry.map_lock_offset()) as *const AtomicU32;
            Locks::new(slots, &*triple, &*triple.add(1), &*triple.add(2))
        }
    }
}
