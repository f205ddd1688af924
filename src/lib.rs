//! Fixed-capacity shared-memory hash map.
//!
//! `SharedMap` maps string keys to string values inside one contiguous
//! memory region whose layout is fully determined by three construction
//! parameters, so nothing is allocated after construction and independent
//! processes can attach to the same backing file and operate on it
//! concurrently. Collisions are resolved by coalesced chaining; mutations
//! coordinate through a map-wide readers/writer lock plus per-slot lock
//! bits, with traversals sliding their slot lock strictly upward and
//! falling back to the exclusive map lock when that order cannot hold.
//!
//! ```
//! use shmap::SharedMap;
//!
//! let map = SharedMap::new(64, 16, 32)?;
//! map.set("season", "winter")?;
//! assert_eq!(map.get("season").as_deref(), Some("winter"));
//! assert_eq!(map.len(), 1);
//! map.remove("season")?;
//! assert!(!map.has("season"));
//! # Ok::<(), shmap::Error>(())
//! ```

mod error;
mod hash;
mod layout;
mod lock;
mod map;
mod region;
mod table;


pub use error::Error;
pub use map::{Keys, SharedMap, Stats};
