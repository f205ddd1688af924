use thiserror::Error;

/// Map error.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong shape of input: empty key, embedded NUL, a string longer than
    /// its configured slot span, or a non-positive construction parameter.
    /// Raised before any lock is taken or state is changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Insert of a fresh key into a map that already holds `capacity`
    /// entries. Replacing an existing key still succeeds on a full map.
    #[error("map is full ({capacity} entries)")]
    CapacityExceeded { capacity: u32 },

    /// Remove of a key that is not present.
    #[error("key not found")]
    KeyNotFound,

    /// An opened region's header does not match the geometry the caller
    /// supplied.
    #[error("shared region mismatch: {0}")]
    RegionMismatch(&'static str),

    /// Creating or mapping the backing file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use Error::*;

        match (self, other) {
            (InvalidArgument(a), InvalidArgument(b)) => a == b,
            (CapacityExceeded { capacity: a }, CapacityExceeded { capacity: b }) => a == b,
            (KeyNotFound, KeyNotFound) => true,
            (RegionMismatch(a), RegionMismatch(b)) => a == b,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
