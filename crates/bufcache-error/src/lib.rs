#![forbid(unsafe_code)]
//! Error types for the sector buffer cache.
//!
//! [`CacheError`] is the single user-facing error type for the whole
//! workspace. The cache layer has no recoverable-error taxonomy of its own:
//! device faults surface through `Result` and callers are expected to treat
//! them as unrecoverable, while invariant violations inside the cache are
//! programming-bug assertions rather than error values.
//!
//! Policy notes:
//! - This crate depends on no other workspace crate, so every layer can
//!   return [`CacheError`] without cycles.
//! - All string payloads are owned (`String`) to keep the type `'static`.
//! - Lock contention is never an error; contended paths retry internally.

use thiserror::Error;

/// Unified error type for all cache and device operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller-supplied sector number is past the end of the device.
    #[error("sector out of range: sector={sector} sector_count={sector_count}")]
    OutOfRange { sector: u64, sector_count: u64 },

    /// A caller-supplied buffer is not exactly one sector long.
    #[error("buffer size mismatch: got={got} expected={expected}")]
    BufferSize { got: usize, expected: usize },

    /// The backing store's shape is unusable (length not sector-aligned,
    /// offset arithmetic overflow).
    #[error("invalid device geometry: {0}")]
    Geometry(String),

    /// A write was attempted against a device opened read-only.
    #[error("read-only device")]
    ReadOnly,

    /// Rejected cache configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = CacheError::OutOfRange {
            sector: 9,
            sector_count: 8,
        };
        assert_eq!(err.to_string(), "sector out of range: sector=9 sector_count=8");

        let err = CacheError::BufferSize {
            got: 100,
            expected: 512,
        };
        assert_eq!(err.to_string(), "buffer size mismatch: got=100 expected=512");

        let err = CacheError::Geometry("image length 100 is not sector-aligned".to_owned());
        assert!(err.to_string().contains("invalid device geometry"));

        assert_eq!(CacheError::ReadOnly.to_string(), "read-only device");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::other("disk fell over");
        let err = CacheError::from(io);
        assert!(matches!(err, CacheError::Io(_)));
    }
}
