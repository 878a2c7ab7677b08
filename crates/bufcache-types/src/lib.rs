#![forbid(unsafe_code)]
//! Shared value types for the sector buffer cache.
//!
//! Unit-carrying newtypes prevent mixing sector numbers with byte offsets or
//! slot indices. Everything here is plain data; the synchronization-bearing
//! slot record lives in the `bufcache` crate.

use serde::{Deserialize, Serialize};

/// Size in bytes of one device sector. Every transfer between the cache, its
/// callers, and the device moves exactly this many bytes.
pub const SECTOR_SIZE: usize = 512;

/// Default number of in-memory cache slots.
pub const DEFAULT_CAPACITY: usize = 64;

/// Index of a fixed-size sector on the backing block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u64);

impl SectorNumber {
    /// The sector immediately following this one, or `None` at the end of
    /// the address space.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Byte offset of this sector on a byte-addressed device, or `None` on
    /// overflow.
    #[must_use]
    pub fn byte_offset(self) -> Option<u64> {
        let size = u64::try_from(SECTOR_SIZE).ok()?;
        self.0.checked_mul(size)
    }
}

/// Snapshot of a slot's two status flags.
///
/// The eviction scan distinguishes all four combinations; in particular
/// `Dirty` (unflushed but untouched since its recency was cleared) is treated
/// differently from `Recent` once the clock hand has completed a revolution,
/// so the four states must not be collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Neither recently used nor dirty. Immediately reclaimable.
    Idle,
    /// Accessed since the last clock sweep, content clean.
    Recent,
    /// Unflushed content, not accessed since its recency was last cleared.
    Dirty,
    /// Unflushed content and accessed since the last clock sweep.
    RecentDirty,
}

impl SlotStatus {
    #[must_use]
    pub fn from_flags(recent: bool, dirty: bool) -> Self {
        match (recent, dirty) {
            (false, false) => Self::Idle,
            (true, false) => Self::Recent,
            (false, true) => Self::Dirty,
            (true, true) => Self::RecentDirty,
        }
    }

    #[must_use]
    pub fn is_recent(self) -> bool {
        matches!(self, Self::Recent | Self::RecentDirty)
    }

    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::Dirty | Self::RecentDirty)
    }
}
