//! One cache slot: a sector-sized buffer plus its synchronization state.

use crate::gate::Gate;
use bufcache_types::{SectorNumber, SlotStatus, SECTOR_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Tag published by a slot bound to no sector.
///
/// A real sector can never collide with this value: caller sectors are
/// bounds-checked against the device's sector count, and a device with
/// `u64::MAX` addressable sectors cannot exist.
pub(crate) const EMPTY_TAG: u64 = u64::MAX;

/// A single fixed-size cache slot.
///
/// Lock discipline:
/// - `ident` is the identity lock: which sector (if any) the slot represents
///   changes only while it is held. `tag` is an unlocked mirror of the same
///   value, published under `ident`, that the table scan reads without
///   locking; any match must be re-checked under `ident`.
/// - `gate` admits many readers or one writer to the slot's content.
/// - `data` serializes the actual byte copies. The gate decides who may
///   touch the buffer; the buffer mutex only covers the memcpy itself.
/// - `recent` and `dirty` are set on the access paths and consumed by the
///   eviction scan and the write-back sweeps.
pub(crate) struct Slot {
    pub(crate) ident: Mutex<Option<SectorNumber>>,
    pub(crate) tag: AtomicU64,
    pub(crate) recent: AtomicBool,
    pub(crate) dirty: AtomicBool,
    pub(crate) gate: Gate,
    pub(crate) data: Mutex<[u8; SECTOR_SIZE]>,
}

impl Slot {
    pub(crate) fn empty() -> Self {
        Self {
            ident: Mutex::new(None),
            tag: AtomicU64::new(EMPTY_TAG),
            recent: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            gate: Gate::default(),
            data: Mutex::new([0_u8; SECTOR_SIZE]),
        }
    }

    pub(crate) fn status(&self) -> SlotStatus {
        SlotStatus::from_flags(
            self.recent.load(Ordering::SeqCst),
            self.dirty.load(Ordering::SeqCst),
        )
    }
}
