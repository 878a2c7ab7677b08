#![forbid(unsafe_code)]
//! Fixed-capacity, sector-addressed buffer cache.
//!
//! [`SectorCache`] sits between a filesystem layer and a block device,
//! holding recently- and frequently-used sectors in a fixed pool of slots.
//! Per-slot readers-writer gates coordinate concurrent access, a
//! second-chance (clock) scan reclaims slots under memory pressure, every
//! miss opportunistically prefetches the next sequential sector, and a
//! background daemon periodically writes dirty slots back to the device.
//!
//! ```no_run
//! use bufcache::{FileSectorDevice, SectorCache, SectorNumber, SECTOR_SIZE};
//!
//! # fn main() -> bufcache::Result<()> {
//! let device = FileSectorDevice::open("disk.img")?;
//! let cache = SectorCache::new(device)?;
//!
//! let mut sector = [0_u8; SECTOR_SIZE];
//! cache.read(SectorNumber(0), &mut sector)?;
//! sector[0] ^= 1;
//! cache.write(SectorNumber(0), &sector)?;
//! cache.close()?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod daemon;
mod gate;
mod readahead;
mod slot;

use crate::cache::CacheInner;
use crate::daemon::FlushDaemon;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use bufcache_block::{FileSectorDevice, MemSectorDevice, SectorDevice};
pub use bufcache_error::{CacheError, Result};
pub use bufcache_types::{SectorNumber, SlotStatus, DEFAULT_CAPACITY, SECTOR_SIZE};

/// Cache tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of in-memory slots. Must be at least 1.
    pub capacity: usize,
    /// Sleep between write-back daemon sweeps.
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            flush_interval: Duration::from_millis(250),
        }
    }
}

/// Point-in-time counters, taken without stopping traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Live slots reclaimed for another sector. Claims of never-bound slots
    /// are not counted.
    pub evictions: u64,
    /// Sectors written to the device by any flush path.
    pub writebacks: u64,
    /// Prefetches that completed a device load.
    pub readaheads: u64,
    pub dirty_slots: usize,
    pub capacity: usize,
}

/// A fixed pool of sector slots over a [`SectorDevice`].
///
/// Cheap to share: wrap in an `Arc` and clone the handle across threads.
/// Dropping the cache stops the write-back daemon and flushes whatever is
/// still dirty; use [`close`](Self::close) to observe flush errors instead
/// of having them logged.
pub struct SectorCache<D: SectorDevice + 'static> {
    inner: Arc<CacheInner<D>>,
    daemon: FlushDaemon,
    closed: bool,
}

impl<D: SectorDevice + 'static> SectorCache<D> {
    /// Build a cache with the default configuration and start its
    /// write-back daemon.
    pub fn new(device: D) -> Result<Self> {
        Self::with_config(device, CacheConfig::default())
    }

    pub fn with_config(device: D, config: CacheConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(CacheError::Config("capacity must be at least 1".to_owned()));
        }
        info!(
            target: "bufcache::cache",
            capacity = config.capacity,
            sector_count = device.sector_count(),
            "cache_init"
        );
        let inner = Arc::new(CacheInner::new(device, config.capacity));
        let daemon = FlushDaemon::spawn(Arc::clone(&inner), config.flush_interval)?;
        Ok(Self {
            inner,
            daemon,
            closed: false,
        })
    }

    fn check_request(&self, sector: SectorNumber, len: usize) -> Result<()> {
        if len != SECTOR_SIZE {
            return Err(CacheError::BufferSize {
                got: len,
                expected: SECTOR_SIZE,
            });
        }
        let sector_count = self.inner.device().sector_count();
        if sector.0 >= sector_count {
            return Err(CacheError::OutOfRange {
                sector: sector.0,
                sector_count,
            });
        }
        Ok(())
    }

    /// Copy one sector into `out`, loading it from the device on a miss.
    /// `out.len()` MUST equal [`SECTOR_SIZE`].
    pub fn read(&self, sector: SectorNumber, out: &mut [u8]) -> Result<()> {
        self.check_request(sector, out.len())?;
        self.inner.read(sector, out)
    }

    /// Copy one sector from `src` into the cache and mark it dirty. The
    /// device copy is updated later, by eviction, the daemon, or a flush.
    pub fn write(&self, sector: SectorNumber, src: &[u8]) -> Result<()> {
        self.check_request(sector, src.len())?;
        self.inner.write(sector, src)
    }

    /// Synchronously flush every dirty slot, then sync the device.
    ///
    /// This path takes no per-slot locks. Hard precondition: no concurrent
    /// cache traffic is in flight. It is intended for controlled shutdown,
    /// not general use; prefer [`flush_sector`](Self::flush_sector) while
    /// the cache is live.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush_all()
    }

    /// Flush one sector if it is resident and dirty; otherwise a no-op.
    /// Safe under concurrent traffic.
    pub fn flush_sector(&self, sector: SectorNumber) -> Result<()> {
        self.inner.flush_sector(sector)
    }

    /// Whether `sector` currently occupies a slot.
    pub fn is_resident(&self, sector: SectorNumber) -> bool {
        self.inner.probe(sector, false)
    }

    /// Number of slots holding unflushed content.
    pub fn dirty_count(&self) -> usize {
        self.inner.dirty_count()
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.inner.metrics()
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        self.inner.device()
    }

    /// Controlled shutdown: stop the daemon (which runs a final sweep),
    /// then flush anything left and sync the device.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.daemon.shutdown();
        self.inner.flush_all()
    }
}

impl<D: SectorDevice + 'static> Drop for SectorCache<D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.daemon.shutdown();
        if let Err(err) = self.inner.flush_all() {
            warn!(target: "bufcache::cache", error = %err, "flush_on_drop_failed");
        }
    }
}
