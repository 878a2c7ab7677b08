//! Asynchronous read-ahead of the next sequential sector.
//!
//! Every miss spawns an ephemeral prefetch task. The spawner blocks only on
//! the claim handshake: the signal means "a slot is reserved for this
//! sector", not "the data has arrived". A caller that immediately reads the
//! prefetched sector may still block briefly on its identity lock until the
//! device read completes, by ordinary lookup semantics.

use crate::cache::CacheInner;
use crate::slot::EMPTY_TAG;
use bufcache_block::SectorDevice;
use bufcache_types::SectorNumber;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};

/// One-shot completion handshake between a miss and its prefetch task.
#[derive(Debug, Default)]
pub(crate) struct ClaimSignal {
    claimed: Mutex<bool>,
    cond: Condvar,
}

impl ClaimSignal {
    pub(crate) fn set(&self) {
        let mut claimed = self.claimed.lock();
        *claimed = true;
        drop(claimed);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut claimed = self.claimed.lock();
        while !*claimed {
            self.cond.wait(&mut claimed);
        }
    }
}

impl<D: SectorDevice + 'static> CacheInner<D> {
    /// Spawn a prefetch task for `sector` and return its claim handshake.
    pub(crate) fn spawn_readahead(self: &Arc<Self>, sector: SectorNumber) -> Arc<ClaimSignal> {
        let signal = Arc::new(ClaimSignal::default());
        let inner = Arc::clone(self);
        let task_signal = Arc::clone(&signal);
        let spawned = std::thread::Builder::new()
            .name("bufcache-readahead".to_owned())
            .spawn(move || inner.readahead(sector, &task_signal));
        if let Err(err) = spawned {
            // Prefetch is best-effort; a spawn failure must not strand the
            // spawner on the handshake.
            warn!(target: "bufcache::readahead", sector = sector.0, error = %err, "readahead_spawn_failed");
            signal.set();
        }
        signal
    }

    fn readahead(&self, sector: SectorNumber, signal: &ClaimSignal) {
        // Past the end of the device: nothing to warm.
        if sector.0 >= self.device.sector_count() {
            signal.set();
            return;
        }

        if self.probe(sector, true) {
            signal.set();
            return;
        }

        // Best-effort: if another thread is mid-eviction, bow out rather
        // than queue behind it.
        let Some(mut clock) = self.clock.try_lock() else {
            trace!(target: "bufcache::readahead", sector = sector.0, "readahead_abandoned");
            signal.set();
            return;
        };

        // The sector may have landed while we raced for the eviction mutex;
        // loading it again would bind two slots to one sector.
        if self.probe(sector, true) {
            signal.set();
            return;
        }

        let (idx, mut ident) = match self.reclaim(&mut clock) {
            Ok(victim) => victim,
            Err(err) => {
                warn!(target: "bufcache::readahead", sector = sector.0, error = %err, "readahead_reclaim_failed");
                signal.set();
                return;
            }
        };
        let slot = &self.slots[idx];
        *ident = Some(sector);
        slot.tag.store(sector.0, Ordering::SeqCst);

        // Slot claimed: release the spawner now, before the device read.
        signal.set();

        let mut data = slot.data.lock();
        let loaded = self.device.read_sector(sector, &mut data[..]);
        drop(data);
        match loaded {
            Ok(()) => {
                slot.recent.store(true, Ordering::SeqCst);
                self.counters.readaheads.fetch_add(1, Ordering::SeqCst);
                trace!(target: "bufcache::readahead", sector = sector.0, slot = idx, "readahead_loaded");
            }
            Err(err) => {
                // A failed load leaves the slot unbound.
                *ident = None;
                slot.tag.store(EMPTY_TAG, Ordering::SeqCst);
                warn!(target: "bufcache::readahead", sector = sector.0, error = %err, "readahead_load_failed");
            }
        }
        // Identity lock and eviction mutex release here, after the load.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn claim_signal_releases_waiter() {
        let signal = Arc::new(ClaimSignal::default());
        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        signal.set();
        waiter.join().expect("waiter join");
    }

    #[test]
    fn claim_signal_set_before_wait_does_not_block() {
        let signal = ClaimSignal::default();
        signal.set();
        signal.wait();
    }
}
