//! Periodic write-back daemon.
//!
//! One long-lived thread sweeps the slot table on a fixed interval, flushing
//! dirty slots under shared gate access so concurrent readers proceed while
//! an in-flight writer blocks the flush of its slot. Shutdown is a
//! flag-plus-condvar handshake followed by a final sweep, so a clean
//! shutdown leaves nothing dirty behind.

use crate::cache::CacheInner;
use bufcache_block::SectorDevice;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Default)]
struct DaemonShared {
    stop: Mutex<bool>,
    cond: Condvar,
}

pub(crate) struct FlushDaemon {
    shared: Arc<DaemonShared>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    pub(crate) fn spawn<D: SectorDevice + 'static>(
        inner: Arc<CacheInner<D>>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(DaemonShared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("bufcache-writeback".to_owned())
            .spawn(move || run(&inner, &thread_shared, interval))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Stop the daemon and wait for its final sweep. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.cond.notify_all();
        let _ = handle.join();
    }
}

fn run<D: SectorDevice>(inner: &CacheInner<D>, shared: &DaemonShared, interval: Duration) {
    debug!(
        target: "bufcache::daemon",
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "writeback_daemon_started"
    );
    loop {
        let mut stop = shared.stop.lock();
        if !*stop {
            let _ = shared.cond.wait_for(&mut stop, interval);
        }
        let stopping = *stop;
        drop(stop);

        sweep(inner);
        if stopping {
            break;
        }
    }
    debug!(target: "bufcache::daemon", "writeback_daemon_stopped");
}

fn sweep<D: SectorDevice>(inner: &CacheInner<D>) {
    let mut flushed = 0_usize;
    for idx in 0..inner.slots.len() {
        match inner.flush_slot_shared(idx) {
            Ok(true) => flushed += 1,
            Ok(false) => {}
            Err(err) => {
                // The slot stays dirty; the next sweep retries it.
                error!(target: "bufcache::daemon", slot = idx, error = %err, "writeback_failed");
            }
        }
    }
    if flushed > 0 {
        debug!(target: "bufcache::daemon", flushed, "writeback_sweep");
    }
}
