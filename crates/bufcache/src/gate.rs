//! Per-slot readers-writer gate.
//!
//! Admits any number of concurrent readers or exactly one writer to a slot's
//! content. Releasing the writer wakes every waiter (pending readers and
//! writers re-check their conditions and race); the last reader out wakes a
//! single waiter to unblock a pending writer. The gate is not starvation-free:
//! a continuous stream of readers can delay a writer indefinitely. That is an
//! accepted limitation, not a bug.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    writer: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    /// Block while a writer is active, then register as a reader.
    pub(crate) fn acquire_read(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Drop a reader registration; the last reader out wakes one waiter.
    pub(crate) fn release_read(&self) {
        let mut state = self.state.lock();
        assert!(state.readers > 0, "release_read without an active reader");
        state.readers -= 1;
        let last_out = state.readers == 0;
        drop(state);
        if last_out {
            self.cond.notify_one();
        }
    }

    /// Block until no writer is active and all readers have left, then take
    /// exclusive access.
    pub(crate) fn acquire_write(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        assert!(state.readers == 0 && !state.writer);
        state.writer = true;
    }

    /// Drop exclusive access and wake all waiters.
    pub(crate) fn release_write(&self) {
        let mut state = self.state.lock();
        assert!(state.writer, "release_write without an active writer");
        state.writer = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Snapshot of `(reader_count, writer_active)`.
    pub(crate) fn occupancy(&self) -> (usize, bool) {
        let state = self.state.lock();
        (state.readers, state.writer)
    }
}
