//! Stop-the-world coordination.
//!
//! Mutators register with the coordinator and poll it at every allocation.
//! A thread that needs the world stopped raises the request flag, waits for
//! every registered mutator to park, runs its operation and then releases
//! everyone by advancing the safepoint epoch.
//!
//! Parked mutators publish a snapshot of their roots before blocking, so
//! the operation sees the roots of every stopped thread.

use std::{
    mem,
    sync::atomic::{AtomicBool, Ordering},
};

use log::trace;
use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    requested: bool,
    /// Registered mutators that are not parked.
    running: usize,
    /// Mutators waiting for the current epoch to end. They count as running
    /// again as soon as the epoch ends, before they actually wake.
    parked: usize,
    registered: usize,
    epoch: u64,
    thread_roots: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct Safepoint {
    state: Mutex<State>,
    cond: Condvar,
    /// Mirror of `State::requested` for the polling fast path.
    pending: AtomicBool,
}

/// How the calling thread takes part in a stop-the-world operation.
#[derive(Debug)]
pub enum Requester {
    /// A thread that is not a registered mutator.
    External,
    /// A registered mutator, with a snapshot of its roots.
    Mutator(Vec<usize>),
}

impl Safepoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn registered(&self) -> usize {
        self.state.lock().registered
    }

    #[inline(always)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Adds the calling thread as a running mutator. Waits out any pending
    /// operation first.
    pub fn register(&self) {
        let mut state = self.state.lock();
        while state.requested {
            self.cond.wait(&mut state);
        }
        state.running += 1;
        state.registered += 1;
    }

    /// Removes a running mutator.
    pub fn unregister(&self) {
        let mut state = self.state.lock();
        state.running = state
            .running
            .checked_sub(1)
            .unwrap_or_else(|| unreachable!("unregister without register"));
        state.registered -= 1;
        self.cond.notify_all();
    }

    /// Parks the calling mutator while an operation is pending. `roots` is
    /// asked for a fresh snapshot each time the mutator parks.
    pub fn park(&self, mut roots: impl FnMut() -> Vec<usize>) {
        let mut state = self.state.lock();
        while state.requested {
            let snapshot = roots();
            state.thread_roots.extend(snapshot);
            self.wait_for_epoch(&mut state, true);
        }
    }

    fn wait_for_epoch(&self, state: &mut MutexGuard<'_, State>, is_mutator: bool) {
        if is_mutator {
            state.running -= 1;
            state.parked += 1;
            self.cond.notify_all();
        }
        let epoch = state.epoch;
        while state.epoch == epoch {
            self.cond.wait(state);
        }
    }

    /// Runs `op` with every registered mutator parked.
    ///
    /// The operation receives the root snapshots of the parked mutators
    /// (including the requester's own when it is a mutator). Returns `None`
    /// when another thread's operation was already pending; the caller was
    /// parked through it instead.
    pub fn execute<R>(&self, requester: Requester, op: impl FnOnce(&mut [usize]) -> R) -> Option<R> {
        let is_mutator = matches!(requester, Requester::Mutator(_));
        let mut state = self.state.lock();

        if state.requested {
            trace!("safepoint: operation already pending, parking");
            if let Requester::Mutator(roots) = requester {
                state.thread_roots.extend(roots);
            }
            self.wait_for_epoch(&mut state, is_mutator);
            return None;
        }

        state.requested = true;
        self.pending.store(true, Ordering::Release);
        if let Requester::Mutator(roots) = requester {
            state.thread_roots.extend(roots);
            state.running -= 1;
        }
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
        let mut thread_roots = mem::take(&mut state.thread_roots);
        let epoch = state.epoch;
        drop(state);

        trace!("safepoint: all mutators parked, epoch {epoch}");
        let result = op(&mut thread_roots);

        let mut state = self.state.lock();
        state.requested = false;
        self.pending.store(false, Ordering::Release);
        state.epoch += 1;
        state.running += mem::take(&mut state.parked);
        if is_mutator {
            state.running += 1;
        }
        self.cond.notify_all();
        Some(result)
    }
}
