//! Thread-local allocation buffers.
//!
//! A TLAB is a chunk carved from the free list and handed to one mutator for
//! bump allocation. Retiring a TLAB formats its unused tail as a filler
//! object so the heap stays parsable and the tail is reclaimed by the next
//! sweep.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::{memory::Address, object::ObjectModel};

#[derive(Debug, Clone, Copy)]
pub struct Tlab {
    start: Address,
    top: Address,
    end: Address,
    /// Lifetime statistics.
    refills: usize,
    allocated_words: usize,
}

impl Default for Tlab {
    fn default() -> Self {
        Self::empty()
    }
}

impl Tlab {
    pub const fn empty() -> Self {
        Self {
            start: Address::NULL,
            top: Address::NULL,
            end: Address::NULL,
            refills: 0,
            allocated_words: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start.is_null()
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size_words(&self) -> usize {
        self.end.words_since(self.start)
    }

    pub fn used_words(&self) -> usize {
        self.top.words_since(self.start)
    }

    pub fn free_words(&self) -> usize {
        self.end.words_since(self.top)
    }

    pub fn refills(&self) -> usize {
        self.refills
    }

    pub fn allocated_words(&self) -> usize {
        self.allocated_words
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Starts bump allocation in `[start, start + words)`. The previous
    /// buffer must have been retired.
    pub fn install(&mut self, start: Address, words: usize) {
        debug_assert!(self.is_empty(), "installing over a live TLAB");
        self.start = start;
        self.top = start;
        self.end = start.add_words(words);
        self.refills += 1;
    }

    /// Bumps `words` off the buffer. `words` must already be granule
    /// adjusted.
    #[inline(always)]
    pub fn allocate(&mut self, words: usize) -> Option<Address> {
        if self.free_words() < words {
            return None;
        }
        let obj = self.top;
        self.top = obj.add_words(words);
        self.allocated_words += words;
        Some(obj)
    }

    /// Fills the unused tail with a dead object and clears the buffer, so the
    /// next allocation takes the slow path. Returns the words abandoned.
    ///
    /// # Safety
    /// the buffer's range must still belong to the heap and no other thread
    /// may be allocating from it.
    pub unsafe fn retire(&mut self, model: &ObjectModel) -> usize {
        if self.is_empty() {
            return 0;
        }
        let waste = self.free_words();
        if waste > 0 {
            // SAFETY: [top, end) is unused heap memory owned by this buffer
            unsafe { model.fill(self.top, waste) };
        }
        trace!(
            "tlab: retired [{}, {}) with {} words unused",
            self.start, self.end, waste
        );
        self.start = Address::NULL;
        self.top = Address::NULL;
        self.end = Address::NULL;
        waste
    }
}

pub type TlabHandle = Arc<Mutex<Tlab>>;

/// Every live mutator's TLAB, so a collection can retire them all.
#[derive(Debug, Default)]
pub struct TlabRegistry {
    tlabs: Mutex<Vec<TlabHandle>>,
}

impl TlabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> TlabHandle {
        let tlab = Arc::new(Mutex::new(Tlab::empty()));
        self.tlabs.lock().push(tlab.clone());
        tlab
    }

    pub fn unregister(&self, tlab: &TlabHandle) {
        self.tlabs.lock().retain(|t| !Arc::ptr_eq(t, tlab));
    }

    pub fn len(&self) -> usize {
        self.tlabs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retires every registered buffer. Returns the total words abandoned.
    ///
    /// # Safety
    /// every owning mutator must be stopped.
    pub unsafe fn retire_all(&self, model: &ObjectModel) -> usize {
        self.tlabs
            .lock()
            .iter()
            // SAFETY: owners are stopped by caller contract
            .map(|tlab| unsafe { tlab.lock().retire(model) })
            .sum()
    }
}
