//! Marking.
//!
//! Depth-first transitive closure over the object graph using an explicit
//! stack. An object's bit is set before it is pushed, so each object enters
//! the stack at most once and cycles terminate.

use log::trace;

use crate::{
    bitmap::MarkBitmap,
    memory::Address,
    object::{NarrowEncoding, ObjectModel, Slot},
    roots::RootEnumerator,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    pub marked_objects: usize,
    pub max_stack_depth: usize,
}

pub struct Marker<'a> {
    bitmap: &'a MarkBitmap,
    model: &'a ObjectModel,
    encoding: NarrowEncoding,
    stack: Vec<Address>,
    stats: MarkStats,
}

impl<'a> Marker<'a> {
    pub fn new(bitmap: &'a MarkBitmap, model: &'a ObjectModel, encoding: NarrowEncoding) -> Self {
        Self {
            bitmap,
            model,
            encoding,
            stack: Vec::with_capacity(256),
            stats: MarkStats::default(),
        }
    }

    /// Loads a slot and marks and pushes the referenced object if this is
    /// its first discovery.
    #[inline(always)]
    fn discover(&mut self, slot: Slot) {
        // SAFETY: slots come from root providers or from live objects being
        // traced, both readable for the duration of the call
        let obj = unsafe { slot.load(self.encoding) };
        if obj.is_null() {
            return;
        }
        debug_assert!(
            self.bitmap.covered().contains(obj),
            "reference {obj} points outside the heap"
        );
        if !self.bitmap.is_marked(obj) {
            self.bitmap.mark(obj);
            self.stack.push(obj);
            self.stats.marked_objects += 1;
            self.stats.max_stack_depth = self.stats.max_stack_depth.max(self.stack.len());
        }
    }

    /// Marks everything reachable from an explicit set of roots.
    ///
    /// # Safety
    /// every slot must hold null or the address of a parsable heap object,
    /// and the graph must not change until marking returns.
    pub unsafe fn mark_from(mut self, roots: impl IntoIterator<Item = Slot>) -> MarkStats {
        for slot in roots {
            self.discover(slot);
        }
        // SAFETY: forwarded contract
        unsafe { self.drain() }
    }

    /// Marks everything reachable from the registered roots and the parked
    /// mutators' root snapshots.
    ///
    /// # Safety
    /// must run with all mutators stopped; see [`Marker::mark_from`].
    pub unsafe fn mark_roots(mut self, roots: &RootEnumerator, thread_roots: &mut [usize]) -> MarkStats {
        roots.enumerate(thread_roots, &mut |slot| self.discover(slot));
        trace!("mark: {} objects discovered from roots", self.stack.len());
        // SAFETY: forwarded contract
        unsafe { self.drain() }
    }

    unsafe fn drain(mut self) -> MarkStats {
        let model = self.model;
        while let Some(obj) = self.stack.pop() {
            // SAFETY: only marked heap objects are pushed
            unsafe { model.trace(obj, &mut |slot| self.discover(slot)) };
        }
        self.stats
    }
}
