//! Free-list heap space.
//!
//! Every allocation is carved from a list of variable sized free chunks.
//! The list lives in an index arena, nodes link by index and are kept in
//! ascending address order, so first-fit allocation packs the low end of the
//! heap first.
//!
//! Chunk sizes are always whole granules (see
//! [`FreeListSpace::adjust_chunk_size`]), which makes every split remainder a
//! valid chunk and lets the heap be walked object by object: the free-chunk
//! bitmap tells free runs apart from objects, and objects are stepped over by
//! their adjusted size.

use log::trace;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    HeapError,
    bitmap::{BitmapStorage, MarkBitmap},
    memory::{Address, MemRegion, WORD_SIZE, align_up},
    object::ObjectModel,
};

pub const NO_NODE: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
pub struct FreeNode {
    pub start: Address,
    pub words: usize,
    next: usize,
}

impl FreeNode {
    pub fn end(&self) -> Address {
        self.start.add_words(self.words)
    }
}

/// Address ordered singly linked list of free chunks, stored in an arena.
#[derive(Debug)]
pub struct FreeList {
    nodes: Vec<FreeNode>,
    /// Arena slots released by consumed nodes.
    vacant: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
    free_words: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            head: NO_NODE,
            tail: NO_NODE,
            len: 0,
            free_words: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free_words(&self) -> usize {
        self.free_words
    }

    /// Appends a chunk after the current tail. Chunks must be appended in
    /// ascending address order and must not overlap.
    pub fn append(&mut self, start: Address, words: usize) -> usize {
        debug_assert!(words > 0);
        debug_assert!(
            self.tail == NO_NODE || self.nodes[self.tail].end() <= start,
            "free list append out of address order"
        );
        let node = FreeNode {
            start,
            words,
            next: NO_NODE,
        };
        let index = match self.vacant.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        if self.tail == NO_NODE {
            self.head = index;
        } else {
            self.nodes[self.tail].next = index;
        }
        self.tail = index;
        self.len += 1;
        self.free_words += words;
        index
    }

    /// Drops every node. Arena storage is kept for the rebuild.
    pub fn clear(&mut self) {
        self.vacant.clear();
        self.vacant.extend((0..self.nodes.len()).rev());
        self.head = NO_NODE;
        self.tail = NO_NODE;
        self.len = 0;
        self.free_words = 0;
    }

    pub fn iter(&self) -> FreeListIter<'_> {
        FreeListIter {
            list: self,
            cursor: self.head,
        }
    }

    /// First-fit: carves `words` from the low end of the first chunk large
    /// enough, unlinking the chunk if it is consumed whole.
    pub fn take(&mut self, words: usize) -> Option<Address> {
        let mut prev = NO_NODE;
        let mut cursor = self.head;
        while cursor != NO_NODE {
            let node = self.nodes[cursor];
            if node.words >= words {
                let start = node.start;
                if node.words == words {
                    self.unlink(prev, cursor);
                } else {
                    let node = &mut self.nodes[cursor];
                    node.start = start.add_words(words);
                    node.words -= words;
                }
                self.free_words -= words;
                return Some(start);
            }
            prev = cursor;
            cursor = node.next;
        }
        None
    }

    fn unlink(&mut self, prev: usize, index: usize) {
        let next = self.nodes[index].next;
        if prev == NO_NODE {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if self.tail == index {
            self.tail = prev;
        }
        self.vacant.push(index);
        self.len -= 1;
    }
}

pub struct FreeListIter<'a> {
    list: &'a FreeList,
    cursor: usize,
}

impl<'a> Iterator for FreeListIter<'a> {
    type Item = &'a FreeNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NO_NODE {
            return None;
        }
        let node = &self.list.nodes[self.cursor];
        self.cursor = node.next;
        Some(node)
    }
}

/// One step of a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Object { start: Address, words: usize },
    Free { start: Address, words: usize },
}

impl Extent {
    pub fn words(&self) -> usize {
        match *self {
            Extent::Object { words, .. } | Extent::Free { words, .. } => words,
        }
    }
}

/// The heap's allocation space: the committed region, its free list and the
/// free-chunk bitmap marking every granule currently owned by the list.
#[derive(Debug)]
pub struct FreeListSpace {
    region: MemRegion,
    granule_words: usize,
    model: ObjectModel,
    free_chunks: MarkBitmap,
    list: Mutex<FreeList>,
    _free_chunk_storage: BitmapStorage,
}

impl FreeListSpace {
    /// Creates the space over `region` with the whole region as a single free
    /// chunk.
    pub fn new(
        region: MemRegion,
        granule_words: usize,
        model: ObjectModel,
    ) -> Result<Self, HeapError> {
        let granule_bytes = granule_words * WORD_SIZE;
        debug_assert!(region.start().is_aligned(granule_bytes));
        debug_assert_eq!(region.word_size() % granule_words, 0);

        let storage = BitmapStorage::reserve(
            MarkBitmap::compute_size(region.byte_size(), granule_bytes),
            "free chunk bitmap",
        )?;
        storage.commit()?;
        // SAFETY: storage is committed for good and owned by the space
        let free_chunks = unsafe { MarkBitmap::new(region, storage.region(), granule_bytes) };

        let mut list = FreeList::new();
        if !region.is_empty() {
            list.append(region.start(), region.word_size());
            free_chunks.mark_range(region.start(), region.end());
        }

        Ok(Self {
            region,
            granule_words,
            model,
            free_chunks,
            list: Mutex::new(list),
            _free_chunk_storage: storage,
        })
    }

    /// Rounds a size in words up to a whole number of granules, never less
    /// than one granule.
    #[inline(always)]
    pub fn adjust_chunk_size(&self, words: usize) -> usize {
        align_up(words.max(1), self.granule_words)
    }

    /// Whether a request of `words` could ever be satisfied. Larger requests
    /// must be rejected before [`FreeListSpace::adjust_chunk_size`], which
    /// would overflow on them.
    #[inline(always)]
    pub fn can_fit(&self, words: usize) -> bool {
        words <= self.region.word_size()
    }

    /// Carves a chunk of at least `words` words. The returned range is
    /// removed from the free list and the free-chunk bitmap before the
    /// allocation lock is released.
    pub fn allocate(&self, words: usize) -> Option<Address> {
        if !self.can_fit(words) {
            return None;
        }
        let words = self.adjust_chunk_size(words);
        let mut list = self.list.lock();
        let start = list.take(words)?;
        self.free_chunks.clear_range(start, start.add_words(words));
        trace!("free list: carved {} words at {}", words, start);
        Some(start)
    }

    pub fn free_words(&self) -> usize {
        self.list.lock().free_words()
    }

    pub fn used_words(&self) -> usize {
        self.region.word_size() - self.free_words()
    }

    pub fn is_in(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    pub fn is_free_chunk(&self, addr: Address) -> bool {
        self.free_chunks.is_marked(addr)
    }

    /// Locks the free list. Used by sweep to rebuild it in place.
    pub fn lock(&self) -> MutexGuard<'_, FreeList> {
        self.list.lock()
    }

    /// Appends a reclaimed chunk to a locked list and records it in the
    /// free-chunk bitmap.
    pub fn add_chunk(&self, list: &mut FreeList, start: Address, words: usize) {
        debug_assert_eq!(words % self.granule_words, 0);
        list.append(start, words);
        self.free_chunks.mark_range(start, start.add_words(words));
    }

    /// Walks the committed region once in address order, reporting every
    /// object and every free run.
    ///
    /// # Safety
    /// the heap must be parsable: no allocation may be in flight and every
    /// allocated range must start with an initialized object.
    pub unsafe fn walk(&self, mut visit: impl FnMut(Extent)) {
        let end = self.region.end();
        let mut cur = self.region.start();
        while cur < end {
            if self.free_chunks.is_marked(cur) {
                let next = self.free_chunks.next_clear(cur, end);
                visit(Extent::Free {
                    start: cur,
                    words: next.words_since(cur),
                });
                cur = next;
            } else {
                // SAFETY: heap is parsable by contract
                let size = unsafe { self.model.size_of(cur) };
                assert!(
                    size <= end.words_since(cur),
                    "object at {cur} of {size} words runs past the heap end"
                );
                let words = self.adjust_chunk_size(size);
                visit(Extent::Object { start: cur, words });
                cur = cur.add_words(words);
            }
        }
        debug_assert_eq!(cur, end);
    }

    /// Visits every object (free chunks are skipped) in address order.
    ///
    /// # Safety
    /// see [`FreeListSpace::walk`]
    pub unsafe fn object_iterate(&self, mut visit: impl FnMut(Address)) {
        // SAFETY: forwarded contract
        unsafe {
            self.walk(|extent| {
                if let Extent::Object { start, .. } = extent {
                    visit(start);
                }
            })
        }
    }
}
