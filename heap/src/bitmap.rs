//! Side bitmaps over the heap.
//!
//! One bit per granule of the covered region. The liveness bitmap and the
//! free-chunk bitmap are both [`MarkBitmap`]s; they differ only in how
//! their backing memory is managed (see [`BitmapStorage`]).
//!
//! Bit `i` of the map describes the granule starting at
//! `covered.start + i * granule_bytes`.

use std::{
    io,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    HeapError,
    memory::{Address, MemRegion, ReservedSpace, WORD_SIZE, align_up},
    system,
};

const BITS_PER_WORD: usize = usize::BITS as usize;
const LOG_BITS_PER_WORD: u32 = usize::BITS.trailing_zeros();
const BIT_MASK: usize = BITS_PER_WORD - 1;

#[derive(Debug)]
pub struct MarkBitmap {
    covered: MemRegion,
    map: *const AtomicUsize,
    map_words: usize,
    /// log2 of bytes covered by one bit
    shift: u32,
}

// SAFETY: all accesses to the map go through atomics
unsafe impl Send for MarkBitmap {}
// SAFETY: all accesses to the map go through atomics
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    /// Bytes of backing memory needed to cover `heap_bytes` at one bit per
    /// `granule_bytes`, rounded up to whole pages.
    pub fn compute_size(heap_bytes: usize, granule_bytes: usize) -> usize {
        debug_assert!(granule_bytes.is_power_of_two());
        let bits = heap_bytes.div_ceil(granule_bytes);
        let words = bits.div_ceil(BITS_PER_WORD);
        align_up(words * WORD_SIZE, system::page_size())
    }

    /// Binds the bitmap to the `covered` heap range and the `storage` range
    /// holding the bits.
    ///
    /// # Safety
    /// `storage` must stay mapped for the lifetime of the bitmap and be
    /// readable and writable whenever the bitmap is used.
    pub unsafe fn new(covered: MemRegion, storage: MemRegion, granule_bytes: usize) -> Self {
        assert!(granule_bytes.is_power_of_two() && granule_bytes >= WORD_SIZE);
        let shift = granule_bytes.trailing_zeros();
        let bits = covered.byte_size() >> shift;
        let map_words = bits.div_ceil(BITS_PER_WORD);
        assert!(
            storage.byte_size() >= map_words * WORD_SIZE,
            "bitmap storage too small for covered region"
        );
        debug_assert!(covered.start().is_aligned(granule_bytes));

        Self {
            covered,
            map: storage.start().to_ptr::<AtomicUsize>(),
            map_words,
            shift,
        }
    }

    pub fn covered(&self) -> MemRegion {
        self.covered
    }

    pub fn granule_bytes(&self) -> usize {
        1 << self.shift
    }

    #[inline(always)]
    fn bit_for(&self, addr: Address) -> usize {
        debug_assert!(
            addr >= self.covered.start() && addr <= self.covered.end(),
            "address {addr} outside covered region"
        );
        (addr.as_usize() - self.covered.start().as_usize()) >> self.shift
    }

    #[inline(always)]
    fn addr_for(&self, bit: usize) -> Address {
        self.covered.start().add_bytes(bit << self.shift)
    }

    #[inline(always)]
    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.map_words);
        // SAFETY: index is within the map, storage outlives self
        unsafe { &*self.map.add(index) }
    }

    #[inline]
    pub fn mark(&self, addr: Address) {
        let bit = self.bit_for(addr);
        self.word(bit >> LOG_BITS_PER_WORD)
            .fetch_or(1 << (bit & BIT_MASK), Ordering::Relaxed);
    }

    #[inline]
    pub fn clear(&self, addr: Address) {
        let bit = self.bit_for(addr);
        self.word(bit >> LOG_BITS_PER_WORD)
            .fetch_and(!(1 << (bit & BIT_MASK)), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        let bit = self.bit_for(addr);
        self.word(bit >> LOG_BITS_PER_WORD).load(Ordering::Relaxed) & (1 << (bit & BIT_MASK))
            != 0
    }

    /// Sets every bit for granules in `[start, end)`.
    pub fn mark_range(&self, start: Address, end: Address) {
        self.apply_range(self.bit_for(start), self.bit_for(end), true);
    }

    /// Clears every bit for granules in `[start, end)`.
    pub fn clear_range(&self, start: Address, end: Address) {
        self.apply_range(self.bit_for(start), self.bit_for(end), false);
    }

    fn apply_range(&self, beg: usize, end: usize, set: bool) {
        if beg >= end {
            return;
        }
        let first = beg >> LOG_BITS_PER_WORD;
        let last = (end - 1) >> LOG_BITS_PER_WORD;
        for index in first..=last {
            let lo = if index == first { beg & BIT_MASK } else { 0 };
            let hi = if index == last {
                ((end - 1) & BIT_MASK) + 1
            } else {
                BITS_PER_WORD
            };
            let mask = if hi - lo == BITS_PER_WORD {
                usize::MAX
            } else {
                ((1usize << (hi - lo)) - 1) << lo
            };
            if set {
                self.word(index).fetch_or(mask, Ordering::Relaxed);
            } else {
                self.word(index).fetch_and(!mask, Ordering::Relaxed);
            }
        }
    }

    /// First address in `[from, limit)` whose bit is set, or `limit`.
    pub fn next_marked(&self, from: Address, limit: Address) -> Address {
        let bit = self.find_bit(self.bit_for(from), self.bit_for(limit), true);
        self.addr_for(bit)
    }

    /// First address in `[from, limit)` whose bit is clear, or `limit`.
    pub fn next_clear(&self, from: Address, limit: Address) -> Address {
        let bit = self.find_bit(self.bit_for(from), self.bit_for(limit), false);
        self.addr_for(bit)
    }

    fn find_bit(&self, beg: usize, end: usize, want_set: bool) -> usize {
        if beg >= end {
            return end;
        }
        let mut index = beg >> LOG_BITS_PER_WORD;
        let last = (end - 1) >> LOG_BITS_PER_WORD;
        let mut low_mask = !0usize << (beg & BIT_MASK);
        while index <= last {
            let mut word = self.word(index).load(Ordering::Relaxed);
            if !want_set {
                word = !word;
            }
            word &= low_mask;
            if word != 0 {
                let bit = (index << LOG_BITS_PER_WORD) + word.trailing_zeros() as usize;
                return bit.min(end);
            }
            low_mask = !0;
            index += 1;
        }
        end
    }

    /// Number of set bits for granules in `[start, end)`.
    pub fn count_marked(&self, start: Address, end: Address) -> usize {
        let mut count = 0;
        let mut cur = self.next_marked(start, end);
        while cur < end {
            count += 1;
            cur = self.next_marked(cur.add_bytes(self.granule_bytes()), end);
        }
        count
    }
}

/// Separately reserved backing memory for a [`MarkBitmap`].
///
/// The liveness bitmap commits its storage at the start of each collection
/// and uncommits it at the end, so every cycle begins from an all-zero map.
/// The free-chunk bitmap commits once and keeps it.
#[derive(Debug)]
pub struct BitmapStorage {
    space: ReservedSpace,
    bytes: usize,
    committed: AtomicBool,
    what: &'static str,
    #[cfg(test)]
    fail_commit: AtomicBool,
    #[cfg(test)]
    fail_uncommit: AtomicBool,
}

impl BitmapStorage {
    pub fn reserve(bytes: usize, what: &'static str) -> Result<Self, HeapError> {
        let space = ReservedSpace::reserve(bytes)?;
        Ok(Self {
            bytes: space.size(),
            space,
            committed: AtomicBool::new(false),
            what,
            #[cfg(test)]
            fail_commit: AtomicBool::new(false),
            #[cfg(test)]
            fail_uncommit: AtomicBool::new(false),
        })
    }

    pub fn region(&self) -> MemRegion {
        MemRegion::new(self.space.base(), self.bytes / WORD_SIZE)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn commit(&self) -> Result<(), HeapError> {
        #[cfg(test)]
        if self.fail_commit.swap(false, Ordering::AcqRel) {
            return Err(HeapError::Commit {
                what: self.what,
                size: self.bytes,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        self.space
            .commit(self.bytes)
            .map_err(|source| HeapError::Commit {
                what: self.what,
                size: self.bytes,
                source,
            })?;
        self.committed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn uncommit(&self) -> io::Result<()> {
        self.committed.store(false, Ordering::Release);
        #[cfg(test)]
        if self.fail_uncommit.swap(false, Ordering::AcqRel) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.space.uncommit(self.bytes)
    }

    /// Makes the next [`BitmapStorage::commit`] fail with `ENOMEM`.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::Release);
    }

    /// Makes the next [`BitmapStorage::uncommit`] fail with `EINVAL`.
    #[cfg(test)]
    pub(crate) fn fail_next_uncommit(&self) {
        self.fail_uncommit.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRANULE: usize = 16;

    struct TestMap {
        _words: Vec<usize>,
        bitmap: MarkBitmap,
    }

    fn test_map(heap_words: usize) -> TestMap {
        let covered = MemRegion::new(Address::new(0x10_0000), heap_words);
        let map_words = (heap_words * WORD_SIZE / GRANULE).div_ceil(BITS_PER_WORD);
        let mut words = vec![0usize; map_words.max(1)];
        let storage = MemRegion::new(Address::from_ptr(words.as_mut_ptr()), words.len());
        // SAFETY: words outlives bitmap inside TestMap
        let bitmap = unsafe { MarkBitmap::new(covered, storage, GRANULE) };
        TestMap {
            _words: words,
            bitmap,
        }
    }

    fn slot(bitmap: &MarkBitmap, index: usize) -> Address {
        bitmap.covered().start().add_bytes(index * GRANULE)
    }

    #[test]
    fn mark_and_test() {
        let t = test_map(1024);
        let a = slot(&t.bitmap, 3);
        let b = slot(&t.bitmap, 64);

        assert!(!t.bitmap.is_marked(a));
        t.bitmap.mark(a);
        t.bitmap.mark(a);
        assert!(t.bitmap.is_marked(a));
        assert!(!t.bitmap.is_marked(b));

        t.bitmap.mark(b);
        assert!(t.bitmap.is_marked(b));

        t.bitmap.clear(a);
        assert!(!t.bitmap.is_marked(a));
    }

    #[test]
    fn range_operations_cross_word_boundaries() {
        let t = test_map(4096);
        let start = slot(&t.bitmap, 60);
        let end = slot(&t.bitmap, 200);

        t.bitmap.mark_range(start, end);
        assert!(!t.bitmap.is_marked(slot(&t.bitmap, 59)));
        assert!(t.bitmap.is_marked(slot(&t.bitmap, 60)));
        assert!(t.bitmap.is_marked(slot(&t.bitmap, 128)));
        assert!(t.bitmap.is_marked(slot(&t.bitmap, 199)));
        assert!(!t.bitmap.is_marked(slot(&t.bitmap, 200)));
        assert_eq!(t.bitmap.count_marked(t.bitmap.covered().start(), t.bitmap.covered().end()), 140);

        t.bitmap.clear_range(slot(&t.bitmap, 64), slot(&t.bitmap, 192));
        assert_eq!(t.bitmap.count_marked(t.bitmap.covered().start(), t.bitmap.covered().end()), 12);
    }

    #[test]
    fn searches_stop_at_limit() {
        let t = test_map(4096);
        let end = t.bitmap.covered().end();
        let first = slot(&t.bitmap, 0);

        assert_eq!(t.bitmap.next_marked(first, end), end);
        assert_eq!(t.bitmap.next_clear(first, end), first);

        t.bitmap.mark_range(slot(&t.bitmap, 10), slot(&t.bitmap, 70));
        assert_eq!(t.bitmap.next_marked(first, end), slot(&t.bitmap, 10));
        assert_eq!(t.bitmap.next_clear(slot(&t.bitmap, 10), end), slot(&t.bitmap, 70));
        assert_eq!(
            t.bitmap.next_clear(slot(&t.bitmap, 10), slot(&t.bitmap, 40)),
            slot(&t.bitmap, 40)
        );
    }

    #[test]
    fn whole_map_run() {
        let t = test_map(4096);
        let covered = t.bitmap.covered();
        t.bitmap.mark_range(covered.start(), covered.end());
        assert_eq!(t.bitmap.next_clear(covered.start(), covered.end()), covered.end());
    }

    #[test]
    fn compute_size_rounds_to_pages() {
        let size = MarkBitmap::compute_size(1024 * 1024, GRANULE);
        assert!(size >= 1024 * 1024 / GRANULE / 8);
        assert_eq!(size % system::page_size(), 0);
    }

    #[test]
    fn storage_commit_cycle_clears_bits() {
        let covered = MemRegion::new(Address::new(0x40_0000), 64 * 1024);
        let bytes = MarkBitmap::compute_size(covered.byte_size(), GRANULE);
        let storage = BitmapStorage::reserve(bytes, "test bitmap").expect("reserve");
        storage.commit().expect("commit");
        assert!(storage.is_committed());

        // SAFETY: storage outlives bitmap in this test
        let bitmap = unsafe { MarkBitmap::new(covered, storage.region(), GRANULE) };
        bitmap.mark(covered.start());
        assert!(bitmap.is_marked(covered.start()));

        storage.uncommit().expect("uncommit");
        assert!(!storage.is_committed());
        storage.commit().expect("recommit");
        assert!(!bitmap.is_marked(covered.start()));
    }

    #[test]
    fn injected_commit_failure_is_reported_once() {
        let storage = BitmapStorage::reserve(system::page_size(), "test bitmap").expect("reserve");
        storage.fail_next_commit();
        let err = storage.commit().expect_err("commit fails");
        assert!(matches!(err, HeapError::Commit { what: "test bitmap", .. }));
        assert!(!storage.is_committed());

        storage.commit().expect("second commit");
        assert!(storage.is_committed());

        storage.fail_next_uncommit();
        assert!(storage.uncommit().is_err());
        assert!(!storage.is_committed());
        storage.uncommit().expect("second uncommit");
    }
}
