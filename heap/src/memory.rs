//! Address arithmetic and the reserved/committed address ranges backing the
//! heap and its side bitmaps.

use std::{fmt, mem, ptr::NonNull};

use crate::{HeapError, system};

/// Size of a heap word in bytes.
pub const WORD_SIZE: usize = mem::size_of::<usize>();
pub const LOG_WORD_SIZE: u32 = WORD_SIZE.trailing_zeros();

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// A raw machine address. Heap addresses are always word aligned.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline(always)]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub const fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn add_words(self, words: usize) -> Self {
        Self(self.0 + words * WORD_SIZE)
    }

    #[inline(always)]
    pub const fn add_bytes(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Distance in words from `base` up to `self`.
    #[inline(always)]
    pub fn words_since(self, base: Address) -> usize {
        debug_assert!(self >= base);
        (self.0 - base.0) >> LOG_WORD_SIZE
    }

    #[inline(always)]
    pub const fn is_aligned(self, bytes: usize) -> bool {
        self.0 & (bytes - 1) == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open word range `[start, end)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemRegion {
    start: Address,
    end: Address,
}

impl MemRegion {
    pub const fn new(start: Address, words: usize) -> Self {
        Self {
            start,
            end: start.add_words(words),
        }
    }

    pub fn from_bounds(start: Address, end: Address) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    #[inline(always)]
    pub const fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub const fn end(&self) -> Address {
        self.end
    }

    pub fn word_size(&self) -> usize {
        self.end.words_since(self.start)
    }

    pub fn byte_size(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// An exclusively owned reservation of address space. Released on drop.
#[derive(Debug)]
pub struct ReservedSpace {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the reservation is plain address space, ownership is unique
unsafe impl Send for ReservedSpace {}
// SAFETY: the handle itself is immutable after creation
unsafe impl Sync for ReservedSpace {}

impl ReservedSpace {
    /// Reserves `size` bytes, rounded up to the allocation granularity.
    pub fn reserve(size: usize) -> Result<Self, HeapError> {
        let size = align_up(size.max(1), system::allocation_granularity());
        let base = system::reserve_memory(size)
            .map_err(|source| HeapError::Reserve { size, source })?;
        Ok(Self { base, size })
    }

    pub fn base(&self) -> Address {
        Address::from_ptr(self.base.as_ptr())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn region(&self) -> MemRegion {
        MemRegion::new(self.base(), self.size / WORD_SIZE)
    }

    /// Commits `[base, base + bytes)`.
    pub fn commit(&self, bytes: usize) -> std::io::Result<()> {
        debug_assert!(bytes <= self.size);
        system::commit_memory(self.base, bytes)
    }

    /// Gives back the backing pages of `[base, base + bytes)`.
    pub fn uncommit(&self, bytes: usize) -> std::io::Result<()> {
        debug_assert!(bytes <= self.size);
        system::uncommit_memory(self.base, bytes)
    }
}

impl Drop for ReservedSpace {
    fn drop(&mut self) {
        system::release_memory(self.base, self.size);
    }
}

/// A reservation with a committed prefix `[low, high)`.
#[derive(Debug)]
pub struct VirtualSpace {
    reserved: ReservedSpace,
    committed: usize,
}

impl VirtualSpace {
    /// Takes ownership of `reserved` and commits its first `committed` bytes.
    pub fn new(reserved: ReservedSpace, committed: usize) -> Result<Self, HeapError> {
        let mut space = Self {
            reserved,
            committed: 0,
        };
        space.expand_by(committed)?;
        Ok(space)
    }

    pub fn expand_by(&mut self, bytes: usize) -> Result<(), HeapError> {
        if bytes == 0 {
            return Ok(());
        }
        let new_committed = self.committed + bytes;
        if new_committed > self.reserved.size() {
            return Err(HeapError::InvalidSettings(
                "commit request exceeds reserved space",
            ));
        }
        // only the new tail is mapped, already committed pages keep their contents
        let start = self.reserved.base().add_bytes(self.committed);
        // SAFETY: start lies inside the reservation, which is non null
        let start_ptr = unsafe { NonNull::new_unchecked(start.to_mut_ptr::<u8>()) };
        system::commit_memory(start_ptr, bytes).map_err(|source| HeapError::Commit {
            what: "heap",
            size: bytes,
            source,
        })?;
        self.committed = new_committed;
        Ok(())
    }

    pub fn low(&self) -> Address {
        self.reserved.base()
    }

    pub fn high(&self) -> Address {
        self.reserved.base().add_bytes(self.committed)
    }

    pub fn reserved_size(&self) -> usize {
        self.reserved.size()
    }

    pub fn committed_size(&self) -> usize {
        self.committed
    }

    pub fn committed_region(&self) -> MemRegion {
        MemRegion::from_bounds(self.low(), self.high())
    }
}
