//! Contract with the host object model.
//!
//! The collector never interprets object contents itself. The host supplies
//! three functions through [`ObjectModel`]: how large an object is, which
//! reference slots it holds, and how to format a dead filler object over a
//! range of words.

use crate::memory::Address;

/// A location holding a reference to a heap object.
///
/// `Narrow` slots hold compressed references which must be decoded with the
/// heap's [`NarrowEncoding`] before use. A zero value in either kind of slot
/// is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Wide(*mut usize),
    Narrow(*mut u32),
}

impl Slot {
    /// Reads the referenced address, decoding narrow slots.
    ///
    /// # Safety
    /// the slot pointer must be valid for reads
    #[inline]
    pub unsafe fn load(self, encoding: NarrowEncoding) -> Address {
        match self {
            // SAFETY: caller guarantees the slot is readable
            Slot::Wide(ptr) => Address::new(unsafe { ptr.read() }),
            // SAFETY: caller guarantees the slot is readable
            Slot::Narrow(ptr) => encoding.decode(unsafe { ptr.read() }),
        }
    }
}

/// Compressed reference scheme: `base + (narrow << shift)`, zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NarrowEncoding {
    pub base: Address,
    pub shift: u32,
}

impl NarrowEncoding {
    #[inline(always)]
    pub fn decode(self, narrow: u32) -> Address {
        if narrow == 0 {
            return Address::NULL;
        }
        self.base.add_bytes((narrow as usize) << self.shift)
    }

    /// Encodes a heap address. The base itself cannot be encoded since it
    /// would collide with null.
    #[inline(always)]
    pub fn encode(self, addr: Address) -> u32 {
        if addr.is_null() {
            return 0;
        }
        debug_assert!(addr > self.base, "cannot encode heap base");
        let offset = (addr.as_usize() - self.base.as_usize()) >> self.shift;
        debug_assert!(offset <= u32::MAX as usize, "address out of narrow range");
        offset as u32
    }
}

/// Size of the object starting at `obj`, in words.
///
/// # Safety
/// `obj` must point to a fully initialized heap object.
pub type SizeFn = unsafe fn(obj: Address) -> usize;

/// Calls `visitor` once for every reference slot of the object at `obj`.
///
/// # Safety
/// `obj` must point to a fully initialized heap object.
pub type TraceFn = unsafe fn(obj: Address, visitor: &mut dyn FnMut(Slot));

/// Formats `[start, start + words)` as one dead object that reports exactly
/// `words` as its size and holds no references.
///
/// # Safety
/// the range must be writable heap memory of at least one granule.
pub type FillFn = unsafe fn(start: Address, words: usize);

#[derive(Debug, Clone, Copy)]
pub struct ObjectModel {
    pub size: SizeFn,
    pub trace: TraceFn,
    pub fill: FillFn,
}

impl ObjectModel {
    /// # Safety
    /// see [`SizeFn`]
    #[inline(always)]
    pub unsafe fn size_of(&self, obj: Address) -> usize {
        // SAFETY: forwarded contract
        unsafe { (self.size)(obj) }
    }

    /// # Safety
    /// see [`TraceFn`]
    #[inline(always)]
    pub unsafe fn trace(&self, obj: Address, visitor: &mut dyn FnMut(Slot)) {
        // SAFETY: forwarded contract
        unsafe { (self.trace)(obj, visitor) }
    }

    /// # Safety
    /// see [`FillFn`]
    #[inline(always)]
    pub unsafe fn fill(&self, start: Address, words: usize) {
        // SAFETY: forwarded contract
        unsafe { (self.fill)(start, words) }
    }
}
