//! A minimal host object layout.
//!
//! ```text
//! word 0:      header: size_words:32 | ref_count:16 | flags:16
//! words 1..:   reference slots, one word each (or packed u32 pairs when NARROW)
//! rest:        opaque payload
//! ```
//!
//! Used by the driver binary and by tests to build object graphs. Real hosts
//! plug their own functions into [`ObjectModel`].

use crate::{
    memory::{Address, WORD_SIZE},
    object::{ObjectModel, Slot},
};

pub const FLAG_FILLER: u16 = 1 << 0;
pub const FLAG_NARROW: u16 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SimpleHeader {
    pub size_words: u32,
    pub ref_count: u16,
    pub flags: u16,
}

const _: () = assert!(size_of::<SimpleHeader>() == 8);

pub const MODEL: ObjectModel = ObjectModel {
    size: simple_size,
    trace: simple_trace,
    fill: simple_fill,
};

/// Words needed for an object with `refs` wide reference slots and
/// `payload_words` of opaque data.
pub const fn words_for(refs: usize, payload_words: usize) -> usize {
    1 + refs + payload_words
}

/// Words needed for an object with `refs` narrow reference slots.
pub const fn narrow_words_for(refs: usize, payload_words: usize) -> usize {
    1 + refs.div_ceil(2) + payload_words
}

/// # Safety
/// `obj` must point to an object formatted by this module
#[inline(always)]
pub unsafe fn header(obj: Address) -> SimpleHeader {
    // SAFETY: caller contract
    unsafe { obj.to_ptr::<SimpleHeader>().read() }
}

/// Formats an object with `refs` null wide reference slots.
///
/// # Safety
/// `[obj, obj + size_words)` must be writable heap memory
pub unsafe fn init(obj: Address, size_words: usize, refs: u16) {
    debug_assert!(size_words >= words_for(refs as usize, 0));
    // SAFETY: caller contract
    unsafe { write(obj, size_words, refs, 0) }
}

/// Formats an object with `refs` null narrow reference slots.
///
/// # Safety
/// `[obj, obj + size_words)` must be writable heap memory
pub unsafe fn init_narrow(obj: Address, size_words: usize, refs: u16) {
    debug_assert!(size_words >= narrow_words_for(refs as usize, 0));
    // SAFETY: caller contract
    unsafe { write(obj, size_words, refs, FLAG_NARROW) }
}

unsafe fn write(obj: Address, size_words: usize, refs: u16, flags: u16) {
    let header = SimpleHeader {
        size_words: size_words as u32,
        ref_count: refs,
        flags,
    };
    // SAFETY: caller contract
    unsafe {
        obj.to_mut_ptr::<SimpleHeader>().write(header);
        obj.add_words(1)
            .to_mut_ptr::<usize>()
            .write_bytes(0, size_words - 1);
    }
}

/// # Safety
/// `obj` must be a wide object with more than `index` slots
pub unsafe fn set_ref(obj: Address, index: usize, target: Address) {
    // SAFETY: caller contract
    unsafe {
        debug_assert!(index < header(obj).ref_count as usize);
        obj.add_words(1 + index)
            .to_mut_ptr::<usize>()
            .write(target.as_usize());
    }
}

/// # Safety
/// `obj` must be a wide object with more than `index` slots
pub unsafe fn get_ref(obj: Address, index: usize) -> Address {
    // SAFETY: caller contract
    Address::new(unsafe { obj.add_words(1 + index).to_ptr::<usize>().read() })
}

/// # Safety
/// `obj` must be a narrow object with more than `index` slots
pub unsafe fn set_narrow_ref(obj: Address, index: usize, narrow: u32) {
    // SAFETY: caller contract
    unsafe {
        obj.add_words(1)
            .to_mut_ptr::<u32>()
            .add(index)
            .write(narrow);
    }
}

unsafe fn simple_size(obj: Address) -> usize {
    // SAFETY: forwarded contract
    unsafe { header(obj) }.size_words as usize
}

unsafe fn simple_trace(obj: Address, visitor: &mut dyn FnMut(Slot)) {
    // SAFETY: forwarded contract
    let header = unsafe { header(obj) };
    if header.flags & FLAG_FILLER != 0 {
        return;
    }
    let slots = obj.add_words(1);
    for i in 0..header.ref_count as usize {
        if header.flags & FLAG_NARROW != 0 {
            // SAFETY: slot lies inside the object
            visitor(Slot::Narrow(unsafe { slots.to_mut_ptr::<u32>().add(i) }));
        } else {
            visitor(Slot::Wide(slots.add_bytes(i * WORD_SIZE).to_mut_ptr()));
        }
    }
}

unsafe fn simple_fill(start: Address, words: usize) {
    // SAFETY: forwarded contract
    unsafe { write(start, words, 0, FLAG_FILLER) }
}

/// # Safety
/// `obj` must point to an object formatted by this module
pub unsafe fn is_filler(obj: Address) -> bool {
    // SAFETY: caller contract
    unsafe { header(obj) }.flags & FLAG_FILLER != 0
}
