//! Sweeping.
//!
//! Rebuilds the free list from scratch in one address-ordered walk. Unmarked
//! objects and existing free chunks that touch are merged into a single
//! chunk, so the list after a sweep holds exactly the maximal free runs of
//! the heap.

use crate::{
    bitmap::MarkBitmap,
    free_list::{Extent, FreeListSpace},
    memory::Address,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub live_objects: usize,
    pub live_words: usize,
    pub dead_objects: usize,
    /// Words of objects that died this cycle.
    pub reclaimed_words: usize,
    /// Words on the free list after the rebuild.
    pub free_words: usize,
    pub free_chunks: usize,
}

/// Sweeps `space` against the liveness bitmap `live`.
///
/// # Safety
/// must run with all mutators stopped and after marking completed against
/// `live`; the heap must be parsable.
pub unsafe fn sweep(space: &FreeListSpace, live: &MarkBitmap) -> SweepStats {
    let mut list = space.lock();
    list.clear();

    let mut stats = SweepStats::default();
    let mut run: Option<(Address, usize)> = None;
    // SAFETY: caller contract
    unsafe {
        space.walk(|extent| match extent {
            Extent::Object { start, words } if live.is_marked(start) => {
                if let Some((chunk, len)) = run.take() {
                    space.add_chunk(&mut list, chunk, len);
                }
                stats.live_objects += 1;
                stats.live_words += words;
            }
            Extent::Object { start, words } => {
                extend(&mut run, start, words);
                stats.dead_objects += 1;
                stats.reclaimed_words += words;
            }
            Extent::Free { start, words } => extend(&mut run, start, words),
        });
    }
    if let Some((chunk, len)) = run {
        space.add_chunk(&mut list, chunk, len);
    }

    stats.free_words = list.free_words();
    stats.free_chunks = list.len();
    stats
}

fn extend(run: &mut Option<(Address, usize)>, start: Address, words: usize) {
    match run {
        Some((_, len)) => *len += words,
        None => *run = Some((start, words)),
    }
}
