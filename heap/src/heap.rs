//! Mark-sweep heap.
//!
//! A single contiguous heap served by a free list. Collection stops the
//! world, marks from the roots into a liveness bitmap that only exists for
//! the duration of the cycle, and rebuilds the free list by sweeping.
//! Objects never move.
//!
//! This crate is decoupled from any specific VM. Consumers provide:
//! - An [`ObjectModel`] to size, trace and fill heap objects.
//! - [`RootProvider`]s to supply live roots at GC time, either registered
//!   with [`MSweepHeap::roots`] or passed to each [`Mutator`] call.

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::{
    HeapError,
    bitmap::{BitmapStorage, MarkBitmap},
    free_list::FreeListSpace,
    mark::Marker,
    memory::{Address, ReservedSpace, VirtualSpace, WORD_SIZE, align_up},
    object::{NarrowEncoding, ObjectModel},
    roots::{RootEnumerator, RootProvider},
    safepoint::{Requester, Safepoint},
    sweep,
    system,
    tlab::{Tlab, TlabHandle, TlabRegistry},
};

pub const NAME: &str = "MSweep";

/// A TLAB is retired rather than bypassed once its free space drops to
/// this fraction of its size.
const TLAB_REFILL_WASTE_FRACTION: usize = 64;

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the mark-sweep heap. All sizes are in bytes.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Reported at startup. The whole `max_heap_size` is committed up front.
    pub initial_heap_size: usize,
    /// Size of the heap reservation.
    pub max_heap_size: usize,
    /// Smallest TLAB handed to a mutator.
    pub min_tlab_size: usize,
    /// Largest TLAB handed to a mutator. Raised to `min_tlab_size` if smaller.
    pub max_tlab_size: usize,
    /// TLAB size mutators ask for.
    pub tlab_size: usize,
    /// Object alignment, minimum chunk size and bitmap granularity, in words.
    pub granule_words: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_heap_size: 64 * 1024 * 1024, // 64 MB
            max_heap_size: 256 * 1024 * 1024,    // 256 MB
            min_tlab_size: 2 * 1024,             // 2 KB
            max_tlab_size: 4 * 1024 * 1024,      // 4 MB
            tlab_size: 64 * 1024,                // 64 KB
            granule_words: 2,                    // 16 bytes on 64 bit
        }
    }
}

impl HeapSettings {
    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.max_heap_size == 0 || self.min_tlab_size == 0 || self.tlab_size == 0 {
            return Err("Sizes must be > 0");
        }
        if !self.granule_words.is_power_of_two() {
            return Err("granule_words must be a power of two");
        }
        // the heap base is only page aligned
        if self.granule_bytes() > system::page_size() {
            return Err("granule_words must not exceed a page");
        }
        if self.initial_heap_size > self.max_heap_size {
            return Err("initial_heap_size must not exceed max_heap_size");
        }
        if self.max_heap_size < self.granule_bytes() {
            return Err("max_heap_size must hold at least one granule");
        }
        // narrow references index granules with 32 bits, offset by one
        if self.max_heap_size / self.granule_bytes() >= u32::MAX as usize {
            return Err("max_heap_size too large for narrow references");
        }
        Ok(())
    }

    pub fn granule_bytes(&self) -> usize {
        self.granule_words * WORD_SIZE
    }

    /// Applies platform alignment and TLAB bound adjustments.
    fn apply_ergonomics(mut self) -> Self {
        let align = system::allocation_granularity().max(system::page_size());
        self.initial_heap_size = align_up(self.initial_heap_size, align);
        self.max_heap_size = align_up(self.max_heap_size, align);

        if self.max_tlab_size < self.min_tlab_size {
            warn!(
                "max_tlab_size < min_tlab_size, adjusting it to {}",
                self.min_tlab_size
            );
            self.max_tlab_size = self.min_tlab_size;
        }
        self
    }
}

// ── GC cause / phase ──────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    NoGc = 0,
    AllocationFailure = 1,
    Explicit = 2,
    MetadataThreshold = 3,
    MetadataClearSoftRefs = 4,
    HeapInspection = 5,
    HeapDump = 6,
}

impl From<u8> for GcCause {
    fn from(val: u8) -> Self {
        match val {
            1 => GcCause::AllocationFailure,
            2 => GcCause::Explicit,
            3 => GcCause::MetadataThreshold,
            4 => GcCause::MetadataClearSoftRefs,
            5 => GcCause::HeapInspection,
            6 => GcCause::HeapDump,
            _ => GcCause::NoGc,
        }
    }
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcCause::NoGc => "No GC",
            GcCause::AllocationFailure => "Allocation Failure",
            GcCause::Explicit => "Explicit GC",
            GcCause::MetadataThreshold => "Metadata GC Threshold",
            GcCause::MetadataClearSoftRefs => "Metadata GC Clear Soft References",
            GcCause::HeapInspection => "Heap Inspection Initiated GC",
            GcCause::HeapDump => "Heap Dump Initiated GC",
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle = 0,
    Prologue = 1,
    Marking = 2,
    Sweeping = 3,
    Epilogue = 4,
}

impl From<u8> for GcPhase {
    fn from(val: u8) -> Self {
        match val {
            1 => GcPhase::Prologue,
            2 => GcPhase::Marking,
            3 => GcPhase::Sweeping,
            4 => GcPhase::Epilogue,
            _ => GcPhase::Idle,
        }
    }
}

/// Outcome of one completed collection cycle. Sizes are in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub cause: GcCause,
    pub marked_objects: usize,
    pub live_words: usize,
    pub reclaimed_words: usize,
    pub free_words: usize,
    pub free_chunks: usize,
    /// Unused TLAB tails abandoned in the prologue.
    pub tlab_waste_words: usize,
    pub duration: Duration,
}

// ── HeapInner ─────────────────────────────────────────────────────────

pub struct HeapInner {
    pub settings: HeapSettings,
    model: ObjectModel,
    virtual_space: VirtualSpace,
    space: FreeListSpace,
    live_bitmap: MarkBitmap,
    encoding: NarrowEncoding,
    /// In words, granule aligned.
    max_tlab_words: usize,
    roots: RootEnumerator,
    tlabs: TlabRegistry,
    safepoint: Safepoint,
    /// Held for the whole of a collection cycle.
    heap_lock: Mutex<()>,
    phase: AtomicU8,
    gc_cause: AtomicU8,
    collections: AtomicUsize,
    last_cycle: Mutex<Option<CycleStats>>,
    metadata_hook: Option<fn()>,
    live_storage: BitmapStorage,
}

impl fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapInner")
            .field("settings", &self.settings)
            .field("committed", &self.virtual_space.committed_region())
            .field("phase", &self.phase())
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

impl HeapInner {
    pub fn new(
        settings: HeapSettings,
        model: ObjectModel,
        metadata_hook: Option<fn()>,
    ) -> Result<Self, HeapError> {
        settings.validate().map_err(HeapError::InvalidSettings)?;
        let settings = settings.apply_ergonomics();
        let granule_bytes = settings.granule_bytes();

        // reserve and commit the maximum size; the heap never grows
        let reserved = ReservedSpace::reserve(settings.max_heap_size)?;
        let virtual_space = VirtualSpace::new(reserved, settings.max_heap_size)?;
        let committed = virtual_space.committed_region();

        let bitmap_size =
            MarkBitmap::compute_size(virtual_space.reserved_size(), granule_bytes);
        let live_storage = BitmapStorage::reserve(bitmap_size, "marking bitmap")?;
        // SAFETY: the storage is owned by the heap and only touched between
        // commit in the prologue and uncommit in the epilogue
        let live_bitmap =
            unsafe { MarkBitmap::new(committed, live_storage.region(), granule_bytes) };

        let space = FreeListSpace::new(committed, settings.granule_words, model)?;

        let max_tlab_words = align_up(settings.max_tlab_size / WORD_SIZE, settings.granule_words)
            .min(committed.word_size());

        // biased by one granule so the heap's first object is encodable
        let encoding = NarrowEncoding {
            base: Address::new(virtual_space.low().as_usize() - granule_bytes),
            shift: granule_bytes.trailing_zeros(),
        };

        info!(
            "Using {NAME} GC: heap {}K initial, {}K max at {}, TLAB max {}K, granule {} bytes",
            settings.initial_heap_size / 1024,
            settings.max_heap_size / 1024,
            virtual_space.low(),
            max_tlab_words * WORD_SIZE / 1024,
            granule_bytes
        );

        Ok(Self {
            settings,
            model,
            virtual_space,
            space,
            live_bitmap,
            encoding,
            max_tlab_words,
            roots: RootEnumerator::new(),
            tlabs: TlabRegistry::new(),
            safepoint: Safepoint::new(),
            heap_lock: Mutex::new(()),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            gc_cause: AtomicU8::new(GcCause::NoGc as u8),
            collections: AtomicUsize::new(0),
            last_cycle: Mutex::new(None),
            metadata_hook,
            live_storage,
        })
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn model(&self) -> &ObjectModel {
        &self.model
    }

    pub fn narrow_encoding(&self) -> NarrowEncoding {
        self.encoding
    }

    /// Registry of external root sources.
    pub fn roots(&self) -> &RootEnumerator {
        &self.roots
    }

    pub fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: GcPhase) {
        debug!("gc phase: {:?} -> {:?}", self.phase(), phase);
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Cause of the current or most recent collection request.
    pub fn gc_cause(&self) -> GcCause {
        GcCause::from(self.gc_cause.load(Ordering::Relaxed))
    }

    /// Completed collection cycles.
    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Acquire)
    }

    pub fn last_cycle(&self) -> Option<CycleStats> {
        *self.last_cycle.lock()
    }

    /// Bytes not on the free list. Includes live TLABs.
    pub fn used(&self) -> usize {
        self.space.used_words() * WORD_SIZE
    }

    /// Committed bytes.
    pub fn capacity(&self) -> usize {
        self.virtual_space.committed_size()
    }

    /// Reserved bytes.
    pub fn max_capacity(&self) -> usize {
        self.virtual_space.reserved_size()
    }

    pub fn is_in(&self, addr: Address) -> bool {
        self.space.is_in(addr)
    }

    pub fn is_maximal_no_gc(&self) -> bool {
        self.used() >= self.capacity()
    }

    /// Whether `addr` lies in a chunk currently on the free list.
    pub fn is_free(&self, addr: Address) -> bool {
        self.is_in(addr) && self.space.is_free_chunk(addr)
    }

    pub fn free_words(&self) -> usize {
        self.space.free_words()
    }

    /// The free list as `(start, words)` pairs in address order.
    pub fn free_chunks(&self) -> Vec<(Address, usize)> {
        self.space
            .lock()
            .iter()
            .map(|node| (node.start, node.words))
            .collect()
    }

    /// Largest TLAB in words.
    pub fn max_tlab_size(&self) -> usize {
        self.max_tlab_words
    }

    /// Largest TLAB in bytes; the allocation path settles the actual size.
    pub fn unsafe_max_tlab_alloc(&self) -> usize {
        self.max_tlab_words * WORD_SIZE
    }

    pub fn tlab_capacity(&self) -> usize {
        self.capacity()
    }

    pub fn tlab_used(&self) -> usize {
        self.used()
    }

    // Every object is implicitly pinned.

    pub fn supports_object_pinning(&self) -> bool {
        true
    }

    pub fn pin_object(&self, obj: Address) -> Address {
        obj
    }

    pub fn unpin_object(&self, _obj: Address) {}

    // ── Allocation ────────────────────────────────────────────────────

    /// Rounds a word size up to the object granule.
    #[inline(always)]
    pub fn adjust_size(&self, words: usize) -> usize {
        self.space.adjust_chunk_size(words)
    }

    /// Allocates straight from the free list without collecting.
    #[inline]
    pub fn allocate_work(&self, words: usize) -> Option<Address> {
        self.space.allocate(words)
    }

    /// Free list allocation for threads outside the safepoint protocol.
    ///
    /// `claim` runs on the carved chunk before the heap lock is released and
    /// must leave it parsable, so a cycle never sees raw memory.
    fn allocate_external<R>(&self, words: usize, claim: impl Fn(Address) -> R) -> Option<R> {
        let _heap_lock = self.heap_lock.lock();
        self.allocate_work(words).map(claim)
    }

    /// Tries the free list, collects once on failure and retries once.
    /// Requests larger than the heap fail without collecting.
    fn allocate_or_collect<R>(
        &self,
        words: usize,
        claim: impl Fn(Address) -> R,
    ) -> Result<R, HeapError> {
        if !self.space.can_fit(words) {
            return Err(HeapError::OutOfMemory { requested_words: words });
        }
        if let Some(claimed) = self.allocate_external(words, &claim) {
            return Ok(claimed);
        }
        self.collect_for_allocation(words, || Requester::External);
        self.allocate_external(words, &claim)
            .ok_or(HeapError::OutOfMemory {
                requested_words: self.adjust_size(words),
            })
    }

    #[cold]
    fn collect_for_allocation(&self, words: usize, requester: impl FnOnce() -> Requester) {
        debug!("allocation of {words} words failed, collecting");
        if let Err(err) = self.vmentry_collect(GcCause::AllocationFailure, requester()) {
            debug!("retrying allocation after failed collection: {err}");
        }
    }

    /// TLAB size for a request: `requested_words` clamped to
    /// `[min_words, max_tlab_size]` and granule aligned.
    pub fn tlab_size_for(&self, min_words: usize, requested_words: usize) -> usize {
        debug_assert!(min_words <= self.max_tlab_words, "min TLAB size above max");
        self.adjust_size(requested_words.min(self.max_tlab_words).max(min_words))
    }

    // ── Collection ────────────────────────────────────────────────────

    fn collect_with(
        &self,
        cause: GcCause,
        requester: impl FnOnce() -> Requester,
    ) -> Result<(), HeapError> {
        match cause {
            GcCause::AllocationFailure | GcCause::Explicit => {
                self.vmentry_collect(cause, requester()).map(|_| ())
            }
            GcCause::MetadataThreshold | GcCause::MetadataClearSoftRefs => {
                info!("GC request for \"{cause}\" is handled");
                if let Some(hook) = self.metadata_hook {
                    hook();
                }
                Ok(())
            }
            _ => {
                info!("GC request for \"{cause}\" is ignored");
                Ok(())
            }
        }
    }

    /// Runs one cycle with the world stopped. Returns `None` when the caller
    /// was parked through a cycle started by another thread.
    fn vmentry_collect(
        &self,
        cause: GcCause,
        requester: Requester,
    ) -> Result<Option<CycleStats>, HeapError> {
        self.gc_cause.store(cause as u8, Ordering::Relaxed);
        match self
            .safepoint
            .execute(requester, |thread_roots| self.entry_collect(cause, thread_roots))
        {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    /// Prologue, mark, sweep, epilogue. Must run with the world stopped.
    fn entry_collect(
        &self,
        cause: GcCause,
        thread_roots: &mut [usize],
    ) -> Result<CycleStats, HeapError> {
        let _heap_lock = self.heap_lock.lock();
        let started = Instant::now();

        self.set_phase(GcPhase::Prologue);
        let tlab_waste_words = match self.prologue() {
            Ok(waste) => {
                debug_assert!(self.live_storage.is_committed());
                waste
            }
            Err(err) => {
                error!("{cause}: collection aborted: {err}");
                self.set_phase(GcPhase::Idle);
                return Err(HeapError::CycleAborted("marking bitmap could not be committed"));
            }
        };

        self.set_phase(GcPhase::Marking);
        let mark_started = Instant::now();
        // SAFETY: all mutators are parked, TLABs are retired
        let mark = unsafe {
            Marker::new(&self.live_bitmap, &self.model, self.encoding)
                .mark_roots(&self.roots, thread_roots)
        };
        debug!(
            "marked {} objects in {:?}, max stack depth {}",
            mark.marked_objects,
            mark_started.elapsed(),
            mark.max_stack_depth
        );

        self.set_phase(GcPhase::Sweeping);
        let sweep_started = Instant::now();
        // SAFETY: as above, and marking is complete
        let sweep = unsafe { sweep::sweep(&self.space, &self.live_bitmap) };
        debug!(
            "swept {} dead objects ({} words) in {:?}, {} free chunks",
            sweep.dead_objects,
            sweep.reclaimed_words,
            sweep_started.elapsed(),
            sweep.free_chunks
        );

        self.set_phase(GcPhase::Epilogue);
        self.epilogue();
        self.set_phase(GcPhase::Idle);

        let stats = CycleStats {
            cause,
            marked_objects: mark.marked_objects,
            live_words: sweep.live_words,
            reclaimed_words: sweep.reclaimed_words,
            free_words: sweep.free_words,
            free_chunks: sweep.free_chunks,
            tlab_waste_words,
            duration: started.elapsed(),
        };
        let n = self.collections.fetch_add(1, Ordering::AcqRel);
        *self.last_cycle.lock() = Some(stats);
        info!(
            "GC({n}) {cause}: {}K live, {}K reclaimed, {}K free in {} chunks, {:.3}ms",
            stats.live_words * WORD_SIZE / 1024,
            stats.reclaimed_words * WORD_SIZE / 1024,
            stats.free_words * WORD_SIZE / 1024,
            stats.free_chunks,
            stats.duration.as_secs_f64() * 1000.0
        );
        Ok(stats)
    }

    /// Commits the liveness bitmap and retires every TLAB. Returns the
    /// words abandoned in TLAB tails.
    fn prologue(&self) -> Result<usize, HeapError> {
        self.live_storage.commit()?;
        // SAFETY: every mutator is parked
        Ok(unsafe { self.tlabs.retire_all(&self.model) })
    }

    fn epilogue(&self) {
        if let Err(err) = self.live_storage.uncommit() {
            warn!("Could not uncommit native memory for marking bitmap: {err}");
        }
    }

    /// Visits every object in the heap in address order, with the world
    /// stopped.
    fn object_iterate_with(&self, requester: Requester, visitor: impl FnMut(Address)) {
        self.safepoint.execute(requester, |_| {
            let _heap_lock = self.heap_lock.lock();
            // SAFETY: every mutator is parked; retiring the TLABs makes the
            // heap parsable
            unsafe {
                self.tlabs.retire_all(&self.model);
                self.space.object_iterate(visitor);
            }
        });
    }
}

/// Copies the non-null references of a root provider.
fn snapshot_roots(encoding: NarrowEncoding, roots: &mut dyn RootProvider) -> Vec<usize> {
    let mut snapshot = Vec::new();
    roots.visit_roots(&mut |slot| {
        // SAFETY: providers hand out readable slots
        let obj = unsafe { slot.load(encoding) };
        if !obj.is_null() {
            snapshot.push(obj.as_usize());
        }
    });
    snapshot
}

// ── MSweepHeap (Arc wrapper) ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MSweepHeap(Arc<HeapInner>);

impl MSweepHeap {
    pub fn new(settings: HeapSettings, model: ObjectModel) -> Result<Self, HeapError> {
        Ok(Self(Arc::new(HeapInner::new(settings, model, None)?)))
    }

    /// Like [`MSweepHeap::new`], with a hook run for metadata-pressure
    /// collection requests.
    pub fn with_metadata_hook(
        settings: HeapSettings,
        model: ObjectModel,
        hook: fn(),
    ) -> Result<Self, HeapError> {
        Ok(Self(Arc::new(HeapInner::new(settings, model, Some(hook))?)))
    }

    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator::new(self.clone())
    }

    // The entry points below are for threads that are not registered
    // mutators. A thread owning a `Mutator` must use the `Mutator` methods:
    // a stop-the-world request from it would otherwise wait on itself.

    /// Allocates `words`, collecting once if the free list is exhausted.
    ///
    /// The chunk comes back formatted as a dead filler. The caller formats
    /// its object over it and roots it; a collection that runs first
    /// reclaims the chunk.
    pub fn mem_allocate(&self, words: usize) -> Result<Address, HeapError> {
        self.allocate_or_collect(words, |obj| {
            // SAFETY: freshly carved, owned by this call until returned
            unsafe { self.model.fill(obj, self.adjust_size(words)) };
            obj
        })
    }

    /// Allocates a TLAB of `requested_words` clamped to
    /// `[min_words, max_tlab_size]`.
    ///
    /// The buffer is registered with the heap like a mutator's, so every
    /// collection retires it: its unused tail is reclaimed and later
    /// [`ExternalTlab::allocate`] calls fail until a new buffer is requested.
    pub fn allocate_new_tlab(
        &self,
        min_words: usize,
        requested_words: usize,
    ) -> Result<ExternalTlab, HeapError> {
        let words = self.tlab_size_for(min_words, requested_words);
        let tlab = self.allocate_or_collect(words, |start| {
            let tlab = self.tlabs.register();
            tlab.lock().install(start, words);
            tlab
        })?;
        trace!("new external TLAB of {words} words");
        Ok(ExternalTlab {
            heap: self.clone(),
            tlab,
        })
    }

    pub fn collect(&self, cause: GcCause) -> Result<(), HeapError> {
        self.collect_with(cause, || Requester::External)
    }

    pub fn do_full_collection(&self) -> Result<(), HeapError> {
        self.collect(self.gc_cause())
    }

    /// Visits every object in address order with the world stopped.
    pub fn object_iterate(&self, visitor: impl FnMut(Address)) {
        self.object_iterate_with(Requester::External, visitor);
    }
}

impl Deref for MSweepHeap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── ExternalTlab ──────────────────────────────────────────────────────

/// A TLAB owned by a thread that is not a registered mutator.
///
/// Dropping it retires the remaining space back to the heap.
#[derive(Debug)]
pub struct ExternalTlab {
    heap: MSweepHeap,
    tlab: TlabHandle,
}

impl ExternalTlab {
    /// Current state of the buffer. Empty once a collection retired it.
    pub fn tlab(&self) -> Tlab {
        *self.tlab.lock()
    }

    pub fn start(&self) -> Address {
        self.tlab.lock().start()
    }

    pub fn size_words(&self) -> usize {
        self.tlab.lock().size_words()
    }

    /// Bumps `words` off the buffer, or `None` once it is full or retired.
    ///
    /// Like [`MSweepHeap::mem_allocate`], the object comes back as a filler
    /// and must be formatted and rooted before the next collection.
    pub fn allocate(&self, words: usize) -> Option<Address> {
        if !self.heap.space.can_fit(words) {
            return None;
        }
        let words = self.heap.adjust_size(words);
        // a retirement filling the tail waits on this lock
        let mut tlab = self.tlab.lock();
        let obj = tlab.allocate(words)?;
        // SAFETY: just bumped from a buffer only this handle allocates from
        unsafe { self.heap.model.fill(obj, words) };
        Some(obj)
    }
}

impl Drop for ExternalTlab {
    fn drop(&mut self) {
        // keeps the retirement out of a running cycle
        let _heap_lock = self.heap.heap_lock.lock();
        // SAFETY: only this handle allocates from the buffer
        unsafe { self.tlab.lock().retire(&self.heap.model) };
        self.heap.tlabs.unregister(&self.tlab);
    }
}

// ── Mutator (thread-local allocator) ──────────────────────────────────

/// Per-thread allocation proxy.
///
/// Bump allocates from a TLAB and polls for stop-the-world requests on
/// every allocation. While it exists the owning thread counts as running,
/// so it must keep allocating (or call [`Mutator::poll`]) for collections
/// requested by other threads to make progress.
///
/// Roots held by the thread are passed to each call that can block.
#[derive(Debug)]
pub struct Mutator {
    heap: MSweepHeap,
    tlab: TlabHandle,
    /// Desired TLAB size in words.
    tlab_words: usize,
    refill_waste_limit: usize,
}

impl Mutator {
    #[must_use]
    pub fn new(heap: MSweepHeap) -> Self {
        heap.safepoint.register();
        let tlab = heap.tlabs.register();
        let min_words = heap.adjust_size(heap.settings.min_tlab_size / WORD_SIZE);
        let tlab_words = heap.tlab_size_for(
            min_words.min(heap.max_tlab_words),
            heap.settings.tlab_size / WORD_SIZE,
        );
        Self {
            heap,
            tlab,
            tlab_words,
            refill_waste_limit: tlab_words / TLAB_REFILL_WASTE_FRACTION,
        }
    }

    pub fn heap(&self) -> &MSweepHeap {
        &self.heap
    }

    pub fn tlab(&self) -> Tlab {
        *self.tlab.lock()
    }

    /// Parks the thread if a stop-the-world operation is pending.
    #[inline(always)]
    pub fn poll(&mut self, roots: &mut dyn RootProvider) {
        if self.heap.safepoint.is_pending() {
            self.park(roots);
        }
    }

    #[cold]
    #[inline(never)]
    fn park(&mut self, roots: &mut dyn RootProvider) {
        let encoding = self.heap.encoding;
        self.heap.safepoint.park(|| snapshot_roots(encoding, roots));
    }

    /// Allocates `words`.
    ///
    /// The object must be initialized before the next call on this mutator.
    #[inline(always)]
    pub fn allocate(
        &mut self,
        words: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Address, HeapError> {
        self.poll(roots);
        if !self.heap.space.can_fit(words) {
            return Err(HeapError::OutOfMemory { requested_words: words });
        }
        let words = self.heap.adjust_size(words);

        // Fast path: current TLAB has space.
        let fast = self.tlab.lock().allocate(words);
        if let Some(obj) = fast {
            return Ok(obj);
        }

        self.allocate_slow(words, roots)
    }

    #[cold]
    #[inline(never)]
    fn allocate_slow(
        &mut self,
        words: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<Address, HeapError> {
        if let Some(obj) = self.refill_or_allocate(words) {
            return Ok(obj);
        }

        let encoding = self.heap.encoding;
        self.heap.collect_for_allocation(words, || {
            Requester::Mutator(snapshot_roots(encoding, roots))
        });

        self.refill_or_allocate(words)
            .ok_or(HeapError::OutOfMemory { requested_words: words })
    }

    /// Refills the TLAB when its remaining space is small enough to give up,
    /// otherwise allocates directly from the free list.
    fn refill_or_allocate(&mut self, words: usize) -> Option<Address> {
        let refill = words <= self.tlab_words
            && self.tlab.lock().free_words() <= self.refill_waste_limit;
        if refill {
            let size = self.heap.tlab_size_for(words, self.tlab_words);
            if let Some(start) = self.heap.allocate_work(size) {
                let mut tlab = self.tlab.lock();
                // SAFETY: this thread owns its TLAB and is not parked
                unsafe { tlab.retire(&self.heap.model) };
                tlab.install(start, size);
                trace!("TLAB refill: {size} words at {start}");
                return tlab.allocate(words);
            }
        }
        self.heap.allocate_work(words)
    }

    pub fn collect(&mut self, cause: GcCause, roots: &mut dyn RootProvider) -> Result<(), HeapError> {
        let encoding = self.heap.encoding;
        self.heap
            .collect_with(cause, || Requester::Mutator(snapshot_roots(encoding, roots)))
    }

    pub fn object_iterate(&mut self, roots: &mut dyn RootProvider, visitor: impl FnMut(Address)) {
        let snapshot = snapshot_roots(self.heap.encoding, roots);
        self.heap
            .object_iterate_with(Requester::Mutator(snapshot), visitor);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        // a pending operation counts this thread as running, park through it
        // first; the thread's roots die with it
        self.heap.safepoint.park(Vec::new);

        let mut tlab = self.tlab.lock();
        // SAFETY: not parked, so no collection is running
        unsafe { tlab.retire(&self.heap.model) };
        trace!(
            "mutator exit: {} TLAB refills, {} words bump allocated",
            tlab.refills(),
            tlab.allocated_words()
        );
        drop(tlab);
        self.heap.tlabs.unregister(&self.tlab);
        self.heap.safepoint.unregister();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object::Slot, roots::HandleTable, roots::RootKind, simple};

    /// A simple root provider that holds a list of addresses.
    struct TestRoots {
        roots: Vec<usize>,
    }

    impl TestRoots {
        fn new() -> Self {
            Self { roots: Vec::new() }
        }

        fn push(&mut self, obj: Address) {
            self.roots.push(obj.as_usize());
        }
    }

    impl RootProvider for TestRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(Slot)) {
            for root in &mut self.roots {
                visitor(Slot::Wide(root));
            }
        }
    }

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            initial_heap_size: 1024 * 1024,
            max_heap_size: 1024 * 1024, // 1 MB
            min_tlab_size: 1024,
            max_tlab_size: 16 * 1024,
            tlab_size: 4 * 1024,
            granule_words: 2,
        }
    }

    fn create_test_env() -> (MSweepHeap, Mutator, TestRoots) {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let mutator = heap.mutator();
        (heap, mutator, TestRoots::new())
    }

    fn new_object(mutator: &mut Mutator, roots: &mut TestRoots, words: usize, refs: u16) -> Address {
        let obj = mutator.allocate(words, roots).expect("allocate");
        // SAFETY: freshly allocated, initialized before the next allocation
        unsafe { simple::init(obj, words, refs) };
        obj
    }

    #[test]
    fn test_settings_validation() {
        let bad_granule = HeapSettings {
            granule_words: 3,
            ..create_test_settings()
        };
        assert!(matches!(
            MSweepHeap::new(bad_granule, simple::MODEL),
            Err(HeapError::InvalidSettings(_))
        ));

        let inverted = HeapSettings {
            initial_heap_size: 2 * 1024 * 1024,
            ..create_test_settings()
        };
        assert!(inverted.validate().is_err());

        let huge_granule = HeapSettings {
            granule_words: system::page_size() / WORD_SIZE * 2,
            ..create_test_settings()
        };
        assert_eq!(
            huge_granule.validate(),
            Err("granule_words must not exceed a page")
        );
        assert!(HeapSettings::default().validate().is_ok());
    }

    #[test]
    fn test_max_tlab_raised_to_min() {
        let settings = HeapSettings {
            min_tlab_size: 8 * 1024,
            max_tlab_size: 1024,
            ..create_test_settings()
        };
        let heap = MSweepHeap::new(settings, simple::MODEL).expect("heap");
        assert_eq!(heap.settings.max_tlab_size, 8 * 1024);
        assert_eq!(heap.max_tlab_size(), 1024);
        assert_eq!(heap.unsafe_max_tlab_alloc(), 8 * 1024);
    }

    #[test]
    fn test_allocation_basic() {
        let (heap, mut mutator, mut roots) = create_test_env();

        let a = new_object(&mut mutator, &mut roots, 3, 0);
        let b = new_object(&mut mutator, &mut roots, 4, 0);

        assert!(a.is_aligned(heap.settings.granule_bytes()));
        assert_eq!(b, a.add_words(4));
        assert!(heap.is_in(a));
        assert!(mutator.tlab().contains(a));
        assert_eq!(heap.capacity(), 1024 * 1024);
        assert_eq!(heap.max_capacity(), 1024 * 1024);
        assert_eq!(heap.used(), mutator.tlab().size_words() * WORD_SIZE);
    }

    #[test]
    fn test_large_objects_bypass_tlab() {
        let (heap, mut mutator, mut roots) = create_test_env();
        let small = new_object(&mut mutator, &mut roots, 2, 0);
        let tlab = mutator.tlab();

        let large = new_object(&mut mutator, &mut roots, 1024, 0);
        assert!(!tlab.contains(large));
        assert_eq!(mutator.tlab().start(), tlab.start());
        assert!(heap.is_in(small) && heap.is_in(large));
    }

    #[test]
    fn test_collection_reclaims_garbage() {
        let (heap, mut mutator, mut roots) = create_test_env();

        let live = new_object(&mut mutator, &mut roots, 8, 1);
        let child = new_object(&mut mutator, &mut roots, 8, 0);
        // SAFETY: live has one slot
        unsafe { simple::set_ref(live, 0, child) };
        roots.push(live);
        let garbage = new_object(&mut mutator, &mut roots, 8, 0);

        mutator.collect(GcCause::Explicit, &mut roots).expect("collect");

        let stats = heap.last_cycle().expect("one cycle");
        assert_eq!(heap.collections(), 1);
        assert_eq!(stats.cause, GcCause::Explicit);
        assert_eq!(stats.marked_objects, 2);
        assert_eq!(stats.live_words, 16);
        assert!(stats.tlab_waste_words > 0);
        assert!(!heap.is_free(live));
        assert!(!heap.is_free(child));
        assert!(heap.is_free(garbage));
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert!(mutator.tlab().is_empty());
        assert_eq!(heap.used(), 16 * WORD_SIZE);
    }

    #[test]
    fn test_registered_roots_are_scanned() {
        let (heap, mut mutator, mut roots) = create_test_env();
        let handles = HandleTable::new();
        heap.roots().register(RootKind::GlobalHandles, handles.clone());

        let kept = new_object(&mut mutator, &mut roots, 4, 0);
        handles.push(kept);
        let dropped = new_object(&mut mutator, &mut roots, 4, 0);

        mutator.collect(GcCause::Explicit, &mut roots).expect("collect");
        assert!(!heap.is_free(kept));
        assert!(heap.is_free(dropped));
    }

    #[test]
    fn test_allocation_failure_triggers_collection() {
        let (heap, mut mutator, mut roots) = create_test_env();
        let object_words = 1000;

        // fill the heap with garbage; allocation must keep succeeding
        for _ in 0..1000 {
            new_object(&mut mutator, &mut roots, object_words, 0);
        }
        assert!(heap.collections() > 0);
        assert_eq!(
            heap.last_cycle().map(|s| s.cause),
            Some(GcCause::AllocationFailure)
        );
    }

    #[test]
    fn test_out_of_memory_after_one_retry() {
        let (heap, mut mutator, mut roots) = create_test_env();
        let half = heap.capacity() / WORD_SIZE / 2;

        let first = new_object(&mut mutator, &mut roots, half, 0);
        roots.push(first);
        let before = heap.collections();

        let err = mutator
            .allocate(half + 2, &mut roots)
            .expect_err("cannot fit");
        assert!(err.is_out_of_memory());
        assert_eq!(heap.collections(), before + 1);
        assert!(!heap.is_free(first));
    }

    #[test]
    fn test_metadata_and_ignored_causes_do_not_collect() {
        use std::sync::atomic::AtomicUsize;
        static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);
        fn hook() {
            HOOK_CALLS.fetch_add(1, Ordering::Relaxed);
        }

        let heap =
            MSweepHeap::with_metadata_hook(create_test_settings(), simple::MODEL, hook).expect("heap");
        heap.collect(GcCause::MetadataThreshold).expect("collect");
        heap.collect(GcCause::MetadataClearSoftRefs).expect("collect");
        heap.collect(GcCause::HeapInspection).expect("collect");
        heap.do_full_collection().expect("collect");

        assert_eq!(HOOK_CALLS.load(Ordering::Relaxed), 2);
        assert_eq!(heap.collections(), 0);

        heap.collect(GcCause::Explicit).expect("collect");
        heap.do_full_collection().expect("collect");
        assert_eq!(heap.collections(), 2);
    }

    #[test]
    fn test_object_iterate_sees_objects_in_address_order() {
        let (heap, mut mutator, mut roots) = create_test_env();
        let mut expected = Vec::new();
        for i in 0..10 {
            expected.push(new_object(&mut mutator, &mut roots, 2 + i, 0));
        }

        let mut seen = Vec::new();
        mutator.object_iterate(&mut roots, |obj| {
            // SAFETY: visited objects are parsable
            if !unsafe { simple::is_filler(obj) } {
                seen.push(obj);
            }
        });
        assert_eq!(seen, expected);
        assert_eq!(heap.collections(), 0);
    }

    #[test]
    fn test_pinning_is_identity() {
        let (heap, mut mutator, mut roots) = create_test_env();
        let obj = new_object(&mut mutator, &mut roots, 2, 0);
        assert!(heap.supports_object_pinning());
        assert_eq!(heap.pin_object(obj), obj);
        heap.unpin_object(obj);
        assert!(!heap.is_maximal_no_gc());
        assert_eq!(heap.name(), "MSweep");
    }

    #[test]
    fn test_external_tlab_allocation_is_clamped() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let max = heap.max_tlab_size();

        let tlab = heap.allocate_new_tlab(4, max * 4).expect("tlab");
        assert_eq!(tlab.size_words(), max);
        assert!(heap.is_in(tlab.start()));

        let small = heap.allocate_new_tlab(5, 1).expect("tlab");
        assert_eq!(small.size_words(), 6);
    }

    #[test]
    fn test_external_tlab_is_retired_by_collection() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let handles = HandleTable::new();
        heap.roots().register(RootKind::GlobalHandles, handles.clone());

        let tlab = heap.allocate_new_tlab(128, 512).expect("tlab");
        assert_eq!(tlab.size_words(), 512);
        let obj = tlab.allocate(2).expect("bump");
        assert_eq!(obj, tlab.start());
        // SAFETY: bumped from the buffer above
        unsafe { simple::init(obj, 2, 0) };
        handles.push(obj);

        heap.collect(GcCause::Explicit).expect("collect");
        let stats = heap.last_cycle().expect("cycle ran");
        assert_eq!(stats.tlab_waste_words, 510);
        assert!(tlab.tlab().is_empty());
        assert!(tlab.allocate(2).is_none());
        assert!(!heap.is_free(obj));

        // the unused tail went back to the heap, and only the tail
        let next = heap.mem_allocate(2).expect("allocate");
        assert_eq!(next, obj.add_words(2));
        drop(tlab);
        assert_eq!(
            heap.free_chunks(),
            vec![(next.add_words(2), heap.capacity() / WORD_SIZE - 4)]
        );
    }

    #[test]
    fn test_unformatted_external_allocations_stay_parsable() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let tlab = heap.allocate_new_tlab(128, 512).expect("tlab");
        let bumped = tlab.allocate(6).expect("bump");
        let direct = heap.mem_allocate(10).expect("allocate");

        // neither range was formatted by the caller before the cycle
        heap.collect(GcCause::Explicit).expect("collect");
        assert!(heap.is_free(bumped));
        assert!(heap.is_free(direct));
        assert_eq!(heap.free_chunks().len(), 1);

        drop(tlab);
        assert_eq!(heap.free_words(), heap.capacity() / WORD_SIZE);
    }

    #[test]
    fn test_dropped_external_tlab_returns_its_tail() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let handles = HandleTable::new();
        heap.roots().register(RootKind::GlobalHandles, handles.clone());

        let tlab = heap.allocate_new_tlab(128, 512).expect("tlab");
        let obj = tlab.allocate(4).expect("bump");
        // SAFETY: bumped from the buffer above
        unsafe { simple::init(obj, 4, 0) };
        handles.push(obj);
        drop(tlab);

        heap.collect(GcCause::Explicit).expect("collect");
        let stats = heap.last_cycle().expect("cycle ran");
        assert_eq!(stats.tlab_waste_words, 0);
        assert_eq!(
            heap.free_chunks(),
            vec![(obj.add_words(4), heap.capacity() / WORD_SIZE - 4)]
        );
    }

    #[test]
    fn test_oversized_requests_fail_without_collecting() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let too_big = [usize::MAX, usize::MAX - 1, heap.capacity() / WORD_SIZE + 1];

        for words in too_big {
            let err = heap.mem_allocate(words).expect_err("cannot fit");
            assert!(err.is_out_of_memory());
        }
        let a = heap.mem_allocate(2).expect("allocate");
        let b = heap.mem_allocate(2).expect("allocate");
        assert_eq!(b, a.add_words(2));

        let tlab = heap.allocate_new_tlab(128, 512).expect("tlab");
        assert!(tlab.allocate(usize::MAX).is_none());
        drop(tlab);

        let mut mutator = heap.mutator();
        let mut roots = TestRoots::new();
        for words in too_big {
            let err = mutator.allocate(words, &mut roots).expect_err("cannot fit");
            assert!(err.is_out_of_memory());
        }
        assert_eq!(heap.collections(), 0);
        let c = new_object(&mut mutator, &mut roots, 2, 0);
        assert!(heap.is_in(c) && c != a && c != b);
    }

    #[test]
    fn test_aborted_cycle_reports_out_of_memory() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let half = heap.capacity() / WORD_SIZE / 2;
        heap.mem_allocate(half).expect("first half");
        heap.mem_allocate(half).expect("second half");

        heap.live_storage.fail_next_commit();
        let err = heap.mem_allocate(half).expect_err("cycle aborted");
        assert!(err.is_out_of_memory());
        assert_eq!(heap.collections(), 0);
        assert!(heap.last_cycle().is_none());
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert!(heap.heap_lock.try_lock().is_some());
        assert!(!heap.live_storage.is_committed());

        heap.live_storage.fail_next_commit();
        assert!(matches!(
            heap.collect(GcCause::Explicit),
            Err(HeapError::CycleAborted(_))
        ));
        assert_eq!(heap.collections(), 0);

        // the storage commits again and the garbage is reclaimed
        assert!(heap.mem_allocate(half).is_ok());
        assert_eq!(heap.collections(), 1);
    }

    #[test]
    fn test_uncommit_failure_is_not_fatal() {
        let heap = MSweepHeap::new(create_test_settings(), simple::MODEL).expect("heap");
        let handles = HandleTable::new();
        heap.roots().register(RootKind::GlobalHandles, handles.clone());

        let obj = heap.mem_allocate(4).expect("allocate");
        // SAFETY: freshly allocated
        unsafe { simple::init(obj, 4, 0) };
        let handle = handles.push(obj);

        heap.live_storage.fail_next_uncommit();
        heap.collect(GcCause::Explicit).expect("cycle completes");
        assert_eq!(heap.collections(), 1);
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert!(!heap.is_free(obj));

        // the marks of the previous cycle must not keep the object alive
        handles.release(handle);
        heap.collect(GcCause::Explicit).expect("collect");
        assert!(heap.is_free(obj));
        assert_eq!(heap.collections(), 2);
    }

    #[test]
    fn test_multithreaded_stress() {
        use std::{
            sync::{Arc, Barrier},
            thread,
        };

        let settings = HeapSettings {
            initial_heap_size: 4 * 1024 * 1024,
            max_heap_size: 4 * 1024 * 1024,
            ..create_test_settings()
        };
        let heap = MSweepHeap::new(settings, simple::MODEL).expect("heap");

        let num_threads = 8;
        let start_barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = vec![];

        for i in 0..num_threads {
            let heap_ref = heap.clone();
            let barrier = start_barrier.clone();

            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut mutator = Mutator::new(heap_ref);
                let mut roots = TestRoots::new();
                let mut local_seed = i as u64 + 1;

                let next_rand = |seed: &mut u64| -> u64 {
                    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                    (*seed >> 32) % 100
                };

                for _ in 0..10_000 {
                    let obj = new_object(&mut mutator, &mut roots, 16, 0);
                    let roll = next_rand(&mut local_seed);

                    if roll < 5 {
                        if roots.roots.len() >= 100 {
                            roots.roots.remove(0);
                        }
                        roots.push(obj);
                    }
                }

                // every rooted object survived every cycle intact
                for &root in &roots.roots {
                    // SAFETY: rooted objects are live
                    let header = unsafe { simple::header(Address::new(root)) };
                    assert_eq!(header.size_words, 16);
                    assert!(!mutator.heap().is_free(Address::new(root)));
                }
            }));
        }

        for h in handles {
            h.join().expect("Thread panicked");
        }

        assert!(
            heap.collections() > 0,
            "Should have triggered at least one GC cycle"
        );
    }
}
