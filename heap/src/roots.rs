//! Root discovery.
//!
//! The host registers one [`RootProvider`] per external reference source.
//! Each collection visits every source exactly once, in a fixed order:
//! code cache, class-loader graph, global handles, then thread roots.

use std::{fmt, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use crate::{memory::Address, object::Slot};

/// Consumers implement this to provide GC roots.
///
/// `visit_roots` must report every reference the source holds into the heap,
/// once per call. Slots may be wide or narrow; null slots are skipped by the
/// collector.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Slot));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// References embedded in compiled code. Visited under the code lock.
    CodeCache,
    ClassLoaderGraph,
    GlobalHandles,
    /// Host-managed thread state. Roots of parked [`crate::Mutator`]s are
    /// visited in the same pass.
    Threads,
}

impl RootKind {
    pub const ORDER: [RootKind; 4] = [
        RootKind::CodeCache,
        RootKind::ClassLoaderGraph,
        RootKind::GlobalHandles,
        RootKind::Threads,
    ];
}

struct Source {
    kind: RootKind,
    provider: Box<dyn RootProvider + Send>,
}

/// Registry of root sources for one heap.
pub struct RootEnumerator {
    sources: Mutex<Vec<Source>>,
    code_lock: Mutex<()>,
}

impl fmt::Debug for RootEnumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources = self.sources.lock();
        f.debug_struct("RootEnumerator")
            .field(
                "sources",
                &sources.iter().map(|s| s.kind).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for RootEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RootEnumerator {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
            code_lock: Mutex::new(()),
        }
    }

    pub fn register(&self, kind: RootKind, provider: impl RootProvider + Send + 'static) {
        self.sources.lock().push(Source {
            kind,
            provider: Box::new(provider),
        });
    }

    /// Lock guarding the code cache. Hosts hold it while patching compiled
    /// code; enumeration holds it only while code cache sources run.
    pub fn code_lock(&self) -> MutexGuard<'_, ()> {
        self.code_lock.lock()
    }

    /// Reports every root to `visitor`. `thread_roots` are the snapshots
    /// published by parked mutators and are visited with the `Threads` pass.
    pub fn enumerate(&self, thread_roots: &mut [usize], visitor: &mut dyn FnMut(Slot)) {
        let mut sources = self.sources.lock();
        for kind in RootKind::ORDER {
            let _code = (kind == RootKind::CodeCache).then(|| self.code_lock.lock());
            for source in sources.iter_mut().filter(|s| s.kind == kind) {
                source.provider.visit_roots(visitor);
            }
            if kind == RootKind::Threads {
                for root in thread_roots.iter_mut() {
                    visitor(Slot::Wide(root));
                }
            }
        }
    }
}

/// A shareable table of wide root slots, usable as a global handle table.
///
/// Clones share the same table, so one clone can be registered with the
/// heap while the host keeps another to update handles.
#[derive(Debug, Clone, Default)]
pub struct HandleTable(Arc<Mutex<Vec<usize>>>);

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `obj` in a new handle and returns its index.
    pub fn push(&self, obj: Address) -> usize {
        let mut slots = self.0.lock();
        slots.push(obj.as_usize());
        slots.len() - 1
    }

    /// The object a handle refers to, or `None` for an index never handed
    /// out by [`HandleTable::push`] (or dropped by [`HandleTable::clear`]).
    pub fn get(&self, index: usize) -> Option<Address> {
        self.0.lock().get(index).map(|&raw| Address::new(raw))
    }

    /// Points a handle at `obj`, returning its previous target. `None` if the
    /// index is not a live handle; the table is left unchanged then.
    pub fn set(&self, index: usize, obj: Address) -> Option<Address> {
        let mut slots = self.0.lock();
        let slot = slots.get_mut(index)?;
        Some(Address::new(std::mem::replace(slot, obj.as_usize())))
    }

    /// Clears a handle. Its slot stays allocated and reads as null.
    pub fn release(&self, index: usize) -> Option<Address> {
        self.set(index, Address::NULL)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for HandleTable {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Slot)) {
        let mut slots = self.0.lock();
        for slot in slots.iter_mut() {
            visitor(Slot::Wide(slot));
        }
    }
}
