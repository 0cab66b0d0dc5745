use std::{process, thread, time::Instant};

use clap::Parser as ClapParser;
use log::{error, info};

use msweep::{
    Address, GcCause, HandleTable, HeapSettings, MSweepHeap, Mutator, RootKind, RootProvider,
    Slot, simple,
};

/// Allocation workload driver for the mark-sweep heap.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Heap size in MB
    #[arg(long, default_value_t = 64)]
    heap_size: usize,

    /// Requested TLAB size in KB
    #[arg(long, default_value_t = 64)]
    tlab_size: usize,

    /// Number of mutator threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Objects allocated per thread
    #[arg(long, default_value_t = 1_000_000)]
    objects: usize,

    /// Keep every n-th object reachable (0 keeps nothing)
    #[arg(long, default_value_t = 100)]
    keep_every: usize,

    /// Explicit collections run after the workload
    #[arg(long, default_value_t = 1)]
    cycles: usize,
}

/// Roots of one worker: a bounded window of recently kept objects plus the
/// object the next allocation will link to.
struct WorkerRoots {
    window: Vec<usize>,
    next: usize,
    previous: usize,
}

impl WorkerRoots {
    fn new(capacity: usize) -> Self {
        Self {
            window: vec![0; capacity],
            next: 0,
            previous: 0,
        }
    }

    fn keep(&mut self, obj: Address) {
        if self.window.is_empty() {
            return;
        }
        self.window[self.next] = obj.as_usize();
        self.next = (self.next + 1) % self.window.len();
    }
}

impl RootProvider for WorkerRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Slot)) {
        for slot in &mut self.window {
            visitor(Slot::Wide(slot));
        }
        visitor(Slot::Wide(&mut self.previous));
    }
}

fn run_worker(mut mutator: Mutator, id: usize, cli: &Cli) -> Result<(), msweep::HeapError> {
    let mut roots = WorkerRoots::new(1024);
    let mut seed = id as u64 + 1;

    for i in 0..cli.objects {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let payload = ((seed >> 33) % 8) as usize;
        let words = simple::words_for(1, payload);

        let obj = mutator.allocate(words, &mut roots)?;
        // SAFETY: freshly allocated, formatted before the next allocation
        unsafe {
            simple::init(obj, words, 1);
            simple::set_ref(obj, 0, Address::new(roots.previous));
        }
        // pairs: every odd object holds its even predecessor
        roots.previous = if i % 2 == 0 { obj.as_usize() } else { 0 };

        if cli.keep_every != 0 && i % cli.keep_every == 0 {
            roots.keep(obj);
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let heap_bytes = cli.heap_size * 1024 * 1024;
    let settings = HeapSettings {
        initial_heap_size: heap_bytes,
        max_heap_size: heap_bytes,
        tlab_size: cli.tlab_size * 1024,
        ..HeapSettings::default()
    };

    let heap = match MSweepHeap::new(settings, simple::MODEL) {
        Ok(heap) => heap,
        Err(err) => {
            error!("could not initialize heap: {err}");
            process::exit(1);
        }
    };

    // a global handle keeps one object alive for the whole run
    let handles = HandleTable::new();
    heap.roots().register(RootKind::GlobalHandles, handles.clone());
    match heap.mem_allocate(simple::words_for(0, 4)) {
        Ok(obj) => {
            // SAFETY: freshly allocated, no mutator is running yet
            unsafe { simple::init(obj, simple::words_for(0, 4), 0) };
            handles.push(obj);
        }
        Err(err) => {
            error!("could not allocate global object: {err}");
            process::exit(1);
        }
    }

    let started = Instant::now();
    let cli_ref = &cli;
    let failures = thread::scope(|scope| {
        let workers: Vec<_> = (0..cli.threads)
            .map(|id| {
                let mutator = heap.mutator();
                scope.spawn(move || run_worker(mutator, id, cli_ref))
            })
            .collect();
        workers
            .into_iter()
            .filter_map(|worker| match worker.join() {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("worker panicked".to_string()),
            })
            .collect::<Vec<_>>()
    });

    for failure in &failures {
        error!("worker failed: {failure}");
    }

    for _ in 0..cli.cycles {
        if let Err(err) = heap.collect(GcCause::Explicit) {
            error!("explicit collection failed: {err}");
        }
    }

    let mut objects = 0usize;
    heap.object_iterate(|obj| {
        // SAFETY: the heap is parsable during iteration
        if !unsafe { simple::is_filler(obj) } {
            objects += 1;
        }
    });

    info!(
        "{} threads x {} objects in {:.3}s: {} collections, {} objects on the heap, {}K used of {}K",
        cli.threads,
        cli.objects,
        started.elapsed().as_secs_f64(),
        heap.collections(),
        objects,
        heap.used() / 1024,
        heap.capacity() / 1024
    );
    if let Some(last) = heap.last_cycle() {
        info!("last cycle: {last:?}");
    }

    if !failures.is_empty() {
        process::exit(1);
    }
}
