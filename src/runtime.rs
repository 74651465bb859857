//! Process-wide heap surface.
//!
//! Embedders that want a single global heap initialize it once with their
//! memory source and root provider, then call the free functions below from
//! the mutator. All entry points serialize on one lock; the collector itself
//! remains single-threaded stop-the-world.

use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::heap::{Heap, HeapError, HeapSettings, HeapStats};
use crate::mark::RootSource;
use crate::system::MemorySource;

struct Runtime {
    heap: Heap,
    roots: Box<dyn RootSource + Send>,
}

static RUNTIME: OnceLock<Mutex<Runtime>> = OnceLock::new();

fn runtime() -> &'static Mutex<Runtime> {
    RUNTIME.get().expect("heap runtime is not initialized")
}

/// Initialize the process-wide heap. Must run before any allocation.
pub fn init(
    settings: HeapSettings,
    source: Box<dyn MemorySource + Send>,
    roots: Box<dyn RootSource + Send>,
) -> Result<(), HeapError> {
    if RUNTIME.get().is_some() {
        return Err(HeapError::AlreadyInitialized);
    }
    let heap = Heap::new(settings, source)?;
    RUNTIME
        .set(Mutex::new(Runtime { heap, roots }))
        .map_err(|_| HeapError::AlreadyInitialized)
}

/// Allocate `size` zero-filled bytes from the process-wide heap.
pub fn alloc(size: usize) -> Result<NonNull<u8>, HeapError> {
    let mut rt = runtime().lock();
    let Runtime { heap, roots } = &mut *rt;
    heap.alloc(size, roots.as_mut())
}

/// Run a full collection cycle on the process-wide heap.
pub fn collect() {
    let mut rt = runtime().lock();
    let Runtime { heap, roots } = &mut *rt;
    heap.collect(roots.as_mut());
}

/// Counters of the process-wide heap.
pub fn stats() -> HeapStats {
    runtime().lock().heap.stats()
}

/// Present for source compatibility with runtimes that pin objects for
/// finalization. This collector has no finalizers, so there is nothing to
/// keep an object alive for; the call is accepted and ignored.
pub fn keep_alive(_obj: *const u8) {}

/// Present for source compatibility. Finalizers are not supported; the
/// registration is accepted and ignored.
pub fn set_finalizer(_obj: *const u8, _finalizer: fn(*mut u8)) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::Marker;
    use crate::system::SystemSource;

    /// Root provider with no regions: every allocation is garbage.
    struct NoRoots;

    impl RootSource for NoRoots {
        fn scan_stack(&mut self, _marker: &mut Marker) {}
        fn scan_globals(&mut self, _marker: &mut Marker) {}
    }

    // The singleton can only be initialized once per process, so the whole
    // surface is exercised in a single test.
    #[test]
    fn global_surface_round_trip() {
        let settings = HeapSettings {
            heap_size: 1024 * 1024,
            ..Default::default()
        };
        init(settings.clone(), Box::new(SystemSource), Box::new(NoRoots))
            .expect("first init succeeds");

        let p = alloc(64).expect("alloc");
        assert_eq!(p.as_ptr() as usize % 8, 0);

        let s = alloc(0).expect("sentinel");
        assert_eq!(s, alloc(0).expect("sentinel again"));

        keep_alive(p.as_ptr());
        set_finalizer(p.as_ptr(), |_| {});

        collect();
        let stats = stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);

        assert_eq!(
            init(settings, Box::new(SystemSource), Box::new(NoRoots)),
            Err(HeapError::AlreadyInitialized)
        );
    }
}
