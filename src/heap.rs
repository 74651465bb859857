//! The heap: a first-fit block allocator over one contiguous region, with a
//! conservative mark-and-sweep collector reclaiming unreachable runs.
//!
//! - Allocation rounds up to whole blocks and scans for a free run from a
//!   rotating cursor. A fruitless full circle escalates: first a collection
//!   cycle, then in-place region growth, then [`HeapError::OutOfMemory`].
//! - Collection is stop-the-world on the allocating thread; roots come from
//!   the embedder through [`RootSource`].
//! - Nothing ever moves. Pointers handed out stay valid until the object
//!   becomes unreachable.

use std::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

use crate::mark::{Marker, RootSource};
use crate::meta::{BLOCKS_PER_STATE_BYTE, BYTES_PER_BLOCK, Block, BlockState, Extent};
use crate::system::MemorySource;

// ── Settings ──────────────────────────────────────────────────────────

/// Tunables for a heap instance.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Initial size of the heap region in bytes.
    pub heap_size: usize,
    /// A collection that leaves less than `1 / headroom_divisor` of the
    /// block area free requests growth immediately, damping collection
    /// frequency under sustained pressure.
    pub headroom_divisor: usize,
    /// Factor by which a growth request enlarges the region.
    pub grow_factor: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 128 * 1024 * 1024, // 128 MiB
            headroom_divisor: 3,
            grow_factor: 2,
        }
    }
}

impl HeapSettings {
    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 {
            return Err("heap_size must be > 0");
        }
        if self.headroom_divisor == 0 {
            return Err("headroom_divisor must be > 0");
        }
        if self.grow_factor < 2 {
            return Err("grow_factor must be >= 2");
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// Collection and region growth both failed to satisfy a non-zero
    /// request. The allocator never returns a null or dangling address.
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),
    /// The process-wide runtime was initialized twice.
    #[error("heap runtime already initialized")]
    AlreadyInitialized,
}

// ── Statistics ────────────────────────────────────────────────────────

/// Lifetime counters, updated by the allocator and the sweeper.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Total bytes requested, summed over all allocations.
    pub total_allocated: u64,
    /// Number of allocation requests. Zero-size requests are not counted.
    pub allocations: u64,
    /// Number of objects reclaimed by sweeps.
    pub frees: u64,
    /// Number of completed collection cycles.
    pub collections: u64,
}

/// Returned for zero-size requests: a fixed address outside the heap region,
/// never written through and never scanned.
static ZERO_SIZED: u8 = 0;

// ── Heap ──────────────────────────────────────────────────────────────

/// A conservative mark-and-sweep heap. Owns the region, the allocation
/// cursor, and the statistics; every state transition of every block goes
/// through methods of this value.
pub struct Heap {
    extent: Extent,
    /// Block index where the next first-fit scan begins. Wraps at the end
    /// of the block area.
    next_alloc: Block,
    settings: HeapSettings,
    source: Box<dyn MemorySource + Send>,
    stats: HeapStats,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("extent", &self.extent)
            .field("next_alloc", &self.next_alloc)
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Reserve the region from `source` and lay it out. The region is held
    /// for the rest of the process; it is grown in place, never released.
    pub fn new(
        settings: HeapSettings,
        mut source: Box<dyn MemorySource + Send>,
    ) -> Result<Heap, HeapError> {
        settings.validate().map_err(HeapError::InvalidSettings)?;
        let region = source
            .reserve(settings.heap_size)
            .ok_or(HeapError::OutOfMemory)?;
        let heap_start = region.as_ptr() as usize;
        let extent = Extent::compute(heap_start, heap_start + settings.heap_size);
        extent.zero_metadata();
        Ok(Heap {
            extent,
            next_alloc: Block(0),
            settings,
            source,
            stats: HeapStats::default(),
        })
    }

    /// Allocate `size` zero-filled bytes, block-aligned.
    ///
    /// `size == 0` returns a fixed sentinel that does not occupy heap space.
    /// Fails only when a collection cycle and a growth attempt both leave no
    /// free run of the required length.
    pub fn alloc(
        &mut self,
        size: usize,
        roots: &mut dyn RootSource,
    ) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Ok(NonNull::from(&ZERO_SIZED));
        }

        self.stats.total_allocated += size as u64;
        self.stats.allocations += 1;

        let need = size.div_ceil(BYTES_PER_BLOCK);

        // Scan until a run of `need` free blocks appears, escalating every
        // time the cursor comes back around: one full circle proves no run
        // exists, so collect; a second proves collection was not enough, so
        // grow or give up.
        let mut index = self.next_alloc;
        let mut run = 0usize;
        let mut circles = 0u8;
        loop {
            if index == self.next_alloc {
                if circles == 0 {
                    circles = 1;
                } else if circles == 1 {
                    circles = 2;
                    let free_bytes = self.collect(roots);
                    if free_bytes < self.extent.heap_bytes() / self.settings.headroom_divisor {
                        // Too little headroom: pressure will recur soon,
                        // grow now whether or not this request fits.
                        self.grow();
                    }
                } else if !self.grow() {
                    return Err(HeapError::OutOfMemory);
                }
            }

            if index.0 == self.extent.end_block {
                // An object may not straddle the wrap. A zero-block heap
                // also lands here until growth provides space.
                index = Block(0);
                run = 0;
                continue;
            }

            if self.extent.state(index) != BlockState::Free {
                run = 0;
                index = Block(index.0 + 1);
                continue;
            }
            run += 1;
            index = Block(index.0 + 1);

            if run == need {
                return Ok(self.commit(index, need, size));
            }
        }
    }

    /// Reserve the run ending just before `end`, zero the payload, and hand
    /// out the head address.
    fn commit(&mut self, end: Block, need: usize, size: usize) -> NonNull<u8> {
        self.next_alloc = end;
        let head = Block(end.0 - need);
        self.extent.set_state(head, BlockState::Head);
        for b in head.0 + 1..end.0 {
            self.extent.set_state(Block(b), BlockState::Tail);
        }

        let ptr = self.extent.addr_of(head) as *mut u8;
        // SAFETY: the run lies inside the block area and was just reserved.
        unsafe { ptr.write_bytes(0, size) };
        // SAFETY: block-area addresses are never null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Run a full collection cycle: conservatively mark everything reachable
    /// from the embedder's roots, then sweep. Returns the number of free
    /// bytes in the block area afterwards.
    pub fn collect(&mut self, roots: &mut dyn RootSource) -> usize {
        let mut marker = Marker::new(self.extent);
        roots.scan_stack(&mut marker);
        roots.scan_globals(&mut marker);
        marker.finish();

        let free_bytes = self.sweep();
        self.stats.collections += 1;
        debug!(free_bytes, "collection cycle finished");
        free_bytes
    }

    /// One pass over all blocks: free unmarked objects, demote marked heads
    /// for the next cycle, count free bytes.
    fn sweep(&mut self) -> usize {
        let mut free_bytes = 0;
        let mut freeing = false;
        for index in 0..self.extent.end_block {
            let block = Block(index);
            match self.extent.state(block) {
                BlockState::Head => {
                    // Still Head after marking: unreachable. Free it and
                    // the tail run behind it.
                    self.extent.mark_free(block);
                    freeing = true;
                    self.stats.frees += 1;
                    free_bytes += BYTES_PER_BLOCK;
                }
                BlockState::Tail => {
                    if freeing {
                        self.extent.mark_free(block);
                        free_bytes += BYTES_PER_BLOCK;
                    }
                }
                BlockState::Mark => {
                    self.extent.unmark(block);
                    freeing = false;
                }
                BlockState::Free => free_bytes += BYTES_PER_BLOCK,
            }
        }
        free_bytes
    }

    /// Ask the source to enlarge the region in place, then recompute the
    /// layout and relocate the packed states of all pre-existing blocks.
    #[cold]
    fn grow(&mut self) -> bool {
        let old = self.extent;
        let old_bytes = old.heap_end - old.heap_start;
        let new_bytes = old_bytes.saturating_mul(self.settings.grow_factor);
        let Some(region) = NonNull::new(old.heap_start as *mut u8) else {
            return false;
        };
        if !self.source.grow(region, old_bytes, new_bytes) {
            return false;
        }

        self.extent = Extent::compute(old.heap_start, old.heap_start + new_bytes);
        let used = old.end_block.div_ceil(BLOCKS_PER_STATE_BYTE);
        let metadata_bytes = self.extent.heap_end - self.extent.metadata_start;
        // SAFETY: both state areas lie inside the grown region; the copy
        // may overlap when the region is large, which `copy` permits. New
        // slots beyond the old block count are cleared to Free.
        unsafe {
            core::ptr::copy(
                old.metadata_start as *const u8,
                self.extent.metadata_start as *mut u8,
                used,
            );
            (self.extent.metadata_start as *mut u8)
                .add(used)
                .write_bytes(0, metadata_bytes - used);
        }
        debug!(old_bytes, new_bytes, "heap region grown in place");
        true
    }

    /// Whether `addr` points into the block area.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.extent.looks_like_pointer(addr)
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Render one glyph per block, 64 per row: `*` head, `-` tail, `#`
    /// mark, `·` free. Intended for the embedder's debug dumping facility.
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(self.extent.end_block * 2 + 2);
        for index in 0..self.extent.end_block {
            out.push(self.extent.state(Block(index)).glyph());
            if index % 64 == 63 || index + 1 == self.extent.end_block {
                out.push('\n');
            }
        }
        out
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
