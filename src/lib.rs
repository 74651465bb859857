//! Conservative, non-moving mark-and-sweep heap for runtimes that cannot
//! identify pointers at the machine-word level.
//!
//! The heap carves one contiguous region (from a [`MemorySource`]) into
//! four-word blocks with packed two-bit states stored at the top of the
//! region. Allocation is a rotating first-fit scan that escalates to a
//! collection cycle and then to in-place region growth. Marking is
//! conservative: any word in a root region or a live object that falls
//! inside the block area is treated as a pointer, with interior pointers
//! resolved to their object. Nothing ever moves.
//!
//! Embedders provide the memory source and a [`RootSource`] enumerating
//! their stacks and globals, then either own a [`Heap`] value directly or
//! go through the process-wide surface in [`init`]/[`alloc`]/[`collect`].

mod heap;
mod mark;
mod meta;
mod runtime;
mod system;

pub use heap::{Heap, HeapError, HeapSettings, HeapStats};
pub use mark::{Marker, RootSource};
pub use meta::{BYTES_PER_BLOCK, WORDS_PER_BLOCK};
pub use runtime::{alloc, collect, init, keep_alive, set_finalizer, stats};
pub use system::{MemorySource, OS_PAGE_SIZE, ReservedSource, SystemSource, map_memory};
