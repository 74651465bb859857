//! Conservative marking.
//!
//! Any word-aligned machine word whose value falls inside the block area is
//! treated as a potential pointer; no type information is consulted.
//! Interior pointers resolve to their object through the tail-block walk.
//! Traversal uses a four-entry explicit stack; when it overflows, dropped
//! children are recovered by re-scanning every marked block until a pass
//! completes without overflowing again.

use crate::meta::{Block, BlockState, Extent, WORD_SIZE};

/// Capacity of the bounded mark stack. A larger stack would have to be
/// statically reserved or heap-allocated, and allocating during a collection
/// cycle is impossible; the overflow re-scan covers the remainder.
pub(crate) const MARK_STACK_SIZE: usize = 4;

/// Root regions supplied by the embedding runtime.
///
/// Each operation calls [`Marker::mark_range`] over every word-aligned region
/// that may hold pointers: active thread stacks for `scan_stack`, static
/// data/bss for `scan_globals`. Both must be callable from inside an
/// allocation that triggered a collection.
pub trait RootSource {
    fn scan_stack(&mut self, marker: &mut Marker);
    fn scan_globals(&mut self, marker: &mut Marker);
}

/// One collection cycle's marking state.
pub struct Marker {
    extent: Extent,
    /// Set when `trace` had to drop a discovered child because the bounded
    /// stack was full. Always consumed by `finish` before the cycle ends.
    stack_overflow: bool,
}

impl Marker {
    pub(crate) fn new(extent: Extent) -> Marker {
        Marker {
            extent,
            stack_overflow: false,
        }
    }

    /// Conservatively scan the word-aligned range `[start, end)`.
    ///
    /// Every word is loaded and classified; words that resolve to a live
    /// block mark that block's object and everything reachable from it.
    pub fn mark_range(&mut self, start: usize, end: usize) {
        debug_assert!(start % WORD_SIZE == 0, "unaligned range start");
        debug_assert!(end % WORD_SIZE == 0, "unaligned range end");
        let mut addr = start;
        while addr + WORD_SIZE <= end {
            // SAFETY: the caller vouches the range is readable; alignment
            // was checked above.
            let word = unsafe { read_word(addr) };
            self.mark_word(word);
            addr += WORD_SIZE;
        }
    }

    /// Classify one root word and trace from it if it refers to a live,
    /// not-yet-marked object.
    fn mark_word(&mut self, word: usize) {
        if !self.extent.looks_like_pointer(word) {
            return;
        }
        let block = self.extent.block_of(word);
        if self.extent.state(block) == BlockState::Free {
            // No object there; most likely a false positive.
            return;
        }
        let head = self.extent.find_head(block);
        if self.extent.state(head) != BlockState::Mark {
            self.trace(head);
        }
    }

    /// Depth-first traversal from `root` over the bounded stack.
    ///
    /// Discovered children are marked before being pushed, so a child
    /// dropped on overflow stays marked and is re-entered by `finish`.
    fn trace(&mut self, root: Block) {
        let mut stack = [root; MARK_STACK_SIZE];
        let mut len = 1;
        self.extent.set_state(root, BlockState::Mark);

        while len > 0 {
            len -= 1;
            let block = stack[len];

            // Scan every word of the object's blocks.
            let start = self.extent.addr_of(block);
            let end = self.extent.addr_of(self.extent.find_next(block));
            let mut addr = start;
            while addr < end {
                // SAFETY: `[start, end)` lies inside the block area of the
                // mapped region and is word-aligned.
                let word = unsafe { read_word(addr) };
                addr += WORD_SIZE;

                if !self.extent.looks_like_pointer(word) {
                    continue;
                }
                let referenced = self.extent.block_of(word);
                if self.extent.state(referenced) == BlockState::Free {
                    continue;
                }
                let head = self.extent.find_head(referenced);
                if self.extent.state(head) == BlockState::Mark {
                    continue;
                }
                self.extent.set_state(head, BlockState::Mark);

                if len == MARK_STACK_SIZE {
                    // The child stays marked; its own children are picked
                    // up by the re-scan in `finish`.
                    self.stack_overflow = true;
                    continue;
                }
                stack[len] = head;
                len += 1;
            }
        }
    }

    /// Re-scan marked blocks until no pass drops a child.
    ///
    /// Terminates because the marked set only grows and is bounded by the
    /// block count: a pass that re-arms the flag must have marked at least
    /// one new block, and already-marked children short-circuit. Must stay
    /// an explicit loop; recursing here would unbound the call stack.
    pub(crate) fn finish(&mut self) {
        while self.stack_overflow {
            self.stack_overflow = false;
            for index in 0..self.extent.end_block {
                let block = Block(index);
                if self.extent.state(block) != BlockState::Mark {
                    continue;
                }
                self.trace(block);
            }
        }
    }
}

/// The single conservative-scanning primitive: load one machine word.
///
/// # Safety
/// `addr` must be word-aligned and readable for `WORD_SIZE` bytes.
#[inline(always)]
unsafe fn read_word(addr: usize) -> usize {
    // SAFETY: guaranteed by the caller.
    unsafe { (addr as *const usize).read() }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BLOCKS_PER_STATE_BYTE, BYTES_PER_BLOCK};

    /// Word-aligned buffer laid out as a heap of exactly `blocks` blocks.
    fn region(blocks: usize) -> (Vec<usize>, Extent) {
        let total = blocks * BYTES_PER_BLOCK + blocks.div_ceil(BLOCKS_PER_STATE_BYTE);
        let mut buf = vec![0usize; total.div_ceil(WORD_SIZE)];
        let start = buf.as_mut_ptr() as usize;
        let extent = Extent::compute(start, start + total);
        extent.zero_metadata();
        assert_eq!(extent.end_block, blocks);
        (buf, extent)
    }

    /// Write `word` into word slot `slot` of block `b`.
    fn poke(extent: &Extent, b: Block, slot: usize, word: usize) {
        let addr = extent.addr_of(b) + slot * WORD_SIZE;
        // SAFETY: inside the buffer backing the extent.
        unsafe { (addr as *mut usize).write(word) };
    }

    /// Scan a root buffer holding the given words.
    fn scan_roots(marker: &mut Marker, roots: &[usize]) {
        let start = roots.as_ptr() as usize;
        marker.mark_range(start, start + roots.len() * WORD_SIZE);
    }

    #[test]
    fn root_pointer_marks_its_object() {
        let (_buf, extent) = region(8);
        extent.set_state(Block(2), BlockState::Head);
        extent.set_state(Block(3), BlockState::Tail);

        let mut marker = Marker::new(extent);
        scan_roots(&mut marker, &[extent.addr_of(Block(2))]);
        marker.finish();

        assert_eq!(extent.state(Block(2)), BlockState::Mark);
        assert_eq!(extent.state(Block(3)), BlockState::Tail);
    }

    #[test]
    fn interior_pointer_resolves_to_the_head() {
        let (_buf, extent) = region(8);
        extent.set_state(Block(1), BlockState::Head);
        extent.set_state(Block(2), BlockState::Tail);
        extent.set_state(Block(3), BlockState::Tail);

        let mut marker = Marker::new(extent);
        let interior = extent.addr_of(Block(2)) + WORD_SIZE;
        scan_roots(&mut marker, &[interior]);
        marker.finish();

        assert_eq!(extent.state(Block(1)), BlockState::Mark);
    }

    #[test]
    fn free_blocks_and_foreign_words_are_ignored() {
        let (_buf, extent) = region(8);
        extent.set_state(Block(5), BlockState::Head);

        let mut marker = Marker::new(extent);
        scan_roots(
            &mut marker,
            &[
                extent.addr_of(Block(1)), // free block
                extent.metadata_start,    // out of scanning range
                0x10,                     // nowhere near the heap
            ],
        );
        marker.finish();

        for i in 0..8 {
            assert_ne!(extent.state(Block(i)), BlockState::Mark);
        }
    }

    #[test]
    fn references_between_objects_are_followed() {
        let (_buf, extent) = region(8);
        extent.set_state(Block(0), BlockState::Head);
        extent.set_state(Block(4), BlockState::Head);
        extent.set_state(Block(5), BlockState::Tail);
        poke(&extent, Block(0), 1, extent.addr_of(Block(4)));

        let mut marker = Marker::new(extent);
        scan_roots(&mut marker, &[extent.addr_of(Block(0))]);
        marker.finish();

        assert_eq!(extent.state(Block(0)), BlockState::Mark);
        assert_eq!(extent.state(Block(4)), BlockState::Mark);
    }

    #[test]
    fn deep_chain_is_fully_marked() {
        // Each object's first word points at the next one. Traversal depth
        // stays at one because children are popped before more are found.
        let (_buf, extent) = region(12);
        for i in 0..10 {
            extent.set_state(Block(i), BlockState::Head);
        }
        for i in 0..9 {
            poke(&extent, Block(i), 0, extent.addr_of(Block(i + 1)));
        }

        let mut marker = Marker::new(extent);
        scan_roots(&mut marker, &[extent.addr_of(Block(0))]);
        marker.finish();

        assert!(!marker.stack_overflow);
        for i in 0..10 {
            assert_eq!(extent.state(Block(i)), BlockState::Mark, "block {i}");
        }
    }

    #[test]
    fn wide_fanout_overflows_and_recovers() {
        // A two-block object whose eight words reference eight distinct
        // objects: four fit on the stack, four are dropped with the
        // overflow flag set. Two of the dropped children carry their own
        // references, which only the re-scan can reach.
        let (_buf, extent) = region(16);
        extent.set_state(Block(0), BlockState::Head);
        extent.set_state(Block(1), BlockState::Tail);
        for i in 2..12 {
            extent.set_state(Block(i), BlockState::Head);
        }
        for slot in 0..8 {
            poke(&extent, Block(slot / 4), slot % 4, extent.addr_of(Block(slot + 2)));
        }
        poke(&extent, Block(8), 0, extent.addr_of(Block(10)));
        poke(&extent, Block(9), 0, extent.addr_of(Block(11)));

        let mut marker = Marker::new(extent);
        scan_roots(&mut marker, &[extent.addr_of(Block(0))]);
        assert!(marker.stack_overflow);
        marker.finish();
        assert!(!marker.stack_overflow);

        assert_eq!(extent.state(Block(0)), BlockState::Mark);
        assert_eq!(extent.state(Block(1)), BlockState::Tail);
        for i in 2..12 {
            assert_eq!(extent.state(Block(i)), BlockState::Mark, "block {i}");
        }
    }

    #[test]
    fn cycles_terminate() {
        let (_buf, extent) = region(8);
        extent.set_state(Block(0), BlockState::Head);
        extent.set_state(Block(1), BlockState::Head);
        poke(&extent, Block(0), 0, extent.addr_of(Block(1)));
        poke(&extent, Block(1), 0, extent.addr_of(Block(0)));

        let mut marker = Marker::new(extent);
        scan_roots(&mut marker, &[extent.addr_of(Block(0))]);
        marker.finish();

        assert_eq!(extent.state(Block(0)), BlockState::Mark);
        assert_eq!(extent.state(Block(1)), BlockState::Mark);
    }

    #[test]
    fn empty_range_scans_nothing() {
        let (_buf, extent) = region(4);
        let mut marker = Marker::new(extent);
        let base = extent.heap_start;
        marker.mark_range(base, base);
        marker.finish();
        for i in 0..4 {
            assert_eq!(extent.state(Block(i)), BlockState::Free);
        }
    }
}
