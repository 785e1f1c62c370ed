//! A page-backed arena allocator.
//!
//! The arena bump-allocates out of frames drawn straight from the
//! [`FrameManager`], returning direct-map pointers. It exists for the window
//! early in boot where something needs sub-page allocations but no real
//! heap is up yet. Individual frees are not supported; the whole arena is
//! torn down at once with `dispose`, which returns every frame.
//!
//! The arena's own control state lives at the start of its first frame, and
//! every frame begins with a link to the next one, so the arena occupies
//! nothing but the frames it hands out.

use core::ptr::addr_of_mut;

use super::addr::{Length, PhysAddress};
use super::alloc::{Block, RawAllocator};
use super::hhdm;
use super::page::PAGE_SIZE;
use super::phys::FrameManager;

/// Alignments beyond 2 KiB make no sense for sub-page allocations.
pub const MAX_ALIGN_SHIFT: u32 = 11;

/// Every arena frame starts with one of these; the chain is what `dispose`
/// walks.
#[derive(Clone, Copy)]
#[repr(C)]
struct FrameLink {
    /// Physical address of the next frame, zero at the tail.
    next: u64,
}

/// Lives at offset 0 of the first frame. `link` must stay the first field
/// so the chain walk can treat the head frame like any other.
#[derive(Clone, Copy)]
#[repr(C)]
struct ArenaHeader {
    link: FrameLink,
    /// Frame the cursor points into.
    current: u64,
    /// Offset of the next free byte within the current frame.
    cursor: u32,
    p2align: u32,
    frames: FrameManager,
}

/// Handle to an arena; the state itself sits in the arena's first frame.
#[derive(Clone, Copy, Debug)]
pub struct ArenaAllocator {
    head: PhysAddress,
}

impl ArenaAllocator {
    /// Builds an arena drawing from `frames`, rounding every allocation up
    /// to `1 << p2align` bytes. Returns `None` when no frame is available
    /// for the arena itself.
    ///
    /// # Panics
    ///
    /// Panics if `p2align` exceeds [`MAX_ALIGN_SHIFT`].
    pub fn new(mut frames: FrameManager, p2align: u32) -> Option<ArenaAllocator> {
        assert!(p2align <= MAX_ALIGN_SHIFT, "alignment shift {p2align} too large");

        let page = frames.allocate();
        if page.is_null() {
            return None;
        }

        let header = ArenaHeader {
            link: FrameLink { next: 0 },
            current: page.as_raw(),
            cursor: align_to(core::mem::size_of::<ArenaHeader>(), p2align) as u32,
            p2align,
            frames,
        };
        unsafe {
            hhdm::phys_to_virt(page)
                .as_mut_ptr::<ArenaHeader>()
                .write(header);
        }

        Some(ArenaAllocator { head: page })
    }

    fn header_ptr(&self) -> *mut ArenaHeader {
        hhdm::phys_to_virt(self.head).as_mut_ptr()
    }
}

impl RawAllocator for ArenaAllocator {
    fn raw_alloc(&mut self, size: usize) -> Block {
        let header = self.header_ptr();
        let (p2align, mut current, mut cursor) =
            unsafe { ((*header).p2align, (*header).current, (*header).cursor as usize) };

        let page_size = PAGE_SIZE.as_raw() as usize;
        let size = align_to(size, p2align);
        let fresh_cursor = align_to(core::mem::size_of::<FrameLink>(), p2align);

        // Only sub-page allocations are supported, and a block must fit in
        // a frame alongside the frame's link header.
        if size >= page_size || fresh_cursor + size > page_size {
            return Block::EMPTY;
        }

        if cursor + size > page_size {
            let mut frames = unsafe { (*header).frames };
            let page = frames.allocate();
            if page.is_null() {
                return Block::EMPTY;
            }

            unsafe {
                link_ptr(page).write(FrameLink { next: 0 });
                (*link_ptr(PhysAddress::from_raw(current))).next = page.as_raw();
                addr_of_mut!((*header).current).write(page.as_raw());
            }
            current = page.as_raw();
            cursor = fresh_cursor;
        }

        let ptr = (hhdm::phys_to_virt(PhysAddress::from_raw(current))
            + Length::from_raw(cursor as u64))
        .as_mut_ptr();
        unsafe {
            addr_of_mut!((*header).cursor).write((cursor + size) as u32);
        }
        Block { ptr, size }
    }

    // No raw_free: arena blocks are reclaimed only at dispose. The
    // interface wrapper silently drops frees.

    fn raw_dispose(&mut self) {
        let mut frames = unsafe { (*self.header_ptr()).frames };
        let mut page = self.head.as_raw();
        while page != 0 {
            let next = unsafe { (*link_ptr(PhysAddress::from_raw(page))).next };
            frames.deallocate(PhysAddress::from_raw(page));
            page = next;
        }
    }
}

fn link_ptr(frame: PhysAddress) -> *mut FrameLink {
    hhdm::phys_to_virt(frame).as_mut_ptr()
}

fn align_to(value: usize, p2align: u32) -> usize {
    let step = 1usize << p2align;
    (value + step - 1) & !(step - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::alloc::Allocator;
    use crate::memory::testutil::SimMemory;

    use memoffset::offset_of;
    use std::vec::Vec;

    #[test]
    fn header_layout() {
        // The chain walk depends on the link sitting at the frame start.
        assert_eq!(offset_of!(ArenaHeader, link), 0);
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let mem = SimMemory::new(80);
        let manager = mem.manager();
        let free_before = manager.stats().free;

        let mut arena = ArenaAllocator::new(manager, 4).unwrap();

        let mut blocks = Vec::new();
        for i in 0..40 {
            let block = arena.alloc(5 * i + 50);
            assert!(!block.is_empty());
            assert!(block.size >= 5 * i + 50);
            assert_eq!(block.ptr as usize % 16, 0);
            blocks.push(block);
        }

        // Pairwise disjoint.
        let mut spans: Vec<(usize, usize)> = blocks
            .iter()
            .map(|b| (b.ptr as usize, b.ptr as usize + b.size))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{pair:?}");
        }

        // The run crossed at least one frame boundary.
        assert!(manager.stats().free < free_before - 1);

        // Writes through one block stay inside it.
        unsafe {
            core::ptr::write_bytes(blocks[3].ptr, 0xab, blocks[3].size);
        }

        arena.dispose();
        assert_eq!(manager.stats().free, free_before);
    }

    #[test]
    fn rejects_page_sized_requests() {
        let mem = SimMemory::new(80);
        let mut arena = ArenaAllocator::new(mem.manager(), 4).unwrap();

        assert_eq!(arena.alloc(4096), Block::EMPTY);
        assert_eq!(arena.alloc(8192), Block::EMPTY);
        // 4090 rounds up to 4096 under the 16-byte alignment.
        assert_eq!(arena.alloc(4090), Block::EMPTY);
        // Zero-size short-circuits in the wrapper.
        assert_eq!(arena.alloc(0), Block::EMPTY);
    }

    #[test]
    fn free_is_dropped_and_realloc_falls_back() {
        let mem = SimMemory::new(80);
        let manager = mem.manager();
        let mut arena = ArenaAllocator::new(manager, 3).unwrap();

        let block = arena.alloc(24);
        unsafe {
            block.ptr.copy_from(b"twenty-four byte payload".as_ptr(), 24);
        }
        let used = manager.stats().used;

        // Arena free is a silent no-op; nothing comes back.
        arena.free(block);
        assert_eq!(manager.stats().used, used);

        // Realloc takes the allocate-and-copy path.
        let bigger = arena.realloc(block, 48);
        assert!(!bigger.is_empty());
        assert_ne!(bigger.ptr, block.ptr);
        assert_eq!(
            unsafe { core::slice::from_raw_parts(bigger.ptr, 24) },
            b"twenty-four byte payload"
        );
    }

    #[test]
    fn exhaustion_fails_cleanly() {
        // 64-frame block: 63 usable frames, one taken by the arena header.
        let mem = SimMemory::new(66);
        let manager = mem.manager_with_pages(64);
        let mut arena = ArenaAllocator::new(manager, 4).unwrap();

        // Each near-page block forces a fresh frame.
        let mut served = 0;
        loop {
            let block = arena.alloc(4080);
            if block.is_empty() {
                break;
            }
            served += 1;
        }
        assert_eq!(served, 62);
        assert_eq!(manager.stats().free, 0);

        arena.dispose();
        assert_eq!(manager.stats().free, 63);
    }

    #[test]
    fn construction_fails_without_frames() {
        let mem = SimMemory::new(66);
        let mut manager = mem.manager_with_pages(64);
        while !manager.allocate().is_null() {}

        assert!(ArenaAllocator::new(manager, 4).is_none());
    }
}
