//! Virtual address-space range accounting.
//!
//! An [`AddressSpace`] tracks which sub-ranges of an abstract address
//! window are reserved. Reservations live in a sorted singly-linked list of
//! region nodes; the nodes themselves sit in slots of page-sized storage
//! blocks obtained from the [`FrameManager`], and exhausted nodes are
//! recycled through a free list rather than returned.
//!
//! Links are not pointers but packed `(block, slot)` references: the block
//! is page-aligned, so its low twelve bits are free to carry the slot
//! index. That keeps the structure position-independent and makes the node
//! accounting trivially checkable: every node a block has ever handed out
//! is on exactly one of the two lists.

use core::ptr::addr_of_mut;

use static_assertions as sa;

use super::addr::{Length, PhysAddress, VirtAddress};
use super::hhdm;
use super::page::PAGE_SIZE;
use super::phys::FrameManager;

/// Region nodes per storage block.
pub const NODES_PER_BLOCK: usize = 100;

/// Packed reference to a node slot: the storage block's physical address
/// with the slot index in the low bits. Zero means "none".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
struct NodeRef(u64);

impl NodeRef {
    const NONE: NodeRef = NodeRef(0);

    fn new(block: u64, slot: usize) -> NodeRef {
        debug_assert!(slot < NODES_PER_BLOCK);
        NodeRef(block | slot as u64)
    }

    fn is_none(self) -> bool {
        self.0 == 0
    }

    fn block(self) -> u64 {
        self.0 & !0xfff
    }

    fn slot(self) -> usize {
        (self.0 & 0xfff) as usize
    }
}

/// One reserved range `[begin, end)`.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct RegionNode {
    next: NodeRef,
    begin: u64,
    end: u64,
}

const ZERO_NODE: RegionNode = RegionNode {
    next: NodeRef::NONE,
    begin: 0,
    end: 0,
};

#[repr(C, align(4096))]
struct StorageBlock {
    /// Physical address of the next block, zero at the tail.
    next: u64,
    /// Slots handed out so far; slots below this index are live nodes.
    entries: u32,
    _reserved: u32,
    nodes: [RegionNode; NODES_PER_BLOCK],
}

sa::assert_eq_size!(StorageBlock, [u8; 4096]);

/// Control state, in a frame of its own. The rest of that frame is unused;
/// a sub-page allocator could reclaim it.
#[derive(Clone, Copy)]
#[repr(C)]
struct SpaceHeader {
    frames: FrameManager,
    /// Head of the storage-block chain.
    storage: u64,
    /// Sorted list of reserved regions.
    allocated: NodeRef,
    /// Recycled nodes.
    unused: NodeRef,
    begin: u64,
    end: u64,
}

/// Handle to an address-space allocator over the window `[begin, end)`.
#[derive(Clone, Copy, Debug)]
pub struct AddressSpace {
    header: PhysAddress,
}

impl AddressSpace {
    /// Creates an empty address space over `[begin, end)`, taking one frame
    /// from `frames` for the control state.
    ///
    /// # Panics
    ///
    /// Panics if the window is empty or no frame is available.
    pub fn new(mut frames: FrameManager, begin: VirtAddress, end: VirtAddress) -> AddressSpace {
        assert!(begin < end, "empty window {begin:?}..{end:?}");

        let page = frames.allocate();
        assert!(!page.is_null(), "no frame for address-space bookkeeping");

        let header = SpaceHeader {
            frames,
            storage: 0,
            allocated: NodeRef::NONE,
            unused: NodeRef::NONE,
            begin: begin.as_raw(),
            end: end.as_raw(),
        };
        unsafe {
            hhdm::phys_to_virt(page)
                .as_mut_ptr::<SpaceHeader>()
                .write(header);
        }

        AddressSpace { header: page }
    }

    /// Reserves `size` bytes at the lowest free position, or `None` when no
    /// gap is large enough. A gap directly after an existing region grows
    /// that region instead of creating a new one, so a region may cover
    /// several reservations.
    pub fn allocate(&mut self, size: Length) -> Option<VirtAddress> {
        let size = size.as_raw();
        if size == 0 {
            return None;
        }

        let hp = self.header_ptr();
        let (begin, end, head) = unsafe { ((*hp).begin, (*hp).end, (*hp).allocated) };

        // The gap below the first region is the only one with no region to
        // grow; it gets a fresh node at the list head.
        let free_end = if head.is_none() {
            end
        } else {
            self.node(head).begin
        };
        if free_end - begin >= size {
            let fresh = self.take_node();
            self.set_node(
                fresh,
                RegionNode {
                    next: head,
                    begin,
                    end: begin + size,
                },
            );
            unsafe {
                addr_of_mut!((*hp).allocated).write(fresh);
            }
            return Some(VirtAddress::from_raw(begin));
        }

        let mut cursor = head;
        while !cursor.is_none() {
            let node = self.node(cursor);
            let free_begin = node.end;
            let free_end = if node.next.is_none() {
                end
            } else {
                self.node(node.next).begin
            };
            if free_end - free_begin >= size {
                self.set_node(
                    cursor,
                    RegionNode {
                        end: node.end + size,
                        ..node
                    },
                );
                return Some(VirtAddress::from_raw(free_begin));
            }
            cursor = node.next;
        }

        None
    }

    /// Releases `[addr, addr + size)`. Parts of the range that are not
    /// reserved are ignored, so freeing is infallible; a region reserved in
    /// one piece may be released in several, and vice versa. `free(0, _)`
    /// is a no-op.
    pub fn free(&mut self, addr: VirtAddress, size: Length) {
        let a = addr.as_raw();
        let b = a + size.as_raw();
        let hp = self.header_ptr();

        // `prev` trails `cursor`; NONE stands for the list head pointer.
        let mut prev = NodeRef::NONE;
        let mut cursor = unsafe { (*hp).allocated };

        while !cursor.is_none() {
            let node = self.node(cursor);
            let next = node.next;

            if b < node.begin {
                // Entirely below this and every later region.
                return;
            } else if node.end < a {
                prev = cursor;
            } else if a <= node.begin && node.end <= b {
                // Swallowed whole: unlink and recycle the node.
                self.set_next(prev, next);
                let unused = unsafe { (*hp).unused };
                self.set_node(cursor, RegionNode { next: unused, ..node });
                unsafe {
                    addr_of_mut!((*hp).unused).write(cursor);
                }
            } else if a <= node.begin {
                self.set_node(cursor, RegionNode { begin: b, ..node });
                prev = cursor;
            } else if node.end <= b {
                self.set_node(cursor, RegionNode { end: a, ..node });
                prev = cursor;
            } else {
                // Strictly interior: split off the tail.
                let tail = self.take_node();
                self.set_node(
                    tail,
                    RegionNode {
                        next,
                        begin: b,
                        end: node.end,
                    },
                );
                self.set_node(
                    cursor,
                    RegionNode {
                        next: tail,
                        begin: node.begin,
                        end: a,
                    },
                );
                prev = tail;
            }

            cursor = next;
        }
    }

    /// Logs the window, storage usage and every reserved region.
    ///
    /// # Panics
    ///
    /// Panics if a node has leaked from both lists, since that means the
    /// structure is corrupt.
    pub fn print(&self) {
        let hp = self.header_ptr();
        let (begin, end) = unsafe { ((*hp).begin, (*hp).end) };
        let census = self.census();

        log::info!("address space {begin:#x}..{end:#x}");
        log::info!(
            "  storage blocks: {} nodes: {}",
            census.blocks,
            census.stored
        );

        let mut cursor = unsafe { (*hp).allocated };
        while !cursor.is_none() {
            let node = self.node(cursor);
            log::info!("  {:#x}..{:#x}", node.begin, node.end);
            cursor = node.next;
        }

        log::info!("  nodes used: {} unused: {}", census.used, census.unused);
        assert_eq!(
            census.stored,
            census.used + census.unused,
            "address-space node lost"
        );
    }

    /// Returns every storage block and the control frame.
    pub fn dispose(self) {
        let header = unsafe { self.header_ptr().read() };
        let mut frames = header.frames;

        let mut block = header.storage;
        while block != 0 {
            let next = unsafe { (*block_ptr(block)).next };
            frames.deallocate(PhysAddress::from_raw(block));
            block = next;
        }
        frames.deallocate(self.header);
    }

    /// Fetches a zeroed node: from the recycle list, a spare slot of an
    /// existing block, or a freshly allocated block.
    fn take_node(&mut self) -> NodeRef {
        let hp = self.header_ptr();

        let unused = unsafe { (*hp).unused };
        if !unused.is_none() {
            let next = self.node(unused).next;
            unsafe {
                addr_of_mut!((*hp).unused).write(next);
            }
            self.set_node(unused, ZERO_NODE);
            return unused;
        }

        let mut block = unsafe { (*hp).storage };
        while block != 0 {
            let bp = block_ptr(block);
            let entries = unsafe { (*bp).entries };
            if (entries as usize) < NODES_PER_BLOCK {
                unsafe {
                    addr_of_mut!((*bp).entries).write(entries + 1);
                }
                let fresh = NodeRef::new(block, entries as usize);
                self.set_node(fresh, ZERO_NODE);
                return fresh;
            }
            block = unsafe { (*bp).next };
        }

        let mut frames = unsafe { (*hp).frames };
        let page = frames.allocate();
        assert!(!page.is_null(), "no frame for address-space nodes");
        unsafe {
            core::ptr::write_bytes(
                hhdm::phys_to_virt(page).as_mut_ptr::<u8>(),
                0,
                PAGE_SIZE.as_raw() as usize,
            );
            let bp = block_ptr(page.as_raw());
            addr_of_mut!((*bp).next).write((*hp).storage);
            addr_of_mut!((*bp).entries).write(1);
            addr_of_mut!((*hp).storage).write(page.as_raw());
        }
        NodeRef::new(page.as_raw(), 0)
    }

    fn set_next(&mut self, of: NodeRef, next: NodeRef) {
        if of.is_none() {
            unsafe {
                addr_of_mut!((*self.header_ptr()).allocated).write(next);
            }
        } else {
            let node = self.node(of);
            self.set_node(of, RegionNode { next, ..node });
        }
    }

    fn node(&self, r: NodeRef) -> RegionNode {
        unsafe { *node_ptr(r) }
    }

    fn set_node(&mut self, r: NodeRef, node: RegionNode) {
        unsafe {
            node_ptr(r).write(node);
        }
    }

    fn header_ptr(&self) -> *mut SpaceHeader {
        hhdm::phys_to_virt(self.header).as_mut_ptr()
    }

    fn census(&self) -> NodeCensus {
        let hp = self.header_ptr();
        let mut census = NodeCensus::default();

        let mut block = unsafe { (*hp).storage };
        while block != 0 {
            census.blocks += 1;
            census.stored += unsafe { (*block_ptr(block)).entries } as u64;
            block = unsafe { (*block_ptr(block)).next };
        }

        let mut cursor = unsafe { (*hp).allocated };
        while !cursor.is_none() {
            census.used += 1;
            cursor = self.node(cursor).next;
        }

        let mut cursor = unsafe { (*hp).unused };
        while !cursor.is_none() {
            census.unused += 1;
            cursor = self.node(cursor).next;
        }

        census
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct NodeCensus {
    blocks: u64,
    stored: u64,
    used: u64,
    unused: u64,
}

fn block_ptr(block: u64) -> *mut StorageBlock {
    hhdm::phys_to_virt(PhysAddress::from_raw(block)).as_mut_ptr()
}

fn node_ptr(r: NodeRef) -> *mut RegionNode {
    let bp = block_ptr(r.block());
    unsafe { addr_of_mut!((*bp).nodes[r.slot()]) }
}
