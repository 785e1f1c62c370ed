//! Virtual-to-physical translation: the four-level page-map radix tree.
//!
//! A tree node is one page of 512 entries. Interior entries point at child
//! node frames; bottom-level entries point at mapped data frames. Node
//! frames come from the [`FrameManager`] and are returned to it as soon as
//! every entry in them is zero, so the tree never keeps empty nodes around.
//!
//! The API is machine-independent in shape; the entry encoding below is the
//! x86-64 long-mode format.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions as sa;

use super::addr::{Length, PhysAddress, VirtAddress};
use super::hhdm;
use super::page::PAGE_SIZE;
use super::phys::FrameManager;

pub const ENTRY_COUNT: usize = 512;

/// Bits 12..51 of an entry hold the target frame.
pub const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Start of the canonical higher half.
pub const HIGHER_HALF_MIN: u64 = 0xffff_8000_0000_0000;

bitflags::bitflags! {
    /// Architecture entry bits. Documented in the architecture manual; not
    /// every bit is valid at every level.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Leaf at a non-bottom level.
        const LARGE_PAGE = 1 << 7;
        const EXECUTE_DISABLE = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Machine-independent mapping permissions. Translated to [`EntryFlags`]
    /// internally; the present bit is always added, and a missing `EXEC`
    /// becomes execute-disable.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MapFlags: u8 {
        const USER = 1 << 0;
        const EXEC = 1 << 1;
        const WRITE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
    }
}

/// How deep into the tree a node sits. `Top` is the root table; `Memory`
/// and `Invalid` are the two terminal lookup results (a mapped frame and an
/// unmapped address respectively).
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum MapDepth {
    Top = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
    Memory = 4,
    Invalid = 5,
}

impl MapDepth {
    pub const BOTTOM: MapDepth = MapDepth::Level3;

    /// Whether this depth denotes an actual table page.
    pub fn is_table(self) -> bool {
        self <= MapDepth::BOTTOM
    }

    fn next(self) -> MapDepth {
        MapDepth::from_u8(self as u8 + 1).unwrap()
    }

    /// Bit position of this level's index field within a virtual address.
    fn shift(self) -> u32 {
        const SHIFTS: [u32; 4] = [39, 30, 21, 12];
        SHIFTS[self as usize]
    }
}

/// One page of the page map: a node frame plus the depth it sits at. The
/// zero value ([`MapNode::CURRENT`]) stands for the live root the CPU is
/// translating with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapNode {
    pub frame: PhysAddress,
    pub depth: MapDepth,
}

impl MapNode {
    /// Stand-in for the root currently installed in the translation
    /// register.
    pub const CURRENT: MapNode = MapNode {
        frame: PhysAddress::null(),
        depth: MapDepth::Top,
    };

    pub fn new(frame: PhysAddress, depth: MapDepth) -> MapNode {
        MapNode { frame, depth }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
struct Entry(u64);

impl Entry {
    const ZERO: Entry = Entry(0);

    fn new(target: PhysAddress, flags: EntryFlags) -> Entry {
        Entry((target.as_raw() & ENTRY_ADDR_MASK) | flags.bits())
    }

    fn is_zero(self) -> bool {
        self.0 == 0
    }

    fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    fn target(self) -> PhysAddress {
        PhysAddress::from_raw(self.0 & ENTRY_ADDR_MASK)
    }

    fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }
}

#[repr(C, align(4096))]
struct Table {
    entries: [Entry; ENTRY_COUNT],
}

sa::assert_eq_size!(Table, [u8; 4096]);

/// An address is canonical when its upper bits are a sign extension of
/// bit 47: the high half is all zeros or all ones.
pub fn is_canonical(addr: VirtAddress) -> bool {
    let half = addr.as_raw() & HIGHER_HALF_MIN;
    half == 0 || half == HIGHER_HALF_MIN
}

/// Reads the entry for `virt` in `node` and descends one level.
///
/// Returns `Invalid` for a non-present entry, `Memory` with the mapped
/// frame for a leaf (bottom level or large page), and the child node
/// otherwise. Repeated application walks from the root to a frame.
pub fn lookup_step(node: MapNode, virt: VirtAddress) -> MapNode {
    let node = resolve_root(node);
    assert!(node.depth.is_table(), "lookup past the bottom of the map");

    let index = ((virt.as_raw() >> node.depth.shift()) & 0x1ff) as usize;
    let entry = unsafe { (*table_ptr(node.frame)).entries[index] };

    if !entry.is_present() {
        return MapNode::new(PhysAddress::null(), MapDepth::Invalid);
    }
    if entry.flags().contains(EntryFlags::LARGE_PAGE) || node.depth == MapDepth::BOTTOM {
        return MapNode::new(entry.target(), MapDepth::Memory);
    }
    MapNode::new(entry.target(), node.depth.next())
}

/// Walks the tree, mapping and unmapping page-granular ranges. Interior
/// node frames are drawn from (and returned to) the frame manager the
/// mapper was built with.
pub struct Mapper {
    frames: FrameManager,
}

impl Mapper {
    pub fn new(frames: FrameManager) -> Mapper {
        Mapper { frames }
    }

    pub fn frames(&self) -> FrameManager {
        self.frames
    }

    /// Maps virtual pages `[virt, virt + size)` linearly onto physical
    /// frames `[phys, phys + size)` under `root`, creating interior nodes
    /// as needed. Existing bottom-level entries in the range are
    /// overwritten.
    ///
    /// # Panics
    ///
    /// Panics on unaligned inputs, `size == 0`, a non-canonical range, a
    /// range straddling the canonical halves, or frame exhaustion while
    /// reserving an interior node.
    pub fn assign(
        &mut self,
        root: MapNode,
        flags: MapFlags,
        virt: VirtAddress,
        size: Length,
        phys: PhysAddress,
    ) {
        let root = resolve_root(root);
        check_node(root);
        assert!(!size.is_zero(), "empty assignment");
        check_range(virt, size);
        assert!(phys.is_aligned_to(PAGE_SIZE.as_raw()), "{phys:?}");

        let start = virt.as_raw();
        let end = start + size.as_raw();
        self.assign_level(root, start, end, start, phys.as_raw(), leaf_bits(flags));
    }

    /// [`Mapper::assign`] for a single page.
    pub fn assign_one(
        &mut self,
        root: MapNode,
        flags: MapFlags,
        phys: PhysAddress,
        virt: VirtAddress,
    ) {
        self.assign(root, flags, virt, PAGE_SIZE, phys);
    }

    /// Unmaps `[virt, virt + size)` under `root` and frees every interior
    /// node left with no present entries. The root frame itself is never
    /// freed. The caller is responsible for any TLB invalidation if `root`
    /// is live.
    pub fn remove(&mut self, root: MapNode, virt: VirtAddress, size: Length) {
        if size.is_zero() {
            return;
        }

        let root = resolve_root(root);
        check_node(root);
        check_range(virt, size);

        let start = virt.as_raw();
        let end = start + size.as_raw();
        self.remove_level(root, start, end);
    }

    /// [`Mapper::remove`] for a single page.
    pub fn remove_one(&mut self, root: MapNode, virt: VirtAddress) {
        self.remove(root, virt, PAGE_SIZE);
    }

    fn assign_level(
        &mut self,
        node: MapNode,
        start: u64,
        end: u64,
        virt_base: u64,
        phys_base: u64,
        leaf: EntryFlags,
    ) {
        let shift = node.depth.shift();
        let span = 1u64 << shift;
        let table_base = start & !((span << 9) - 1);

        let first = ((start >> shift) & 0x1ff) as usize;
        let last = (((end - 1) >> shift) & 0x1ff) as usize;

        for index in first..=last {
            let entry_va = table_base + (index as u64) * span;

            if node.depth == MapDepth::BOTTOM {
                let target = phys_base + (entry_va - virt_base);
                let entry = Entry::new(PhysAddress::from_raw(target), leaf);
                unsafe {
                    (*table_ptr(node.frame)).entries[index] = entry;
                }
                continue;
            }

            let existing = unsafe { (*table_ptr(node.frame)).entries[index] };
            let child_frame = if existing.is_present() {
                existing.target()
            } else {
                let frame = self.reserve_node();
                let entry = Entry::new(frame, INTERIOR_FLAGS);
                unsafe {
                    (*table_ptr(node.frame)).entries[index] = entry;
                }
                frame
            };

            let child_start = start.max(entry_va);
            let child_end = end.min(entry_va.saturating_add(span));
            self.assign_level(
                MapNode::new(child_frame, node.depth.next()),
                child_start,
                child_end,
                virt_base,
                phys_base,
                leaf,
            );
        }
    }

    /// Clears the range in this node's subtree. Returns whether the node is
    /// entirely zero afterwards, in which case the caller frees it.
    fn remove_level(&mut self, node: MapNode, start: u64, end: u64) -> bool {
        let shift = node.depth.shift();
        let span = 1u64 << shift;
        let table_base = start & !((span << 9) - 1);

        let first = ((start >> shift) & 0x1ff) as usize;
        let last = (((end - 1) >> shift) & 0x1ff) as usize;

        for index in first..=last {
            if node.depth == MapDepth::BOTTOM {
                unsafe {
                    (*table_ptr(node.frame)).entries[index] = Entry::ZERO;
                }
                continue;
            }

            let entry = unsafe { (*table_ptr(node.frame)).entries[index] };
            if !entry.is_present() {
                continue;
            }

            let entry_va = table_base + (index as u64) * span;
            let child_start = start.max(entry_va);
            let child_end = end.min(entry_va.saturating_add(span));
            let child = MapNode::new(entry.target(), node.depth.next());

            if self.remove_level(child, child_start, child_end) {
                unsafe {
                    (*table_ptr(node.frame)).entries[index] = Entry::ZERO;
                }
                self.frames.deallocate(entry.target());
            }
        }

        let table = unsafe { &*table_ptr(node.frame) };
        table.entries.iter().all(|e| e.is_zero())
    }

    /// Fetches and zeroes a frame for a new interior node. There is no
    /// recovering from exhaustion here: without page tables the kernel
    /// cannot continue.
    fn reserve_node(&mut self) -> PhysAddress {
        let frame = self.frames.allocate();
        assert!(!frame.is_null(), "out of frames for a page-map node");
        unsafe {
            core::ptr::write_bytes(
                hhdm::phys_to_virt(frame).as_mut_ptr::<u8>(),
                0,
                PAGE_SIZE.as_raw() as usize,
            );
        }
        frame
    }
}

/// Interior entries are installed permissive; the bottom-level entry
/// decides the effective permissions.
const INTERIOR_FLAGS: EntryFlags = EntryFlags::PRESENT
    .union(EntryFlags::WRITABLE)
    .union(EntryFlags::USER);

fn leaf_bits(flags: MapFlags) -> EntryFlags {
    let mut bits = EntryFlags::PRESENT;
    if flags.contains(MapFlags::USER) {
        bits |= EntryFlags::USER;
    }
    if flags.contains(MapFlags::WRITE) {
        bits |= EntryFlags::WRITABLE;
    }
    if flags.contains(MapFlags::WRITE_THROUGH) {
        bits |= EntryFlags::WRITE_THROUGH;
    }
    if !flags.contains(MapFlags::EXEC) {
        bits |= EntryFlags::EXECUTE_DISABLE;
    }
    bits
}

fn resolve_root(node: MapNode) -> MapNode {
    if node.frame.is_null() && node.depth == MapDepth::Top {
        current_root()
    } else {
        node
    }
}

/// The root the CPU is currently translating with.
#[cfg(target_arch = "x86_64")]
fn current_root() -> MapNode {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    MapNode::new(
        PhysAddress::from_raw(frame.start_address().as_u64()),
        MapDepth::Top,
    )
}

#[cfg(not(target_arch = "x86_64"))]
fn current_root() -> MapNode {
    unimplemented!("the live page-map root can only be read on x86-64");
}

fn check_node(node: MapNode) {
    assert!(node.frame.is_aligned_to(PAGE_SIZE.as_raw()), "{node:?}");
    assert!(node.depth.is_table(), "{node:?}");
}

fn check_range(virt: VirtAddress, size: Length) {
    assert!(virt.is_aligned_to(PAGE_SIZE.as_raw()), "{virt:?}");
    assert!(size.is_aligned_to(PAGE_SIZE.as_raw()), "{size:?}");

    let last = virt + (size - Length::from_raw(1));
    assert!(is_canonical(virt), "{virt:?} is not canonical");
    assert!(is_canonical(last), "{last:?} is not canonical");
    assert_eq!(
        virt.as_raw() & HIGHER_HALF_MIN,
        last.as_raw() & HIGHER_HALF_MIN,
        "range straddles the canonical halves"
    );
}

fn table_ptr(frame: PhysAddress) -> *mut Table {
    hhdm::phys_to_virt(frame).as_mut_ptr()
}
