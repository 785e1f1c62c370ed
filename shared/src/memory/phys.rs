//! Physical frame management.
//!
//! The frame manager owns every allocatable 4 KiB frame handed over by the
//! bootloader. All of its bookkeeping lives inside the memory it tracks: a
//! single control page holds a table of region descriptors, and the first
//! frame of every tracked region is claimed as that region's free-bitmap.
//! Nothing is allocated from anywhere else, because at the point the frame
//! manager is built there is no other allocator to ask.
//!
//! Layout, one box per page:
//!
//! ```text
//!   control page
//!  +===========+
//!  |           |              +========+======+======+======
//!  |  region 0 | -- bitmap -> | bitmap | free | free | ...
//!  |           |              +========+======+======+======
//!  |  region 1 | -- bitmap -> ...
//!  |    ...    |
//!  +===========+
//! ```
//!
//! A set bit in a bitmap means the frame is free.

use log::warn;
use static_assertions as sa;

use super::addr::{Length, PhysAddress};
use super::hhdm;
use super::page::{PAGE_SHIFT, PAGE_SIZE};

/// Region descriptors per control page.
pub const MAX_REGIONS: usize = 168;

/// One bitmap page tracks at most this many frames (4096 bytes of bits).
pub const MAX_REGION_PAGES: u64 = 4096 * 8;

/// Blocks smaller than this are dropped rather than tracked; the descriptor
/// slots are better spent on larger blocks.
pub const MIN_REGION_PAGES: u64 = 64;

const MAX_REGION_BYTES: u64 = MAX_REGION_PAGES << PAGE_SHIFT;
const MIN_REGION_BYTES: u64 = MIN_REGION_PAGES << PAGE_SHIFT;

const BITMAP_WORDS: usize = 512;

#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct RegionDescriptor {
    /// First allocatable frame; the region's bitmap frame sits just below.
    phys_start: u64,
    /// Physical address of the bitmap page.
    bitmap: u64,
    max_pages: u16,
    free_pages: u16,
    active: bool,
}

#[repr(C, align(4096))]
struct RegionTable {
    regions: [RegionDescriptor; MAX_REGIONS],
}

#[repr(C, align(4096))]
struct BitmapPage {
    words: [u64; BITMAP_WORDS],
}

sa::assert_eq_size!(RegionTable, [u8; 4096]);
sa::assert_eq_size!(BitmapPage, [u8; 4096]);

/// Usage counters for a [`FrameManager`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub free: u64,
    pub used: u64,
    pub total: u64,
    /// Pages spent on bookkeeping: the control page plus one bitmap page per
    /// tracked region.
    pub overhead: u64,
}

/// Handle to a frame manager. The handle is just the physical address of the
/// control page; all state lives in the pages themselves, reached through
/// the direct map. Copying the handle aliases the same manager.
///
/// There is no internal locking. A single logical owner must serialise
/// access (in the kernel that is a `spin::Mutex` around the handle).
#[derive(Clone, Copy, Debug)]
pub struct FrameManager {
    table: PhysAddress,
}

impl FrameManager {
    /// Creates an empty frame manager in `control_page`, zeroing it.
    ///
    /// # Safety
    ///
    /// `control_page` must be a page-aligned pointer into the direct map,
    /// backed by a frame that is reserved for this manager for its whole
    /// lifetime and not tracked by it.
    pub unsafe fn new(control_page: super::addr::VirtAddress) -> FrameManager {
        assert!(control_page.is_aligned_to(PAGE_SIZE.as_raw()), "{control_page:?}");
        unsafe {
            core::ptr::write_bytes(control_page.as_mut_ptr::<u8>(), 0, PAGE_SIZE.as_raw() as usize);
        }
        FrameManager {
            table: hhdm::virt_to_phys(control_page),
        }
    }

    /// Hands a block of contiguous usable memory to the manager. Only
    /// regular RAM may be added, never MMIO.
    ///
    /// The start is aligned up and the size down to page granularity. Blocks
    /// under [`MIN_REGION_PAGES`] are dropped with a warning; blocks over
    /// [`MAX_REGION_PAGES`] are split across several descriptors.
    pub fn add(&mut self, phys_start: PhysAddress, size: Length) {
        let mut start = phys_start.align_up(PAGE_SIZE.as_raw());
        let mut size = size.align_down(PAGE_SIZE.as_raw());

        loop {
            let (chunk, rest) = if size.as_raw() > MAX_REGION_BYTES {
                let max = Length::from_raw(MAX_REGION_BYTES);
                (max, size - max)
            } else if size.as_raw() < MIN_REGION_BYTES {
                warn!("memory block {start:?}+{size:?} not tracked (too small)");
                return;
            } else {
                (size, Length::from_raw(0))
            };

            let table = unsafe { &mut *self.table_ptr() };
            match table.regions.iter_mut().find(|d| !d.active) {
                Some(descriptor) => set_up_region(descriptor, start, chunk),
                None => {
                    warn!("memory block {start:?}+{size:?} not tracked (region table full)");
                    return;
                }
            }

            if rest.is_zero() {
                return;
            }
            start += chunk;
            size = rest;
        }
    }

    /// Allocates one frame, first-fit over regions and lowest set bit within
    /// a region. Returns the null address when every region is exhausted.
    pub fn allocate(&mut self) -> PhysAddress {
        let table = unsafe { &mut *self.table_ptr() };
        for descriptor in table.regions.iter_mut() {
            if !descriptor.active || descriptor.free_pages == 0 {
                continue;
            }

            let words = unsafe { &mut (*bitmap_ptr(descriptor.bitmap)).words };
            for (word_index, word) in words.iter_mut().enumerate() {
                if *word == 0 {
                    continue;
                }
                let bit = word.trailing_zeros() as u64;
                *word &= !(1u64 << bit);
                descriptor.free_pages -= 1;

                let index = 64 * word_index as u64 + bit;
                return PhysAddress::from_raw(descriptor.phys_start)
                    + Length::from_raw(index << PAGE_SHIFT);
            }

            panic!(
                "bitmap {:#x} disagrees with free count {}",
                descriptor.bitmap, descriptor.free_pages
            );
        }

        warn!("physical frame allocation failed: out of memory");
        PhysAddress::null()
    }

    /// Returns a frame to the manager. The null address is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is unaligned, not covered by any tracked region, or
    /// already free.
    pub fn deallocate(&mut self, frame: PhysAddress) {
        if frame.is_null() {
            return;
        }
        assert!(frame.is_aligned_to(PAGE_SIZE.as_raw()), "{frame:?}");

        let table = unsafe { &mut *self.table_ptr() };
        for descriptor in table.regions.iter_mut() {
            if !descriptor.active {
                continue;
            }
            let span = (descriptor.max_pages as u64) << PAGE_SHIFT;
            if frame.as_raw() < descriptor.phys_start
                || frame.as_raw() >= descriptor.phys_start + span
            {
                continue;
            }

            let index = (frame.as_raw() - descriptor.phys_start) >> PAGE_SHIFT;
            let word_index = (index / 64) as usize;
            let mask = 1u64 << (index % 64);

            let words = unsafe { &mut (*bitmap_ptr(descriptor.bitmap)).words };
            assert_eq!(words[word_index] & mask, 0, "double free of {frame:?}");
            words[word_index] |= mask;
            descriptor.free_pages += 1;
            return;
        }

        panic!("bad free: {frame:?} is not covered by any region");
    }

    pub fn stats(&self) -> FrameStats {
        let table = unsafe { &*self.table_ptr() };
        let mut stats = FrameStats {
            // The control page itself.
            overhead: 1,
            ..FrameStats::default()
        };
        for descriptor in table.regions.iter().filter(|d| d.active) {
            stats.free += descriptor.free_pages as u64;
            stats.used += (descriptor.max_pages - descriptor.free_pages) as u64;
            stats.total += descriptor.max_pages as u64;
            stats.overhead += 1;
        }
        stats
    }

    fn table_ptr(&self) -> *mut RegionTable {
        hhdm::phys_to_virt(self.table).as_mut_ptr()
    }

    /// Test hook: bitmap popcounts must match the per-region free counters.
    #[cfg(test)]
    fn check_bit_accounting(&self) {
        let table = unsafe { &*self.table_ptr() };
        for descriptor in table.regions.iter().filter(|d| d.active) {
            let words = unsafe { &(*bitmap_ptr(descriptor.bitmap)).words };
            let popcount: u32 = words.iter().map(|w| w.count_ones()).sum();
            assert_eq!(popcount, descriptor.free_pages as u32);
        }
    }

    #[cfg(test)]
    fn active_regions(&self) -> usize {
        let table = unsafe { &*self.table_ptr() };
        table.regions.iter().filter(|d| d.active).count()
    }
}

/// Claims the first frame of the block as its bitmap and marks the rest
/// free.
fn set_up_region(descriptor: &mut RegionDescriptor, start: PhysAddress, size: Length) {
    let bitmap = start;
    let pages = (size.as_raw() >> PAGE_SHIFT) - 1;

    let words = unsafe { &mut (*bitmap_ptr(bitmap.as_raw())).words };
    *words = [0; BITMAP_WORDS];
    let full_words = (pages / 64) as usize;
    for word in &mut words[..full_words] {
        *word = u64::MAX;
    }
    let extra_bits = (pages % 64) as u32;
    if extra_bits != 0 {
        words[full_words] = u64::MAX >> (64 - extra_bits);
    }

    *descriptor = RegionDescriptor {
        phys_start: (start + PAGE_SIZE).as_raw(),
        bitmap: bitmap.as_raw(),
        max_pages: pages as u16,
        free_pages: pages as u16,
        active: true,
    };
}

fn bitmap_ptr(bitmap: u64) -> *mut BitmapPage {
    hhdm::phys_to_virt(PhysAddress::from_raw(bitmap)).as_mut_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testutil::SimMemory;

    use pretty_assertions::assert_eq;

    const PAGE: u64 = 4096;

    #[test]
    fn basic_add_allocate_free() {
        // A 64-frame block: one frame becomes the bitmap, 63 are usable.
        let mem = SimMemory::new(65);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(64 * PAGE));

        let stats = manager.stats();
        assert_eq!(stats.total, 63);
        assert_eq!(stats.free, 63);
        assert_eq!(stats.used, 0);
        assert!(stats.overhead >= 2);

        let base = mem.phys(1);
        assert_eq!(manager.allocate(), base + Length::from_raw(PAGE));
        assert_eq!(manager.allocate(), base + Length::from_raw(2 * PAGE));
        assert_eq!(manager.allocate(), base + Length::from_raw(3 * PAGE));

        manager.deallocate(base + Length::from_raw(2 * PAGE));
        assert_eq!(manager.allocate(), base + Length::from_raw(2 * PAGE));

        manager.check_bit_accounting();
        let stats = manager.stats();
        assert_eq!(stats.free + stats.used, stats.total);
    }

    #[test]
    fn oversized_block_is_split() {
        // 200 MiB worth of frames: split into a 128 MiB region and a 72 MiB
        // region, each losing one frame to its bitmap.
        let frames = 200 * 1024 * 1024 / PAGE;
        let mem = SimMemory::new(frames as usize + 1);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(frames * PAGE));

        assert_eq!(manager.active_regions(), 2);
        let stats = manager.stats();
        assert_eq!(stats.total, 32767 + (72 * 256 - 1));
        assert_eq!(stats.overhead, 3);
        manager.check_bit_accounting();
    }

    #[test_log::test]
    fn undersized_block_is_dropped() {
        let mem = SimMemory::new(64);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(63 * PAGE));

        assert_eq!(manager.active_regions(), 0);
        assert_eq!(manager.stats().total, 0);
        assert_eq!(manager.allocate(), PhysAddress::null());
    }

    #[test]
    fn bitmap_capacity_boundary() {
        let mem = SimMemory::new(514);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(513 * PAGE));

        assert_eq!(manager.stats().total, 512);
        manager.check_bit_accounting();
    }

    #[test]
    fn unaligned_block_is_trimmed() {
        let mem = SimMemory::new(68);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        // Start misaligned by 8 bytes, length with a ragged tail.
        manager.add(
            mem.phys(1) + Length::from_raw(8),
            Length::from_raw(65 * PAGE + 100),
        );

        // Start rounds up a frame, size rounds down to 65 frames; one more
        // goes to the bitmap.
        assert_eq!(manager.stats().total, 64);
        assert_eq!(
            manager.allocate(),
            mem.phys(2) + Length::from_raw(PAGE)
        );
    }

    #[test]
    fn exhaustion_returns_null_and_recovers() {
        let mem = SimMemory::new(65);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(64 * PAGE));

        let mut frames = std::vec::Vec::new();
        loop {
            let frame = manager.allocate();
            if frame.is_null() {
                break;
            }
            frames.push(frame);
        }
        assert_eq!(frames.len(), 63);

        // All distinct.
        let unique: std::collections::BTreeSet<u64> =
            frames.iter().map(|f| f.as_raw()).collect();
        assert_eq!(unique.len(), frames.len());

        // Returning one frame makes exactly one allocation possible again.
        manager.deallocate(frames[10]);
        assert_eq!(manager.allocate(), frames[10]);
        assert_eq!(manager.allocate(), PhysAddress::null());
        manager.check_bit_accounting();
    }

    #[test]
    #[should_panic(expected = "bad free")]
    fn freeing_untracked_frame_panics() {
        let mem = SimMemory::new(66);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(64 * PAGE));

        // One past the end of the tracked region.
        manager.deallocate(mem.phys(65));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mem = SimMemory::new(65);
        let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
        manager.add(mem.phys(1), Length::from_raw(64 * PAGE));

        let frame = manager.allocate();
        manager.deallocate(frame);
        manager.deallocate(frame);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Bit accounting holds over arbitrary allocate/free interleavings,
        // and the counters stay consistent.
        #[test]
        fn accounting_invariant(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let mem = SimMemory::new(130);
            let mut manager = unsafe { FrameManager::new(mem.page_va(0)) };
            manager.add(mem.phys(1), Length::from_raw(128 * 4096));
            let total = manager.stats().total;

            let mut held = std::vec::Vec::new();
            for allocate in ops {
                if allocate {
                    let frame = manager.allocate();
                    if !frame.is_null() {
                        prop_assert!(!held.contains(&frame.as_raw()));
                        held.push(frame.as_raw());
                    }
                } else if let Some(raw) = held.pop() {
                    manager.deallocate(PhysAddress::from_raw(raw));
                }

                manager.check_bit_accounting();
                let stats = manager.stats();
                prop_assert_eq!(stats.free + stats.used, total);
                prop_assert_eq!(stats.used, held.len() as u64);
            }
        }
    }
}
