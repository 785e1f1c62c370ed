//! The kernel's memory subsystem: typed addresses, the physical frame
//! manager, the page-map walker, and the early allocators built on top of
//! them.
//!
//! Boot-time data flow: the bootloader's memory map feeds every usable
//! region into the [`phys::FrameManager`]; the [`paging::Mapper`] draws its
//! node frames from it; [`arena::ArenaAllocator`] and [`virt::AddressSpace`]
//! build their page-backed state on it as well. Everything reaches physical
//! memory through the [`hhdm`] projection.

pub mod addr;
pub mod alloc;
pub mod arena;
pub mod hhdm;
pub mod page;
pub mod paging;
pub mod phys;
pub mod virt;

pub use addr::*;
pub use page::*;

use arrayvec::ArrayVec;

const MAP_CAPACITY: usize = 128;

/// The machine's physical memory map, as handed over at boot.
#[derive(Clone, Debug)]
pub struct Map {
    entries: ArrayVec<MapEntry, MAP_CAPACITY>,
}

impl Map {
    /// `src` must be sorted by start address, as the boot protocol
    /// guarantees.
    ///
    /// # Panics
    ///
    /// Panics if `src` is unsorted or holds more than 128 entries.
    pub fn from_entries<T: IntoIterator<Item = MapEntry>>(src: T) -> Map {
        let entries: ArrayVec<MapEntry, MAP_CAPACITY> = src.into_iter().collect();
        for pair in entries.windows(2) {
            assert!(
                pair[0].extent.address() <= pair[1].extent.address(),
                "memory map out of order: {pair:?}"
            );
        }
        Map { entries }
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn iter_type(&self, mem_type: MemoryType) -> impl Iterator<Item = PhysExtent> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.mem_type == mem_type)
            .map(|e| e.extent)
    }

    /// The regions the frame manager may own.
    pub fn usable(&self) -> impl Iterator<Item = PhysExtent> + '_ {
        self.iter_type(MemoryType::Usable)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub extent: PhysExtent,
    pub mem_type: MemoryType,
}

/// Memory-map entry types, mirroring the boot protocol's classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryType {
    /// Free for the kernel to use.
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    /// Holds bootloader structures; reclaimable once they are done with.
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}


/// Simulated physical memory for host tests: page-aligned heap storage
/// with the direct-map offset pinned to zero, so physical addresses are
/// host pointers.
#[cfg(test)]
pub(crate) mod testutil {
    use super::addr::{Length, PhysAddress, VirtAddress};
    use super::hhdm;
    use super::page::PAGE_SIZE;
    use super::phys::FrameManager;

    #[derive(Clone, Copy)]
    #[repr(C, align(4096))]
    struct RawPage([u8; 4096]);

    pub(crate) struct SimMemory {
        pages: Box<[RawPage]>,
    }

    impl SimMemory {
        pub fn new(frames: usize) -> SimMemory {
            hhdm::init(0);
            SimMemory {
                pages: vec![RawPage([0; 4096]); frames].into_boxed_slice(),
            }
        }

        pub fn phys(&self, index: usize) -> PhysAddress {
            PhysAddress::from_raw(&self.pages[index] as *const RawPage as u64)
        }

        pub fn page_va(&self, index: usize) -> VirtAddress {
            VirtAddress::from_raw(self.phys(index).as_raw())
        }

        /// A frame manager with page 0 as its control page and a single
        /// region over the remaining pages.
        pub fn manager(&self) -> FrameManager {
            self.manager_with_pages(self.pages.len() - 1)
        }

        pub fn manager_with_pages(&self, count: usize) -> FrameManager {
            assert!(count < self.pages.len());
            let mut manager = unsafe { FrameManager::new(self.page_va(0)) };
            manager.add(
                self.phys(1),
                Length::from_raw(count as u64 * PAGE_SIZE.as_raw()),
            );
            manager
        }
    }
}
