//! Higher-half direct map projection.
//!
//! The bootloader maps all of physical memory at a constant offset in the
//! higher half. That offset is recorded here exactly once during boot;
//! afterwards any physical frame can be reached through a plain pointer
//! without touching the page tables. All of the page-backed bookkeeping in
//! this crate (frame bitmaps, page-table nodes, region-node storage) is
//! accessed through this projection.

use core::sync::atomic::{AtomicU64, Ordering};

use super::addr::{Length, PhysAddress, VirtAddress};

/// Sentinel meaning "not yet initialised". A real offset of `u64::MAX` is
/// impossible: it is not page-aligned.
const UNSET: u64 = u64::MAX;

static OFFSET: AtomicU64 = AtomicU64::new(UNSET);

/// Records the direct-map offset. Called once during boot, before any other
/// function in this crate touches physical memory.
///
/// # Panics
///
/// Panics if called again with a different offset.
pub fn init(offset: u64) {
    if let Err(current) = OFFSET.compare_exchange(UNSET, offset, Ordering::SeqCst, Ordering::SeqCst)
    {
        assert_eq!(current, offset, "direct-map offset changed after boot");
    }
}

/// The raw offset.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn offset() -> Length {
    let raw = OFFSET.load(Ordering::Relaxed);
    assert_ne!(raw, UNSET, "direct-map offset read before boot set it");
    Length::from_raw(raw)
}

/// Projects a physical address into the direct map.
pub fn phys_to_virt(phys: PhysAddress) -> VirtAddress {
    VirtAddress::from_raw(phys.as_raw()) + offset()
}

/// Inverse projection. `virt` must point into the direct map.
pub fn virt_to_phys(virt: VirtAddress) -> PhysAddress {
    PhysAddress::from_raw((virt - offset()).as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The offset is process-global, so every host test initialises it to
    // zero: physical addresses and host pointers coincide.
    #[test]
    fn projection_round_trip() {
        init(0);
        init(0); // re-initialising with the same value is fine

        let phys = PhysAddress::from_raw(0x4000);
        assert_eq!(phys_to_virt(phys), VirtAddress::from_raw(0x4000));
        assert_eq!(virt_to_phys(phys_to_virt(phys)), phys);
    }
}
