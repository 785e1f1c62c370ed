//! Frames and pages: the 4 KiB units the memory subsystem deals in.

use super::addr::{Length, PhysAddress, PhysExtent, VirtAddress, VirtExtent};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: Length = Length::from_raw(1 << PAGE_SHIFT);

/// A 4 KiB physical memory frame.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()), "{start:?}");
        Frame { start }
    }

    /// The frame containing `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Frame::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    pub fn start(self) -> PhysAddress {
        self.start
    }

    pub fn extent(self) -> PhysExtent {
        PhysExtent::new(self.start, PAGE_SIZE)
    }

    /// The `n`th frame after `self`, if addressable.
    pub fn next(self, n: u64) -> Option<Frame> {
        let step = Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?);
        Some(Frame::new(self.start.checked_add(step)?))
    }
}

/// A 4 KiB page of virtual address space.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Page {
    start: VirtAddress,
}

impl Page {
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned.
    pub fn new(start: VirtAddress) -> Page {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()), "{start:?}");
        Page { start }
    }

    /// The page containing `addr`.
    pub fn containing(addr: VirtAddress) -> Page {
        Page::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    pub fn start(self) -> VirtAddress {
        self.start
    }

    pub fn extent(self) -> VirtExtent {
        VirtExtent::new(self.start, PAGE_SIZE)
    }

    /// The `n`th page after `self`, if addressable.
    pub fn next(self, n: u64) -> Option<Page> {
        let step = Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?);
        Some(Page::new(self.start.checked_add(step)?))
    }
}

/// A non-empty run of contiguous frames.
#[derive(Clone, Copy, Debug)]
pub struct FrameRange {
    first: Frame,
    count: u64,
}

impl FrameRange {
    pub fn new(first: Frame, count: u64) -> Option<FrameRange> {
        if count == 0 || first.next(count - 1).is_none() {
            return None;
        }
        Some(FrameRange { first, count })
    }

    /// The frames covering `extent`, which must be page-aligned.
    pub fn from_extent(extent: PhysExtent) -> FrameRange {
        assert!(extent.is_aligned_to(PAGE_SIZE.as_raw()), "{extent:?}");
        FrameRange {
            first: Frame::new(extent.address()),
            count: extent.length().as_raw() / PAGE_SIZE.as_raw(),
        }
    }

    pub fn first(self) -> Frame {
        self.first
    }

    pub fn count(self) -> u64 {
        self.count
    }

    pub fn iter(self) -> impl Iterator<Item = Frame> {
        (0..self.count).map(move |n| self.first.next(n).unwrap())
    }
}

/// A non-empty run of contiguous pages.
#[derive(Clone, Copy, Debug)]
pub struct PageRange {
    first: Page,
    count: u64,
}

impl PageRange {
    pub fn new(first: Page, count: u64) -> Option<PageRange> {
        if count == 0 || first.next(count - 1).is_none() {
            return None;
        }
        Some(PageRange { first, count })
    }

    pub fn first(self) -> Page {
        self.first
    }

    pub fn count(self) -> u64 {
        self.count
    }

    pub fn iter(self) -> impl Iterator<Item = Page> {
        (0..self.count).map(move |n| self.first.next(n).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_alignment() {
        let f = Frame::new(PhysAddress::from_raw(0x2000));
        assert_eq!(f.start(), PhysAddress::from_raw(0x2000));
        assert_eq!(
            Frame::containing(PhysAddress::from_raw(0x2fff)),
            Frame::new(PhysAddress::from_raw(0x2000))
        );
    }

    #[test]
    #[should_panic]
    fn unaligned_frame_panics() {
        Frame::new(PhysAddress::from_raw(0x2001));
    }

    #[test]
    fn range_iteration() {
        let range =
            FrameRange::from_extent(PhysExtent::from_raw(0x1000, 3 * PAGE_SIZE.as_raw()));
        let starts: std::vec::Vec<u64> = range.iter().map(|f| f.start().as_raw()).collect();
        assert_eq!(starts, [0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn range_end_of_address_space() {
        let last = Frame::new(PhysAddress::from_raw(u64::MAX & !0xfff));
        assert!(FrameRange::new(last, 1).is_some());
        assert!(FrameRange::new(last, 2).is_none());
    }
}
