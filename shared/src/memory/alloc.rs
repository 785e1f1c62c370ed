//! The allocator interface.
//!
//! Every allocator in the kernel hands out [`Block`]s, a `(ptr, size)` pair,
//! through the same four-operation contract. There is no global `malloc`;
//! callers always name the allocator they are drawing from, which keeps
//! global state explicit.
//!
//! The split here is deliberate: implementations provide the raw operations
//! in [`RawAllocator`] (everything except `raw_alloc` is optional), and all
//! callers go through the [`Allocator`] extension methods, which own the
//! edge cases once:
//!
//!   - `alloc(0)` returns the empty block without consulting the allocator;
//!   - `free` of the empty block is a no-op;
//!   - `realloc(block, 0)` frees and returns the empty block;
//!   - `realloc(empty, n)` behaves as `alloc(n)`;
//!   - `realloc` without native support falls back to allocate-copy-free,
//!     and the free part is silently dropped for arena-style allocators.
//!
//! Call only through the wrappers; implementations may assume the edge
//! cases never reach them.

/// A run of allocated bytes. The empty block (`null`, 0) is the uniform
/// "nothing" value: allocation failure, zero-sized requests and freed
/// blocks all look like this.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Block {
    pub ptr: *mut u8,
    pub size: usize,
}

impl Block {
    pub const EMPTY: Block = Block {
        ptr: core::ptr::null_mut(),
        size: 0,
    };

    pub fn is_empty(self) -> bool {
        self.ptr.is_null()
    }
}

/// Implementation side of the allocator contract.
///
/// `raw_realloc` returning `None` and `raw_free` returning `false` mean
/// "not supported"; the wrappers then apply their fallbacks. `raw_dispose`
/// tears the allocator down, returning its backing storage.
pub trait RawAllocator {
    fn raw_alloc(&mut self, size: usize) -> Block;

    fn raw_realloc(&mut self, _block: Block, _size: usize) -> Option<Block> {
        None
    }

    fn raw_free(&mut self, _block: Block) -> bool {
        false
    }

    fn raw_dispose(&mut self) {}
}

/// Caller side of the allocator contract. Blanket-implemented; never
/// implement this directly and never call the raw operations yourself.
pub trait Allocator: RawAllocator {
    fn alloc(&mut self, size: usize) -> Block {
        if size == 0 {
            return Block::EMPTY;
        }
        self.raw_alloc(size)
    }

    fn realloc(&mut self, block: Block, size: usize) -> Block {
        if size == 0 {
            self.free(block);
            return Block::EMPTY;
        }
        if block.is_empty() {
            return self.raw_alloc(size);
        }
        if let Some(moved) = self.raw_realloc(block, size) {
            return moved;
        }

        // Fallback: fresh allocation, copy what fits, drop the old block.
        let fresh = self.raw_alloc(size);
        if fresh.is_empty() {
            return Block::EMPTY;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(block.ptr, fresh.ptr, block.size.min(size));
        }
        self.raw_free(block);
        fresh
    }

    fn free(&mut self, block: Block) {
        if !block.is_empty() {
            self.raw_free(block);
        }
    }

    fn dispose(&mut self) {
        self.raw_dispose();
    }
}

impl<T: RawAllocator + ?Sized> Allocator for T {}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec::Vec;

    /// Backing for wrapper-law tests: leaks Vec storage and records every
    /// raw call it sees.
    struct Recording {
        allocs: usize,
        frees: Vec<Block>,
        fail_next: bool,
        support_free: bool,
    }

    impl Recording {
        fn new() -> Recording {
            Recording {
                allocs: 0,
                frees: Vec::new(),
                fail_next: false,
                support_free: true,
            }
        }
    }

    impl RawAllocator for Recording {
        fn raw_alloc(&mut self, size: usize) -> Block {
            assert_ne!(size, 0, "wrapper must swallow zero-sized requests");
            if self.fail_next {
                self.fail_next = false;
                return Block::EMPTY;
            }
            self.allocs += 1;
            let storage: &'static mut [u8] = Vec::leak(std::vec![0u8; size]);
            Block {
                ptr: storage.as_mut_ptr(),
                size,
            }
        }

        fn raw_free(&mut self, block: Block) -> bool {
            if !self.support_free {
                return false;
            }
            assert!(!block.is_empty(), "wrapper must swallow empty frees");
            self.frees.push(block);
            true
        }
    }

    #[test]
    fn zero_sized_alloc_is_empty() {
        let mut a = Recording::new();
        assert_eq!(a.alloc(0), Block::EMPTY);
        assert_eq!(a.allocs, 0);
    }

    #[test]
    fn free_of_empty_is_noop() {
        let mut a = Recording::new();
        a.free(Block::EMPTY);
        assert!(a.frees.is_empty());
    }

    #[test]
    fn realloc_of_empty_allocates() {
        let mut a = Recording::new();
        let block = a.realloc(Block::EMPTY, 64);
        assert!(!block.is_empty());
        assert!(block.size >= 64);
        assert_eq!(a.allocs, 1);
    }

    #[test]
    fn realloc_to_zero_frees() {
        let mut a = Recording::new();
        let block = a.alloc(64);
        assert_eq!(a.realloc(block, 0), Block::EMPTY);
        assert_eq!(a.frees, [block]);
    }

    #[test]
    fn realloc_fallback_copies_and_frees() {
        let mut a = Recording::new();
        let old = a.alloc(8);
        unsafe {
            old.ptr.copy_from(b"turnips!".as_ptr(), 8);
        }

        let new = a.realloc(old, 16);
        assert_ne!(new.ptr, old.ptr);
        assert_eq!(unsafe { core::slice::from_raw_parts(new.ptr, 8) }, b"turnips!");
        assert_eq!(a.frees, [old]);

        // Shrinking copies only what fits.
        let small = a.realloc(new, 4);
        assert_eq!(unsafe { core::slice::from_raw_parts(small.ptr, 4) }, b"turn");
    }

    #[test]
    fn realloc_failure_returns_empty() {
        let mut a = Recording::new();
        let old = a.alloc(8);
        a.fail_next = true;
        assert_eq!(a.realloc(old, 16), Block::EMPTY);
        // The old block is untouched on failure.
        assert!(a.frees.is_empty());
    }

    #[test]
    fn arena_style_free_is_dropped() {
        let mut a = Recording::new();
        a.support_free = false;

        let old = a.alloc(8);
        a.free(old);
        assert!(a.frees.is_empty());

        // The realloc fallback still works; the old block simply leaks.
        let new = a.realloc(old, 32);
        assert!(!new.is_empty());
        assert!(a.frees.is_empty());
    }

    #[test]
    fn wrappers_work_through_dyn() {
        let mut a = Recording::new();
        let erased: &mut dyn RawAllocator = &mut a;
        assert_eq!(erased.alloc(0), Block::EMPTY);
        let block = erased.alloc(32);
        assert!(!block.is_empty());
        erased.free(block);
    }
}
