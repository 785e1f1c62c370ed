//! Kernel memory management: global wiring around the `shared` memory
//! subsystem.
//!
//! Boot order matters here. The direct-map offset must be recorded before
//! anything touches physical memory; the frame manager's control page is
//! carved off the front of the first usable region because at that moment
//! there is no allocator to ask; and the page mapper is bound to the frame
//! manager last.

use core::sync::atomic::{AtomicBool, Ordering};

use log::info;
use once_cell::unsync::OnceCell;
use shared::memory::hhdm;
use shared::memory::paging::Mapper;
use shared::memory::phys::FrameManager;
use shared::memory::{Map, PAGE_SIZE};

static FRAME_MANAGER: spin::Mutex<OnceCell<FrameManager>> = spin::Mutex::new(OnceCell::new());
static MAPPER: spin::Mutex<OnceCell<Mapper>> = spin::Mutex::new(OnceCell::new());

/// Initializes the memory subsystem from the boot handoff. Must only be
/// called once; panics otherwise.
pub fn init(hhdm_offset: u64, map: &Map) {
    static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);
    assert!(
        !IS_INITIALIZED.swap(true, Ordering::SeqCst),
        "mm::init called twice"
    );

    hhdm::init(hhdm_offset);

    // The first usable region donates its first frame as the control page.
    let mut usable = map.usable();
    let first = usable.next().expect("no usable memory in the boot map");
    assert!(first.length() > PAGE_SIZE, "first usable region too small");

    let control_page = first.address();
    let mut manager = unsafe { FrameManager::new(hhdm::phys_to_virt(control_page)) };
    manager.add(control_page + PAGE_SIZE, first.length() - PAGE_SIZE);
    for extent in usable {
        manager.add(extent.address(), extent.length());
    }

    let stats = manager.stats();
    info!(
        "frame manager: {} frames ({} free, {} used, {} bookkeeping)",
        stats.total, stats.free, stats.used, stats.overhead
    );

    assert!(FRAME_MANAGER.lock().set(manager).is_ok());
    assert!(MAPPER.lock().set(Mapper::new(manager)).is_ok());
}

/// Handle to the boot frame manager.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn frame_manager() -> FrameManager {
    *FRAME_MANAGER
        .lock()
        .get()
        .expect("memory subsystem not initialised")
}

/// Runs `f` with the kernel page mapper.
///
/// # Panics
///
/// Panics before [`init`] has run.
pub fn with_mapper<R>(f: impl FnOnce(&mut Mapper) -> R) -> R {
    let mut guard = MAPPER.lock();
    f(guard.get_mut().expect("memory subsystem not initialised"))
}
