//! Kernel entry: Limine handshake, logging, memory bring-up.

use core::panic::PanicInfo;

use lazy_static::lazy_static;
use limine::{HhdmRequest, MemmapEntry, MemmapRequest, MemoryMapEntryType, NonNullPtr};
use log::{error, info};
use shared::memory::virt::AddressSpace;
use shared::memory::{hhdm, Length, Map, MapEntry, MemoryType, PhysExtent, VirtAddress};

use crate::mm;

#[used]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new(0);
#[used]
static MMAP_REQUEST: MemmapRequest = MemmapRequest::new(0);

/// Only the Limine bootloader calls this, with the responses above filled
/// in and interrupts masked.
#[no_mangle]
pub extern "C" fn _start() -> ! {
    x86_64::instructions::interrupts::disable();
    init_logger();
    info!("galena booting");

    let hhdm_response = HHDM_REQUEST
        .get_response()
        .get()
        .expect("bootloader left no direct-map response");
    let mmap_response = MMAP_REQUEST
        .get_response()
        .get()
        .expect("bootloader left no memory-map response");

    info!("direct map at {:#x}", hhdm_response.offset);
    let map = translate_memory_map(mmap_response.memmap());
    for entry in map.entries() {
        info!("  {:?} {:?}", entry.extent, entry.mem_type);
    }

    mm::init(hhdm_response.offset, &map);

    address_space_check();
    arena_check();
    mapping_check();

    info!("nothing more to run; halting");
    halt_loop();
}

fn translate_memory_map(entries: &[NonNullPtr<MemmapEntry>]) -> Map {
    Map::from_entries(entries.iter().map(|entry| MapEntry {
        extent: PhysExtent::from_raw(entry.base, entry.len),
        mem_type: match entry.typ {
            MemoryMapEntryType::Usable => MemoryType::Usable,
            MemoryMapEntryType::Reserved => MemoryType::Reserved,
            MemoryMapEntryType::AcpiReclaimable => MemoryType::AcpiReclaimable,
            MemoryMapEntryType::AcpiNvs => MemoryType::AcpiNvs,
            MemoryMapEntryType::BadMemory => MemoryType::BadMemory,
            MemoryMapEntryType::BootloaderReclaimable => MemoryType::BootloaderReclaimable,
            MemoryMapEntryType::KernelAndModules => MemoryType::KernelAndModules,
            MemoryMapEntryType::Framebuffer => MemoryType::Framebuffer,
            #[allow(unreachable_patterns)]
            _ => MemoryType::Reserved,
        },
    }))
}

/// Early self-check of the range allocator: a broken one would corrupt
/// whatever subsystem adopts it first, so run it while the damage is
/// containable.
fn address_space_check() {
    let mut space = AddressSpace::new(
        mm::frame_manager(),
        VirtAddress::from_raw(0x600),
        VirtAddress::from_raw(0x6000),
    );

    let p = space.allocate(Length::from_raw(0x100)).unwrap();
    let _ = space.allocate(Length::from_raw(0x80)).unwrap();
    space.free(p + Length::from_raw(0x20), Length::from_raw(0x30));
    space.print();
    space.free(VirtAddress::null(), Length::from_raw(0x6000));
    space.print();
    space.dispose();
    info!("address-space self-check passed");
}

/// Early self-check of the arena: sub-page blocks must be usable memory,
/// and dispose must hand every frame back.
fn arena_check() {
    use shared::memory::alloc::Allocator;
    use shared::memory::arena::ArenaAllocator;

    let frames = mm::frame_manager();
    let free_before = frames.stats().free;

    let mut arena = ArenaAllocator::new(frames, 4).expect("no frame for the boot arena");
    let block = arena.alloc(96);
    assert!(!block.is_empty(), "boot arena failed a small allocation");
    unsafe {
        core::ptr::write_bytes(block.ptr, 0xa5, block.size);
    }
    arena.dispose();

    assert_eq!(frames.stats().free, free_before, "arena frame leak");
    info!("arena self-check passed");
}

/// Early self-check of the page mapper against a scratch root: map one
/// page, walk to it, unmap, and verify every node frame came back.
fn mapping_check() {
    use shared::memory::paging::{lookup_step, MapDepth, MapFlags, MapNode};

    let mut frames = mm::frame_manager();
    let root_frame = frames.allocate();
    assert!(!root_frame.is_null(), "no frame for the scratch root");
    unsafe {
        core::ptr::write_bytes(hhdm::phys_to_virt(root_frame).as_mut_ptr::<u8>(), 0, 4096);
    }
    let root = MapNode::new(root_frame, MapDepth::Top);

    let target = frames.allocate();
    let virt = VirtAddress::from_raw(0x4000_0000);
    let free_before = frames.stats().free;

    mm::with_mapper(|mapper| {
        mapper.assign_one(root, MapFlags::WRITE, target, virt);

        let mut node = root;
        while node.depth.is_table() {
            node = lookup_step(node, virt);
        }
        assert_eq!(node.depth, MapDepth::Memory);
        assert_eq!(node.frame, target);

        mapper.remove_one(root, virt);
    });

    assert_eq!(frames.stats().free, free_before, "page-map node leak");
    frames.deallocate(target);
    frames.deallocate(root_frame);

    // The zero node stands for the live root: our own entry point must
    // resolve through it.
    let entry = VirtAddress::from_raw(_start as usize as u64);
    let step = lookup_step(MapNode::CURRENT, entry);
    assert!(step.depth.is_table(), "kernel image not mapped under the live root");

    info!("page-map self-check passed");
}

cfg_if::cfg_if! {
    if #[cfg(feature = "qemu_debugcon")] {
        use shared::log::{DebugPortWriter, LogSink};

        lazy_static! {
            static ref LOGGER: LogSink<DebugPortWriter> =
                LogSink::new(unsafe { DebugPortWriter::new() });
        }
    } else {
        use shared::log::LogSink;

        struct NullWriter;

        impl core::fmt::Write for NullWriter {
            fn write_str(&mut self, _: &str) -> core::fmt::Result {
                Ok(())
            }
        }

        lazy_static! {
            static ref LOGGER: LogSink<NullWriter> = LogSink::new(NullWriter);
        }
    }
}

fn init_logger() {
    log::set_logger(&*LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Info);
}

fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    use shared::log::LogExt;

    x86_64::instructions::interrupts::disable();

    // If the panic came from inside the logger, its lock is still held;
    // bypass it with a throwaway writer rather than deadlock.
    if !LOGGER.is_locked() {
        error!("{info}");
    } else {
        #[cfg(feature = "qemu_debugcon")]
        {
            use core::fmt::Write;
            let mut writer = unsafe { DebugPortWriter::new() };
            let _ = write!(&mut writer, "{info}");
        }
    }

    halt_loop();
}
