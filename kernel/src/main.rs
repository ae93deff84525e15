#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]

extern crate alloc;

use alloc::boxed::Box;

use bootloader_api::config::Mapping;
use bootloader_api::info::MemoryRegionKind;
use bootloader_api::{BootInfo, BootloaderConfig};
use core::panic::PanicInfo;
use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{
    FrameAllocator as X86FrameAllocator, Mapper, OffsetPageTable, Page, PageSize, PageTable,
    PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::{PhysAddr, VirtAddr as X86VirtAddr};

use kernel::arch::gdt::Gdt;
use kernel::arch::interrupts;
use kernel::console::SerialConsole;
use kernel::debug_println;
use kernel::env::EnvTable;
use kernel::mm::frame::FrameAllocator;
use kernel::mm::phys::DirectMemory;
use kernel::sched::new_scheduler;
use kernel::snapshot::SnapshotSlot;
use kernel::state::{FlushTlb, KernelState, STATE};

/// Process-wide allocator for this bin target only — `kernel` the library
/// is also linked into `user`'s host test binaries, where a real,
/// uninitialized heap allocator must not become the global one (hence it
/// lives here, not in `kernel/src/lib.rs`).
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Heap placed just past the kernel image in the bootloader's fixed
/// virtual memory layout, the way the teacher's `memory::init` does.
const HEAP_START: u64 = 0x_4444_4444_0000;
const HEAP_SIZE: u64 = 1024 * 1024;

/// # Safety
/// `start..start+size` must already be mapped, writable, and otherwise
/// unused; must be called at most once.
unsafe fn init_heap(start: *mut u8, size: usize) {
    unsafe {
        ALLOCATOR.lock().init(start, size);
    }
}

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    debug_println!("panic: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}

/// Bump frame allocator used only while mapping the heap, the same way
/// the teacher's `LinearFrameAllocator` bootstraps `memory::init` before
/// the real allocator exists.
struct BootFrames<'a> {
    regions: &'a bootloader_api::info::MemoryRegions,
    next: usize,
}

unsafe impl<'a> X86FrameAllocator<Size4KiB> for BootFrames<'a> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let addr = self
            .regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .flat_map(|r| r.start..r.end)
            .step_by(Size4KiB::SIZE as usize)
            .nth(self.next)?;
        self.next += 1;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let phys_mem_offset = boot_info.physical_memory_offset.into_option().expect("no physical memory offset");

    let gdt = Box::leak(Box::new(unsafe { Gdt::init() }));
    interrupts::init();

    let level4_addr = x86_64::registers::control::Cr3::read().0.start_address().as_u64() + phys_mem_offset;
    let level4_table = unsafe { &mut *(level4_addr as *mut PageTable) };
    let mut mapper = unsafe { OffsetPageTable::new(level4_table, X86VirtAddr::new(phys_mem_offset)) };
    let mut boot_frames = BootFrames { regions: &boot_info.memory_regions, next: 0 };

    let heap_start = X86VirtAddr::new(HEAP_START);
    let heap_end = heap_start + HEAP_SIZE - 1u64;
    for page in
        Page::<Size4KiB>::range_inclusive(Page::containing_address(heap_start), Page::containing_address(heap_end))
    {
        let frame = boot_frames.allocate_frame().expect("out of memory initialising heap");
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe {
            mapper.map_to(page, frame, flags, &mut boot_frames).expect("heap mapping failed").flush();
        }
    }
    unsafe {
        init_heap(heap_start.as_mut_ptr(), HEAP_SIZE as usize);
    }

    let total_frames: u32 = boot_info
        .memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| ((r.end - r.start) / Size4KiB::SIZE) as u32)
        .sum();
    let low_frames_reserved = boot_frames.next as u32;

    let frames = FrameAllocator::new(total_frames as usize, move |n| n < low_frames_reserved);
    let phys = unsafe { DirectMemory::new(phys_mem_offset) };
    let envs = EnvTable::new(gdt.selectors.user_code.0, gdt.selectors.user_data.0);

    let state = KernelState {
        frames,
        phys,
        envs,
        tlb: FlushTlb,
        console: SerialConsole,
        scheduler: new_scheduler(0),
        snapshot: SnapshotSlot::new(),
        kernel_template: None,
        current: None,
    };
    STATE.init_once(|| spin::Mutex::new(state));

    debug_println!("kernel initialised, entering idle loop");
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}
