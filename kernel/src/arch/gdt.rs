//! GDT/TSS setup. Grounded on the teacher's `cpu.rs`: one kernel code/data
//! pair, one TSS with a double-fault IST stack, one user code/data pair.
//! Kept to a single CPU (1, non-goal: "CPU discovery/LAPIC setup").

use alloc::boxed::Box;

use x86_64::VirtAddr;
use x86_64::instructions::segmentation::Segment;
use x86_64::instructions::segmentation::{CS, DS, ES, FS, GS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

pub struct Gdt {
    table: GlobalDescriptorTable,
    _tss: &'static mut TaskStateSegment,
    pub selectors: Selectors,
}

impl Gdt {
    /// Builds and loads the GDT/TSS, leaving segment registers pointing at
    /// the fresh kernel selectors. Must run once, before interrupts are
    /// enabled.
    pub unsafe fn init() -> Self {
        let tss = Box::leak(Box::new(TaskStateSegment::new()));
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
            #[allow(unused_unsafe)]
            let stack_start = VirtAddr::from_ptr(unsafe { &raw const STACK });
            stack_start + STACK_SIZE as u64
        };

        let mut table = GlobalDescriptorTable::new();
        let kernel_code = table.append(Descriptor::kernel_code_segment());
        let kernel_data = table.append(Descriptor::kernel_data_segment());
        let tss_sel = table.append(Descriptor::tss_segment(tss));
        let user_data = table.append(Descriptor::user_data_segment());
        let user_code = table.append(Descriptor::user_code_segment());

        table.load();
        unsafe {
            CS::set_reg(kernel_code);
            load_tss(tss_sel);
            DS::set_reg(kernel_data);
            ES::set_reg(kernel_data);
            FS::set_reg(kernel_data);
            GS::set_reg(kernel_data);
            SS::set_reg(kernel_data);
        }

        Gdt {
            table,
            _tss: tss,
            selectors: Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss: tss_sel,
            },
        }
    }
}
