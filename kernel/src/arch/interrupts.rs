//! IDT wiring: the real-hardware entry point for every vector `trap::classify`
//! knows about. Each handler builds a `trap::TrapFrame` from the frame the
//! CPU pushes and hands it to `classify`; `crate::state::on_trap` owns what
//! happens next (syscall dispatch, page-fault upcall, scheduling).
//!
//! General-purpose registers are not yet captured here (`InterruptStackFrame`
//! only carries cs/eip/eflags/esp/ss) — `GeneralRegs` is zeroed on this path.
//! TODO: replace the `extern "x86-interrupt"` handlers below with naked-asm
//! stubs that push `pushad`-equivalent state before calling into Rust, the
//! way `user/syscalls/handle_syscall` used to for the syscall vector.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::gdt::DOUBLE_FAULT_IST_INDEX;
use crate::trap::{TrapFrame, TRAP_BREAKPOINT, TRAP_DIVIDE, TRAP_PAGE_FAULT, TRAP_SYSCALL, TRAP_TIMER};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault.set_handler_fn(double_fault_handler).set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
        idt[TRAP_SYSCALL as usize].set_handler_fn(syscall_handler);
        idt[TRAP_TIMER as usize].set_handler_fn(timer_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

fn frame_from_stack(stack: &InterruptStackFrame, trapno: u32, err: u32, fault_va: u32) -> TrapFrame {
    TrapFrame {
        trapno,
        err,
        eip: stack.instruction_pointer.as_u64() as u32,
        cs: stack.code_segment.0,
        eflags: stack.cpu_flags.bits() as u32,
        esp: stack.stack_pointer.as_u64() as u32,
        ss: stack.stack_segment.0,
        fault_va,
        ..Default::default()
    }
}

extern "x86-interrupt" fn divide_handler(stack: InterruptStackFrame) {
    let frame = frame_from_stack(&stack, TRAP_DIVIDE, 0, 0);
    crate::state::on_trap(frame);
}

extern "x86-interrupt" fn breakpoint_handler(stack: InterruptStackFrame) {
    let frame = frame_from_stack(&stack, TRAP_BREAKPOINT, 0, 0);
    crate::state::on_trap(frame);
}

extern "x86-interrupt" fn page_fault_handler(stack: InterruptStackFrame, err: PageFaultErrorCode) {
    let fault_va = x86_64::registers::control::Cr2::read().unwrap().as_u64() as u32;
    let frame = frame_from_stack(&stack, TRAP_PAGE_FAULT, err.bits() as u32, fault_va);
    crate::state::on_trap(frame);
}

extern "x86-interrupt" fn syscall_handler(stack: InterruptStackFrame) {
    let frame = frame_from_stack(&stack, TRAP_SYSCALL, 0, 0);
    crate::state::on_trap(frame);
}

extern "x86-interrupt" fn timer_handler(stack: InterruptStackFrame) {
    let frame = frame_from_stack(&stack, TRAP_TIMER, 0, 0);
    crate::state::on_trap(frame);
}

extern "x86-interrupt" fn double_fault_handler(stack: InterruptStackFrame, _err: u64) -> ! {
    panic!("double fault: {:#?}", stack);
}
