//! User-level upcall record construction (spec.md 4.9).
//!
//! Builds the structured record a page-fault or other-exception upcall
//! reads off the user exception stack, including the nested-fault chaining
//! rule (a four-byte scratch gap between stacked records).

use super::GeneralRegs;
use crate::errors::{KernelError, KResult};
use crate::mm::frame::FrameAllocator;
use crate::mm::pagetable;
use crate::mm::phys::PhysMemory;
use crate::mm::VirtAddr;

/// Low-to-high layout (4.9): fault va, error code, register snapshot,
/// resume eip, resume eflags, resume esp.
pub const RECORD_SIZE: u32 = 4 + 4 + 32 + 4 + 4 + 4;
pub const NESTED_GAP: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct UserTrapFrame {
    pub fault_va: u32,
    pub err: u32,
    pub regs: GeneralRegs,
    pub resume_eip: u32,
    pub resume_eflags: u32,
    pub resume_esp: u32,
}

impl UserTrapFrame {
    fn write_to(&self, buf: &mut [u8; RECORD_SIZE as usize]) {
        let mut w = 0usize;
        macro_rules! put {
            ($v:expr) => {{
                buf[w..w + 4].copy_from_slice(&($v).to_le_bytes());
                w += 4;
            }};
        }
        put!(self.fault_va);
        put!(self.err);
        put!(self.regs.edi);
        put!(self.regs.esi);
        put!(self.regs.ebp);
        put!(self.regs.oesp);
        put!(self.regs.ebx);
        put!(self.regs.edx);
        put!(self.regs.ecx);
        put!(self.regs.eax);
        put!(self.resume_eip);
        put!(self.resume_eflags);
        put!(self.resume_esp);
    }
}

/// Whether `esp` already sits within the one-page user exception stack, in
/// which case a fault is a *nested* fault (4.9) and chains below the
/// current record with a scratch gap instead of restarting at the top.
pub fn is_on_exception_stack(esp: u32, uxstacktop: u32) -> bool {
    esp <= uxstacktop && esp > uxstacktop - crate::config::PGSIZE as u32
}

/// Computes where the new record's *low* address should land, given
/// whether this is a nested fault.
pub fn record_base(resume_esp: u32, uxstacktop: u32) -> u32 {
    if is_on_exception_stack(resume_esp, uxstacktop) {
        resume_esp - NESTED_GAP - RECORD_SIZE
    } else {
        uxstacktop - RECORD_SIZE
    }
}

/// Writes `record` onto the user exception stack of the address space
/// rooted at `root`, returning the new `esp` (the record's base address)
/// the task should resume with at the upcall entry point.
///
/// The one-page exception stack is assumed not to be crossed by a single
/// record; a record that would straddle its bottom is a stack overflow
/// and reported as `Fault`, matching "a fault on a task with no usable
/// exception stack is fatal" (4.9).
pub fn push_record(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    root: crate::mm::FrameNo,
    uxstacktop: u32,
    resume_esp: u32,
    record: &UserTrapFrame,
) -> KResult<u32> {
    let base = record_base(resume_esp, uxstacktop);
    if base < uxstacktop - crate::config::PGSIZE as u32 {
        return Err(KernelError::Fault);
    }

    let page_va = VirtAddr::new(base).page_round_down();
    let end_va = VirtAddr::new(base + RECORD_SIZE - 1).page_round_down();
    if page_va != end_va {
        return Err(KernelError::Fault);
    }

    let (frame, _perm) = pagetable::lookup(frames, phys, root, page_va)?.ok_or(KernelError::Fault)?;

    let mut buf = [0u8; RECORD_SIZE as usize];
    record.write_to(&mut buf);
    let offset = (base - page_va.as_u32()) as usize;
    phys.write_bytes(frame, offset, &buf);

    Ok(base)
}
