//! Trap classification (spec.md 4.5) and the register-frame types shared
//! across the kernel/user ABI (3, 6). Classification is a pure function
//! of a captured `TrapFrame`, independent of how it got captured, so it
//! is testable without real interrupts; `crate::arch::interrupts` is the
//! thin glue that captures the frame on real hardware and calls it.

pub mod upcall;

/// General-purpose registers, in the order a `pushal`-style entry stub
/// lays them on the stack (edi, esi, ebp, esp-at-trap-time, ebx, edx,
/// ecx, eax).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GeneralRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// The full trap frame captured on kernel entry (3, data model). Immutable
/// to the kernel after capture except for the explicit single-step resume
/// fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub regs: GeneralRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    /// Valid only when `trapno` is the page-fault vector.
    pub fault_va: u32,
}

pub const TRAP_DIVIDE: u32 = 0;
pub const TRAP_DEBUG: u32 = 1;
pub const TRAP_BREAKPOINT: u32 = 3;
pub const TRAP_PAGE_FAULT: u32 = 14;
pub const TRAP_SYSCALL: u32 = 0x80;
pub const TRAP_TIMER: u32 = 0x20;

pub const EFLAGS_TF: u32 = 1 << 8;

impl TrapFrame {
    pub fn from_user(&self) -> bool {
        (self.cs & 0x3) == 3
    }
}

/// What the dispatcher should do with a captured trap (4.5).
#[derive(Debug, PartialEq, Eq)]
pub enum TrapAction {
    Syscall,
    PageFault,
    Breakpoint,
    TimerOrIrq,
    OtherException,
    /// Kernel-mode fault: always fatal.
    FatalKernelFault,
}

/// Pure classification of a captured trap frame (4.5). Carries no side
/// effects; the caller still has to consult per-task state (whether an
/// upcall is registered) to decide what "OtherException"/"PageFault"
/// ultimately do.
pub fn classify(frame: &TrapFrame) -> TrapAction {
    if frame.trapno == TRAP_PAGE_FAULT {
        if !frame.from_user() {
            return TrapAction::FatalKernelFault;
        }
        return TrapAction::PageFault;
    }
    if frame.trapno == TRAP_BREAKPOINT {
        return TrapAction::Breakpoint;
    }
    if frame.trapno == TRAP_SYSCALL {
        return TrapAction::Syscall;
    }
    if frame.trapno == TRAP_TIMER {
        return TrapAction::TimerOrIrq;
    }
    if !frame.from_user() {
        return TrapAction::FatalKernelFault;
    }
    TrapAction::OtherException
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_frame(trapno: u32) -> TrapFrame {
        TrapFrame {
            cs: 0x1b, // ring 3 selector
            trapno,
            ..Default::default()
        }
    }

    #[test]
    fn page_fault_from_kernel_is_fatal() {
        let mut f = user_frame(TRAP_PAGE_FAULT);
        f.cs = 0x08; // ring 0 selector
        assert_eq!(classify(&f), TrapAction::FatalKernelFault);
    }

    #[test]
    fn page_fault_from_user_is_routed() {
        assert_eq!(classify(&user_frame(TRAP_PAGE_FAULT)), TrapAction::PageFault);
    }

    #[test]
    fn syscall_vector_is_routed() {
        assert_eq!(classify(&user_frame(TRAP_SYSCALL)), TrapAction::Syscall);
    }

    #[test]
    fn unknown_user_exception_is_other() {
        assert_eq!(classify(&user_frame(6)), TrapAction::OtherException);
    }

    #[test]
    fn unknown_kernel_exception_is_fatal() {
        let mut f = user_frame(6);
        f.cs = 0x08;
        assert_eq!(classify(&f), TrapAction::FatalKernelFault);
    }
}
