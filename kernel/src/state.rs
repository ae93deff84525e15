//! Global kernel state for the real-hardware entry point. Every subsystem
//! underneath (`mm`, `env`, `trap`, `ipc`, `sched`, `syscall`, `snapshot`)
//! is fully testable without this module — this is just the wiring
//! `arch::interrupts` calls into once real hardware is involved.
//!
//! TODO: `dispatch_syscall` reads arguments out of `frame.regs`, but
//! `arch::interrupts` does not yet capture general-purpose registers (see
//! its module doc) and there is no asm trampoline to resume the caller
//! with `eax` set to the return value — both land with the naked-asm
//! rewrite of the vector stubs.

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::arch::BIG_KERNEL_LOCK;
use crate::console::SerialConsole;
use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::mm::frame::FrameAllocator;
use crate::mm::pagetable::TlbInvalidate;
use crate::mm::phys::DirectMemory;
use crate::mm::FrameNo;
use crate::sched::{ActiveScheduler, SchedDecision, Scheduler};
use crate::snapshot::SnapshotSlot;
use crate::syscall::{self, numbers::*, SyscallContext};
use crate::trap::{self, TrapAction, TrapFrame};

pub struct FlushTlb;

impl TlbInvalidate for FlushTlb {
    fn invalidate(&mut self, va: u32) {
        use x86_64::instructions::tlb;
        tlb::flush(x86_64::VirtAddr::new(va as u64));
    }
}

pub struct KernelState {
    pub frames: FrameAllocator,
    pub phys: DirectMemory,
    pub envs: EnvTable,
    pub tlb: FlushTlb,
    pub console: SerialConsole,
    pub scheduler: ActiveScheduler,
    pub snapshot: SnapshotSlot,
    pub kernel_template: Option<FrameNo>,
    pub current: Option<EnvId>,
}

pub static STATE: OnceCell<Mutex<KernelState>> = OnceCell::uninit();

pub fn on_trap(frame: TrapFrame) {
    let _hold = BIG_KERNEL_LOCK.lock();
    let Some(lock) = STATE.get() else { return };
    let mut state = lock.lock();
    let current = state.current;

    match trap::classify(&frame) {
        TrapAction::Syscall => {
            if let Some(id) = current {
                dispatch_syscall(&mut state, id, &frame);
            }
        }
        TrapAction::PageFault => {
            if let Some(id) = current {
                handle_page_fault(&mut state, id, &frame);
            }
        }
        TrapAction::Breakpoint => {
            // Hands off to the monitor's command loop; the loop itself
            // lives in `crate::main` since it needs a real keyboard/serial
            // read, not the library's `Console` abstraction alone.
        }
        TrapAction::TimerOrIrq => reschedule(&mut state),
        TrapAction::OtherException => {
            if let Some(id) = current {
                dispatch_other_exception(&mut state, id, &frame);
            }
        }
        TrapAction::FatalKernelFault => {
            panic!("fatal kernel-mode fault: trapno={} err={:#x}", frame.trapno, frame.err);
        }
    }
}

fn dispatch_syscall(state: &mut KernelState, caller: EnvId, frame: &TrapFrame) {
    let regs = &frame.regs;
    let (num, a1, a2, a3, a4, a5) = (regs.eax, regs.edx, regs.ecx, regs.ebx, regs.edi, regs.esi);

    if num == SYS_YIELD {
        reschedule(state);
        if let Some(env) = state.envs.get_mut(caller) {
            env.regs.regs.eax = 0;
        }
        return;
    }

    let KernelState { frames, phys, tlb, envs, console, kernel_template, .. } = state;
    let mut ctx = SyscallContext { frames, phys, tlb, envs, console, kernel_template: *kernel_template };

    let result: Result<i32, crate::errors::KernelError> = match num {
        SYS_CPUTS => syscall::cputs(&mut ctx, caller, a1, a2),
        SYS_CGETC => Ok(syscall::cgetc(&mut ctx)),
        SYS_GETENVID => Ok(syscall::getenvid(caller)),
        SYS_ENV_DESTROY => syscall::env_destroy(&mut ctx, caller, EnvId(a1)).map(|_| 0),
        SYS_PAGE_ALLOC => syscall::page_alloc(&mut ctx, caller, EnvId(a1), a2, a3).map(|_| 0),
        SYS_PAGE_MAP => syscall::page_map(&mut ctx, caller, EnvId(a1), a2, EnvId(a3), a4, a5).map(|_| 0),
        SYS_PAGE_UNMAP => syscall::page_unmap(&mut ctx, caller, EnvId(a1), a2).map(|_| 0),
        SYS_EXOFORK => syscall::exofork(&mut ctx, caller).map(|id| id.0 as i32),
        SYS_ENV_SET_STATUS => syscall::env_set_status(ctx.envs, caller, EnvId(a1), a2).map(|_| 0),
        SYS_ENV_SET_PGFAULT_UPCALL => syscall::env_set_pgfault_upcall(ctx.envs, caller, EnvId(a1), a2).map(|_| 0),
        SYS_ENV_SET_OTHER_EXCEPTION_UPCALL => {
            syscall::env_set_other_exception_upcall(ctx.envs, caller, EnvId(a1), a2).map(|_| 0)
        }
        SYS_IPC_TRY_SEND => syscall::ipc_try_send(&mut ctx, caller, EnvId(a1), a2, a3, a4).map(|_| 0),
        SYS_IPC_RECV => syscall::ipc_recv(&mut ctx, caller, a1).map(|_| 0),
        SYS_SNAPSHOT => state.snapshot.capture(ctx.frames, ctx.phys, ctx.envs, caller).map(|_| 0),
        SYS_RESTORE => state.snapshot.restore(ctx.frames, ctx.phys, ctx.tlb, ctx.envs, caller).map(|_| 0),
        _ => Err(crate::errors::KernelError::NoSys),
    };

    let retval = match result {
        Ok(v) => v,
        Err(e) => e.code(),
    };
    if let Some(env) = state.envs.get_mut(caller) {
        env.regs.regs.eax = retval as u32;
    }
}

/// Routes a user page fault to the task's registered handler, or kills it
/// if none is registered (4.9).
fn handle_page_fault(state: &mut KernelState, id: EnvId, frame: &TrapFrame) {
    let upcall = state.envs.get(id).and_then(|e| e.pgfault_upcall);
    deliver_upcall(state, id, frame, upcall);
}

/// Routes any other user exception to the task's registered
/// other-exception upcall the same way `handle_page_fault` routes page
/// faults (4.5, 4.9), or kills the task if none is registered.
fn dispatch_other_exception(state: &mut KernelState, id: EnvId, frame: &TrapFrame) {
    let upcall = state.envs.get(id).and_then(|e| e.other_exception_upcall);
    deliver_upcall(state, id, frame, upcall);
}

/// Pushes a `UserTrapFrame` record onto the task's user exception stack
/// and redirects it to resume at `upcall`; destroys the task if no upcall
/// is registered or the push itself fails (e.g. `NoMem`).
fn deliver_upcall(state: &mut KernelState, id: EnvId, frame: &TrapFrame, upcall: Option<crate::mm::VirtAddr>) {
    let Some(upcall) = upcall else {
        let _ = state.envs.destroy(&mut state.frames, &mut state.phys, &mut state.tlb, id);
        return;
    };

    let root = state.envs.get(id).unwrap().root();
    let record = crate::trap::upcall::UserTrapFrame {
        fault_va: frame.fault_va,
        err: frame.err,
        regs: frame.regs,
        resume_eip: frame.eip,
        resume_eflags: frame.eflags,
        resume_esp: frame.esp,
    };

    match crate::trap::upcall::push_record(
        &mut state.frames,
        &mut state.phys,
        root,
        crate::config::UXSTACKTOP,
        frame.esp,
        &record,
    ) {
        Ok(new_esp) => {
            let env = state.envs.get_mut(id).unwrap();
            env.regs.esp = new_esp;
            env.regs.eip = upcall.as_u32();
        }
        Err(_) => {
            let _ = state.envs.destroy(&mut state.frames, &mut state.phys, &mut state.tlb, id);
        }
    }
}

fn reschedule(state: &mut KernelState) {
    let current = state.current;
    match state.scheduler.pick_next(&state.envs, current) {
        SchedDecision::Run(id) | SchedDecision::KeepCurrent(id) => {
            if let Some(prev) = current {
                if prev != id {
                    let _ = state.envs.set_status(prev, EnvStatus::Runnable);
                }
            }
            let _ = state.envs.set_status(id, EnvStatus::Running);
            state.current = Some(id);
        }
        SchedDecision::Halt => {
            state.current = None;
        }
    }
}
