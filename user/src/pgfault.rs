//! User-level page-fault/other-exception upcall (4.9, 4.10, 4.11),
//! grounded on `examples/original_source/lib/pgfault.c` but restructured
//! around `SyscallBackend`/`AddrSpaceView` so the dispatch logic is
//! host-testable and only the entry trampoline itself is real asm.

use kernel::config::PGSIZE;
use kernel::mm::flags::PtFlags;
use kernel::trap::upcall::RECORD_SIZE;

use crate::layout::{PFTEMP, UXSTACKTOP};
use crate::pgtview::AddrSpaceView;
use crate::swap::{swap_back_page, BlockDevice, SwapTable};
use crate::syscall::{self, SyscallBackend};

/// Decoded view of the record the kernel pushes on the user exception
/// stack (`kernel::trap::upcall::UserTrapFrame`'s on-the-wire layout).
/// Kept as a separate type rather than reusing the kernel's struct since
/// user space decodes it out of raw memory, not out of `PhysMemory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserTrapRecord {
    pub fault_va: u32,
    pub err: u32,
    pub resume_eip: u32,
    pub resume_eflags: u32,
    pub resume_esp: u32,
}

/// Bit 1 of the hardware page-fault error code: set on a write access.
const PF_ERR_WRITE: u32 = 1 << 1;

pub fn decode_record(buf: &[u8; RECORD_SIZE as usize]) -> UserTrapRecord {
    let get = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    UserTrapRecord {
        fault_va: get(0),
        err: get(4),
        resume_eip: get(40),
        resume_eflags: get(44),
        resume_esp: get(48),
    }
}

/// What the handler should do with a fault at `va`, given the page's
/// current entry flags and whether the access was a write (4.11). Pure
/// and independent of any backend so every combination is testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    CopyOnWrite,
    SwapIn,
    Fatal,
}

pub fn classify_fault(flags: Option<PtFlags>, is_write: bool) -> FaultAction {
    match flags {
        Some(f) if f.contains(PtFlags::IN_DISK) => FaultAction::SwapIn,
        Some(f) if f.contains(PtFlags::COW) && is_write => FaultAction::CopyOnWrite,
        _ => FaultAction::Fatal,
    }
}

/// Allocates `PFTEMP`, copies `va`'s current contents into it, then remaps
/// it at `va` writable and without `COW` (4.10's CoW fault resolution).
fn resolve_cow<B: SyscallBackend>(b: &mut B, self_id: u32, va: u32) {
    let perm = (PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE).bits();
    let rc = syscall::page_alloc(b, self_id, PFTEMP, perm);
    assert!(rc >= 0, "pgfault: cow temp alloc failed: {rc}");

    let page = (va / PGSIZE as u32) * PGSIZE as u32;
    #[cfg(not(test))]
    unsafe {
        core::ptr::copy_nonoverlapping(page as *const u8, PFTEMP as *mut u8, PGSIZE);
    }

    let rc = syscall::page_map(b, self_id, PFTEMP, self_id, page, perm);
    assert!(rc >= 0, "pgfault: cow re-map failed: {rc}");

    let rc = syscall::page_unmap(b, self_id, PFTEMP);
    assert!(rc >= 0, "pgfault: cow temp unmap failed: {rc}");
}

/// Handles one decoded fault record. Panics on `FaultAction::Fatal`,
/// matching "the user page-fault handler panics on any fault it cannot
/// classify" (§6). `flags` is looked up by the caller (via `AddrSpaceView`
/// or `SwapTable::is_swapped`, whichever the record's `fault_va` needs)
/// rather than here, since the in-disk case has no hardware entry to read.
pub fn dispatch<B: SyscallBackend, D: BlockDevice, V: AddrSpaceView>(
    b: &mut B,
    dev: &mut D,
    table: &mut SwapTable,
    view: &V,
    self_id: u32,
    record: &UserTrapRecord,
) {
    let is_write = record.err & PF_ERR_WRITE != 0;
    let flags = if table.is_swapped(record.fault_va) {
        Some(PtFlags::IN_DISK)
    } else {
        crate::pgtview::entry_for(view, record.fault_va).map(|raw| PtFlags::from_bits_truncate(raw & (PGSIZE as u32 - 1)))
    };

    match classify_fault(flags, is_write) {
        FaultAction::CopyOnWrite => resolve_cow(b, self_id, record.fault_va),
        FaultAction::SwapIn => swap_back_page(b, dev, table, self_id, record.fault_va),
        FaultAction::Fatal => panic!(
            "unhandled page fault at {:#x} (err={:#x}, write={})",
            record.fault_va, record.err, is_write
        ),
    }
}

/// Allocates the user exception stack (if not already installed) and
/// registers `upcall_entry` as this task's page-fault upcall (4.10 step
/// 1). Idempotent: calling it twice just re-sets the same upcall address.
pub fn install_pgfault_handler<B: SyscallBackend>(b: &mut B) {
    let self_id = syscall::getenvid(b) as u32;
    let exn_page = UXSTACKTOP - PGSIZE as u32;
    let perm = (PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE).bits();
    let rc = syscall::page_alloc(b, self_id, exn_page, perm);
    assert!(rc >= 0 || rc == kernel::errors::KernelError::NoMem.code(), "install_pgfault_handler: exception stack alloc failed: {rc}");

    let rc = syscall::env_set_pgfault_upcall(b, self_id, upcall_entry as usize as u32);
    assert!(rc >= 0, "install_pgfault_handler: set_pgfault_upcall failed: {rc}");
}

/// Real entry point the kernel jumps to after pushing a record (4.9):
/// decodes the record, dispatches it, then atomically restores the saved
/// register state and resumes at `resume_eip` on `resume_esp`. This is
/// the one function in the whole user runtime that cannot be a plain Rust
/// function, since it must never return through the normal call stack.
///
/// The restore half below assumes `dispatch` never needs to observe the
/// general-purpose registers saved in the record (true for every case
/// `classify_fault` produces today, since CoW/swap resolution only needs
/// `fault_va`). If a future fault kind needs them, `decode_record` must
/// grow the `GeneralRegs` fields and this trampoline must restore them
/// from the record instead of relying on whatever the hardware left
/// behind.
#[cfg(not(test))]
#[unsafe(naked)]
pub unsafe extern "C" fn upcall_entry() -> ! {
    // Entered with esp == the record's base address (4.9: "esp set to the
    // top of the record"). Record layout, low to high: fault_va(0),
    // err(4), regs(8..40), resume_eip(40), resume_eflags(44),
    // resume_esp(48). `ret` can't resume at resume_eip directly because
    // switching esp to resume_esp first would drop the record out from
    // under us before eip is loaded, so the trick is: stash resume_eip at
    // [resume_esp - 4], overwrite the record's own resume_esp field with
    // that decremented value, restore everything via popad/popfd (which
    // walks off the end of the record doing so), then `pop esp; ret`.
    core::arch::naked_asm!(
        "
        push esp
        call {rust_dispatch}
        add esp, 4

        mov eax, [esp + 40]   // resume_eip
        mov ecx, [esp + 48]   // resume_esp
        sub ecx, 4
        mov [ecx], eax
        mov [esp + 48], ecx

        add esp, 8            // skip fault_va, err -> regs block
        popad                 // edi, esi, ebp, (skip), ebx, edx, ecx, eax
        add esp, 4            // skip resume_eip, already consumed
        popfd                 // resume_eflags
        pop esp               // resume_esp - 4, pointing at the stashed eip
        ret
        ",
        rust_dispatch = sym upcall_dispatch_trampoline,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgtview::mock::MockView;
    use crate::syscall::mock::MockBackend;
    use alloc::vec;

    #[test]
    fn in_disk_flag_wins_regardless_of_write() {
        assert_eq!(classify_fault(Some(PtFlags::IN_DISK), false), FaultAction::SwapIn);
        assert_eq!(classify_fault(Some(PtFlags::IN_DISK), true), FaultAction::SwapIn);
    }

    #[test]
    fn cow_write_is_copy_on_write() {
        assert_eq!(classify_fault(Some(PtFlags::COW), true), FaultAction::CopyOnWrite);
    }

    #[test]
    fn cow_read_is_fatal() {
        assert_eq!(classify_fault(Some(PtFlags::COW), false), FaultAction::Fatal);
    }

    #[test]
    fn absent_entry_is_fatal() {
        assert_eq!(classify_fault(None, true), FaultAction::Fatal);
    }

    #[test]
    fn decode_record_round_trips_fields() {
        let mut buf = [0u8; RECORD_SIZE as usize];
        buf[0..4].copy_from_slice(&0x3000u32.to_le_bytes());
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        buf[40..44].copy_from_slice(&0x1000u32.to_le_bytes());
        buf[44..48].copy_from_slice(&0x202u32.to_le_bytes());
        buf[48..52].copy_from_slice(&0x2000u32.to_le_bytes());

        let record = decode_record(&buf);
        assert_eq!(record.fault_va, 0x3000);
        assert_eq!(record.err, 2);
        assert_eq!(record.resume_eip, 0x1000);
        assert_eq!(record.resume_eflags, 0x202);
        assert_eq!(record.resume_esp, 0x2000);
    }

    #[test]
    fn dispatch_resolves_cow_via_temp_remap() {
        use crate::swap::mock::RamBlockDevice;

        let mut b = MockBackend::new(vec![0, 0, 0]);
        let mut dev = RamBlockDevice::new();
        let mut table = SwapTable::new();
        let mut view = MockView::default();
        let va = 0x4000u32;
        let pdx = (va >> 22) as usize;
        let ptx = ((va >> 12) & 0x3ff) as usize;
        view.pdes.insert(pdx, 1);
        view.ptes.insert((pdx, ptx), (PtFlags::PRESENT | PtFlags::COW).bits());

        let record = UserTrapRecord { fault_va: va, err: PF_ERR_WRITE, resume_eip: 0, resume_eflags: 0, resume_esp: 0 };
        dispatch(&mut b, &mut dev, &mut table, &view, 1, &record);
        assert_eq!(b.calls.len(), 3);
    }

    #[test]
    fn dispatch_swaps_back_pages_tracked_in_the_table() {
        use crate::swap::mock::RamBlockDevice;

        let mut b = MockBackend::new(vec![0]);
        let mut dev = RamBlockDevice::new();
        let mut table = SwapTable::new();
        let view = MockView::default();
        let va = 0x7000u32;

        // Simulate a prior swap-out by inserting directly rather than
        // driving swap_page_to_disk, since only the lookup path matters
        // here.
        table.mark_swapped_for_test(va, 0);

        let record = UserTrapRecord { fault_va: va, err: 0, resume_eip: 0, resume_eflags: 0, resume_esp: 0 };
        dispatch(&mut b, &mut dev, &mut table, &view, 1, &record);
        assert!(!table.is_swapped(va));
    }
}

/// Stands in for the real backing-store driver on actual hardware: the
/// block driver is an external collaborator this runtime only consumes
/// an interface from (spec.md 1, out of scope), and nothing in this
/// repository wires one up yet. A task that never calls
/// `swap_page_to_disk` never populates `SWAP_TABLE`, so `dispatch` never
/// reaches this device in practice; if it ever does, that's a genuine
/// configuration error worth a clear panic rather than a silent no-op.
#[cfg(not(test))]
struct UnconnectedBlockDevice;

#[cfg(not(test))]
impl crate::swap::BlockDevice for UnconnectedBlockDevice {
    fn read_block(&mut self, _index: usize, _buf: &mut [u8; PGSIZE]) {
        panic!("pgfault: swap-in requested but no backing-store driver is connected");
    }

    fn write_block(&mut self, _index: usize, _buf: &[u8; PGSIZE]) {
        panic!("pgfault: swap-out requested but no backing-store driver is connected");
    }
}

/// Process-wide record of which vas are currently swapped out (4.11),
/// persisted across upcalls the same way the kernel's own per-task state
/// persists across traps.
#[cfg(not(test))]
static SWAP_TABLE: spin::Mutex<SwapTable> = spin::Mutex::new(SwapTable::new());

#[cfg(not(test))]
extern "C" fn upcall_dispatch_trampoline(record_ptr: *const u8) {
    let mut buf = [0u8; RECORD_SIZE as usize];
    unsafe {
        core::ptr::copy_nonoverlapping(record_ptr, buf.as_mut_ptr(), RECORD_SIZE as usize);
    }
    let record = decode_record(&buf);

    let mut backend = syscall::RawBackend;
    let self_id = syscall::getenvid(&mut backend) as u32;
    let view = crate::pgtview::Uvpt;
    let mut dev = UnconnectedBlockDevice;
    let mut table = SWAP_TABLE.lock();

    dispatch(&mut backend, &mut dev, &mut table, &view, self_id, &record);
}
