//! Copy-on-write `fork`/`sfork` (4.10), grounded on
//! `examples/original_source/lib/fork.c`'s `duppage`/`pgfault`/`fork` but
//! reimplemented against `SyscallBackend`/`AddrSpaceView` rather than a
//! direct libc-style page-table walk.

use kernel::config::{NPDENTRIES, NPTENTRIES, PGSIZE, UTOP, USTACKTOP, UXSTACKTOP};
use kernel::mm::flags::PtFlags;

use crate::layout::BATCH_BUF_VA;
use crate::pgfault::install_pgfault_handler;
use crate::pgtview::AddrSpaceView;
use crate::syscall::{self, SyscallBackend};

/// Whether `va`'s page is the batch-syscall buffer's own page, which the
/// COW traversal in `fork`/`sfork` skips (4.13): flushing it mid-traversal
/// would attempt to duppage the buffer out from under itself.
fn is_batch_buf_page(va: u32) -> bool {
    va == BATCH_BUF_VA
}

/// `EnvStatus::Runnable` as seen by `env_set_status` (4.6). Kept local
/// rather than depending on the kernel's internal `env::EnvStatus` enum,
/// since the ABI between the two crates is the syscall numbers, not the
/// kernel's in-memory representation.
const ENV_RUNNABLE: u32 = 1;

/// What `duppage` decides to do with one present page, given its current
/// flags. Pure and exhaustively testable without a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupAction {
    /// Remap into the child with the exact same permissions; both sides
    /// keep writing through to the same frame.
    Share(PtFlags),
    /// Install read-only + COW in both parent and child.
    CopyOnWrite,
    /// Map into the child unchanged; the page was already read-only and
    /// not shared.
    Plain(PtFlags),
}

/// Decides how `duppage` should treat a page with the given flags (4.10).
pub fn classify_duppage(flags: PtFlags) -> DupAction {
    if flags.contains(PtFlags::SHARE) {
        DupAction::Share(flags)
    } else if flags.contains(PtFlags::WRITABLE) || flags.contains(PtFlags::COW) {
        DupAction::CopyOnWrite
    } else {
        DupAction::Plain(flags)
    }
}

/// Applies `classify_duppage`'s decision for one page, mapping it into the
/// child and (for the CoW case) re-mapping the parent's own copy too.
fn duppage<B: SyscallBackend>(b: &mut B, self_id: u32, child: u32, va: u32, flags: PtFlags) {
    match classify_duppage(flags) {
        DupAction::Share(perm) => {
            let rc = syscall::page_map(b, self_id, va, child, va, perm.bits());
            assert!(rc >= 0, "duppage: shared page_map failed: {rc}");
        }
        DupAction::CopyOnWrite => {
            let perm = (flags & !PtFlags::WRITABLE | PtFlags::COW).bits();
            let rc = syscall::page_map(b, self_id, va, child, va, perm);
            assert!(rc >= 0, "duppage: cow page_map to child failed: {rc}");
            let rc = syscall::page_map(b, self_id, va, self_id, va, perm);
            assert!(rc >= 0, "duppage: cow re-map of parent failed: {rc}");
        }
        DupAction::Plain(perm) => {
            let rc = syscall::page_map(b, self_id, va, child, va, perm.bits());
            assert!(rc >= 0, "duppage: plain page_map failed: {rc}");
        }
    }
}

fn entry_flags(raw: u32) -> PtFlags {
    PtFlags::from_bits_truncate(raw & (PGSIZE as u32 - 1))
}

/// Iterates every present page below `UTOP`, in page order, except the
/// one exempted range (used to skip the exception-stack top and, when
/// `sfork` calls this, the non-stack region split point). Descends into
/// a leaf table only when its root entry is present, the way JOS's own
/// `fork`/`duppage` loop over `PDX`/`PTX` rather than every byte of a
/// 4 GiB address space.
fn for_each_present_user_page<V: AddrSpaceView>(view: &V, skip: impl Fn(u32) -> bool, mut f: impl FnMut(u32, PtFlags)) {
    let max_pdx = (UTOP as usize) / (NPTENTRIES * PGSIZE);
    for pdx in 0..max_pdx.min(NPDENTRIES) {
        if view.pde(pdx) & PtFlags::PRESENT.bits() == 0 {
            continue;
        }
        for ptx in 0..NPTENTRIES {
            let va = ((pdx * NPTENTRIES + ptx) * PGSIZE) as u32;
            if va >= UTOP || skip(va) {
                continue;
            }
            let raw = view.pte(pdx, ptx);
            let flags = entry_flags(raw);
            if flags.contains(PtFlags::PRESENT) {
                f(va, flags);
            }
        }
    }
}

/// Allocates and installs the child's exception stack, copying the
/// parent's current contents into it via a temporary mapping at `tmp_va`
/// in the parent's own space (step 4, 4.10).
fn copy_exception_stack<B: SyscallBackend>(b: &mut B, self_id: u32, child: u32, tmp_va: u32) {
    let exn_page = UXSTACKTOP - PGSIZE as u32;
    let perm = (PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE).bits();
    let rc = syscall::page_alloc(b, child, exn_page, perm);
    assert!(rc >= 0, "fork: exception-stack alloc failed: {rc}");

    let rc = syscall::page_map(b, child, exn_page, self_id, tmp_va, perm);
    assert!(rc >= 0, "fork: temporary map of child exception stack failed: {rc}");

    #[cfg(not(test))]
    unsafe {
        core::ptr::copy_nonoverlapping(exn_page as *const u8, tmp_va as *mut u8, PGSIZE);
    }

    let rc = syscall::page_unmap(b, self_id, tmp_va);
    assert!(rc >= 0, "fork: unmap of temporary exception-stack window failed: {rc}");
}

/// `fork()` (4.10). `tmp_va` is a page-aligned scratch address in the
/// parent's own space, unused by anything else, for the exception-stack
/// copy step; callers typically reserve one fixed page for this.
pub fn fork<B: SyscallBackend, V: AddrSpaceView>(b: &mut B, view: &V, self_id: u32, tmp_va: u32) -> u32 {
    install_pgfault_handler(b);

    let child = syscall::exofork(b);
    assert!(child >= 0, "fork: exofork failed: {child}");
    let child = child as u32;

    for_each_present_user_page(
        view,
        |va| va == UXSTACKTOP - PGSIZE as u32 || is_batch_buf_page(va),
        |va, flags| duppage(b, self_id, child, va, flags),
    );

    copy_exception_stack(b, self_id, child, tmp_va);

    let rc = syscall::env_set_pgfault_upcall(b, child, pgfault_entry_addr());
    assert!(rc >= 0, "fork: installing child upcall failed: {rc}");

    let rc = syscall::env_set_status(b, child, ENV_RUNNABLE);
    assert!(rc >= 0, "fork: marking child runnable failed: {rc}");

    child
}

/// `sfork()`: shares every non-stack page read-write instead of CoW-
/// protecting it, and only CoW-protects the ordinary user stack below
/// `UXSTACKTOP`'s page. Supplemented feature, grounded on
/// `examples/original_source/lib/fork.c`'s `sfork`.
pub fn sfork<B: SyscallBackend, V: AddrSpaceView>(b: &mut B, view: &V, self_id: u32, tmp_va: u32) -> u32 {
    install_pgfault_handler(b);

    let child = syscall::exofork(b);
    assert!(child >= 0, "sfork: exofork failed: {child}");
    let child = child as u32;

    let exn_page = UXSTACKTOP - PGSIZE as u32;
    let stack_page = USTACKTOP - PGSIZE as u32;

    for_each_present_user_page(
        view,
        |va| va == exn_page || is_batch_buf_page(va),
        |va, flags| {
            if va == stack_page {
                duppage(b, self_id, child, va, flags);
            } else {
                let rc = syscall::page_map(b, self_id, va, child, va, flags.bits());
                assert!(rc >= 0, "sfork: shared page_map failed: {rc}");
            }
        },
    );

    copy_exception_stack(b, self_id, child, tmp_va);

    let rc = syscall::env_set_pgfault_upcall(b, child, pgfault_entry_addr());
    assert!(rc >= 0, "sfork: installing child upcall failed: {rc}");

    let rc = syscall::env_set_status(b, child, ENV_RUNNABLE);
    assert!(rc >= 0, "sfork: marking child runnable failed: {rc}");

    child
}

/// Address of the user runtime's upcall entry trampoline; real builds
/// fill this in once the trampoline (`pgfault::upcall_entry`) has a fixed
/// link address, since `env_set_pgfault_upcall` needs a bare `u32`.
fn pgfault_entry_addr() -> u32 {
    crate::pgfault::upcall_entry as usize as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgtview::mock::MockView;
    use crate::syscall::mock::MockBackend;
    use alloc::vec;

    #[test]
    fn writable_page_classifies_as_cow() {
        let flags = PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE;
        assert_eq!(classify_duppage(flags), DupAction::CopyOnWrite);
    }

    #[test]
    fn already_cow_page_classifies_as_cow_again() {
        let flags = PtFlags::PRESENT | PtFlags::USER | PtFlags::COW;
        assert_eq!(classify_duppage(flags), DupAction::CopyOnWrite);
    }

    #[test]
    fn share_bit_wins_over_writable() {
        let flags = PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE | PtFlags::SHARE;
        assert_eq!(classify_duppage(flags), DupAction::Share(flags));
    }

    #[test]
    fn read_only_non_shared_page_is_plain() {
        let flags = PtFlags::PRESENT | PtFlags::USER;
        assert_eq!(classify_duppage(flags), DupAction::Plain(flags));
    }

    #[test]
    fn duppage_cow_remaps_both_sides_read_only() {
        let mut b = MockBackend::new(vec![0, 0]);
        let flags = PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE;
        duppage(&mut b, 1, 2, 0x1000, flags);
        assert_eq!(b.calls.len(), 2);
        let perm_to_child = b.calls[0].args[4];
        let perm_to_parent = b.calls[1].args[4];
        assert_eq!(perm_to_child, perm_to_parent);
        assert!(PtFlags::from_bits_truncate(perm_to_child).contains(PtFlags::COW));
        assert!(!PtFlags::from_bits_truncate(perm_to_child).contains(PtFlags::WRITABLE));
    }

    #[test]
    fn for_each_present_user_page_skips_exception_stack_top() {
        let mut view = MockView::default();
        let exn_page = UXSTACKTOP - PGSIZE as u32;
        let pdx = (exn_page >> 22) as usize;
        let ptx = ((exn_page >> 12) & 0x3ff) as usize;
        view.pdes.insert(pdx, 1);
        view.ptes.insert((pdx, ptx), PtFlags::PRESENT.bits());

        let mut seen = alloc::vec::Vec::new();
        for_each_present_user_page(&view, |va| va == exn_page, |va, _| seen.push(va));
        assert!(seen.is_empty());
    }
}
