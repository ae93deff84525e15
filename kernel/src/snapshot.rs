//! State snapshot/restore (spec.md 4.12). One global slot; capture and
//! restore share a single page-walking routine so the number of pages
//! saved on capture and the number revisited on restore can never drift
//! apart (9, "an implementer should make the symmetry explicit" — the
//! flagged snapshot/restore counting bug in the source is fixed here by
//! construction rather than patched after the fact).

use alloc::vec::Vec;

use crate::config::PGSIZE;
use crate::env::{EnvId, EnvTable};
use crate::errors::{KernelError, KResult};
use crate::mm::addrspace::KERNEL_DIR_START;
use crate::mm::flags::PtFlags;
use crate::mm::frame::FrameAllocator;
use crate::mm::pagetable::{self, TlbInvalidate};
use crate::mm::phys::PhysMemory;
use crate::mm::VirtAddr;
use crate::trap::TrapFrame;

struct CapturedPage {
    va: u32,
    perm: PtFlags,
    content: [u8; PGSIZE],
}

struct CapturedEnv {
    parent_id: EnvId,
    regs: TrapFrame,
    status: crate::env::EnvStatus,
    pgfault_upcall: Option<crate::mm::VirtAddr>,
    other_exception_upcall: Option<crate::mm::VirtAddr>,
    ipc: crate::env::IpcState,
    tickets: u32,
}

pub struct Snapshot {
    id: EnvId,
    env: CapturedEnv,
    pages: Vec<CapturedPage>,
}

/// Every present user-space leaf in `root`, as `(va, perm)`. Shared by
/// capture (to know what to save) and would be shared by any future
/// teardown path that needs the exact same enumeration.
fn walk_present_user_pages(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    root: crate::mm::FrameNo,
) -> Vec<(u32, PtFlags)> {
    let mut out = Vec::new();
    for dir_idx in 0..KERNEL_DIR_START {
        let dirent = phys.read_u32(root, dir_idx * 4);
        if dirent & 1 == 0 {
            continue;
        }
        for table_idx in 0..crate::config::NPTENTRIES {
            let va = ((dir_idx as u32) << 22) | ((table_idx as u32) << 12);
            if let Ok(Some((_, flags))) = pagetable::lookup(frames, phys, root, VirtAddr::new(va)) {
                out.push((va, flags));
            }
        }
    }
    out
}

pub fn capture_state(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    envs: &EnvTable,
    id: EnvId,
) -> KResult<Snapshot> {
    let env = envs.get(id).ok_or(KernelError::BadEnv)?;
    let root = env.root();

    let leaves = walk_present_user_pages(frames, phys, root);
    let mut pages = Vec::with_capacity(leaves.len());
    for (va, perm) in leaves {
        let (frame, _) = pagetable::lookup(frames, phys, root, VirtAddr::new(va))?.unwrap();
        let mut content = [0u8; PGSIZE];
        phys.read_bytes(frame, 0, &mut content);
        pages.push(CapturedPage { va, perm, content });
    }

    Ok(Snapshot {
        id,
        env: CapturedEnv {
            parent_id: env.parent_id,
            regs: env.regs,
            status: env.status,
            pgfault_upcall: env.pgfault_upcall,
            other_exception_upcall: env.other_exception_upcall,
            ipc: env.ipc,
            tickets: env.tickets,
        },
        pages,
    })
}

/// Requires that `snapshot.id` is still live. Rewrites the task's struct
/// and every saved page's content, exactly the pages captured and no
/// others, re-establishing the mapping if it was removed since capture.
pub fn restore_state(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    tlb: &mut impl TlbInvalidate,
    envs: &mut EnvTable,
    snapshot: &Snapshot,
) -> KResult<()> {
    let env = envs.get_mut(snapshot.id).ok_or(KernelError::BadEnv)?;
    env.parent_id = snapshot.env.parent_id;
    env.regs = snapshot.env.regs;
    env.status = snapshot.env.status;
    env.pgfault_upcall = snapshot.env.pgfault_upcall;
    env.other_exception_upcall = snapshot.env.other_exception_upcall;
    env.ipc = snapshot.env.ipc;
    env.tickets = snapshot.env.tickets;
    let root = env.root();

    // Unmap anything present now that wasn't part of the capture: without
    // this, a `mutate()` that calls `page_alloc` at a fresh va would leave
    // that mapping intact after restore, so a post-restore read there
    // would succeed when it should fault as not-present (spec.md 8's
    // round-trip property).
    for (va, _) in walk_present_user_pages(frames, phys, root) {
        if !snapshot.pages.iter().any(|p| p.va == va) {
            pagetable::remove(frames, phys, tlb, root, VirtAddr::new(va))?;
        }
    }

    for page in &snapshot.pages {
        let va = VirtAddr::new(page.va);
        let frame = match pagetable::lookup(frames, phys, root, va)? {
            Some((frame, _)) => frame,
            None => {
                let frame = frames.alloc(phys, false)?;
                pagetable::insert(frames, phys, tlb, root, va, frame, page.perm)?;
                frame
            }
        };
        phys.write_bytes(frame, 0, &page.content);
    }
    Ok(())
}

/// Owns the kernel's single snapshot slot (9, "global snapshot slot").
#[derive(Default)]
pub struct SnapshotSlot {
    slot: Option<Snapshot>,
}

impl SnapshotSlot {
    pub const fn new() -> Self {
        SnapshotSlot { slot: None }
    }

    pub fn capture(
        &mut self,
        frames: &mut FrameAllocator,
        phys: &mut impl PhysMemory,
        envs: &EnvTable,
        id: EnvId,
    ) -> KResult<()> {
        if let Some(existing) = &self.slot {
            if envs.get(existing.id).is_some() {
                return Err(KernelError::NoMem);
            }
        }
        self.slot = Some(capture_state(frames, phys, envs, id)?);
        Ok(())
    }

    pub fn restore(
        &self,
        frames: &mut FrameAllocator,
        phys: &mut impl PhysMemory,
        tlb: &mut impl TlbInvalidate,
        envs: &mut EnvTable,
        id: EnvId,
    ) -> KResult<()> {
        let snapshot = self.slot.as_ref().ok_or(KernelError::Fault)?;
        if snapshot.id != id {
            return Err(KernelError::BadEnv);
        }
        restore_state(frames, phys, tlb, envs, snapshot)
    }
}
