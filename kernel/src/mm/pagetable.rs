//! Per-address-space two-level page-table manager (spec.md 4.2).
//!
//! Tables are frames: a root (directory) table of 1024 `u32` directory
//! entries, each either absent or `(second_level_frame << 12) | PRESENT`;
//! a second-level (leaf) table of 1024 `u32` entries, each either absent
//! or `(frame << 12) | PtFlags`. This mirrors the on-disk/in-memory layout
//! real x86 hardware uses for its own page tables, which is also why the
//! flag bits in `PtFlags` fit in the low 12 bits and never collide with a
//! shifted frame number.

use super::flags::PtFlags;
use super::frame::{FrameAllocator, FrameNo};
use super::phys::PhysMemory;
use super::VirtAddr;
use crate::errors::{KernelError, KResult};

const DIRENT_PRESENT: u32 = 1;

/// Abstracts the one hardware side effect this module performs: flushing
/// a stale translation. A no-op on the host; a real `invlpg` on target.
pub trait TlbInvalidate {
    fn invalidate(&mut self, va: u32);
}

pub struct NoopTlb;
impl TlbInvalidate for NoopTlb {
    fn invalidate(&mut self, _va: u32) {}
}

/// Identifies a present or absent leaf slot located during a walk.
#[derive(Clone, Copy)]
pub struct LeafSlot {
    pub leaf_frame: FrameNo,
    pub index: usize,
}

fn dirent_frame(dirent: u32) -> FrameNo {
    FrameNo(dirent >> 12)
}

/// Walks the two-level structure rooted at `root` for `va`, optionally
/// materialising the second-level table if absent. Never touches the leaf
/// entry itself.
pub fn walk(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    root: FrameNo,
    va: VirtAddr,
    create: bool,
) -> KResult<Option<LeafSlot>> {
    let dir_idx = va.dir_index();
    let dirent = phys.read_u32(root, dir_idx * 4);

    let leaf_frame = if dirent & DIRENT_PRESENT != 0 {
        dirent_frame(dirent)
    } else if create {
        let new_table = frames.alloc(phys, true)?;
        phys.write_u32(root, dir_idx * 4, (new_table.0 << 12) | DIRENT_PRESENT);
        new_table
    } else {
        return Ok(None);
    };

    Ok(Some(LeafSlot {
        leaf_frame,
        index: va.table_index(),
    }))
}

/// Looks up the current mapping at `va`, if any.
pub fn lookup(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    root: FrameNo,
    va: VirtAddr,
) -> KResult<Option<(FrameNo, PtFlags)>> {
    let Some(slot) = walk(frames, phys, root, va, false)? else {
        return Ok(None);
    };
    let entry = phys.read_u32(slot.leaf_frame, slot.index * 4);
    let flags = PtFlags::from_bits_truncate(entry & 0xfff);
    if !flags.contains(PtFlags::PRESENT) {
        return Ok(None);
    }
    Ok(Some((dirent_frame(entry), flags)))
}

/// Installs `frame` at `va` with `perm`. Safe even when `frame` is already
/// the mapping at `va`: the new reference is taken before the old one is
/// dropped (4.2, idempotent self-insert).
pub fn insert(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    tlb: &mut impl TlbInvalidate,
    root: FrameNo,
    va: VirtAddr,
    frame: FrameNo,
    perm: PtFlags,
) -> KResult<()> {
    if !perm.contains(PtFlags::PRESENT | PtFlags::USER) || !perm.is_publicly_allowed() {
        return Err(KernelError::Inval);
    }

    let slot = walk(frames, phys, root, va, true)?.expect("walk(create=true) always yields a slot");

    frames.incref(frame);

    let old = phys.read_u32(slot.leaf_frame, slot.index * 4);
    let replaced_existing = old & PtFlags::PRESENT.bits() != 0;
    if replaced_existing {
        frames.decref(dirent_frame(old));
    }

    phys.write_u32(slot.leaf_frame, slot.index * 4, (frame.0 << 12) | perm.bits());

    if replaced_existing {
        tlb.invalidate(va.as_u32());
    }
    Ok(())
}

/// Clears any mapping at `va`. Silent success if none is present.
pub fn remove(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    tlb: &mut impl TlbInvalidate,
    root: FrameNo,
    va: VirtAddr,
) -> KResult<()> {
    let Some(slot) = walk(frames, phys, root, va, false)? else {
        return Ok(());
    };
    let entry = phys.read_u32(slot.leaf_frame, slot.index * 4);
    if entry & PtFlags::PRESENT.bits() == 0 {
        return Ok(());
    }

    phys.write_u32(slot.leaf_frame, slot.index * 4, 0);
    frames.decref(dirent_frame(entry));
    tlb.invalidate(va.as_u32());

    if !table_has_present_leaf(phys, slot.leaf_frame) {
        let dir_idx = va.dir_index();
        phys.write_u32(root, dir_idx * 4, 0);
        frames.decref(slot.leaf_frame);
    }
    Ok(())
}

fn table_has_present_leaf(phys: &impl PhysMemory, table: FrameNo) -> bool {
    (0..crate::config::NPTENTRIES).any(|i| phys.read_u32(table, i * 4) & PtFlags::PRESENT.bits() != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::phys::SimMemory;

    fn setup(nframes: usize) -> (FrameAllocator, SimMemory, FrameNo) {
        let mut frames = FrameAllocator::new(nframes, |_| false);
        let mut phys = SimMemory::new(nframes);
        let root = frames.alloc(&mut phys, true).unwrap();
        (frames, phys, root)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let (mut frames, mut phys, root) = setup(8);
        let mut tlb = NoopTlb;
        let page = frames.alloc(&mut phys, true).unwrap();
        let va = VirtAddr::new(0x1000);
        let perm = PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE;

        insert(&mut frames, &mut phys, &mut tlb, root, va, page, perm).unwrap();
        let (found, flags) = lookup(&mut frames, &mut phys, root, va).unwrap().unwrap();
        assert_eq!(found, page);
        assert_eq!(flags, perm);
    }

    #[test]
    fn self_insert_does_not_free_frame() {
        let (mut frames, mut phys, root) = setup(8);
        let mut tlb = NoopTlb;
        let page = frames.alloc(&mut phys, true).unwrap();
        let va = VirtAddr::new(0x1000);
        let perm = PtFlags::PRESENT | PtFlags::USER;

        insert(&mut frames, &mut phys, &mut tlb, root, va, page, perm).unwrap();
        assert_eq!(frames.refcount(page), 1);

        // Re-inserting the SAME frame at the SAME va must not transiently
        // drop the refcount to zero and free it out from under itself.
        insert(&mut frames, &mut phys, &mut tlb, root, va, page, perm).unwrap();
        assert_eq!(frames.refcount(page), 1);
        assert!(lookup(&mut frames, &mut phys, root, va).unwrap().is_some());
    }

    #[test]
    fn remove_decrefs_and_frees_empty_table() {
        let (mut frames, mut phys, root) = setup(8);
        let mut tlb = NoopTlb;
        let page = frames.alloc(&mut phys, true).unwrap();
        let va = VirtAddr::new(0x1000);
        let perm = PtFlags::PRESENT | PtFlags::USER;

        insert(&mut frames, &mut phys, &mut tlb, root, va, page, perm).unwrap();
        let before_free = frames.free_count();

        remove(&mut frames, &mut phys, &mut tlb, root, va).unwrap();
        assert_eq!(frames.refcount(page), 0);
        assert!(lookup(&mut frames, &mut phys, root, va).unwrap().is_none());
        // both the page and the now-empty leaf table return to the free list
        assert_eq!(frames.free_count(), before_free + 2);
    }

    #[test]
    fn remove_on_absent_mapping_is_silent_success() {
        let (mut frames, mut phys, root) = setup(4);
        let mut tlb = NoopTlb;
        remove(&mut frames, &mut phys, &mut tlb, root, VirtAddr::new(0x4000)).unwrap();
    }

    #[test]
    fn insert_rejects_disallowed_perm_bits() {
        let (mut frames, mut phys, root) = setup(8);
        let mut tlb = NoopTlb;
        let page = frames.alloc(&mut phys, true).unwrap();
        let bogus = PtFlags::from_bits_retain(PtFlags::PRESENT.bits() | (1 << 5));
        assert_eq!(
            insert(&mut frames, &mut phys, &mut tlb, root, VirtAddr::new(0x1000), page, bogus)
                .unwrap_err(),
            KernelError::Inval
        );
    }
}
