//! Address-space lifecycle (spec.md 4.3).

use super::flags::PtFlags;
use super::frame::{FrameAllocator, FrameNo};
use super::pagetable::{self, TlbInvalidate};
use super::phys::PhysMemory;
use super::VirtAddr;
use crate::config::NPDENTRIES;
use crate::errors::KResult;

/// First root-table index belonging to the kernel half of the address
/// space (`UTOP`'s `dir_index()`).
pub const KERNEL_DIR_START: usize = VirtAddr::new(crate::config::UTOP).dir_index();

pub struct AddressSpace {
    pub root: FrameNo,
}

impl AddressSpace {
    /// Creates a fresh address space. The kernel half of the root table is
    /// copied from `template` (the second-level tables themselves are
    /// shared, not duplicated, across every address space).
    pub fn new(
        frames: &mut FrameAllocator,
        phys: &mut impl PhysMemory,
        template: Option<FrameNo>,
    ) -> KResult<Self> {
        let root = frames.alloc(phys, true)?;
        if let Some(template) = template {
            for idx in KERNEL_DIR_START..NPDENTRIES {
                let dirent = phys.read_u32(template, idx * 4);
                if dirent & 1 != 0 {
                    phys.write_u32(root, idx * 4, dirent);
                    frames.incref(FrameNo(dirent >> 12));
                }
            }
        }
        Ok(AddressSpace { root })
    }

    /// Tears down every user-half mapping and drops this address space's
    /// reference to the (shared) kernel-half tables, then frees the root
    /// itself (4.3).
    pub fn destroy(
        self,
        frames: &mut FrameAllocator,
        phys: &mut impl PhysMemory,
        tlb: &mut impl TlbInvalidate,
    ) {
        for dir_idx in 0..KERNEL_DIR_START {
            let dirent = phys.read_u32(self.root, dir_idx * 4);
            if dirent & 1 == 0 {
                continue;
            }
            for table_idx in 0..crate::config::NPTENTRIES {
                let va = VirtAddr::new(((dir_idx as u32) << 22) | ((table_idx as u32) << 12));
                let _ = pagetable::remove(frames, phys, tlb, self.root, va);
            }
        }

        for dir_idx in KERNEL_DIR_START..NPDENTRIES {
            let dirent = phys.read_u32(self.root, dir_idx * 4);
            if dirent & 1 != 0 {
                frames.decref(FrameNo(dirent >> 12));
            }
        }

        frames.decref(self.root);
    }
}
