//! Read-only view onto the current address space's own page tables,
//! mirroring the kernel's `UVPT`/`UVPD` self-mapping (`layout::UVPT`,
//! `layout::UVPD`). `fork`/`duppage` need to inspect permission bits
//! without a syscall for every page; this is how user space gets that
//! without touching kernel memory directly.

use crate::layout::{UVPD, UVPT};
use kernel::config::{NPDENTRIES, NPTENTRIES};

/// Raw root/leaf entries for one virtual page, in the same `u32` layout
/// `kernel::mm::pagetable` uses: `(frame_no << 12) | flags`.
pub trait AddrSpaceView {
    fn pde(&self, pdx: usize) -> u32;
    fn pte(&self, pdx: usize, ptx: usize) -> u32;
}

fn split(va: u32) -> (usize, usize) {
    let pdx = (va >> 22) as usize;
    let ptx = ((va >> 12) & 0x3ff) as usize;
    (pdx, ptx)
}

/// Looks up the leaf entry for `va`, or `None` if the root entry covering
/// it isn't present (mirrors `kernel::mm::pagetable::lookup`'s first step).
pub fn entry_for<V: AddrSpaceView>(view: &V, va: u32) -> Option<u32> {
    let (pdx, ptx) = split(va);
    if pdx >= NPDENTRIES || view.pde(pdx) & 1 == 0 {
        return None;
    }
    Some(view.pte(pdx, ptx))
}

/// Reads the real `UVPD`/`UVPT` self-mapping windows via raw pointers.
/// Safety depends entirely on the kernel having installed those windows
/// read-only over the caller's own address space, per `layout`.
#[cfg(not(test))]
pub struct Uvpt;

#[cfg(not(test))]
impl AddrSpaceView for Uvpt {
    fn pde(&self, pdx: usize) -> u32 {
        unsafe { core::ptr::read_volatile((UVPD as *const u32).add(pdx)) }
    }

    fn pte(&self, pdx: usize, ptx: usize) -> u32 {
        unsafe { core::ptr::read_volatile((UVPT as *const u32).add(pdx * NPTENTRIES + ptx)) }
    }
}

#[cfg(test)]
pub mod mock {
    use super::AddrSpaceView;
    use alloc::collections::BTreeMap;

    #[derive(Default)]
    pub struct MockView {
        pub pdes: BTreeMap<usize, u32>,
        pub ptes: BTreeMap<(usize, usize), u32>,
    }

    impl AddrSpaceView for MockView {
        fn pde(&self, pdx: usize) -> u32 {
            *self.pdes.get(&pdx).unwrap_or(&0)
        }

        fn pte(&self, pdx: usize, ptx: usize) -> u32 {
            *self.ptes.get(&(pdx, ptx)).unwrap_or(&0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockView;
    use super::*;

    #[test]
    fn absent_root_entry_yields_none() {
        let view = MockView::default();
        assert_eq!(entry_for(&view, 0x1000), None);
    }

    #[test]
    fn present_root_and_leaf_yields_entry() {
        let mut view = MockView::default();
        let (pdx, ptx) = split(0x4000);
        view.pdes.insert(pdx, 1);
        view.ptes.insert((pdx, ptx), 0xABCD_1007);
        assert_eq!(entry_for(&view, 0x4000), Some(0xABCD_1007));
    }
}
