//! Environment table and identifiers (spec.md 4.4).

use alloc::vec::Vec;

use crate::config::{LOG2NENV, NENV};
use crate::errors::{KernelError, KResult};
use crate::mm::{AddressSpace, FrameAllocator, FrameNo, VirtAddr};
use crate::mm::phys::PhysMemory;
use crate::trap::TrapFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const NONE: EnvId = EnvId(0);

    pub fn index(self) -> usize {
        (self.0 & ((1 << LOG2NENV) - 1)) as usize
    }

    fn generation(self) -> u32 {
        self.0 >> LOG2NENV
    }

    fn pack(index: usize, generation: u32) -> EnvId {
        EnvId((generation << LOG2NENV) | index as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Dying,
    Runnable,
    NotRunnable,
    Running,
}

/// IPC receive state (4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcState {
    pub recving: bool,
    pub dst_va: u32,
    pub from: u32,
    pub value: u32,
    pub perm: u32,
}

pub struct Env {
    pub id: EnvId,
    pub generation: u32,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub regs: TrapFrame,
    pub address_space: Option<AddressSpace>,
    pub pgfault_upcall: Option<VirtAddr>,
    pub other_exception_upcall: Option<VirtAddr>,
    pub ipc: IpcState,
    /// Lottery-scheduler ticket count (4.8).
    pub tickets: u32,
}

impl Env {
    fn fresh(index: usize, generation: u32) -> Self {
        Env {
            id: EnvId::pack(index, generation),
            generation,
            parent_id: EnvId::NONE,
            status: EnvStatus::Free,
            regs: TrapFrame::default(),
            address_space: None,
            pgfault_upcall: None,
            other_exception_upcall: None,
            ipc: IpcState::default(),
            tickets: 1,
        }
    }

    pub fn root(&self) -> FrameNo {
        self.address_space.as_ref().expect("live env has an address space").root
    }
}

/// Fixed-size array of `NENV` slots (4.4). A slot's generation increments
/// on every allocation so freed identifiers are never reissued.
pub struct EnvTable {
    slots: Vec<Env>,
    free_slots: Vec<usize>,
    /// User-mode code/stack/data selectors installed into a freshly
    /// allocated register frame.
    user_cs: u16,
    user_ds: u16,
}

impl EnvTable {
    pub fn new(user_cs: u16, user_ds: u16) -> Self {
        let mut slots = Vec::with_capacity(NENV);
        let mut free_slots = Vec::with_capacity(NENV);
        for i in 0..NENV {
            slots.push(Env::fresh(i, 0));
            free_slots.push(i);
        }
        // Pop order doesn't matter for correctness but scanning in index
        // order is easier to reason about in tests.
        free_slots.reverse();
        EnvTable { slots, free_slots, user_cs, user_ds }
    }

    pub fn get(&self, id: EnvId) -> Option<&Env> {
        let slot = self.slots.get(id.index())?;
        if slot.status == EnvStatus::Free || slot.generation != id.generation() {
            return None;
        }
        Some(slot)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.status == EnvStatus::Free || slot.generation != id.generation() {
            return None;
        }
        Some(slot)
    }

    /// `lookup` with the permission flag (4.4): the caller must either be
    /// the named task or its parent.
    pub fn lookup_checked(&self, id: EnvId, caller: EnvId) -> KResult<&Env> {
        let env = self.get(id).ok_or(KernelError::BadEnv)?;
        if id != caller && env.parent_id != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(env)
    }

    pub fn lookup_checked_mut(&mut self, id: EnvId, caller: EnvId) -> KResult<&mut Env> {
        let env = self.get_mut(id).ok_or(KernelError::BadEnv)?;
        if id != caller && env.parent_id != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(env)
    }

    /// Allocates a fresh environment as a child of `parent` (4.4). Installs
    /// a new address space (sharing the kernel half with `kernel_template`)
    /// and a zeroed register frame with user-mode selectors.
    pub fn alloc(
        &mut self,
        frames: &mut FrameAllocator,
        phys: &mut impl PhysMemory,
        kernel_template: Option<FrameNo>,
        parent: EnvId,
    ) -> KResult<EnvId> {
        let index = self.free_slots.pop().ok_or(KernelError::NoFreeEnv)?;
        let generation = self.slots[index].generation + 1;
        let space = match AddressSpace::new(frames, phys, kernel_template) {
            Ok(space) => space,
            Err(e) => {
                self.free_slots.push(index);
                return Err(e);
            }
        };

        let mut regs = TrapFrame::default();
        regs.cs = self.user_cs;
        regs.ds = self.user_ds;
        regs.es = self.user_ds;
        regs.ss = self.user_ds;
        regs.eflags = 0x202; // reserved bit + IF

        let env = Env {
            id: EnvId::pack(index, generation),
            generation,
            parent_id: parent,
            status: EnvStatus::NotRunnable,
            regs,
            address_space: Some(space),
            pgfault_upcall: None,
            other_exception_upcall: None,
            ipc: IpcState::default(),
            tickets: 1,
        };
        self.slots[index] = env;
        Ok(self.slots[index].id)
    }

    /// Destroys `id`: decrefs every frame reachable from its address
    /// space and returns the slot to the pool (4.4).
    pub fn destroy(
        &mut self,
        frames: &mut FrameAllocator,
        phys: &mut impl PhysMemory,
        tlb: &mut impl crate::mm::pagetable::TlbInvalidate,
        id: EnvId,
    ) -> KResult<()> {
        let index = id.index();
        let slot = self.slots.get(index).ok_or(KernelError::BadEnv)?;
        if slot.status == EnvStatus::Free || slot.generation != id.generation() {
            return Err(KernelError::BadEnv);
        }

        let generation = slot.generation;
        let mut freed = Env::fresh(index, generation);
        core::mem::swap(&mut self.slots[index], &mut freed);
        if let Some(space) = freed.address_space {
            space.destroy(frames, phys, tlb);
        }
        self.free_slots.push(index);
        Ok(())
    }

    pub fn set_status(&mut self, id: EnvId, status: EnvStatus) -> KResult<()> {
        let env = self.get_mut(id).ok_or(KernelError::BadEnv)?;
        env.status = status;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter(|e| e.status != EnvStatus::Free)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &Env {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Env {
        &mut self.slots[index]
    }
}
