//! Synchronous, single-copy, rendezvous IPC (spec.md 4.7).

use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::errors::{KernelError, KResult};
use crate::mm::flags::PtFlags;
use crate::mm::frame::FrameAllocator;
use crate::mm::pagetable::{self, TlbInvalidate};
use crate::mm::phys::PhysMemory;
use crate::mm::VirtAddr;

/// `ipc_recv(dstVa)`: records that the caller is willing to receive and
/// transitions it to Not-Runnable. Never returns a value to user code on
/// this path — the eventual sender fills in the caller's saved register
/// frame before marking it Runnable again (4.7, "continuation by
/// side-effect").
pub fn ipc_recv(envs: &mut EnvTable, receiver: EnvId, dst_va: u32) -> KResult<()> {
    let env = envs.get_mut(receiver).ok_or(KernelError::BadEnv)?;
    env.ipc.recving = true;
    env.ipc.dst_va = dst_va;
    env.status = EnvStatus::NotRunnable;
    Ok(())
}

/// `ipc_try_send(dstId, value, srcVa, perm)`: never blocks. Fails with
/// `IpcNotRecv` if the target isn't currently receiving. If both sides
/// opted into a page transfer, installs the sender's mapping into the
/// receiver, subject to the same read-only-to-writable rule as
/// `page_map`.
pub fn ipc_try_send(
    frames: &mut FrameAllocator,
    phys: &mut impl PhysMemory,
    tlb: &mut impl TlbInvalidate,
    envs: &mut EnvTable,
    sender: EnvId,
    dst_id: EnvId,
    value: u32,
    src_va: u32,
    perm: PtFlags,
) -> KResult<()> {
    {
        let receiver = envs.get(dst_id).ok_or(KernelError::BadEnv)?;
        if !receiver.ipc.recving {
            return Err(KernelError::IpcNotRecv);
        }
    }

    let wants_page = VirtAddr::new(src_va).is_user() && {
        let receiver = envs.get(dst_id).unwrap();
        VirtAddr::new(receiver.ipc.dst_va).is_user()
    };

    let perm_applied = if wants_page {
        let sender_root = envs.get(sender).ok_or(KernelError::BadEnv)?.root();
        let (src_frame, src_flags) = pagetable::lookup(frames, phys, sender_root, VirtAddr::new(src_va))?
            .ok_or(KernelError::Inval)?;
        if perm.contains(PtFlags::WRITABLE) && !src_flags.contains(PtFlags::WRITABLE) {
            return Err(KernelError::Inval);
        }

        let dst_va = envs.get(dst_id).unwrap().ipc.dst_va;
        let dst_root = envs.get(dst_id).unwrap().root();
        pagetable::insert(frames, phys, tlb, dst_root, VirtAddr::new(dst_va), src_frame, perm)?;
        perm.bits()
    } else {
        0
    };

    let receiver = envs.get_mut(dst_id).unwrap();
    receiver.ipc.from = sender.0;
    receiver.ipc.value = value;
    receiver.ipc.perm = perm_applied;
    receiver.ipc.recving = false;
    receiver.status = EnvStatus::Runnable;
    receiver.regs.regs.eax = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvId;
    use crate::mm::frame::FrameAllocator;
    use crate::mm::pagetable::NoopTlb;
    use crate::mm::phys::SimMemory;

    fn setup() -> (FrameAllocator, SimMemory, EnvTable) {
        (FrameAllocator::new(64, |_| false), SimMemory::new(64), EnvTable::new(0x1b, 0x23))
    }

    #[test]
    fn send_without_receiver_fails_with_no_effect() {
        let (mut frames, mut phys, mut envs) = setup();
        let mut tlb = NoopTlb;
        let a = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        let b = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();

        let err = ipc_try_send(&mut frames, &mut phys, &mut tlb, &mut envs, a, b, 42, 0, PtFlags::empty()).unwrap_err();
        assert_eq!(err, KernelError::IpcNotRecv);
    }

    #[test]
    fn send_with_page_transfer_installs_mapping_and_wakes_receiver() {
        let (mut frames, mut phys, mut envs) = setup();
        let mut tlb = NoopTlb;
        let sender = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        let receiver = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();

        let sender_root = envs.get(sender).unwrap().root();
        let page = frames.alloc(&mut phys, true).unwrap();
        pagetable::insert(
            &mut frames, &mut phys, &mut tlb, sender_root, VirtAddr::new(0x2000), page,
            PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE,
        ).unwrap();

        ipc_recv(&mut envs, receiver, 0x1000).unwrap();
        ipc_try_send(
            &mut frames, &mut phys, &mut tlb, &mut envs, sender, receiver, 0xDEADBEEF, 0x2000,
            PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE,
        ).unwrap();

        let r = envs.get(receiver).unwrap();
        assert_eq!(r.status, EnvStatus::Runnable);
        assert_eq!(r.ipc.value, 0xDEADBEEF);
        assert_eq!(r.ipc.from, sender.0);
        assert_eq!(r.regs.regs.eax, 0);

        let receiver_root = envs.get(receiver).unwrap().root();
        let (found, _) = pagetable::lookup(&mut frames, &mut phys, receiver_root, VirtAddr::new(0x1000)).unwrap().unwrap();
        assert_eq!(found, page);
    }

    #[test]
    fn send_cannot_upgrade_readonly_source_to_writable() {
        let (mut frames, mut phys, mut envs) = setup();
        let mut tlb = NoopTlb;
        let sender = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();
        let receiver = envs.alloc(&mut frames, &mut phys, None, EnvId::NONE).unwrap();

        let sender_root = envs.get(sender).unwrap().root();
        let page = frames.alloc(&mut phys, true).unwrap();
        pagetable::insert(
            &mut frames, &mut phys, &mut tlb, sender_root, VirtAddr::new(0x2000), page,
            PtFlags::PRESENT | PtFlags::USER,
        ).unwrap();

        ipc_recv(&mut envs, receiver, 0x1000).unwrap();
        let err = ipc_try_send(
            &mut frames, &mut phys, &mut tlb, &mut envs, sender, receiver, 1, 0x2000,
            PtFlags::PRESENT | PtFlags::USER | PtFlags::WRITABLE,
        ).unwrap_err();
        assert_eq!(err, KernelError::Inval);
    }
}
