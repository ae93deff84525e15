//! Kernel error kinds (spec.md 7) and their negative-integer ABI mapping.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Invalid or forbidden task id.
    BadEnv,
    /// Bad argument (unaligned va, disallowed perm bits, bad status, ...).
    Inval,
    /// Physical frame or second-level table exhausted.
    NoMem,
    /// No free environment-table slot.
    NoFreeEnv,
    /// Unknown syscall number.
    NoSys,
    /// `ipc_try_send` target is not currently receiving.
    IpcNotRecv,
    /// Backing-store inconsistency (bad slot, bad offset).
    Fault,
    /// No swap slot available.
    NoDisk,
}

impl KernelError {
    /// Negative machine-word encoding used as the syscall return value.
    pub const fn code(self) -> i32 {
        match self {
            KernelError::BadEnv => -1,
            KernelError::Inval => -2,
            KernelError::NoMem => -3,
            KernelError::NoFreeEnv => -4,
            KernelError::NoSys => -5,
            KernelError::IpcNotRecv => -6,
            KernelError::Fault => -7,
            KernelError::NoDisk => -8,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelError::BadEnv => "BadEnv",
            KernelError::Inval => "Inval",
            KernelError::NoMem => "NoMem",
            KernelError::NoFreeEnv => "NoFreeEnv",
            KernelError::NoSys => "NoSys",
            KernelError::IpcNotRecv => "IpcNotRecv",
            KernelError::Fault => "Fault",
            KernelError::NoDisk => "NoDisk",
        };
        f.write_str(name)
    }
}

pub type KResult<T> = Result<T, KernelError>;
