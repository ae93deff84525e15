//! Memory layout constants as seen from user space. Mirrors
//! `kernel::config` rather than redefining the numbers, since both sides
//! of the ABI must agree on them by construction, not by convention.

pub use kernel::config::{
    BATCH_BUF_LEN, BATCH_BUF_VA, PGSIZE, UENVS, USTACKTOP, UTOP, UVPD, UVPT, UXSTACKTOP,
};

/// Scratch page for the copy-on-write fault handler's temporary mapping
/// (4.10) and for `fork`'s exception-stack copy. Not part of the kernel's
/// ABI — user space is free to pick any unused page below `USTACKTOP`.
pub const PFTEMP: u32 = USTACKTOP - 2 * (PGSIZE as u32);
