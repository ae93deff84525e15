//! Fixed sizing and layout constants shared by every subsystem.
//!
//! Values follow the classic two-level, 32-bit-address-space design this
//! core implements (see `SPEC_FULL.md` 3): 4 KiB pages, 1024-entry tables,
//! a 4 GiB address space split at `UTOP`.

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const NPTENTRIES: usize = 1024;
pub const NPDENTRIES: usize = 1024;
/// Bytes spanned by one fully-populated second-level table.
pub const PTSIZE: usize = NPTENTRIES * PGSIZE;

/// Number of environment-table slots. Must be a power of two (4.4).
pub const NENV: usize = 1024;
pub const LOG2NENV: u32 = 10;

/// Number of swap slots in the backing store (6: `/pagefile`).
pub const NSWAPSLOTS: usize = 1024;

/// User/kernel boundary. Addresses `>= UTOP` are kernel-only.
pub const UTOP: u32 = 0xF000_0000;
/// Top of the user exception stack (one page, grows down from here).
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the ordinary user stack.
pub const USTACKTOP: u32 = 0xEEC0_0000;
/// Read-only window onto the current address space's leaf tables.
pub const UVPT: u32 = 0xEF40_0000;
/// Read-only window onto the current address space's root table.
pub const UVPD: u32 = 0xEF3F_F000;
/// Read-only window onto the environment table.
pub const UENVS: u32 = 0xEF00_0000;
/// Read-only window onto the frame-info array.
pub const UPAGES: u32 = 0xEE00_0000;

/// Virtual address of the batch-syscall buffer (4.13). Exempted from the
/// COW traversal inside `fork`.
pub const BATCH_BUF_VA: u32 = 0xED00_0000;
pub const BATCH_BUF_LEN: usize = 64;

pub const fn page_round_down(va: u32) -> u32 {
    va & !((PGSIZE as u32) - 1)
}

pub const fn is_page_aligned(va: u32) -> bool {
    va & ((PGSIZE as u32) - 1) == 0
}
