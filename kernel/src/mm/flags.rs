use bitflags::bitflags;

bitflags! {
    /// Software and hardware-meaningful bits carried on a leaf entry
    /// (3, data model; 6, "software page-table bits").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Copy-on-write: the mapping is read-only in hardware; a write
        /// fault is expected and handled by the user runtime (4.10).
        const COW = 1 << 9;
        /// Two tasks intentionally share writes to this frame (4.10).
        const SHARE = 1 << 10;
        /// Page contents live in the backing store, not in `frame` (4.11).
        const IN_DISK = 1 << 11;

        /// Bits a caller of `insert`/`page_alloc`/`page_map` is allowed to
        /// set (4.2, permission policy).
        const PUBLIC = Self::USER.bits() | Self::WRITABLE.bits() | Self::PRESENT.bits()
            | Self::COW.bits() | Self::SHARE.bits() | Self::IN_DISK.bits();
    }
}

impl PtFlags {
    pub fn is_publicly_allowed(self) -> bool {
        PtFlags::PUBLIC.contains(self)
    }
}
