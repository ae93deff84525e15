//! Real-hardware glue: GDT/TSS, IDT, and the single big kernel lock (9,
//! "one `spin::Mutex<()>` conceptually held from trap entry to IRET").
//! Everything that can be expressed without touching real hardware lives
//! in `crate::mm`/`crate::env`/`crate::trap`/`crate::syscall` instead.

pub mod gdt;
pub mod interrupts;

use spin::Mutex;

pub static BIG_KERNEL_LOCK: Mutex<()> = Mutex::new(());
