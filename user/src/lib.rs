#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod batch;
pub mod fork;
pub mod layout;
pub mod pgfault;
pub mod pgtview;
pub mod swap;
pub mod syscall;
