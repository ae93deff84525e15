#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(abi_x86_interrupt))]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod arch;
pub mod config;
pub mod console;
pub mod env;
pub mod errors;
pub mod ipc;
pub mod logging;
pub mod mm;
pub mod monitor;
pub mod sched;
pub mod snapshot;
pub mod state;
pub mod trap;
pub mod syscall;

// `#[global_allocator]` is a whole-binary-process concern, not a
// shared-library one: `kernel` is linked into both the real `kernel` bin
// target (which needs it) and the `user` crate's host test binaries
// (which must not inherit an uninitialized one). The allocator therefore
// lives in `kernel/src/main.rs`, the bin target, not here.
