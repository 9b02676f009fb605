//! TEE Core
//!
//! Kernel heaps and multi-guest support of the TEE core. The platform plugs in its console, its
//! MMU and its interrupt masking, then forwards the virtualization calls of the secure monitor to
//! the [smc] entry points.
#![cfg_attr(not(test), no_std)]

pub mod heap;
pub mod platform_config;
pub mod smc;

pub use heap::{HeapAllocator, KernelHeaps};
pub use smc::SmcReturn;

/// Sends the logs to `console`, up to `level`.
pub fn init_logging(console: &'static dyn logger::Console, level: log::LevelFilter) {
    logger::register_console(console);
    logger::init(level);
}
