//! Boundary-Tag Memory Allocator
//!
//! A pool based allocator: memory pools are registered with a [PoolSet], which carves buffers out
//! of them and coalesces buffers as they are released. Each buffer is preceded by a boundary tag
//! recording its size and the size of the previous buffer when that one is free, so that neighbours
//! can be merged in constant time.
#![cfg_attr(not(test), no_std)]

mod block;
mod boxed;
mod bpool;
mod config;
mod debug;
mod mdbg;
mod poolset;
mod stats;

pub use boxed::PoolBox;
pub use bpool::SearchPolicy;
pub use config::SIZE_QUANT;
pub use poolset::{PoolError, PoolSet, Tagging};
pub use stats::MallocStats;
