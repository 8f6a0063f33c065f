//!
//! Persistent-memory log object pools.
//!
//! Four fixed-shape object kinds back a user-space pmem I/O library: log
//! tables (radix-tree nodes), log entries (per-write metadata), log data
//! blocks (payload buffers in power-of-two size classes) and UMAs (mapped
//! region descriptors). Each kind is carved out of one contiguous mapping,
//! anonymous for tables and file-backed on the pmem mount for the rest, and
//! circulates through a two-tier LIFO free list for the life of the process.
//!
//! The global tier of every pool is guarded by its own mutex and carries the
//! authoritative count; the per-thread tier is owned by a [`LogLocal`] handle
//! and is lock-free. Bulk transfers of carrier batches amortize contention in
//! both directions, and a background worker keeps the table pool topped up so
//! mutator threads almost never block on the hot write path.
//!
#[macro_use]
extern crate log;
#[macro_use]
extern crate thiserror;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
extern crate errno;
extern crate libc;
#[macro_use]
extern crate num_derive;
extern crate num_traits;

#[macro_use]
pub mod errors;

pub mod config;
pub mod freelist;
pub mod region;
pub mod types;

pub mod alloc;
mod refill;

pub use self::alloc::{Allocator, LogLocal};
pub use self::config::{Config, LogSize};
pub use self::errors::{Error, Result};
pub use self::types::{LogEntry, LogTable, Policy, TableKind, Uma};

#[cfg(test)]
mod tests;
