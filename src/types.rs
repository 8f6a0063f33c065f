//! Pool object records.
//!
//! All records are `#[repr(C)]` and live inside the region backing their
//! pool; the allocator hands out interior pointers and never moves an object.
//! File-backed regions are zero-filled at creation, and every enum here makes
//! zero a valid discriminant.
//!
use libc;

use config::LogSize;

/// Child slots per log table node.
pub const NR_TABLE_SLOTS: usize = 512;

/// Role of a table node in a per-file index tree.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TableKind {
    /// Leaf node, slots point at log entries.
    Table = 0,
    /// Interior node, slots point at lower tables.
    Directory = 1,
}

/// Write-back policy of a mapped region and of entries logged under it.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Policy {
    Undo = 0,
    Redo = 1,
}

/// Radix-tree node mapping file-offset prefixes to lower tables or entries.
#[repr(C)]
pub struct LogTable {
    /// Live children below this node.
    pub count: u32,
    pub kind: TableKind,
    /// Back-reference to the parent node; relation only, never ownership.
    pub parent: *mut LogTable,
    /// Slot this node occupies in its parent.
    pub index: usize,
    /// Size class of the entries reached through this node.
    pub log_size: LogSize,
    pub slots: [*mut u8; NR_TABLE_SLOTS],
}

/// Metadata record for one logged write.
#[repr(C)]
pub struct LogEntry {
    pub epoch: u64,
    /// Offset of the logged range within its data block.
    pub offset: u64,
    pub len: u32,
    /// Set when neighboring writes have been merged into this entry.
    pub united: u32,
    pub policy: Policy,
    /// Checkpoint destination of the logged data.
    pub dst: *mut u8,
    /// Payload block exclusively owned by this entry while allocated.
    pub data: *mut u8,
    /// Lock storage allocated once per slot and retained across reuse;
    /// initialized on alloc, destroyed on free.
    pub rwlock: *mut libc::pthread_rwlock_t,
}

/// Descriptor of one user-space memory-mapped file region.
#[repr(C)]
pub struct Uma {
    /// Process-monotonic identifier assigned at allocation.
    pub id: u64,
    pub start: *mut u8,
    pub end: *mut u8,
    /// File offset the mapping starts at.
    pub offset: u64,
    pub ino: u64,
    pub epoch: u64,
    pub policy: Policy,
    /// Root of the per-file index tree.
    pub table: *mut LogTable,
    /// Lock storage initialized lazily on first allocation and retained for
    /// the life of the slot.
    pub rwlock: *mut libc::pthread_rwlock_t,
}
