//! Pool sizing and environment configuration.
//!
use std::env;
use std::path::PathBuf;

use num_traits::FromPrimitive;

use errors::{Error, Result};

/// Base page shift; one log entry tracks one page of logged data.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of data block size classes, 4 KiB through 2 MiB.
pub const NR_LOG_SIZES: usize = 10;

/// High watermark of a per-thread list, and the slab quantum for tables.
pub const MAX_FREE_NODES: u64 = 1024;

/// Carriers moved per bulk refill or spill.
pub const NR_FILL_NODES: u64 = 256;

/// Unit size the entry and data pool capacities are derived from.
pub const LOG_FILE_SIZE: usize = 1 << 30;

/// UMA slots provisioned in the uma file.
pub const MAX_NR_UMAS: usize = 1024;

/// Environment variable naming the persistent-memory mount.
pub const ENV_PMEM_PATH: &'static str = "PMEM_PATH";

/// Data block size classes. Class `s` holds blocks of
/// `1 << (PAGE_SHIFT + s)` bytes.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum LogSize {
    Log4K = 0,
    Log8K,
    Log16K,
    Log32K,
    Log64K,
    Log128K,
    Log256K,
    Log512K,
    Log1M,
    Log2M,
}

impl LogSize {
    /// Size class for a given index, if in range.
    pub fn from_class(idx: usize) -> Option<LogSize> {
        FromPrimitive::from_usize(idx)
    }

    /// Shift of the block size for this class.
    pub fn shift(self) -> usize {
        PAGE_SHIFT + self as usize
    }

    /// Block size in bytes.
    pub fn bytes(self) -> usize {
        1 << self.shift()
    }
}

/// Tunables of one allocator instance.
///
/// The defaults suit a production pmem mount; tests shrink them to keep the
/// provisioned files small.
#[derive(Clone, Debug)]
pub struct Config {
    /// Persistent-memory directory hosting this process's log files.
    pub root: PathBuf,
    /// High watermark of each per-thread list, and the table slab quantum.
    pub max_free_nodes: u64,
    /// Carriers moved per bulk refill or spill.
    pub nr_fill_nodes: u64,
    /// Unit size the entry and data pool capacities are derived from.
    pub log_file_size: usize,
    /// UMA slots provisioned in the uma file.
    pub max_nr_umas: usize,
    /// Tables provisioned at startup.
    pub initial_tables: u64,
    /// Run the background table refill worker.
    pub background_refill: bool,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(root: P) -> Config {
        Config {
            root: root.into(),
            max_free_nodes: MAX_FREE_NODES,
            nr_fill_nodes: NR_FILL_NODES,
            log_file_size: LOG_FILE_SIZE,
            max_nr_umas: MAX_NR_UMAS,
            initial_tables: MAX_FREE_NODES * 10,
            background_refill: true,
        }
    }

    /// Read the pmem root from `PMEM_PATH`.
    ///
    /// A trailing separator is stripped from an owned copy of the value; the
    /// environment itself is left untouched.
    pub fn from_env() -> Result<Config> {
        let mut root = env::var(ENV_PMEM_PATH).map_err(|_| Error::Env(ENV_PMEM_PATH))?;
        if root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Ok(Config::new(root))
    }
}
