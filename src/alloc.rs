//! Typed allocation entry points over the pool tiers.
//!
//! [`Allocator`] owns the provisioned regions, the global tier of every pool,
//! the background refiller and the UMA id counter. All allocation and free
//! operations live on [`LogLocal`], the per-thread handle, which owns the
//! local tier and the carrier reservoir. The handle is not `Send`, so the
//! lock-free local tier can only ever be touched by its owning thread.
//!
use std::fs;
use std::mem;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use libc;

use config::{Config, LogSize, NR_LOG_SIZES, PAGE_SHIFT};
use errors::{AsResult, Result};
use freelist::{carve, FreeList, NodeCache};
use refill::{self, TablePool};
use region::{self, Region};
use types::{LogEntry, LogTable, TableKind, Uma};

/// A global pool tier backed by one file region.
struct FilePool {
    list: Mutex<FreeList>,
    region: Region,
    stride: usize,
    count: u64,
}

impl FilePool {
    fn new<P: AsRef<Path>>(path: P, file_len: usize, stride: usize, count: u64, nodes: &mut NodeCache) -> Result<FilePool> {
        let region = Region::file(path, file_len)?;

        let mut list = FreeList::new();
        list.push_chain(carve(region.base(), stride, count, nodes));

        Ok(FilePool {
            list: Mutex::new(list),
            region,
            stride,
            count,
        })
    }

    fn free_count(&self) -> u64 {
        self.list.lock().unwrap().count()
    }

    /// Address of slot `i`, independent of the slot's pool state.
    fn slot(&self, i: u64) -> *mut u8 {
        unsafe { self.region.base().add(i as usize * self.stride) }
    }
}

/// Process-wide allocator state.
///
/// Dropping the last reference stops the refill worker, releases every
/// carrier and lock storage, unmaps the regions and removes the log
/// directory; any object still handed out is invalidated at that point.
pub struct Allocator {
    cfg: Config,
    dir: PathBuf,
    tables: Arc<TablePool>,
    entries: FilePool,
    data: Vec<FilePool>,
    umas: FilePool,
    uma_id: AtomicU64,
    refiller: Mutex<Option<JoinHandle<()>>>,
    cleaned: AtomicBool,
}

impl Allocator {
    /// Provision the pools under the directory named by `PMEM_PATH`.
    pub fn from_env() -> Result<Arc<Allocator>> {
        Allocator::with_config(Config::from_env()?)
    }

    /// Provision every pool family under `cfg.root` and start the refill
    /// worker.
    ///
    /// Creates the per-process log directory and, inside it, one file per
    /// file-backed pool: `entries.log`, `data-<class>.log` per size class
    /// and `umas.log`, each pre-allocated to its full size.
    pub fn with_config(cfg: Config) -> Result<Arc<Allocator>> {
        let dir = cfg.root.join(format!(".libnvmmio-{}", process::id()));

        let mut builder = fs::DirBuilder::new();
        builder.mode(0o777);
        builder.create(&dir)?;

        let mut nodes = NodeCache::new();

        let tables = Arc::new(TablePool::new(cfg.max_free_nodes, cfg.background_refill));
        let table_stride = mem::size_of::<LogTable>();
        let seed = Region::anonymous(cfg.initial_tables as usize * table_stride)?;
        {
            let mut list = tables.list.lock().unwrap();
            list.push_chain(carve(seed.base(), table_stride, cfg.initial_tables, &mut nodes));
        }
        tables.adopt(seed, cfg.initial_tables);

        let entry_stride = mem::size_of::<LogEntry>();
        let entry_count = ((cfg.log_file_size * 32) >> PAGE_SHIFT) as u64;
        let entries = FilePool::new(
            dir.join("entries.log"),
            entry_count as usize * entry_stride,
            entry_stride,
            entry_count,
            &mut nodes,
        )?;
        init_entry_locks(&entries);

        let mut data = Vec::with_capacity(NR_LOG_SIZES);
        for class in 0..NR_LOG_SIZES {
            let size = LogSize::from_class(class).unwrap();
            let file_len = cfg.log_file_size * 2;
            data.push(FilePool::new(
                dir.join(format!("data-{}.log", class)),
                file_len,
                size.bytes(),
                (file_len >> size.shift()) as u64,
                &mut nodes,
            )?);
        }

        let uma_stride = mem::size_of::<Uma>();
        let umas = FilePool::new(
            dir.join("umas.log"),
            cfg.max_nr_umas * uma_stride,
            uma_stride,
            cfg.max_nr_umas as u64,
            &mut nodes,
        )?;

        let background = cfg.background_refill;
        let alloc = Arc::new(Allocator {
            cfg,
            dir,
            tables,
            entries,
            data,
            umas,
            uma_id: AtomicU64::new(0),
            refiller: Mutex::new(None),
            cleaned: AtomicBool::new(false),
        });

        if background {
            let handle = refill::spawn(Arc::clone(&alloc.tables));
            *alloc.refiller.lock().unwrap() = Some(handle);
        }

        Ok(alloc)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Per-process log directory this allocator provisioned.
    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Free tables in the global tier.
    pub fn global_tables(&self) -> u64 {
        self.tables.list.lock().unwrap().count()
    }

    /// Tables provisioned across all slabs so far.
    pub fn table_capacity(&self) -> u64 {
        self.tables.provisioned()
    }

    /// Free entries in the global tier.
    pub fn global_entries(&self) -> u64 {
        self.entries.free_count()
    }

    pub fn entry_capacity(&self) -> u64 {
        self.entries.count
    }

    /// Free data blocks of `size` in the global tier.
    pub fn global_data(&self, size: LogSize) -> u64 {
        self.data[size as usize].free_count()
    }

    pub fn data_capacity(&self, size: LogSize) -> u64 {
        self.data[size as usize].count
    }

    /// Free UMA slots in the global pool.
    pub fn global_umas(&self) -> u64 {
        self.umas.free_count()
    }

    /// Verify count coherence of every global tier: each stored count must
    /// equal the length reachable from the list head. Panics on mismatch.
    pub fn audit(&self) {
        {
            let list = self.tables.list.lock().unwrap();
            assert_eq!(list.count(), list.walk_len(), "global table pool");
        }
        {
            let list = self.entries.list.lock().unwrap();
            assert_eq!(list.count(), list.walk_len(), "global entry pool");
        }
        for (class, pool) in self.data.iter().enumerate() {
            let list = pool.list.lock().unwrap();
            assert_eq!(list.count(), list.walk_len(), "global data pool {}", class);
        }
        {
            let list = self.umas.list.lock().unwrap();
            assert_eq!(list.count(), list.walk_len(), "global uma pool");
        }
    }

    /// Stop the background worker. Harmless if it was never started or has
    /// already been stopped.
    pub fn stop_refiller(&self) {
        if let Some(handle) = self.refiller.lock().unwrap().take() {
            refill::stop(&self.tables, handle);
        }
    }

    /// Unlink the per-process log files and remove the directory. The pools
    /// are not persistent across runs.
    pub fn cleanup_logs(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = region::remove_log_dir(&self.dir) {
            fatal!("removing {}: {}", self.dir.display(), e);
        }
    }

    fn next_uma_id(&self) -> u64 {
        self.uma_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.stop_refiller();

        self.tables.list.lock().unwrap().clear();
        self.entries.list.lock().unwrap().clear();
        for pool in &self.data {
            pool.list.lock().unwrap().clear();
        }
        self.umas.list.lock().unwrap().clear();

        // lock storage lives on the heap, keyed from the region slots
        for i in 0..self.entries.count {
            let entry = self.entries.slot(i) as *mut LogEntry;
            unsafe {
                let rwlock = (*entry).rwlock;
                if !rwlock.is_null() {
                    (*entry).rwlock = ptr::null_mut();
                    drop(Box::from_raw(rwlock));
                }
            }
        }
        for i in 0..self.umas.count {
            let uma = self.umas.slot(i) as *mut Uma;
            unsafe {
                let rwlock = (*uma).rwlock;
                if !rwlock.is_null() {
                    (*uma).rwlock = ptr::null_mut();
                    drop(Box::from_raw(rwlock));
                }
            }
        }

        self.cleanup_logs();
    }
}

/// Every entry slot gets its lock storage up front; the storage is reused
/// across allocations of the slot.
fn init_entry_locks(pool: &FilePool) {
    for i in 0..pool.count {
        let entry = pool.slot(i) as *mut LogEntry;
        unsafe {
            (*entry).rwlock = Box::into_raw(Box::new(libc::PTHREAD_RWLOCK_INITIALIZER));
        }
    }
}

/// Per-thread allocation handle.
///
/// Owns the local tier of the table, entry and data pools plus the carrier
/// reservoir. Dropping the handle drains every local tier back to the global
/// pools.
pub struct LogLocal {
    global: Arc<Allocator>,
    tables: FreeList,
    entries: FreeList,
    data: Vec<FreeList>,
    nodes: NodeCache,
}

impl LogLocal {
    /// Create the calling thread's allocation handle.
    pub fn new(global: &Arc<Allocator>) -> LogLocal {
        let mut data = Vec::with_capacity(NR_LOG_SIZES);
        for _ in 0..NR_LOG_SIZES {
            data.push(FreeList::new());
        }

        LogLocal {
            global: Arc::clone(global),
            tables: FreeList::new(),
            entries: FreeList::new(),
            data,
            nodes: NodeCache::new(),
        }
    }

    /// Shared allocator behind this handle.
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.global
    }

    pub fn local_tables(&self) -> u64 {
        self.tables.count()
    }

    pub fn local_entries(&self) -> u64 {
        self.entries.count()
    }

    pub fn local_data(&self, size: LogSize) -> u64 {
        self.data[size as usize].count()
    }

    /// Verify count coherence of every local tier. Panics on mismatch.
    pub fn audit(&self) {
        assert_eq!(self.tables.count(), self.tables.walk_len(), "local table tier");
        assert_eq!(self.entries.count(), self.entries.walk_len(), "local entry tier");
        for (class, list) in self.data.iter().enumerate() {
            assert_eq!(list.count(), list.walk_len(), "local data tier {}", class);
        }
    }

    /// Take a table from the local tier, refilling from the global pool when
    /// the tier is empty, and initialize its metadata.
    pub fn alloc_log_table(&mut self, parent: *mut LogTable, index: usize, kind: TableKind) -> NonNull<LogTable> {
        if self.tables.is_empty() {
            self.fill_local_tables();
        }

        let table = Self::pop_payload(&mut self.tables, &mut self.nodes) as *mut LogTable;
        unsafe {
            (*table).count = 0;
            (*table).kind = kind;
            (*table).parent = parent;
            (*table).index = index;
            (*table).log_size = LogSize::Log4K;

            NonNull::new_unchecked(table)
        }
    }

    /// Return a table to the local tier, spilling a batch to the global pool
    /// past the watermark.
    pub fn free_log_table(&mut self, table: NonNull<LogTable>) {
        let node = self.nodes.alloc();
        unsafe {
            (*node).payload = table.as_ptr() as *mut u8;
        }
        self.tables.push(node);

        if self.tables.count() > self.global.cfg.max_free_nodes {
            let chain = self.tables.take_chain(self.global.cfg.nr_fill_nodes);
            self.global.tables.list.lock().unwrap().push_chain(chain);
        }
    }

    /// Allocate an entry paired with a data block of `size`, wired to the
    /// owning region's epoch and policy.
    pub fn alloc_log_entry(&mut self, uma: &Uma, size: LogSize) -> NonNull<LogEntry> {
        if self.entries.is_empty() {
            self.fill_local_entries();
        }

        let entry = Self::pop_payload(&mut self.entries, &mut self.nodes) as *mut LogEntry;
        let data = self.alloc_log_data(size);

        unsafe {
            (*entry).epoch = uma.epoch;
            (*entry).offset = 0;
            (*entry).len = 0;
            (*entry).policy = uma.policy;
            (*entry).dst = ptr::null_mut();
            (*entry).data = data;

            if let Err(e) = libc::pthread_rwlock_init((*entry).rwlock, ptr::null()).as_result() {
                fatal!("pthread_rwlock_init: {}", e);
            }

            NonNull::new_unchecked(entry)
        }
    }

    /// Return an entry and its data block to the local tiers.
    ///
    /// With `persist` the cleared metadata is flushed to media before the
    /// entry is recycled. Either push may spill a batch to the matching
    /// global pool.
    pub fn free_log_entry(&mut self, entry: NonNull<LogEntry>, size: LogSize, persist: bool) {
        let entry = entry.as_ptr();

        let data = unsafe {
            let data = (*entry).data;
            (*entry).united = 0;
            (*entry).data = ptr::null_mut();
            (*entry).dst = ptr::null_mut();
            data
        };

        if persist {
            region::persist(entry as *const u8, mem::size_of::<LogEntry>());
        }

        unsafe {
            if let Err(e) = libc::pthread_rwlock_destroy((*entry).rwlock).as_result() {
                fatal!("pthread_rwlock_destroy: {}", e);
            }
        }

        self.put_data_local(data, size);
        self.put_entry_local(entry as *mut u8);
    }

    /// Take a UMA slot from the global pool and stamp it with a fresh
    /// monotonic id. UMAs are rare and long-lived, so they have no local
    /// tier.
    pub fn alloc_uma(&mut self) -> NonNull<Uma> {
        let node = {
            let mut list = self.global.umas.list.lock().unwrap();
            match list.pop() {
                Some(node) => node,
                None => fatal!("global uma pool is exhausted"),
            }
        };

        let uma = unsafe { (*node).payload } as *mut Uma;
        if uma.is_null() {
            fatal!("free list carrier holds a null payload");
        }
        self.nodes.free(node);

        unsafe {
            if (*uma).rwlock.is_null() {
                (*uma).rwlock = Box::into_raw(Box::new(libc::PTHREAD_RWLOCK_INITIALIZER));
            }
            (*uma).id = self.global.next_uma_id();

            NonNull::new_unchecked(uma)
        }
    }

    /// Return a UMA slot to the global pool. Its lock storage is retained
    /// for reuse.
    pub fn free_uma(&mut self, uma: NonNull<Uma>) {
        let node = self.nodes.alloc();
        unsafe {
            (*node).payload = uma.as_ptr() as *mut u8;
        }
        self.global.umas.list.lock().unwrap().push(node);
    }

    /// Drain the local entry tier back to the global pool. Runs on handle
    /// drop; also callable explicitly at thread exit.
    pub fn release_local_list(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let chain = self.entries.take_all();
        self.global.entries.list.lock().unwrap().push_chain(chain);
    }

    /// Pop a data block of `size` straight from the global pool. Blocks are
    /// allocated globally and freed through the local tier: allocation
    /// happens once per entry alloc, free once per entry free, so only the
    /// free side is worth the local batching.
    fn alloc_log_data(&mut self, size: LogSize) -> *mut u8 {
        let node = {
            let mut list = self.global.data[size as usize].list.lock().unwrap();
            match list.pop() {
                Some(node) => node,
                None => fatal!("global data pool {:?} is exhausted", size),
            }
        };

        let data = unsafe { (*node).payload };
        if data.is_null() {
            fatal!("free list carrier holds a null payload");
        }
        self.nodes.free(node);

        data
    }

    /// Refill the local table tier, growing the pool synchronously when the
    /// global list is empty and waking the refiller when it drops below the
    /// watermark.
    fn fill_local_tables(&mut self) {
        let pool = &self.global.tables;

        let mut list = pool.list.lock().unwrap();
        if list.is_empty() {
            pool.append_slab(&mut list, &mut self.nodes);
        }

        self.tables.push_chain(list.take_chain(self.global.cfg.nr_fill_nodes));

        if list.count() < self.global.cfg.max_free_nodes {
            pool.request_refill();
        }
    }

    /// Refill the local entry tier. The entry pool is provisioned to
    /// saturation, so an empty global list is a sizing bug.
    fn fill_local_entries(&mut self) {
        let mut list = self.global.entries.list.lock().unwrap();
        if list.is_empty() {
            fatal!("global entry pool is exhausted");
        }

        self.entries.push_chain(list.take_chain(self.global.cfg.nr_fill_nodes));
    }

    fn put_entry_local(&mut self, entry: *mut u8) {
        let node = self.nodes.alloc();
        unsafe {
            (*node).payload = entry;
        }
        self.entries.push(node);

        if self.entries.count() > self.global.cfg.max_free_nodes {
            let chain = self.entries.take_chain(self.global.cfg.nr_fill_nodes);
            self.global.entries.list.lock().unwrap().push_chain(chain);
        }
    }

    fn put_data_local(&mut self, data: *mut u8, size: LogSize) {
        let node = self.nodes.alloc();
        unsafe {
            (*node).payload = data;
        }
        self.data[size as usize].push(node);

        if self.data[size as usize].count() > self.global.cfg.max_free_nodes {
            let chain = self.data[size as usize].take_chain(self.global.cfg.nr_fill_nodes);
            self.global.data[size as usize].list.lock().unwrap().push_chain(chain);
        }
    }

    fn pop_payload(list: &mut FreeList, nodes: &mut NodeCache) -> *mut u8 {
        let node = match list.pop() {
            Some(node) => node,
            None => fatal!("local free list drained under its owner"),
        };

        let payload = unsafe { (*node).payload };
        if payload.is_null() {
            fatal!("free list carrier holds a null payload");
        }
        nodes.free(node);

        payload
    }
}

impl Drop for LogLocal {
    fn drop(&mut self) {
        self.release_local_list();

        let chain = self.tables.take_all();
        self.global.tables.list.lock().unwrap().push_chain(chain);

        for class in 0..NR_LOG_SIZES {
            let chain = self.data[class].take_all();
            self.global.data[class].list.lock().unwrap().push_chain(chain);
        }
    }
}
