//! Background table refiller.
//!
//! Table allocation sits on the hot write path, so a dedicated worker appends
//! fresh anonymous slabs to the global table pool whenever a refill drains it
//! below the watermark. Mutators fall back to growing a slab synchronously
//! only when they outrun the worker and find the pool empty.
//!
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use freelist::{carve, FreeList, NodeCache};
use region::Region;
use types::LogTable;

#[derive(Default)]
struct Handshake {
    refill: bool,
    shutdown: bool,
}

/// The global table pool: its free list, the slabs backing it, and the
/// refill handshake.
pub struct TablePool {
    pub list: Mutex<FreeList>,
    slabs: Mutex<Vec<Region>>,
    provisioned: AtomicU64,
    handshake: Mutex<Handshake>,
    wakeup: Condvar,
    /// Tables added per appended slab.
    slab_tables: u64,
    background: bool,
}

impl TablePool {
    pub fn new(slab_tables: u64, background: bool) -> TablePool {
        TablePool {
            list: Mutex::new(FreeList::new()),
            slabs: Mutex::new(Vec::new()),
            provisioned: AtomicU64::new(0),
            handshake: Mutex::new(Handshake::default()),
            wakeup: Condvar::new(),
            slab_tables,
            background,
        }
    }

    /// Record a freshly carved region as part of this pool.
    pub fn adopt(&self, region: Region, tables: u64) {
        self.slabs.lock().unwrap().push(region);
        self.provisioned.fetch_add(tables, Ordering::SeqCst);
    }

    /// Tables carved across all slabs so far.
    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Map a fresh anonymous slab and splice its free list onto the global
    /// list. The list lock must already be held by the caller.
    pub fn append_slab(&self, list: &mut FreeList, nodes: &mut NodeCache) {
        let stride = mem::size_of::<LogTable>();
        let region = match Region::anonymous(self.slab_tables as usize * stride) {
            Ok(region) => region,
            Err(e) => fatal!("growing the table pool: {}", e),
        };

        list.push_chain(carve(region.base(), stride, self.slab_tables, nodes));
        self.adopt(region, self.slab_tables);

        debug!("appended {} tables to the global pool", self.slab_tables);
    }

    /// Post a refill request and wake the worker. Called with the list lock
    /// held, so the request is visible before any thread can observe the
    /// drained pool.
    pub fn request_refill(&self) {
        if !self.background {
            return;
        }

        let mut state = self.handshake.lock().unwrap();
        state.refill = true;
        self.wakeup.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.handshake.lock().unwrap();
        state.shutdown = true;
        self.wakeup.notify_one();
    }
}

/// Start the refill worker. It owns its carrier reservoir and shares nothing
/// but the table pool.
pub fn spawn(pool: Arc<TablePool>) -> JoinHandle<()> {
    thread::spawn(move || run(&pool))
}

/// Stop and join the worker.
pub fn stop(pool: &TablePool, handle: JoinHandle<()>) {
    pool.shutdown();
    let _ = handle.join();
}

fn run(pool: &TablePool) {
    debug!("table refill worker started");

    let mut nodes = NodeCache::new();

    loop {
        {
            let mut state = pool.handshake.lock().unwrap();
            while !state.refill && !state.shutdown {
                state = pool.wakeup.wait(state).unwrap();
            }
            if state.shutdown {
                return;
            }
        }

        debug!("refill worker woke up");

        // Mutators post requests while holding the list lock, so the
        // handshake lock is dropped before the list lock is taken here.
        {
            let mut list = pool.list.lock().unwrap();
            pool.append_slab(&mut list, &mut nodes);
        }

        pool.handshake.lock().unwrap().refill = false;
    }
}
