extern crate num_cpus;
extern crate pretty_env_logger;

use std::collections::HashSet;
use std::env;
use std::fs;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::alloc::{Allocator, LogLocal};
use super::config::{Config, LogSize, ENV_PMEM_PATH};
use super::types::TableKind;

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A config over a fresh scratch directory, shrunk so every pool stays tiny:
/// 512 entries, 32 data blocks in the 4K class, 64 umas.
fn small_config() -> Config {
    let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    let root = env::temp_dir().join(format!("nvmmio-test-{}-{}", process::id(), seq));
    fs::create_dir_all(&root).unwrap();

    let mut cfg = Config::new(root);
    cfg.max_free_nodes = 8;
    cfg.nr_fill_nodes = 4;
    cfg.log_file_size = 1 << 16;
    cfg.max_nr_umas = 64;
    cfg.initial_tables = 80;
    cfg
}

#[test]
fn test_table_lifecycle() {
    let _ = pretty_env_logger::try_init();

    let cfg = small_config();
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        let mut local = LogLocal::new(&alloc);

        assert_eq!(alloc.global_tables(), 80);
        assert_eq!(alloc.table_capacity(), 80);

        let mut tables = Vec::new();
        tables.push(local.alloc_log_table(ptr::null_mut(), 0, TableKind::Directory));

        // one refill moved a batch down, one table came off it
        assert_eq!(local.local_tables(), 3);
        assert_eq!(alloc.global_tables(), 76);

        let root_table = tables[0].as_ptr();
        for index in 1..5 {
            tables.push(local.alloc_log_table(root_table, index, TableKind::Table));
        }

        // the fifth allocation forced a second refill
        assert_eq!(local.local_tables(), 3);
        assert_eq!(alloc.global_tables(), 72);

        unsafe {
            let table = tables[1].as_ref();
            assert_eq!(table.count, 0);
            assert_eq!(table.kind, TableKind::Table);
            assert_eq!(table.parent, root_table);
            assert_eq!(table.index, 1);
            assert_eq!(table.log_size, LogSize::Log4K);
        }

        for table in tables.drain(..) {
            local.free_log_table(table);
        }
        assert_eq!(local.local_tables(), 8);

        local.audit();
        alloc.audit();
        assert_eq!(
            alloc.global_tables() + local.local_tables(),
            alloc.table_capacity()
        );

        drop(local);
        assert_eq!(alloc.global_tables(), 80);
    }

    // teardown removed the log directory, leaving the scratch root empty
    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_entry_spill() {
    let _ = pretty_env_logger::try_init();

    let mut cfg = small_config();
    cfg.max_free_nodes = 4;
    cfg.nr_fill_nodes = 2;
    cfg.initial_tables = 40;
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        let mut local = LogLocal::new(&alloc);

        let entry_cap = alloc.entry_capacity();
        let data_cap = alloc.data_capacity(LogSize::Log4K);
        assert_eq!(entry_cap, 512);
        assert_eq!(data_cap, 32);

        let uma = local.alloc_uma();

        let mut entries = Vec::new();
        for _ in 0..6 {
            entries.push(local.alloc_log_entry(unsafe { uma.as_ref() }, LogSize::Log4K));
        }
        assert_eq!(local.local_entries(), 0);
        assert_eq!(alloc.global_entries(), entry_cap - 6);
        assert_eq!(alloc.global_data(LogSize::Log4K), data_cap - 6);

        for entry in entries.drain(..) {
            local.free_log_entry(entry, LogSize::Log4K, false);
        }

        // the fifth free crossed the watermark: exactly one spill of
        // nr_fill_nodes carriers in the entry tier and in the data tier
        assert_eq!(local.local_entries(), 4);
        assert_eq!(alloc.global_entries(), entry_cap - 4);
        assert_eq!(local.local_data(LogSize::Log4K), 4);
        assert_eq!(alloc.global_data(LogSize::Log4K), data_cap - 4);

        local.free_uma(uma);
        local.audit();
        alloc.audit();

        // handle drop returns every cached object
        drop(local);
        assert_eq!(alloc.global_entries(), entry_cap);
        assert_eq!(alloc.global_data(LogSize::Log4K), data_cap);
        assert_eq!(alloc.global_umas(), 64);
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_background_refill() {
    let _ = pretty_env_logger::try_init();

    let mut cfg = small_config();
    cfg.initial_tables = 8;
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        let mut local = LogLocal::new(&alloc);

        let table = local.alloc_log_table(ptr::null_mut(), 0, TableKind::Directory);

        // the refill dropped the global pool to 4, under the watermark of 8
        assert_eq!(local.local_tables(), 3);

        let deadline = Instant::now() + Duration::from_secs(5);
        while alloc.global_tables() < 12 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        // the worker appended one slab of max_free_nodes tables; the global
        // pool never ran empty, so the mutator never grew it synchronously
        assert_eq!(alloc.global_tables(), 12);
        assert_eq!(alloc.table_capacity(), 16);
        alloc.audit();

        local.free_log_table(table);
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_synchronous_fallback() {
    let _ = pretty_env_logger::try_init();

    let mut cfg = small_config();
    cfg.background_refill = false;
    cfg.initial_tables = 8;
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        let mut local = LogLocal::new(&alloc);

        let mut tables = Vec::new();
        for index in 0..40 {
            tables.push(local.alloc_log_table(ptr::null_mut(), index, TableKind::Table));

            alloc.audit();
            local.audit();
            assert!(local.local_tables() <= 8 + 4);
            assert_eq!(
                alloc.global_tables() + local.local_tables() + tables.len() as u64,
                alloc.table_capacity()
            );
        }

        // allocation kept succeeding by growing the drained pool in place
        assert!(alloc.table_capacity() > 8);

        for table in tables.drain(..) {
            local.free_log_table(table);
        }
        alloc.audit();
        local.audit();
        assert_eq!(
            alloc.global_tables() + local.local_tables(),
            alloc.table_capacity()
        );
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_uma_ids() {
    let _ = pretty_env_logger::try_init();

    let cfg = small_config();
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let mut local = LogLocal::new(&alloc);
                    let mut ids = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        let uma = local.alloc_uma();
                        ids.push(unsafe { uma.as_ref().id });
                        local.free_uma(uma);
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            let ids = thread.join().unwrap();

            // monotone within a thread, unique across all of them
            for window in ids.windows(2) {
                assert!(window[0] < window[1]);
            }
            for id in ids {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(alloc.global_umas(), 64);
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_entry_reuse() {
    let _ = pretty_env_logger::try_init();

    let cfg = small_config();
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        let mut local = LogLocal::new(&alloc);

        let uma = local.alloc_uma();

        let first = local.alloc_log_entry(unsafe { uma.as_ref() }, LogSize::Log8K);
        let first_ptr = first.as_ptr();
        let first_data = unsafe { first.as_ref().data };
        assert!(!first_data.is_null());

        local.free_log_entry(first, LogSize::Log8K, false);
        assert_eq!(local.local_entries(), 1);
        assert_eq!(local.local_data(LogSize::Log8K), 1);

        let second = local.alloc_log_entry(unsafe { uma.as_ref() }, LogSize::Log8K);

        // the most-recently-freed entry comes right back on this thread
        assert_eq!(second.as_ptr(), first_ptr);

        // its old block stays parked in the local data tier until spilled;
        // the fresh block came from the global pool
        let second_data = unsafe { second.as_ref().data };
        assert!(second_data != first_data);
        assert_eq!(local.local_data(LogSize::Log8K), 1);

        local.free_log_entry(second, LogSize::Log8K, false);
        local.free_uma(uma);
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_persist_clears_entry() {
    let _ = pretty_env_logger::try_init();

    let cfg = small_config();
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        let mut local = LogLocal::new(&alloc);

        let uma = local.alloc_uma();
        let entry = local.alloc_log_entry(unsafe { uma.as_ref() }, LogSize::Log4K);
        let raw = entry.as_ptr();

        unsafe {
            (*raw).offset = 0x1000;
            (*raw).len = 512;
            (*raw).united = 7;
            (*raw).dst = raw as *mut u8;
        }

        local.free_log_entry(entry, LogSize::Log4K, true);

        // the payload-referencing fields were cleared before the flush hit
        // the mapped entry file; the rest of the record is untouched
        unsafe {
            assert_eq!((*raw).united, 0);
            assert!((*raw).data.is_null());
            assert!((*raw).dst.is_null());
            assert_eq!((*raw).offset, 0x1000);
            assert_eq!((*raw).len, 512);
        }

        local.free_uma(uma);
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_concurrent_churn() {
    let _ = pretty_env_logger::try_init();

    let mut cfg = small_config();
    cfg.log_file_size = 1 << 18;
    cfg.initial_tables = 200;
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();

        let nr_threads = num_cpus::get().max(2).min(8);
        let threads: Vec<_> = (0..nr_threads)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let mut local = LogLocal::new(&alloc);
                    let uma = local.alloc_uma();

                    for round in 0..200 {
                        let table = local.alloc_log_table(ptr::null_mut(), round, TableKind::Table);
                        let entry = local.alloc_log_entry(unsafe { uma.as_ref() }, LogSize::Log4K);

                        local.free_log_entry(entry, LogSize::Log4K, round % 16 == 0);
                        local.free_log_table(table);
                    }

                    local.free_uma(uma);
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        // every object found its way home once the locals drained
        alloc.audit();
        assert_eq!(alloc.global_entries(), alloc.entry_capacity());
        assert_eq!(alloc.global_data(LogSize::Log4K), alloc.data_capacity(LogSize::Log4K));
        assert_eq!(alloc.global_tables(), alloc.table_capacity());
        assert_eq!(alloc.global_umas(), 64);
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_explicit_teardown() {
    let _ = pretty_env_logger::try_init();

    let cfg = small_config();
    let root = cfg.root.clone();

    {
        let alloc = Allocator::with_config(cfg).unwrap();
        assert!(alloc.log_dir().exists());

        alloc.stop_refiller();
        alloc.stop_refiller();

        alloc.cleanup_logs();
        assert!(!alloc.log_dir().exists());
    }

    fs::remove_dir(&root).unwrap();
}

#[test]
fn test_config_from_env() {
    let _ = pretty_env_logger::try_init();

    let dir = env::temp_dir().join("nvmmio-env-test");
    let with_sep = format!("{}/", dir.display());
    env::set_var(ENV_PMEM_PATH, &with_sep);

    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.root, dir);

    // the separator was stripped from a copy, the variable is untouched
    assert_eq!(env::var(ENV_PMEM_PATH).unwrap(), with_sep);

    env::remove_var(ENV_PMEM_PATH);
    assert!(Config::from_env().is_err());
}
