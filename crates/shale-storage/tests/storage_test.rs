//! Storage integration tests.
//!
//! Exercises the full stack over a real database file:
//! - Disk file manager, buffer pool and B+ tree together
//! - Catalog root tracking across splits and collapses
//! - Persistence and freelist reuse across reopen
//! - Randomized workloads against a `BTreeMap` model with a tiny pool

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use shale_buffer::{BufferPool, BufferPoolConfig, FileManager};
use shale_common::page::PageId;
use shale_common::{ShaleError, StorageConfig};
use shale_storage::{
    BPlusTree, Catalog, CollectionInfo, DiskFileManager, DiskFileManagerConfig, CATALOG_PAGE_ID,
};

// =============================================================================
// Helpers
// =============================================================================

struct Storage {
    fm: Arc<DiskFileManager>,
    pool: Arc<BufferPool>,
    catalog: Catalog,
}

fn open_storage(path: &Path, num_frames: usize) -> Storage {
    let fm = Arc::new(
        DiskFileManager::open(DiskFileManagerConfig {
            path: path.to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap(),
    );
    let pool = Arc::new(BufferPool::new(BufferPoolConfig { num_frames }, fm.clone()));
    let catalog = Catalog::open(pool.clone(), CATALOG_PAGE_ID).unwrap();
    Storage { fm, pool, catalog }
}

fn open_collection(storage: &Storage, name: &str, order: usize) -> BPlusTree {
    let info = match storage.catalog.get_collection(name).unwrap() {
        Some(info) => info,
        None => {
            let info = CollectionInfo::new(PageId::INVALID, PageId::INVALID);
            storage.catalog.create_collection(name, info).unwrap();
            info
        }
    };
    BPlusTree::open(storage.pool.clone(), info.root_page_id, order).unwrap()
}

fn save_root(storage: &Storage, name: &str, tree: &BPlusTree) {
    let mut info = storage.catalog.get_collection(name).unwrap().unwrap();
    if info.root_page_id != tree.root_page_id() {
        info.root_page_id = tree.root_page_id();
        storage.catalog.update_collection(name, info).unwrap();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_tree_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.db");

    {
        let storage = open_storage(&path, 16);
        let mut tree = open_collection(&storage, "users", 4);
        for k in 0..500 {
            assert!(tree.insert(k * 7 % 500, k as u64).unwrap());
            save_root(&storage, "users", &tree);
        }
        tree.verify().unwrap();
        storage.pool.flush_all().unwrap();
    }

    let storage = open_storage(&path, 16);
    let tree = open_collection(&storage, "users", 4);
    tree.verify().unwrap();
    assert_eq!(tree.len().unwrap(), 500);
    for k in 0..500 {
        assert_eq!(tree.search(k * 7 % 500).unwrap(), Some(k as u64));
    }
}

#[test]
fn test_reopen_with_different_order_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("order.db");

    {
        let storage = open_storage(&path, 8);
        let mut tree = open_collection(&storage, "wide", 64);
        for k in 0..40 {
            tree.insert(k, k as u64 * 10).unwrap();
        }
        save_root(&storage, "wide", &tree);
    }

    let storage = open_storage(&path, 8);
    let narrow = open_collection(&storage, "wide", 4);
    assert!(matches!(narrow.search(5), Err(ShaleError::BTreeCorrupted(_))));
    assert!(matches!(narrow.range(0, 39), Err(ShaleError::BTreeCorrupted(_))));

    let wide = open_collection(&storage, "wide", 64);
    assert_eq!(wide.search(5).unwrap(), Some(50));
    assert_eq!(wide.search(39).unwrap(), Some(390));
}

#[test]
fn test_catalog_tracks_root_changes() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir.path().join("roots.db"), 8);
    let mut tree = open_collection(&storage, "events", 3);

    let mut roots = vec![tree.root_page_id()];
    for k in 0..30 {
        tree.insert(k, 0).unwrap();
        save_root(&storage, "events", &tree);
        if *roots.last().unwrap() != tree.root_page_id() {
            roots.push(tree.root_page_id());
        }
    }
    // Empty, first leaf, then one new root per level.
    assert!(roots.len() >= 4);

    for k in 0..30 {
        tree.remove(k).unwrap();
        save_root(&storage, "events", &tree);
    }
    let info = storage.catalog.get_collection("events").unwrap().unwrap();
    assert_eq!(info.root_page_id, PageId::INVALID);
    assert!(tree.is_empty());
}

#[test]
fn test_freed_pages_reused_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("freelist.db");

    let pages_used = {
        let storage = open_storage(&path, 8);
        let mut tree = open_collection(&storage, "t", 4);
        for k in 0..200 {
            tree.insert(k, 1).unwrap();
        }
        let pages_used = storage.fm.num_pages();
        for k in 0..200 {
            tree.remove(k).unwrap();
        }
        save_root(&storage, "t", &tree);
        assert!(tree.is_empty());

        // Everything but the meta and catalog pages is back on the freelist.
        assert_eq!(storage.fm.free_list().unwrap().len() as u32, pages_used - 2);
        pages_used
    };

    let storage = open_storage(&path, 8);
    assert_eq!(storage.fm.free_list().unwrap().len() as u32, pages_used - 2);

    let mut tree = open_collection(&storage, "t", 4);
    for k in 0..200 {
        tree.insert(k, 2).unwrap();
    }
    // Same shape of tree, built entirely from recycled pages.
    assert_eq!(storage.fm.num_pages(), pages_used);
    tree.verify().unwrap();
}

#[test]
fn test_random_workload_with_tiny_pool() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("random.db");
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(7);

    {
        let storage = open_storage(&path, 3);
        let mut tree = open_collection(&storage, "r", 5);

        for step in 0..5000 {
            let key = rng.random_range(0..1000);
            match rng.random_range(0..4) {
                0 | 1 => {
                    let value = rng.random::<u64>();
                    if tree.insert(key, value).unwrap() {
                        model.insert(key, value);
                    }
                }
                2 => {
                    assert_eq!(tree.remove(key).unwrap(), model.remove(&key).is_some());
                }
                _ => {
                    assert_eq!(
                        tree.search(key).unwrap(),
                        model.get(&key).copied(),
                        "step {step}"
                    );
                }
            }
            save_root(&storage, "r", &tree);
        }

        tree.verify().unwrap();
        let stats = storage.pool.stats();
        assert_eq!(stats.pinned_frames, 0);
        assert_eq!(stats.total_frames, 3);
    }

    let storage = open_storage(&path, 3);
    let tree = open_collection(&storage, "r", 5);
    let expected: Vec<(i32, u64)> = model.into_iter().collect();
    assert_eq!(tree.scan().unwrap(), expected);
}

#[test]
fn test_multiple_collections_share_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("multi.db");

    {
        let storage = open_storage(&path, 16);
        let mut a = open_collection(&storage, "a", 4);
        let mut b = open_collection(&storage, "b", 4);
        for k in 0..100 {
            a.insert(k, 1).unwrap();
            b.insert(-k, 2).unwrap();
        }
        save_root(&storage, "a", &a);
        save_root(&storage, "b", &b);
    }

    let storage = open_storage(&path, 16);
    let names: Vec<String> = storage
        .catalog
        .collections()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let a = open_collection(&storage, "a", 4);
    let b = open_collection(&storage, "b", 4);
    assert_eq!(a.range(0, 99).unwrap().len(), 100);
    assert_eq!(b.range(-99, 0).unwrap().len(), 100);
    assert_eq!(a.search(-5).unwrap(), None);
    assert_eq!(b.search(-5).unwrap(), Some(2));
}

#[test]
fn test_drop_collection_keeps_others() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir.path().join("drop.db"), 8);
    open_collection(&storage, "keep", 4);
    open_collection(&storage, "gone", 4);

    storage.catalog.drop_collection("gone").unwrap();
    assert!(storage.catalog.get_collection("keep").unwrap().is_some());
    assert!(matches!(
        storage.catalog.drop_collection("gone"),
        Err(ShaleError::CollectionNotFound(_))
    ));
}

#[test]
fn test_pool_exhaustion_is_reported() {
    let dir = tempdir().unwrap();
    let storage = open_storage(&dir.path().join("full.db"), 3);

    let ids: Vec<PageId> = (0..4).map(|_| storage.pool.allocate_page().unwrap()).collect();
    let _held: Vec<_> = ids[..3]
        .iter()
        .map(|&id| storage.pool.fetch_page(id).unwrap())
        .collect();

    assert!(matches!(
        storage.pool.fetch_page(ids[3]),
        Err(ShaleError::BufferPoolFull)
    ));
}

#[test]
fn test_open_from_storage_config() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_path: dir.path().join("data").join("shale.db"),
        buffer_pool_pages: 8,
        btree_order: 6,
        fsync_enabled: true,
    };
    config.validate().unwrap();

    let fm = Arc::new(DiskFileManager::open(DiskFileManagerConfig::from(&config)).unwrap());
    let pool = Arc::new(BufferPool::new(BufferPoolConfig::from(&config), fm.clone()));
    assert_eq!(pool.num_frames(), 8);

    let mut tree = BPlusTree::new(pool, config.btree_order).unwrap();
    for k in 0..50 {
        tree.insert(k, k as u64).unwrap();
    }
    tree.verify().unwrap();
    assert!(fm.page_exists(tree.root_page_id()));
    assert!(config.data_path.exists());
}
