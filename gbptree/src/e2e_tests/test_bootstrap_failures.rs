//! Test bootstrapping tree files on disk, and the failures reported for
//! files that hold no usable tree.

use std::path::Path;
use std::sync::Arc;

use crate::bootstrap::{BootstrapError, DefaultLayoutBootstrapper, GBPTreeBootstrapper};
use crate::e2e_tests::helpers::{PAGE_SIZE, bootstrapped_keys, insert_range};
use crate::fs::DefaultFileSystem;
use crate::page_cache::PageCache;
use crate::tree::{GBPTree, SimpleLongLayout};

fn page_cache() -> PageCache {
    PageCache::new(Arc::new(DefaultFileSystem), 16)
}

fn bootstrapper() -> GBPTreeBootstrapper {
    GBPTreeBootstrapper::new(page_cache(), Arc::new(DefaultLayoutBootstrapper::default()))
}

fn create_tree(path: &Path) {
    let tree = GBPTree::builder(&page_cache(), path, SimpleLongLayout)
        .page_size(PAGE_SIZE)
        .header_writer(b"schema-1")
        .build()
        .expect("Failed to create tree");
    insert_range(&tree, 0..25);
    tree.close().expect("Failed to close");
}

#[test]
fn test_bootstrap_tree_on_disk() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("index.db");
    create_tree(&path);

    let bootstrap = bootstrapper().bootstrap_tree(&path);
    assert!(bootstrap.is_tree(), "{:?}", bootstrap.cause());
    let state = bootstrap.state().expect("Bootstrap has a state");
    assert!(state.state.clean);
    assert_eq!(state.header, b"schema-1");
    assert_eq!(bootstrap.meta().expect("Bootstrap has meta").page_size, PAGE_SIZE);

    let tree = bootstrap.tree().expect("Bootstrap has a tree");
    assert!(tree.is_read_only());
    assert_eq!(bootstrapped_keys(tree), (0..25).collect::<Vec<_>>());
    bootstrap.close().expect("Failed to close");
}

#[test]
fn test_missing_and_empty_files_are_reported() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = dir.path().join("missing.db");
    let bootstrap = bootstrapper().bootstrap_tree(&missing);
    assert!(matches!(
        bootstrap.cause().map(|cause| &**cause),
        Some(BootstrapError::MissingFile(path)) if *path == missing
    ));

    let empty = dir.path().join("empty.db");
    std::fs::write(&empty, b"").expect("Failed to write file");
    let bootstrap = bootstrapper().bootstrap_tree(&empty);
    assert!(matches!(
        bootstrap.cause().map(|cause| &**cause),
        Some(BootstrapError::MissingFile(_))
    ));
}

#[test]
fn test_garbage_file_has_unreadable_meta() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0xAB; 4096]).expect("Failed to write file");

    let bootstrap = bootstrapper().bootstrap_tree(&path);
    let cause = bootstrap.cause().expect("Bootstrap failed");
    assert!(matches!(&**cause, BootstrapError::UnreadableMeta(_)));

    // Accessors report the same cause instead of a tree.
    match bootstrap.tree() {
        Ok(_) => panic!("a failed bootstrap has no tree"),
        Err(err) => assert!(Arc::ptr_eq(&err.cause, cause)),
    }
    assert!(bootstrap.close().is_ok());
}
