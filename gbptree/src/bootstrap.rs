//! Opening a tree file without knowing its layout up front.
//!
//! [`GBPTreeBootstrapper::bootstrap_tree`] reads the meta record and both
//! tree state slots, resolves a layout from the recorded layout identifier
//! and opens the tree under it. The outcome is a [`Bootstrap`]: either the
//! opened tree with what was read on the way, or the reason it could not be
//! opened.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collector::IgnoreCleanupCollector;
use crate::page_cache::{MapOptions, PageCache};
use crate::tree::{
    ByteLayout, DynLayout, GBPTree, GBPTreeError, HeaderVisitor, Meta, MetaError,
    SimpleLongLayout, TreeInconsistency, TreeStateRecord, visit_header,
};

/// Resolves a concrete layout from a meta record.
pub trait LayoutBootstrapper: Send + Sync + std::fmt::Debug {
    /// A layout matching `meta`, or `None` if the identifier is unknown.
    fn create(&self, meta: &Meta) -> Option<DynLayout>;
}

/// Knows the layouts shipped with this crate.
///
/// Every known layout encodes keys so that bytewise order is key order, so
/// each resolves to a [`ByteLayout`] carrying the recorded identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLayoutBootstrapper {
    bytewise_fallback: bool,
}

impl DefaultLayoutBootstrapper {
    /// Also accept unknown identifiers, reading their keys and values as raw
    /// bytes ordered bytewise.
    #[must_use]
    pub const fn with_bytewise_fallback() -> Self {
        Self {
            bytewise_fallback: true,
        }
    }
}

const fn fixed_size(size: u32) -> Option<usize> {
    if size == 0 { None } else { Some(size as usize) }
}

impl LayoutBootstrapper for DefaultLayoutBootstrapper {
    fn create(&self, meta: &Meta) -> Option<DynLayout> {
        let known = meta.layout_identifier == SimpleLongLayout::IDENTIFIER
            || meta.layout_identifier == ByteLayout::IDENTIFIER;
        if !known && !self.bytewise_fallback {
            return None;
        }
        Some(Arc::new(ByteLayout::with_identity(
            meta.layout_identifier,
            meta.layout_major_version,
            meta.layout_minor_version,
            fixed_size(meta.key_size),
            fixed_size(meta.value_size),
        )))
    }
}

/// Why a tree file could not be bootstrapped.
#[derive(Debug)]
pub enum BootstrapError {
    /// The file does not exist or is empty.
    MissingFile(PathBuf),
    /// The meta record could not be read.
    UnreadableMeta(MetaError),
    /// Neither tree state slot could be used.
    UnreadableState(TreeInconsistency),
    /// No layout is known for the recorded identifier.
    UnknownLayout {
        identifier: u64,
        major_version: u32,
        minor_version: u32,
    },
    /// Opening the tree failed after the header was read.
    Open(GBPTreeError),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFile(path) => write!(f, "no tree file at {}", path.display()),
            Self::UnreadableMeta(err) => write!(f, "unreadable meta: {err}"),
            Self::UnreadableState(err) => write!(f, "unreadable tree state: {err}"),
            Self::UnknownLayout {
                identifier,
                major_version,
                minor_version,
            } => write!(
                f,
                "unknown layout {identifier:#018x} (version {major_version}.{minor_version})"
            ),
            Self::Open(err) => write!(f, "failed to open tree: {err}"),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnreadableMeta(err) => Some(err),
            Self::UnreadableState(err) => Some(err),
            Self::Open(err) => Some(err),
            Self::MissingFile(_) | Self::UnknownLayout { .. } => None,
        }
    }
}

impl From<GBPTreeError> for BootstrapError {
    fn from(err: GBPTreeError) -> Self {
        match err {
            GBPTreeError::Meta(err) => Self::UnreadableMeta(err),
            GBPTreeError::TreeInconsistency(
                err @ (TreeInconsistency::BothStatesInvalid { .. }
                | TreeInconsistency::EqualStateGenerations { .. }),
            ) => Self::UnreadableState(err),
            other => Self::Open(other),
        }
    }
}

/// Returned by the accessors of a failed [`Bootstrap`].
#[derive(Debug, Clone)]
pub struct IllegalStateError {
    pub cause: Arc<BootstrapError>,
}

impl std::fmt::Display for IllegalStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bootstrap did not produce a tree: {}", self.cause)
    }
}

impl std::error::Error for IllegalStateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// A tree opened by the bootstrapper, with what was read to open it.
pub struct BootstrapSuccess {
    pub tree: GBPTree<DynLayout>,
    pub layout: DynLayout,
    pub state: TreeStateRecord,
    pub meta: Meta,
}

impl std::fmt::Debug for BootstrapSuccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapSuccess")
            .field("tree", &self.tree)
            .field("layout", &self.layout.identifier())
            .field("state", &self.state)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Outcome of bootstrapping a tree file.
///
/// Check [`Bootstrap::is_tree`] before using the accessors; on a failed
/// bootstrap they return an [`IllegalStateError`] carrying the cause.
#[derive(Debug)]
pub enum Bootstrap {
    Successful(Box<BootstrapSuccess>),
    Failed(Arc<BootstrapError>),
}

impl Bootstrap {
    #[must_use]
    pub const fn is_tree(&self) -> bool {
        matches!(self, Self::Successful(_))
    }

    /// The failure cause, if bootstrapping failed.
    #[must_use]
    pub const fn cause(&self) -> Option<&Arc<BootstrapError>> {
        match self {
            Self::Successful(_) => None,
            Self::Failed(cause) => Some(cause),
        }
    }

    fn success(&self) -> Result<&BootstrapSuccess, IllegalStateError> {
        match self {
            Self::Successful(success) => Ok(&**success),
            Self::Failed(cause) => Err(IllegalStateError {
                cause: Arc::clone(cause),
            }),
        }
    }

    pub fn tree(&self) -> Result<&GBPTree<DynLayout>, IllegalStateError> {
        self.success().map(|s| &s.tree)
    }

    pub fn layout(&self) -> Result<&DynLayout, IllegalStateError> {
        self.success().map(|s| &s.layout)
    }

    pub fn state(&self) -> Result<&TreeStateRecord, IllegalStateError> {
        self.success().map(|s| &s.state)
    }

    pub fn meta(&self) -> Result<&Meta, IllegalStateError> {
        self.success().map(|s| &s.meta)
    }

    /// Take the opened tree.
    pub fn into_tree(self) -> Result<GBPTree<DynLayout>, IllegalStateError> {
        match self {
            Self::Successful(success) => Ok(success.tree),
            Self::Failed(cause) => Err(IllegalStateError { cause }),
        }
    }

    /// Close the tree, if there is one.
    pub fn close(&self) -> Result<(), GBPTreeError> {
        match self {
            Self::Successful(success) => success.tree.close(),
            Self::Failed(_) => Ok(()),
        }
    }
}

/// Records the meta and selected state seen while reading a header.
#[derive(Debug, Default)]
struct BootstrapVisitor {
    meta: Option<Meta>,
    header_bytes: usize,
}

impl HeaderVisitor for BootstrapVisitor {
    fn meta(&mut self, meta: &Meta) {
        self.meta = Some(*meta);
    }

    fn header_data(&mut self, data: &[u8]) {
        self.header_bytes = data.len();
    }
}

/// Opens arbitrary tree files for inspection.
///
/// Trees are opened read-only by default, and crash cleanup is never run:
/// a bootstrapped tree reflects exactly what is on disk.
#[derive(Debug, Clone)]
pub struct GBPTreeBootstrapper {
    page_cache: PageCache,
    layouts: Arc<dyn LayoutBootstrapper>,
    read_only: bool,
}

impl GBPTreeBootstrapper {
    #[must_use]
    pub fn new(page_cache: PageCache, layouts: Arc<dyn LayoutBootstrapper>) -> Self {
        Self {
            page_cache,
            layouts,
            read_only: true,
        }
    }

    /// Open bootstrapped trees for writing.
    #[must_use]
    pub const fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }

    /// Open the tree at `path` under whatever layout its meta names.
    pub fn bootstrap_tree(&self, path: impl AsRef<Path>) -> Bootstrap {
        let path = path.as_ref();
        match self.try_bootstrap(path) {
            Ok(success) => {
                tracing::info!(
                    path = %path.display(),
                    layout = success.meta.layout_identifier,
                    stable = success.state.state.stable_generation,
                    clean = success.state.state.clean,
                    "bootstrapped tree"
                );
                Bootstrap::Successful(Box::new(success))
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "bootstrap failed");
                Bootstrap::Failed(Arc::new(err))
            }
        }
    }

    fn try_bootstrap(&self, path: &Path) -> Result<BootstrapSuccess, BootstrapError> {
        let fs = self.page_cache.file_system();
        let size = if fs.exists(path) {
            fs.file_size(path)
                .map_err(|e| BootstrapError::Open(GBPTreeError::Io(e)))?
        } else {
            0
        };
        if size == 0 {
            return Err(BootstrapError::MissingFile(path.to_path_buf()));
        }

        let meta = Meta::read_from_file(fs.as_ref(), path).map_err(BootstrapError::UnreadableMeta)?;
        let paged_file = self
            .page_cache
            .map(path, meta.page_size, MapOptions::read_only())
            .map_err(|e| BootstrapError::Open(e.into()))?;
        let mut visitor = BootstrapVisitor::default();
        let visited = visit_header(&paged_file, &mut visitor);
        paged_file.close();
        let (meta, state) = visited?;
        tracing::debug!(
            path = %path.display(),
            header_bytes = visitor.header_bytes,
            slot = %state.state.slot,
            "read tree header"
        );

        let layout = self
            .layouts
            .create(&meta)
            .ok_or(BootstrapError::UnknownLayout {
                identifier: meta.layout_identifier,
                major_version: meta.layout_major_version,
                minor_version: meta.layout_minor_version,
            })?;

        let tree = GBPTree::builder(&self.page_cache, path, Arc::clone(&layout))
            .read_only(self.read_only)
            .cleanup_collector(Arc::new(IgnoreCleanupCollector))
            .build()
            .map_err(BootstrapError::Open)?;

        Ok(BootstrapSuccess {
            tree,
            layout,
            state,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::tree::{HeaderUpdate, named_identifier};

    const PAGE_SIZE: usize = 256;

    fn setup() -> (Arc<EphemeralFileSystem>, PageCache, GBPTreeBootstrapper) {
        let fs = Arc::new(EphemeralFileSystem::new());
        let dyn_fs: Arc<dyn FileSystem> = fs.clone();
        let cache = PageCache::new(dyn_fs, 64);
        let bootstrapper =
            GBPTreeBootstrapper::new(cache.clone(), Arc::new(DefaultLayoutBootstrapper::default()));
        (fs, cache, bootstrapper)
    }

    fn create_long_tree(cache: &PageCache, path: &str, entries: u64) {
        let tree = GBPTree::builder(cache, path, SimpleLongLayout)
            .page_size(PAGE_SIZE)
            .header_writer(b"hdr")
            .build()
            .expect("create");
        for key in 0..entries {
            tree.insert(&key, &(key * 2)).expect("insert");
        }
        tree.close().expect("close");
    }

    #[test]
    fn test_bootstrap_opens_known_layout() {
        let (_fs, cache, bootstrapper) = setup();
        create_long_tree(&cache, "/long", 30);

        let bootstrap = bootstrapper.bootstrap_tree("/long");
        assert!(bootstrap.is_tree());
        let meta = bootstrap.meta().expect("meta");
        assert_eq!(meta.layout_identifier, SimpleLongLayout::IDENTIFIER);
        assert_eq!(meta.page_size, PAGE_SIZE);
        assert_eq!(bootstrap.state().expect("state").header, b"hdr");
        assert_eq!(bootstrap.layout().expect("layout").key_size(), Some(8));

        let tree = bootstrap.tree().expect("tree");
        assert!(tree.is_read_only());
        assert_eq!(tree.count_entries().expect("count"), 30);
        assert_eq!(
            tree.get_raw(&7u64.to_be_bytes()).expect("get"),
            Some(14u64.to_be_bytes().to_vec())
        );
        bootstrap.close().expect("close");
    }

    #[test]
    fn test_missing_file_fails_with_cause() {
        let (_fs, _cache, bootstrapper) = setup();
        let bootstrap = bootstrapper.bootstrap_tree("/nothing");
        assert!(!bootstrap.is_tree());
        assert!(matches!(
            bootstrap.cause().map(|cause| &**cause),
            Some(BootstrapError::MissingFile(_))
        ));

        let err = bootstrap.tree().expect_err("no tree");
        assert!(matches!(err.cause.as_ref(), BootstrapError::MissingFile(_)));
        assert!(bootstrap.meta().is_err());
        assert!(bootstrap.layout().is_err());
        assert!(bootstrap.state().is_err());
        assert!(bootstrap.close().is_ok());
    }

    #[test]
    fn test_corrupt_meta_is_unreadable_meta() {
        let (fs, cache, bootstrapper) = setup();
        create_long_tree(&cache, "/long", 3);
        fs.corrupt_byte(Path::new("/long"), 9).expect("corrupt");

        let bootstrap = bootstrapper.bootstrap_tree("/long");
        assert!(matches!(
            bootstrap.cause().map(|cause| &**cause),
            Some(BootstrapError::UnreadableMeta(_))
        ));
    }

    #[test]
    fn test_both_states_corrupt_is_unreadable_state() {
        let (fs, cache, bootstrapper) = setup();
        create_long_tree(&cache, "/long", 3);
        for slot_page in [1u64, 2] {
            let offset = slot_page * PAGE_SIZE as u64 + 20;
            fs.corrupt_byte(Path::new("/long"), offset).expect("corrupt");
        }

        let bootstrap = bootstrapper.bootstrap_tree("/long");
        assert!(matches!(
            bootstrap.cause().map(|cause| &**cause),
            Some(BootstrapError::UnreadableState(
                TreeInconsistency::BothStatesInvalid { .. }
            ))
        ));
    }

    #[test]
    fn test_unknown_layout() {
        let (_fs, cache, bootstrapper) = setup();
        let custom = ByteLayout::with_identity(named_identifier("CUST", 3), 2, 0, None, None);
        let tree = GBPTree::builder(&cache, "/custom", custom)
            .page_size(PAGE_SIZE)
            .build()
            .expect("create");
        tree.insert(&b"k".to_vec(), &b"v".to_vec()).expect("insert");
        tree.close().expect("close");

        let bootstrap = bootstrapper.bootstrap_tree("/custom");
        assert!(matches!(
            bootstrap.cause().map(|cause| &**cause),
            Some(BootstrapError::UnknownLayout { major_version: 2, .. })
        ));

        let lenient = GBPTreeBootstrapper::new(
            cache,
            Arc::new(DefaultLayoutBootstrapper::with_bytewise_fallback()),
        );
        let tree = lenient.bootstrap_tree("/custom").into_tree().expect("tree");
        assert_eq!(tree.get_raw(b"k").expect("get"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_writable_bootstrap_allows_checkpoint() {
        let (_fs, cache, bootstrapper) = setup();
        create_long_tree(&cache, "/long", 5);

        let tree = bootstrapper
            .writable()
            .bootstrap_tree("/long")
            .into_tree()
            .expect("tree");
        tree.insert_raw(&9u64.to_be_bytes(), &1u64.to_be_bytes())
            .expect("insert");
        tree.checkpoint(HeaderUpdate::CarryOver).expect("checkpoint");
        tree.close().expect("close");

        let reopened = GBPTree::builder(&cache, "/long", SimpleLongLayout)
            .build()
            .expect("reopen");
        assert_eq!(reopened.get(&9).expect("get"), Some(1));
    }
}
