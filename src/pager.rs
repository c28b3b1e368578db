//! The page store: file-backed pages with an in-memory cache.
//!
//! The store owns the on-disk byte array and the cached decoded pages. Pages
//! are cached as `Arc` snapshots so readers share them without copying; a
//! commit replaces the snapshot wholesale via [`Pager::save_page`]. Page 0
//! carries the database header in its reserved prefix and stores its node
//! after it; every other page stores the node at offset 0.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace};

use crate::codec;
use crate::config::{NODE_AREA_SIZE, PAGE_SIZE, ROOT_PAGE_CONFIG_SIZE};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::node::{marshal, Node, NodeSpec};
use crate::types::PageIndex;

/// Database header stored in the reserved prefix of page 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DatabaseHeader {
    /// Head of the free-page stack; 0 when the list is empty.
    pub first_free_page: PageIndex,
    /// Number of pages on the free list.
    pub free_page_count: u32,
}

impl DatabaseHeader {
    /// Serialize into the fixed page-0 prefix.
    pub fn marshal(&self) -> [u8; ROOT_PAGE_CONFIG_SIZE] {
        let mut buf = [0u8; ROOT_PAGE_CONFIG_SIZE];
        let mut pos = 0;
        codec::write_u32(&mut buf, &mut pos, self.first_free_page.0);
        codec::write_u32(&mut buf, &mut pos, self.free_page_count);
        buf
    }

    /// Decode from the page-0 prefix.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let first_free_page = PageIndex(codec::read_u32(buf, &mut pos, "header.first_free")?);
        let free_page_count = codec::read_u32(buf, &mut pos, "header.free_count")?;
        Ok(Self {
            first_free_page,
            free_page_count,
        })
    }
}

/// A decoded page: its index plus the node it carries.
#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub index: PageIndex,
    pub node: Node,
}

impl Page {
    pub fn new(index: PageIndex, node: Node) -> Self {
        Self { index, node }
    }
}

#[derive(Debug)]
struct PagerInner {
    cache: HashMap<PageIndex, Arc<Page>>,
    dirty: BTreeSet<PageIndex>,
    header_dirty: bool,
    total_pages: u32,
    header: DatabaseHeader,
}

/// Page store with an `Arc` snapshot cache and dirty tracking.
#[derive(Debug)]
pub struct Pager {
    file: Mutex<DbFile>,
    inner: RwLock<PagerInner>,
    path: PathBuf,
}

impl Pager {
    /// Open a database file, creating it when absent. Rejects files whose
    /// length is not a multiple of the page size; reads the database header
    /// from page 0 when the file is non-empty.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = DbFile::open(path)?;
        let total_pages = file.page_count()?;

        let header = if total_pages > 0 {
            let mut buf = [0u8; PAGE_SIZE];
            file.read_page(PageIndex(0), &mut buf)?;
            DatabaseHeader::unmarshal(&buf[..ROOT_PAGE_CONFIG_SIZE])?
        } else {
            DatabaseHeader::default()
        };
        debug!(
            "opened {} with {} pages, free list head {} ({} free)",
            path.display(),
            total_pages,
            header.first_free_page,
            header.free_page_count
        );

        Ok(Self {
            file: Mutex::new(file),
            inner: RwLock::new(PagerInner {
                cache: HashMap::new(),
                dirty: BTreeSet::new(),
                header_dirty: total_pages == 0,
                total_pages,
                header,
            }),
            path: path.to_path_buf(),
        })
    }

    /// Return the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical page count.
    pub fn total_pages(&self) -> u32 {
        self.inner.read().expect("pager lock poisoned").total_pages
    }

    /// Snapshot of the database header.
    pub fn header(&self) -> DatabaseHeader {
        self.inner.read().expect("pager lock poisoned").header
    }

    /// Replace the database header (commit publish path).
    pub fn set_header(&self, header: DatabaseHeader) {
        let mut inner = self.inner.write().expect("pager lock poisoned");
        inner.header = header;
        inner.header_dirty = true;
    }

    /// Fetch a page, decoding through the caller-supplied `spec`. Requesting
    /// `idx == total_pages()` allocates: the logical file grows by one page
    /// holding an empty node of the requested kind.
    pub fn get_page(&self, ctx: &Ctx, idx: PageIndex, spec: NodeSpec) -> Result<Arc<Page>> {
        ctx.check()?;

        {
            let inner = self.inner.read().expect("pager lock poisoned");
            if let Some(page) = inner.cache.get(&idx) {
                return Ok(Arc::clone(page));
            }
            if idx.0 > inner.total_pages {
                return Err(Error::invariant(
                    "pager.get_page",
                    format!(
                        "page {} requested beyond total {}",
                        idx, inner.total_pages
                    ),
                ));
            }
        }

        let mut inner = self.inner.write().expect("pager lock poisoned");
        // Another caller may have filled the cache while we waited.
        if let Some(page) = inner.cache.get(&idx) {
            return Ok(Arc::clone(page));
        }

        if idx.0 == inner.total_pages {
            let mut node = spec.empty();
            if idx.is_zero() {
                node.set_is_root(true);
            }
            trace!("allocating page {} as {}", idx, node.kind_name());
            let page = Arc::new(Page::new(idx, node));
            inner.cache.insert(idx, Arc::clone(&page));
            inner.dirty.insert(idx);
            inner.total_pages += 1;
            return Ok(page);
        }
        if idx.0 > inner.total_pages {
            return Err(Error::invariant(
                "pager.get_page",
                format!("page {} requested beyond total {}", idx, inner.total_pages),
            ));
        }

        let mut buf = [0u8; PAGE_SIZE];
        {
            let mut file = self.file.lock().expect("file lock poisoned");
            file.read_page(idx, &mut buf)?;
        }
        let area = node_area(&buf, idx);
        let mut node = spec.unmarshal(area)?;
        if idx.is_zero() {
            node.set_is_root(true);
        }
        trace!("read page {} as {}", idx, node.kind_name());
        let page = Arc::new(Page::new(idx, node));
        inner.cache.insert(idx, Arc::clone(&page));
        Ok(page)
    }

    /// Publish a page snapshot, superseding the cached one. Not cancellable:
    /// commits that passed validation must complete.
    pub fn save_page(&self, page: Page) {
        let mut inner = self.inner.write().expect("pager lock poisoned");
        let idx = page.index;
        if idx.0 >= inner.total_pages {
            inner.total_pages = idx.0 + 1;
        }
        inner.cache.insert(idx, Arc::new(page));
        inner.dirty.insert(idx);
    }

    /// Write one cached page through to the file. Idempotent for clean pages.
    pub fn flush(&self, ctx: &Ctx, idx: PageIndex) -> Result<()> {
        ctx.check()?;
        let (page, header) = {
            let inner = self.inner.read().expect("pager lock poisoned");
            let Some(page) = inner.cache.get(&idx).cloned() else {
                return Ok(());
            };
            (page, inner.header)
        };

        let mut buf = [0u8; PAGE_SIZE];
        let area = marshal(&page.node)?;
        if idx.is_zero() {
            buf[..ROOT_PAGE_CONFIG_SIZE].copy_from_slice(&header.marshal());
            buf[ROOT_PAGE_CONFIG_SIZE..].copy_from_slice(&area);
        } else {
            buf[..NODE_AREA_SIZE].copy_from_slice(&area);
        }

        let mut file = self.file.lock().expect("file lock poisoned");
        file.write_page(idx, &buf)?;
        drop(file);

        let mut inner = self.inner.write().expect("pager lock poisoned");
        inner.dirty.remove(&idx);
        if idx.is_zero() {
            inner.header_dirty = false;
        }
        Ok(())
    }

    /// Flush every dirty page in ascending index order, then the header if
    /// it changed without page 0 being dirty.
    pub fn flush_all(&self, ctx: &Ctx) -> Result<()> {
        let (dirty, header_dirty, page_zero_cached): (Vec<PageIndex>, bool, bool) = {
            let inner = self.inner.read().expect("pager lock poisoned");
            (
                inner.dirty.iter().copied().collect(),
                inner.header_dirty,
                inner.cache.contains_key(&PageIndex(0)),
            )
        };
        for idx in dirty {
            self.flush(ctx, idx)?;
        }
        if header_dirty {
            if page_zero_cached {
                self.flush(ctx, PageIndex(0))?;
            } else if self.total_pages() > 0 {
                ctx.check()?;
                let header = self.header();
                let mut file = self.file.lock().expect("file lock poisoned");
                file.write_page_zero_prefix(&header.marshal())?;
                drop(file);
                let mut inner = self.inner.write().expect("pager lock poisoned");
                inner.header_dirty = false;
            }
        }
        Ok(())
    }

    /// Pages currently held in the cache, ascending.
    pub fn cached_pages(&self) -> Vec<PageIndex> {
        let inner = self.inner.read().expect("pager lock poisoned");
        let mut pages: Vec<PageIndex> = inner.cache.keys().copied().collect();
        pages.sort();
        pages
    }

    /// Drop the in-memory cache; subsequent reads come from disk.
    #[cfg(test)]
    pub(crate) fn clear_cache_for_tests(&self) {
        let mut inner = self.inner.write().expect("pager lock poisoned");
        inner.cache.clear();
        inner.dirty.clear();
    }
}

fn node_area(buf: &[u8; PAGE_SIZE], idx: PageIndex) -> &[u8] {
    if idx.is_zero() {
        &buf[ROOT_PAGE_CONFIG_SIZE..]
    } else {
        &buf[..NODE_AREA_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{LeafCell, LeafNode};
    use std::io::Write as _;

    const ROW: usize = 8;

    fn tree_spec() -> NodeSpec {
        NodeSpec::Tree { row_size: ROW }
    }

    fn leaf_with_keys(keys: &[u64]) -> Node {
        let mut leaf = LeafNode::empty(ROW);
        for &key in keys {
            leaf.cells.push(LeafCell {
                key,
                null_bitmask: 0,
                payload: vec![key as u8; ROW],
            });
        }
        Node::Leaf(leaf)
    }

    #[test]
    fn open_rejects_unaligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.db");
        {
            let mut raw = std::fs::File::create(&path).unwrap();
            raw.write_all(&[0u8; PAGE_SIZE + 7]).unwrap();
        }
        let err = Pager::open(&path).unwrap_err();
        assert!(matches!(
            err,
            Error::CorruptFile { context: "file.len_alignment", .. }
        ));
    }

    #[test]
    fn get_page_at_total_allocates() {
        let dir = tempfile::tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("t.db")).unwrap();
        let ctx = Ctx::background();
        assert_eq!(pager.total_pages(), 0);

        let page = pager.get_page(&ctx, PageIndex(0), tree_spec()).unwrap();
        assert_eq!(pager.total_pages(), 1);
        // Page 0 is root-flavoured.
        match &page.node {
            Node::Leaf(leaf) => assert!(leaf.is_root),
            other => panic!("expected leaf, got {}", other.kind_name()),
        }

        let err = pager
            .get_page(&ctx, PageIndex(5), tree_spec())
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));
    }

    #[test]
    fn save_flush_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let ctx = Ctx::background();
        {
            let pager = Pager::open(&path).unwrap();
            pager.get_page(&ctx, PageIndex(0), tree_spec()).unwrap();
            let mut node = leaf_with_keys(&[1, 2, 3]);
            node.set_is_root(true);
            pager.save_page(Page::new(PageIndex(0), node));
            pager.set_header(DatabaseHeader {
                first_free_page: PageIndex(0),
                free_page_count: 0,
            });
            pager.flush_all(&ctx).unwrap();
        }

        let pager = Pager::open(&path).unwrap();
        assert_eq!(pager.total_pages(), 1);
        let page = pager.get_page(&ctx, PageIndex(0), tree_spec()).unwrap();
        match &page.node {
            Node::Leaf(leaf) => {
                assert!(leaf.is_root);
                assert_eq!(leaf.cells.len(), 3);
                assert_eq!(leaf.cells[2].key, 3);
            }
            other => panic!("expected leaf, got {}", other.kind_name()),
        }
    }

    #[test]
    fn header_round_trips_through_page_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let ctx = Ctx::background();
        {
            let pager = Pager::open(&path).unwrap();
            pager.get_page(&ctx, PageIndex(0), tree_spec()).unwrap();
            pager.set_header(DatabaseHeader {
                first_free_page: PageIndex(42),
                free_page_count: 7,
            });
            pager.flush_all(&ctx).unwrap();
        }
        let pager = Pager::open(&path).unwrap();
        let header = pager.header();
        assert_eq!(header.first_free_page, PageIndex(42));
        assert_eq!(header.free_page_count, 7);
    }

    #[test]
    fn flush_is_idempotent_for_clean_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let ctx = Ctx::background();
        let pager = Pager::open(&path).unwrap();
        pager.get_page(&ctx, PageIndex(0), tree_spec()).unwrap();
        pager.flush_all(&ctx).unwrap();
        pager.flush(&ctx, PageIndex(0)).unwrap();
        pager.flush(&ctx, PageIndex(0)).unwrap();
        assert_eq!(pager.total_pages(), 1);
    }

    #[test]
    fn cancelled_context_stops_reads() {
        let dir = tempfile::tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("t.db")).unwrap();
        let (ctx, handle) = Ctx::cancellable();
        handle.cancel();
        let err = pager.get_page(&ctx, PageIndex(0), tree_spec()).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
