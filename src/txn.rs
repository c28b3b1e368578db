//! Optimistic copy-on-write transactions.
//!
//! A transaction buffers page shadows in its write set and records the
//! version of every page it read. Commit validates the read versions under
//! the manager lock and, if nothing moved underneath, publishes the shadows
//! atomically. Readers never block writers; the losing writer of a conflict
//! gets [`Error::TxConflict`] and nothing it wrote becomes visible.
//!
//! The free list lives in the database header, so free-list manipulation
//! flows through the same shadow mechanism: an aborted transaction's pops and
//! pushes vanish with its header draft.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::{debug, trace};

use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::node::{FreeNode, Node, NodeSpec};
use crate::pager::{DatabaseHeader, Page, Pager};
use crate::types::{PageIndex, TxId};

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

/// Per-transaction shadow state.
#[derive(Debug)]
pub struct Transaction {
    pub id: TxId,
    read_set: HashMap<PageIndex, u64>,
    write_set: HashMap<PageIndex, Page>,
    header_read: Option<u64>,
    header_write: Option<DatabaseHeader>,
    status: TxStatus,
}

impl Transaction {
    pub fn status(&self) -> TxStatus {
        self.status
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    next_tx_id: u64,
    page_versions: HashMap<PageIndex, u64>,
    header_version: u64,
    active: HashSet<TxId>,
}

/// Tracks page versions and active transactions; serializes commits.
#[derive(Debug, Default)]
pub struct TransactionManager {
    state: Mutex<ManagerState>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new transaction.
    pub fn begin(&self) -> Transaction {
        let mut state = self.state.lock().expect("txn manager lock poisoned");
        state.next_tx_id += 1;
        let id = TxId(state.next_tx_id);
        state.active.insert(id);
        trace!("{} begin", id);
        Transaction {
            id,
            read_set: HashMap::new(),
            write_set: HashMap::new(),
            header_read: None,
            header_write: None,
            status: TxStatus::Active,
        }
    }

    /// Version of a page as last published.
    fn page_version(&self, idx: PageIndex) -> u64 {
        let state = self.state.lock().expect("txn manager lock poisoned");
        state.page_versions.get(&idx).copied().unwrap_or(0)
    }

    fn header_version(&self) -> u64 {
        self.state
            .lock()
            .expect("txn manager lock poisoned")
            .header_version
    }

    /// Validate the transaction's read set and publish its shadows.
    ///
    /// Runs entirely under the manager lock so concurrent committers
    /// serialize and all of a transaction's writes become visible at once.
    /// Publication is not cancellable once validation passes.
    pub fn commit(&self, tx: &mut Transaction, store: &Pager) -> Result<()> {
        if tx.status != TxStatus::Active {
            return Err(Error::NoActiveTransaction);
        }
        let mut state = self.state.lock().expect("txn manager lock poisoned");

        for (&idx, &seen) in &tx.read_set {
            let current = state.page_versions.get(&idx).copied().unwrap_or(0);
            if current > seen {
                tx.status = TxStatus::Aborted;
                state.active.remove(&tx.id);
                debug!("{} conflict on page {} ({} > {})", tx.id, idx, current, seen);
                return Err(Error::TxConflict { page: idx });
            }
        }
        if let Some(seen) = tx.header_read {
            if state.header_version > seen {
                tx.status = TxStatus::Aborted;
                state.active.remove(&tx.id);
                debug!("{} conflict on database header", tx.id);
                return Err(Error::TxConflict { page: PageIndex(0) });
            }
        }

        let mut pages: Vec<PageIndex> = tx.write_set.keys().copied().collect();
        pages.sort();
        for idx in pages {
            let page = tx.write_set.remove(&idx).expect("write set entry");
            store.save_page(page);
            *state.page_versions.entry(idx).or_insert(0) += 1;
        }
        if let Some(header) = tx.header_write.take() {
            store.set_header(header);
            state.header_version += 1;
        }

        tx.status = TxStatus::Committed;
        state.active.remove(&tx.id);
        trace!("{} committed", tx.id);
        Ok(())
    }

    /// Drop the transaction's shadows without publishing anything.
    pub fn rollback(&self, tx: &mut Transaction) {
        let mut state = self.state.lock().expect("txn manager lock poisoned");
        tx.write_set.clear();
        tx.header_write = None;
        tx.status = TxStatus::Aborted;
        state.active.remove(&tx.id);
        trace!("{} rolled back", tx.id);
    }

    /// Number of transactions currently active.
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .expect("txn manager lock poisoned")
            .active
            .len()
    }

    #[cfg(test)]
    pub(crate) fn page_version_for_tests(&self, idx: PageIndex) -> u64 {
        self.page_version(idx)
    }
}

/// Transactional view of the page store.
///
/// Reads come from the write set first, then from the store (recording the
/// read version). The first write of a page deep-clones it into the write
/// set; later reads and writes in the same transaction see that shadow.
pub struct TxPager<'a> {
    store: &'a Pager,
    mgr: &'a TransactionManager,
    ctx: &'a Ctx,
    tx: &'a mut Transaction,
}

impl<'a> TxPager<'a> {
    pub fn new(
        store: &'a Pager,
        mgr: &'a TransactionManager,
        ctx: &'a Ctx,
        tx: &'a mut Transaction,
    ) -> Self {
        Self {
            store,
            mgr,
            ctx,
            tx,
        }
    }

    pub fn ctx(&self) -> &Ctx {
        self.ctx
    }

    /// Current logical page count of the store.
    pub fn total_pages(&self) -> u32 {
        self.store.total_pages()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.tx.status != TxStatus::Active {
            return Err(Error::NoActiveTransaction);
        }
        Ok(())
    }

    /// Read a page's node, shadow-first. The returned node is this
    /// transaction's own deep copy and is safe to mutate before handing it
    /// back to [`TxPager::write_node`].
    pub fn read_node(&mut self, idx: PageIndex, spec: NodeSpec) -> Result<Node> {
        self.ensure_active()?;
        self.ctx.check()?;
        if let Some(page) = self.tx.write_set.get(&idx) {
            return Ok(page.node.clone());
        }
        let version = self.mgr.page_version(idx);
        let page = self.store.get_page(self.ctx, idx, spec)?;
        self.tx.read_set.entry(idx).or_insert(version);
        Ok(page.node.clone())
    }

    /// Record a node into the transaction's write set.
    pub fn write_node(&mut self, idx: PageIndex, node: Node) -> Result<()> {
        self.ensure_active()?;
        self.ctx.check()?;
        self.tx.write_set.insert(idx, Page::new(idx, node));
        Ok(())
    }

    /// Read the database header, draft-first.
    pub fn read_header(&mut self) -> Result<DatabaseHeader> {
        self.ensure_active()?;
        self.ctx.check()?;
        if let Some(header) = self.tx.header_write {
            return Ok(header);
        }
        let version = self.mgr.header_version();
        let header = self.store.header();
        self.tx.header_read.get_or_insert(version);
        Ok(header)
    }

    /// Record a header draft in the transaction.
    pub fn write_header(&mut self, header: DatabaseHeader) -> Result<()> {
        self.ensure_active()?;
        self.ctx.check()?;
        self.tx.header_write = Some(header);
        Ok(())
    }

    /// Produce a page ready to be typed by the caller: pop the free list if
    /// possible, otherwise extend the file.
    pub fn get_free_page(&mut self) -> Result<PageIndex> {
        self.ensure_active()?;
        let mut header = self.read_header()?;
        if !header.first_free_page.is_zero() {
            let idx = header.first_free_page;
            let free = self.read_node(idx, NodeSpec::Free)?.into_free()?;
            if header.free_page_count == 0 {
                return Err(Error::corrupt(
                    "freelist.count",
                    "free list head set but count is zero",
                ));
            }
            header.first_free_page = free.next_free_page;
            header.free_page_count -= 1;
            self.write_header(header)?;
            trace!("{} reused free page {}", self.tx.id, idx);
            return Ok(idx);
        }

        let idx = PageIndex(self.store.total_pages());
        self.store.get_page(self.ctx, idx, NodeSpec::Free)?;
        trace!("{} extended file with page {}", self.tx.id, idx);
        Ok(idx)
    }

    /// Push a page onto the free list. Page 0 must never be freed.
    pub fn add_free_page(&mut self, idx: PageIndex) -> Result<()> {
        self.ensure_active()?;
        if idx.is_zero() {
            return Err(Error::invariant(
                "freelist.add",
                "page 0 cannot be added to the free list",
            ));
        }
        let mut header = self.read_header()?;
        self.write_node(
            idx,
            Node::Free(FreeNode {
                next_free_page: header.first_free_page,
            }),
        )?;
        header.first_free_page = idx;
        header.free_page_count += 1;
        self.write_header(header)
    }
}

/// Run `f` inside a fresh transaction: commit on success, roll back on any
/// error (including cancellation observed by the body).
pub fn run_in_transaction<T>(
    store: &Pager,
    mgr: &TransactionManager,
    ctx: &Ctx,
    f: impl FnOnce(&mut TxPager<'_>) -> Result<T>,
) -> Result<T> {
    let mut tx = mgr.begin();
    let outcome = {
        let mut txp = TxPager::new(store, mgr, ctx, &mut tx);
        ctx.check().and_then(|()| f(&mut txp))
    };
    match outcome {
        Ok(value) => {
            mgr.commit(&mut tx, store)?;
            Ok(value)
        }
        Err(err) => {
            mgr.rollback(&mut tx);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{LeafCell, LeafNode};

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
                payload: vec![0; ROW],
            });
        }
        Node::Leaf(leaf)
    }

    /// Pager with `n` allocated leaf pages.
    fn store_with_pages(dir: &tempfile::TempDir, n: u32) -> Pager {
        let pager = Pager::open(&dir.path().join("t.db")).unwrap();
        let ctx = Ctx::background();
        for i in 0..n {
            pager.get_page(&ctx, PageIndex(i), tree_spec()).unwrap();
        }
        pager
    }

    #[test]
    fn reads_after_writes_observe_the_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 2);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();

        let mut tx = mgr.begin();
        let mut txp = TxPager::new(&store, &mgr, &ctx, &mut tx);
        txp.write_node(PageIndex(1), leaf_with_keys(&[5])).unwrap();
        let node = txp.read_node(PageIndex(1), tree_spec()).unwrap();
        let leaf = node.into_leaf().unwrap();
        assert_eq!(leaf.cells.len(), 1);
        assert_eq!(leaf.cells[0].key, 5);

        // The store still sees the empty page until commit.
        let live = store.get_page(&ctx, PageIndex(1), tree_spec()).unwrap();
        match &live.node {
            Node::Leaf(l) => assert!(l.cells.is_empty()),
            other => panic!("unexpected node {}", other.kind_name()),
        }
    }

    #[test]
    fn commit_publishes_and_bumps_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 2);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();

        let mut tx = mgr.begin();
        {
            let mut txp = TxPager::new(&store, &mgr, &ctx, &mut tx);
            txp.read_node(PageIndex(1), tree_spec()).unwrap();
            txp.write_node(PageIndex(1), leaf_with_keys(&[7])).unwrap();
        }
        mgr.commit(&mut tx, &store).unwrap();
        assert_eq!(tx.status(), TxStatus::Committed);
        assert_eq!(mgr.page_version_for_tests(PageIndex(1)), 1);

        let live = store.get_page(&ctx, PageIndex(1), tree_spec()).unwrap();
        match &live.node {
            Node::Leaf(l) => assert_eq!(l.cells[0].key, 7),
            other => panic!("unexpected node {}", other.kind_name()),
        }
    }

    #[test]
    fn second_writer_conflicts_and_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 4);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();
        let target = PageIndex(3);

        let mut t1 = mgr.begin();
        let mut t2 = mgr.begin();

        {
            let mut p1 = TxPager::new(&store, &mgr, &ctx, &mut t1);
            p1.read_node(target, tree_spec()).unwrap();
        }
        {
            let mut p2 = TxPager::new(&store, &mgr, &ctx, &mut t2);
            p2.read_node(target, tree_spec()).unwrap();
            p2.write_node(target, leaf_with_keys(&[2])).unwrap();
        }
        mgr.commit(&mut t2, &store).unwrap();

        {
            let mut p1 = TxPager::new(&store, &mgr, &ctx, &mut t1);
            p1.write_node(target, leaf_with_keys(&[1])).unwrap();
        }
        let err = mgr.commit(&mut t1, &store).unwrap_err();
        assert!(matches!(err, Error::TxConflict { page } if page == target));
        assert_eq!(t1.status(), TxStatus::Aborted);
        // Versions bumped exactly once, by the winner.
        assert_eq!(mgr.page_version_for_tests(target), 1);

        let live = store.get_page(&ctx, target, tree_spec()).unwrap();
        match &live.node {
            Node::Leaf(l) => assert_eq!(l.cells[0].key, 2),
            other => panic!("unexpected node {}", other.kind_name()),
        }
    }

    #[test]
    fn free_page_cycle_reuses_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 3);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();

        run_in_transaction(&store, &mgr, &ctx, |txp| {
            txp.add_free_page(PageIndex(2))?;
            txp.add_free_page(PageIndex(1))?;
            Ok(())
        })
        .unwrap();

        let header = store.header();
        assert_eq!(header.first_free_page, PageIndex(1));
        assert_eq!(header.free_page_count, 2);

        // Pops come off the stack head; exhaustion extends the file.
        run_in_transaction(&store, &mgr, &ctx, |txp| {
            assert_eq!(txp.get_free_page()?, PageIndex(1));
            assert_eq!(txp.get_free_page()?, PageIndex(2));
            assert_eq!(txp.get_free_page()?, PageIndex(3));
            Ok(())
        })
        .unwrap();
        assert_eq!(store.header().free_page_count, 0);
        assert_eq!(store.total_pages(), 4);
    }

    #[test]
    fn rollback_discards_free_list_draft() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 3);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();

        let before = store.header();
        let err = run_in_transaction(&store, &mgr, &ctx, |txp| {
            txp.add_free_page(PageIndex(2))?;
            txp.add_free_page(PageIndex(1))?;
            Err::<(), _>(Error::bad_input("forced failure"))
        })
        .unwrap_err();
        assert!(matches!(err, Error::BadInput { .. }));

        // The published header never saw the aborted pops and pushes.
        assert_eq!(store.header(), before);
        assert_eq!(store.header().free_page_count, 0);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn add_free_page_rejects_page_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 1);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();

        let err = run_in_transaction(&store, &mgr, &ctx, |txp| txp.add_free_page(PageIndex(0)))
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));
    }

    #[test]
    fn finished_transaction_rejects_further_use() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 2);
        let mgr = TransactionManager::new();
        let ctx = Ctx::background();

        let mut tx = mgr.begin();
        mgr.rollback(&mut tx);
        let mut txp = TxPager::new(&store, &mgr, &ctx, &mut tx);
        assert!(matches!(
            txp.read_node(PageIndex(1), tree_spec()),
            Err(Error::NoActiveTransaction)
        ));
        assert!(matches!(
            txp.write_node(PageIndex(1), leaf_with_keys(&[1])),
            Err(Error::NoActiveTransaction)
        ));
    }

    #[test]
    fn cancelled_body_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_pages(&dir, 2);
        let mgr = TransactionManager::new();
        let (ctx, handle) = Ctx::cancellable();

        let err = run_in_transaction(&store, &mgr, &ctx, |txp| {
            txp.write_node(PageIndex(1), leaf_with_keys(&[9]))?;
            handle.cancel();
            txp.read_node(PageIndex(1), tree_spec()).map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(mgr.active_count(), 0);

        let fresh = Ctx::background();
        let live = store.get_page(&fresh, PageIndex(1), tree_spec()).unwrap();
        match &live.node {
            Node::Leaf(l) => assert!(l.cells.is_empty()),
            other => panic!("unexpected node {}", other.kind_name()),
        }
    }
}
