//! Overflow chains for varchar values that do not fit a leaf cell inline.
//!
//! A chain is a singly linked list of overflow pages; the cell stores a
//! `TextPointer` naming the first page and the total byte length. The last
//! page's next pointer is 0.

use log::trace;

use crate::config::MAX_OVERFLOW_PAGE_DATA;
use crate::error::{Error, Result};
use crate::node::{Node, NodeSpec, OverflowNode};
use crate::row::TextPointer;
use crate::txn::TxPager;
use crate::types::PageIndex;

/// Write `data` onto a freshly allocated chain and return its pointer.
pub fn write_chain(txp: &mut TxPager<'_>, data: &[u8]) -> Result<TextPointer> {
    if data.is_empty() {
        return Err(Error::invariant(
            "overflow.write",
            "empty payloads are stored inline, never spilled",
        ));
    }
    let chunks: Vec<&[u8]> = data.chunks(MAX_OVERFLOW_PAGE_DATA).collect();
    let mut pages = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        pages.push(txp.get_free_page()?);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let next = pages.get(i + 1).copied().unwrap_or(PageIndex(0));
        txp.write_node(
            pages[i],
            Node::Overflow(OverflowNode {
                next,
                data: chunk.to_vec(),
            }),
        )?;
    }
    trace!("spilled {} bytes across {} overflow pages", data.len(), pages.len());
    Ok(TextPointer {
        first_page: pages[0],
        length: data.len() as u32,
    })
}

/// Materialize a chain back into a string.
pub fn read_chain(txp: &mut TxPager<'_>, ptr: TextPointer) -> Result<String> {
    let mut data = Vec::with_capacity(ptr.length as usize);
    let mut current = ptr.first_page;
    while !current.is_zero() {
        if data.len() > ptr.length as usize {
            return Err(Error::corrupt(
                "overflow.read",
                format!("chain from page {} longer than declared {}", ptr.first_page, ptr.length),
            ));
        }
        let node = txp.read_node(current, NodeSpec::Overflow)?.into_overflow()?;
        data.extend_from_slice(&node.data);
        current = node.next;
    }
    if data.len() != ptr.length as usize {
        return Err(Error::corrupt(
            "overflow.read",
            format!(
                "chain from page {} holds {} bytes, pointer declares {}",
                ptr.first_page,
                data.len(),
                ptr.length
            ),
        ));
    }
    String::from_utf8(data).map_err(|e| Error::corrupt("overflow.utf8", e.to_string()))
}

/// Push every page of the chain onto the free list, head first.
pub fn free_chain(txp: &mut TxPager<'_>, first: PageIndex) -> Result<()> {
    let mut current = first;
    let mut freed = 0u32;
    while !current.is_zero() {
        if freed > txp.total_pages() {
            return Err(Error::corrupt(
                "overflow.free",
                "overflow chain longer than the file",
            ));
        }
        let node = txp.read_node(current, NodeSpec::Overflow)?.into_overflow()?;
        txp.add_free_page(current)?;
        current = node.next;
        freed += 1;
    }
    trace!("freed {} overflow pages starting at {}", freed, first);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::Ctx;
    use crate::pager::Pager;
    use crate::txn::{run_in_transaction, TransactionManager};

    fn setup(dir: &tempfile::TempDir) -> (Pager, TransactionManager, Ctx) {
        let pager = Pager::open(&dir.path().join("t.db")).unwrap();
        let ctx = Ctx::background();
        // Page 0 exists in any real file; occupy it.
        pager
            .get_page(&ctx, PageIndex(0), NodeSpec::Tree { row_size: 8 })
            .unwrap();
        (pager, TransactionManager::new(), ctx)
    }

    #[test]
    fn chain_round_trip_multi_page() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mgr, ctx) = setup(&dir);
        let text: String = ('a'..='z').cycle().take(MAX_OVERFLOW_PAGE_DATA + 100).collect();

        let ptr = run_in_transaction(&store, &mgr, &ctx, |txp| {
            write_chain(txp, text.as_bytes())
        })
        .unwrap();
        assert_eq!(ptr.length as usize, text.len());

        let back = run_in_transaction(&store, &mgr, &ctx, |txp| read_chain(txp, ptr)).unwrap();
        assert_eq!(back, text);
        // One page per chunk: the value needed two.
        assert_eq!(store.total_pages(), 3);
    }

    #[test]
    fn freed_chain_lands_on_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mgr, ctx) = setup(&dir);
        let text = "x".repeat(2 * MAX_OVERFLOW_PAGE_DATA + 5);

        let ptr = run_in_transaction(&store, &mgr, &ctx, |txp| {
            write_chain(txp, text.as_bytes())
        })
        .unwrap();

        run_in_transaction(&store, &mgr, &ctx, |txp| free_chain(txp, ptr.first_page)).unwrap();
        assert_eq!(store.header().free_page_count, 3);

        // The freed pages are reused before the file grows again.
        let reused = run_in_transaction(&store, &mgr, &ctx, |txp| {
            write_chain(txp, text.as_bytes())
        })
        .unwrap();
        assert_eq!(store.header().free_page_count, 0);
        assert_eq!(store.total_pages(), 4);
        let back =
            run_in_transaction(&store, &mgr, &ctx, |txp| read_chain(txp, reused)).unwrap();
        assert_eq!(back, text);
    }

    #[test]
    fn length_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mgr, ctx) = setup(&dir);
        let ptr = run_in_transaction(&store, &mgr, &ctx, |txp| write_chain(txp, b"hello"))
            .unwrap();
        let bad = TextPointer {
            first_page: ptr.first_page,
            length: ptr.length + 1,
        };
        let err = run_in_transaction(&store, &mgr, &ctx, |txp| read_chain(txp, bad)).unwrap_err();
        assert!(matches!(err, Error::CorruptFile { context: "overflow.read", .. }));
    }
}
