use std::collections::HashSet;

use crate::ctx::Ctx;
use crate::error::Error;
use crate::node::NodeSpec;
use crate::pager::Pager;
use crate::schema::ColumnKind;
use crate::txn::{run_in_transaction, TransactionManager};
use crate::types::PageIndex;

use super::{IndexKey, IndexTree};

struct Fixture {
    _dir: tempfile::TempDir,
    store: Pager,
    mgr: TransactionManager,
    ctx: Ctx,
    tree: IndexTree,
}

fn fixture(maximum_keys: Option<usize>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Pager::open(&dir.path().join("t.db")).unwrap();
    let ctx = Ctx::background();
    let spec = NodeSpec::Index {
        kind: ColumnKind::Int8,
        key_size: 8,
    };
    // Page 0 stands in for the meta root; the index root is page 1.
    store.get_page(&ctx, PageIndex(0), spec).unwrap();
    store.get_page(&ctx, PageIndex(1), spec).unwrap();
    let mut tree = IndexTree::new(PageIndex(1), "t_primary_key", ColumnKind::Int8, 8);
    if let Some(max) = maximum_keys {
        tree = tree.with_maximum_keys(max);
    }
    Fixture {
        _dir: dir,
        store,
        mgr: TransactionManager::new(),
        ctx,
        tree,
    }
}

fn insert(fx: &Fixture, key: i64, row_id: u64) -> Result<(), Error> {
    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        fx.tree.insert(txp, IndexKey::Int8(key), row_id)
    })
}

fn delete(fx: &Fixture, key: i64) -> Result<(), Error> {
    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        fx.tree.delete(txp, &IndexKey::Int8(key))
    })
}

fn find(fx: &Fixture, key: i64) -> Result<u64, Error> {
    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        fx.tree.find(txp, &IndexKey::Int8(key))
    })
}

fn bfs_ints(fx: &Fixture) -> Vec<i64> {
    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| fx.tree.keys_bfs(txp))
        .unwrap()
        .into_iter()
        .map(|k| match k {
            IndexKey::Int8(v) => v,
            other => panic!("unexpected key {:?}", other),
        })
        .collect()
}

fn check_structure(fx: &Fixture) {
    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        fx.tree.check_structure(txp)
    })
    .unwrap();
}

fn free_count(fx: &Fixture) -> u32 {
    fx.store.header().free_page_count
}

/// The insertion order from the engine's churn scenario.
const CHURN: [i64; 21] = [
    16, 9, 5, 18, 11, 1, 14, 7, 10, 6, 20, 19, 8, 2, 13, 12, 17, 3, 4, 21, 15,
];

#[test]
fn low_fanout_churn_inserts_then_drains() {
    let fx = fixture(Some(3));
    for (i, &key) in CHURN.iter().enumerate() {
        insert(&fx, key, i as u64 + 1).unwrap();
        check_structure(&fx);
    }

    let keys: HashSet<i64> = bfs_ints(&fx).into_iter().collect();
    assert_eq!(keys, (1..=21).collect::<HashSet<i64>>());
    for (i, &key) in CHURN.iter().enumerate() {
        assert_eq!(find(&fx, key).unwrap(), i as u64 + 1);
    }

    // Drain in a different order than insertion.
    let mut order = CHURN;
    order.reverse();
    for &key in &order {
        delete(&fx, key).unwrap();
        check_structure(&fx);
    }
    assert_eq!(bfs_ints(&fx), Vec::<i64>::new());

    // Every page but the meta stand-in and the index root is free.
    assert_eq!(free_count(&fx), fx.store.total_pages() - 2);
}

#[test]
fn ascending_drain_also_empties() {
    let fx = fixture(Some(3));
    for &key in &CHURN {
        insert(&fx, key, key as u64).unwrap();
    }
    for key in 1..=21 {
        delete(&fx, key).unwrap();
        check_structure(&fx);
    }
    assert_eq!(bfs_ints(&fx), Vec::<i64>::new());
    assert_eq!(free_count(&fx), fx.store.total_pages() - 2);
}

#[test]
fn duplicate_insert_fails_and_leaves_tree_unchanged() {
    let fx = fixture(Some(3));
    for &key in &CHURN[..10] {
        insert(&fx, key, key as u64).unwrap();
    }
    let before = bfs_ints(&fx);
    let err = insert(&fx, CHURN[3], 999).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { ref index } if index == "t_primary_key"));
    assert_eq!(bfs_ints(&fx), before);
    // The old mapping is intact.
    assert_eq!(find(&fx, CHURN[3]).unwrap(), CHURN[3] as u64);
}

#[test]
fn find_missing_is_not_found() {
    let fx = fixture(Some(3));
    insert(&fx, 5, 1).unwrap();
    assert!(matches!(find(&fx, 6), Err(Error::NotFound { .. })));
    assert!(matches!(delete(&fx, 6), Err(Error::NotFound { .. })));
}

#[test]
fn seek_last_key_follows_rightmost_path() {
    let fx = fixture(Some(3));
    let empty = run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        fx.tree.seek_last_key(txp)
    })
    .unwrap();
    assert_eq!(empty, None);

    for &key in &CHURN {
        insert(&fx, key, key as u64 * 10).unwrap();
    }
    let last = run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        fx.tree.seek_last_key(txp)
    })
    .unwrap();
    assert_eq!(last, Some((IndexKey::Int8(21), 210)));
}

#[test]
fn production_fanout_handles_many_keys() {
    let fx = fixture(None);
    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        for key in (1..=600).rev() {
            fx.tree.insert(txp, IndexKey::Int8(key), key as u64)?;
        }
        Ok(())
    })
    .unwrap();
    check_structure(&fx);
    for key in [1i64, 299, 600] {
        assert_eq!(find(&fx, key).unwrap(), key as u64);
    }

    run_in_transaction(&fx.store, &fx.mgr, &fx.ctx, |txp| {
        for key in 1..=600 {
            fx.tree.delete(txp, &IndexKey::Int8(key))?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(bfs_ints(&fx), Vec::<i64>::new());
}

#[test]
fn string_keys_order_lexicographically_in_tree() {
    let dir = tempfile::tempdir().unwrap();
    let store = Pager::open(&dir.path().join("t.db")).unwrap();
    let ctx = Ctx::background();
    let spec = NodeSpec::Index {
        kind: ColumnKind::Varchar,
        key_size: 16,
    };
    store.get_page(&ctx, PageIndex(0), spec).unwrap();
    let tree = IndexTree::new(PageIndex(0), "names_pk", ColumnKind::Varchar, 16)
        .with_maximum_keys(3);
    let mgr = TransactionManager::new();

    let names = ["pear", "apple", "quince", "fig", "banana", "melon", "cherry"];
    run_in_transaction(&store, &mgr, &ctx, |txp| {
        for (i, name) in names.iter().enumerate() {
            tree.insert(txp, IndexKey::Varchar(name.to_string()), i as u64)?;
        }
        Ok(())
    })
    .unwrap();

    for (i, name) in names.iter().enumerate() {
        let got = run_in_transaction(&store, &mgr, &ctx, |txp| {
            tree.find(txp, &IndexKey::Varchar(name.to_string()))
        })
        .unwrap();
        assert_eq!(got, i as u64);
    }
    let last = run_in_transaction(&store, &mgr, &ctx, |txp| tree.seek_last_key(txp)).unwrap();
    assert_eq!(last, Some((IndexKey::Varchar("quince".to_string()), 2)));
}
