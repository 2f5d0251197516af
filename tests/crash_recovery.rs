use gbptree::layout::U64Layout;
use gbptree::{GbpError, Options, Tree};
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Result<Tree<U64Layout>, GbpError> {
    Tree::create(path, U64Layout, Options { page_size: 4096, ..Options::default() })
}

#[test]
fn reopen_without_checkpoint_loses_uncheckpointed_writes() -> Result<(), GbpError> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
        let tree = open(&path)?;
        tree.put(&1u64, &10u64)?;
        tree.checkpoint("baseline")?;
        for k in 100..200u64 {
            tree.put(&k, &k)?;
        }
        // Tree is dropped here with no second checkpoint - simulates a crash.
    }

    let reopened = Tree::open(&path, U64Layout, Options { page_size: 4096, ..Options::default() })?;
    assert_eq!(reopened.get(&1u64)?, Some(10));
    assert_eq!(reopened.get(&150u64)?, None);
    let report = reopened.consistency_check()?;
    assert!(report.is_clean());
    Ok(())
}

#[test]
fn checkpoint_then_reopen_preserves_every_key() -> Result<(), GbpError> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
        let tree = open(&path)?;
        for k in 0..500u64 {
            tree.put(&k, &(k * 2))?;
        }
        tree.checkpoint("bulk load")?;
    }

    let reopened = Tree::open(&path, U64Layout, Options { page_size: 4096, ..Options::default() })?;
    for k in 0..500u64 {
        assert_eq!(reopened.get(&k)?, Some(k * 2));
    }
    Ok(())
}

#[test]
fn remove_survives_a_checkpoint_and_reopen() -> Result<(), GbpError> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
        let tree = open(&path)?;
        for k in 0..50u64 {
            tree.put(&k, &k)?;
        }
        for k in 0..25u64 {
            tree.remove(&k)?;
        }
        tree.checkpoint("after removes")?;
    }

    let reopened = Tree::open(&path, U64Layout, Options { page_size: 4096, ..Options::default() })?;
    for k in 0..25u64 {
        assert_eq!(reopened.get(&k)?, None);
    }
    for k in 25..50u64 {
        assert_eq!(reopened.get(&k)?, Some(k));
    }
    Ok(())
}
