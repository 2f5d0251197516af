use std::sync::Arc;
use std::thread;

use gbptree::layout::U64Layout;
use gbptree::{GbpError, Options, Tree};
use tempfile::tempdir;

#[test]
fn concurrent_writers_do_not_corrupt_the_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let tree = Arc::new(Tree::create(&path, U64Layout, Options { page_size: 4096, ..Options::default() }).unwrap());

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for i in 0..50u64 {
                let key = worker * 1000 + i;
                loop {
                    match tree.put(&key, &key) {
                        Ok(()) => break,
                        Err(GbpError::Conflict) => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    tree.checkpoint("after concurrent writers").unwrap();
    for worker in 0..8u64 {
        for i in 0..50u64 {
            let key = worker * 1000 + i;
            assert_eq!(tree.get(&key).unwrap(), Some(key));
        }
    }
    assert!(tree.consistency_check().unwrap().is_clean());
}
