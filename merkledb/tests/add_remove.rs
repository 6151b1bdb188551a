mod common;

use common::{new_db, root_of, TS};
use merkledb::{Key, ViewChanges};

#[test]
fn basic_reads_after_writes() {
    let db = new_db();
    db.insert(b"a", b"1").unwrap();
    db.insert(b"ab", b"2").unwrap();

    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"ab").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), None);

    let results = db.get_many(&[b"a", b"b", b"ab"]);
    assert_eq!(results[0], Ok(b"1".to_vec()));
    assert_eq!(results[1], Err(merkledb::Error::NotFound));
    assert_eq!(results[2], Ok(b"2".to_vec()));
}

#[test]
fn overwrites_change_the_root() {
    let db = new_db();
    db.insert(b"a", b"1").unwrap();
    let first = db.root();
    db.insert(b"a", b"2").unwrap();
    assert_ne!(db.root(), first);
    db.insert(b"a", b"1").unwrap();
    assert_eq!(db.root(), first);
}

#[test]
fn remove_is_idempotent() {
    let db = new_db();
    db.insert(b"a", b"1").unwrap();
    let with_a = db.root();
    db.remove(b"zz").unwrap();
    assert_eq!(db.root(), with_a);
    db.remove(b"a").unwrap();
    db.remove(b"a").unwrap();
    assert_eq!(db.get(b"a").unwrap(), None);
}

#[test]
fn removal_compresses_the_path() {
    let db = new_db();
    let view = db
        .new_view(
            ViewChanges::new()
                .put(&b"ab"[..], &b"1"[..])
                .put(&b"ac"[..], &b"2"[..]),
        )
        .unwrap();
    view.commit_to_db().unwrap();
    db.remove(b"ac").unwrap();

    // the remaining trie must be a single leaf behind one compressed edge,
    // not a branch with a dangling sibling
    let proof = db.get_proof(b"ab").unwrap();
    assert_eq!(proof.path.len(), 2);
    assert_eq!(proof.path[1].key, Key::from_bytes(b"ab", TS));
    let root = &proof.path[0];
    assert_eq!(root.children.len(), 1);
    let edge = root.children.values().next().unwrap();
    assert_eq!(edge.compressed_key.len(), 3);

    assert_eq!(db.root(), root_of(&[(b"ab", b"1")]));
}

#[test]
fn empty_key_holds_a_value() {
    let db = new_db();
    db.insert(b"", b"root value").unwrap();
    db.insert(b"a", b"1").unwrap();
    assert_eq!(db.get(b"").unwrap(), Some(b"root value".to_vec()));
    db.remove(b"").unwrap();
    assert_eq!(db.get(b"").unwrap(), None);
    assert_eq!(db.root(), root_of(&[(b"a", b"1")]));
}

#[test]
fn fill_and_empty_restores_the_empty_root() {
    let db = new_db();
    let empty_root = db.root();

    let keys: Vec<Vec<u8>> = (0u16..200).map(|i| i.to_be_bytes().to_vec()).collect();
    for key in &keys {
        db.insert(key, key).unwrap();
    }
    for key in &keys {
        assert_eq!(db.get(key).unwrap(), Some(key.clone()));
    }
    assert_ne!(db.root(), empty_root);

    for key in &keys {
        db.remove(key).unwrap();
    }
    assert_eq!(db.root(), empty_root);
    assert_eq!(db.iterator().unwrap().count(), 0);
}

#[test]
fn long_values_round_trip() {
    // values at and above the digest threshold are digested in the trie
    // but must read back whole
    let db = new_db();
    let long = vec![0xabu8; 4096];
    let exactly_32 = vec![0xcdu8; 32];
    db.insert(b"long", &long).unwrap();
    db.insert(b"edge", &exactly_32).unwrap();
    assert_eq!(db.get(b"long").unwrap(), Some(long));
    assert_eq!(db.get(b"edge").unwrap(), Some(exactly_32));
}

#[test]
fn no_committed_node_has_one_child_and_no_value() {
    let db = new_db();
    let keys: Vec<Vec<u8>> = (0u16..120)
        .map(|i| i.wrapping_mul(40503).to_be_bytes().to_vec())
        .collect();
    for key in &keys {
        db.insert(key, b"v").unwrap();
    }
    for key in keys.iter().step_by(3) {
        db.remove(key).unwrap();
    }

    // every committed node shows up on some key's proof path
    for key in keys.iter() {
        let proof = db.get_proof(key).unwrap();
        for node in &proof.path {
            let single_child_no_value =
                node.children.len() == 1 && node.value_digest.is_none() && !node.key.is_empty();
            assert!(
                !single_child_no_value,
                "uncompressed node at {:?} on path to {:?}",
                node.key, key
            );
        }
    }
}

#[test]
fn other_branch_factors_work() {
    use merkledb::{BranchFactor, MemoryStore, MerkleDb, Options};
    use std::sync::Arc;

    for branch_factor in [
        BranchFactor::Two,
        BranchFactor::Four,
        BranchFactor::Sixteen,
        BranchFactor::TwoFiftySix,
    ] {
        let mut options = Options::new();
        options.branch_factor(branch_factor);
        let db = MerkleDb::open(Arc::new(MemoryStore::new()), options).unwrap();

        for (key, value) in [(&b"ab"[..], &b"1"[..]), (b"ac", b"2"), (b"b", b"3")] {
            db.insert(key, value).unwrap();
        }
        assert_eq!(db.get(b"ab").unwrap(), Some(b"1".to_vec()));
        db.remove(b"ac").unwrap();
        assert_eq!(db.get(b"ac").unwrap(), None);

        let root = db.root();
        let ts = branch_factor.token_size();
        db.get_proof(b"ab").unwrap().verify(&root, ts).unwrap();
        db.get_proof(b"ac").unwrap().verify(&root, ts).unwrap();
        db.get_range_proof(None, None, 10)
            .unwrap()
            .verify(None, None, &root, ts)
            .unwrap();
    }
}

#[test]
fn values_iterate_in_key_order() {
    let db = new_db();
    for key in [&b"b"[..], b"aa", b"ab", b"c", b"a"] {
        db.insert(key, key).unwrap();
    }
    let keys: Vec<Vec<u8>> = db
        .iterator()
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(
        keys,
        vec![
            b"a".to_vec(),
            b"aa".to_vec(),
            b"ab".to_vec(),
            b"b".to_vec(),
            b"c".to_vec()
        ]
    );

    let keys: Vec<Vec<u8>> = db
        .iterator_with_start(b"ab")
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, vec![b"ab".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}
