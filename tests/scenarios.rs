//! End-to-end scenarios exercising the engine's core guarantees: single-key
//! durability, MVCC snapshot isolation, GC page reuse, and DUPSORT subpage
//! promotion.

use std::sync::Arc;
use tempfile::TempDir;
use emberdb::{Database, DatabaseFlags, EnvBuilder};

fn open_env(dir: &TempDir) -> Arc<emberdb::Environment<emberdb::env::state::Open>> {
    Arc::new(EnvBuilder::new().map_size(64 * 1024 * 1024).open(dir.path()).unwrap())
}

#[test]
fn scenario_1_single_key_round_trip() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db: Database<Vec<u8>, Vec<u8>> = {
        let mut txn = env.write_txn().unwrap();
        let db = env.create_database(&mut txn, None).unwrap();
        db.put(&mut txn, b"hello".to_vec(), b"world".to_vec()).unwrap();
        txn.commit().unwrap();
        db
    };

    let txn = env.read_txn().unwrap();
    assert_eq!(db.get(&txn, &b"hello".to_vec()).unwrap(), Some(b"world".to_vec()));
}

#[test]
fn scenario_2_mvcc_snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db: Database<String, String> = {
        let mut txn = env.write_txn().unwrap();
        let db = env.create_database(&mut txn, Some("counters")).unwrap();
        txn.commit().unwrap();
        db
    };

    fn set(env: &emberdb::Environment<emberdb::env::state::Open>, db: &Database<String, String>, v: &str) {
        let mut txn = env.write_txn().unwrap();
        db.put(&mut txn, "a".to_string(), v.to_string()).unwrap();
        txn.commit().unwrap();
    }

    set(&env, &db, "1");

    let r1 = env.read_txn().unwrap();
    assert_eq!(db.get(&r1, &"a".to_string()).unwrap(), Some("1".to_string()));

    set(&env, &db, "2");
    assert_eq!(db.get(&r1, &"a".to_string()).unwrap(), Some("1".to_string()), "R1 must not see txn 2's write");

    set(&env, &db, "3");
    assert_eq!(db.get(&r1, &"a".to_string()).unwrap(), Some("1".to_string()), "R1 must not see txn 3's write");

    drop(r1);

    let r2 = env.read_txn().unwrap();
    assert_eq!(db.get(&r2, &"a".to_string()).unwrap(), Some("3".to_string()), "a fresh reader sees the latest commit");
}

#[test]
fn scenario_3_gc_reuses_pages_instead_of_growing_the_file() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db: Database<String, Vec<u8>> = {
        let mut txn = env.write_txn().unwrap();
        let db = env.create_database(&mut txn, Some("blobs")).unwrap();
        txn.commit().unwrap();
        db
    };

    // Insert 50 keys with large-page-forcing values, then delete them all.
    // With no live readers, the pages they occupied become reclaimable.
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..50 {
            db.put(&mut txn, format!("key{i:04}"), vec![0xAB; 3 * 1024]).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..50 {
            db.delete(&mut txn, &format!("key{i:04}")).unwrap();
        }
        txn.commit().unwrap();
    }

    let used_before = env.space_info().unwrap().used_pages;

    // Inserting fewer, similarly sized keys should reuse the retired run
    // rather than extending the file.
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..10 {
            db.put(&mut txn, format!("newkey{i:04}"), vec![0xCD; 3 * 1024]).unwrap();
        }
        txn.commit().unwrap();
    }

    let used_after = env.space_info().unwrap().used_pages;
    assert!(
        used_after <= used_before,
        "GC should have reclaimed retired pages instead of growing the map: before={used_before}, after={used_after}"
    );
}

#[test]
fn scenario_6_dupsort_promotes_from_subpage_to_nested_tree() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    let db: Database<String, Vec<u8>> = {
        let mut txn = env.write_txn().unwrap();
        let db = env
            .create_database_with_flags(&mut txn, Some("tags"), DatabaseFlags::DUP_SORT)
            .unwrap();
        txn.commit().unwrap();
        db
    };

    // A handful of small values stays an embedded subpage.
    {
        let mut txn = env.write_txn().unwrap();
        db.put_dup(&mut txn, "k".to_string(), vec![1; 8]).unwrap();
        db.put_dup(&mut txn, "k".to_string(), vec![2; 8]).unwrap();
        db.put_dup(&mut txn, "k".to_string(), vec![3; 8]).unwrap();
        txn.commit().unwrap();
    }
    {
        let txn = env.read_txn().unwrap();
        let values = db.get_all(&txn, &"k".to_string()).unwrap();
        assert_eq!(values.len(), 3);
    }

    // Pushing past the subpage size threshold promotes to a nested tree;
    // reads must keep returning every value in sorted order regardless.
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..40u8 {
            db.put_dup(&mut txn, "k".to_string(), vec![i; 512]).unwrap();
        }
        txn.commit().unwrap();
    }

    let txn = env.read_txn().unwrap();
    let mut values = db.get_all(&txn, &"k".to_string()).unwrap();
    values.sort();
    assert_eq!(values.len(), 43);
    for i in 0..40u8 {
        assert!(values.contains(&vec![i; 512]));
    }
}

#[test]
fn integrity_checker_reports_no_findings_on_a_well_formed_database() {
    let dir = TempDir::new().unwrap();
    let env = open_env(&dir);

    {
        let mut txn = env.write_txn().unwrap();
        let db: Database<String, String> = env.create_database(&mut txn, Some("misc")).unwrap();
        for i in 0..30 {
            db.put(&mut txn, format!("k{i}"), "v".repeat(i + 1)).unwrap();
        }
        txn.commit().unwrap();
    }

    let txn = env.read_txn().unwrap();
    let report = emberdb::checker::check_database(&txn).unwrap();
    assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
}
