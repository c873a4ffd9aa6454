//! # Map Operation Scenarios
//!
//! Black-box coverage of the persistent map through its public API only:
//! empty-map behavior, basic association, growth under load, and erase
//! patterns. Persistence across reopen lives in `map_persistence.rs`.

use lgdb::PersistentMap;
use rand::Rng;
use tempfile::tempdir;

#[test]
fn empty_map_has_nothing() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "empty").unwrap();

    assert!(!map.has(&42));
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    assert_eq!(map.iter().count(), 0);
}

#[test]
fn two_entries_associate_independently() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<u64, i64> = PersistentMap::open(dir.path(), "pair").unwrap();

    map.set(0xa1fa, 1);
    map.set(0xbe7a, 2);

    assert_eq!(map.get(&0xa1fa), 1);
    assert_eq!(map.get(&0xbe7a), 2);
    assert_eq!(map.len(), 2);
}

#[test]
fn five_thousand_squares() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "squares").unwrap();

    for k in 0u64..5000 {
        map.set(k, k * k);
    }
    assert_eq!(map.len(), 5000);

    let mut rng = rand::rng();
    for _ in 0..100 {
        let k = rng.random_range(0u64..5000);
        assert_eq!(map.get(&k), k * k, "key {k}");
    }
}

#[test]
fn erase_odd_keys() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "odds").unwrap();

    for k in 0u64..5000 {
        map.set(k, k);
    }
    for k in (1u64..5000).step_by(2) {
        assert_eq!(map.erase(&k), 1, "erase {k}");
    }

    assert_eq!(map.len(), 2500);
    for k in 0u64..5000 {
        assert_eq!(map.has(&k), k % 2 == 0, "key {k}");
    }
}

#[test]
fn erase_then_reinsert_round_trips() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "churn").unwrap();

    for round in 0u64..4 {
        for k in 0u64..1000 {
            map.set(k, k + round);
        }
        for k in 0u64..1000 {
            assert_eq!(map.get(&k), k + round);
        }
        for k in 0u64..1000 {
            assert_eq!(map.erase(&k), 1);
        }
        assert!(map.is_empty(), "round {round}");
    }
}

#[test]
fn iteration_matches_contents_after_mixed_ops() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<u32, u64> = PersistentMap::open(dir.path(), "mixed").unwrap();

    let mut model = std::collections::HashMap::new();
    let mut rng = rand::rng();
    for _ in 0..20_000 {
        let k: u32 = rng.random_range(0..4096);
        if rng.random_range(0..3) == 0 {
            let erased = map.erase(&k);
            assert_eq!(erased == 1, model.remove(&k).is_some(), "erase {k}");
        } else {
            let v: u64 = rng.random();
            map.set(k, v);
            model.insert(k, v);
        }
    }

    assert_eq!(map.len(), model.len() as u64);
    let mut walked = 0usize;
    for (k, v) in map.iter() {
        assert_eq!(model.get(&k), Some(&v), "key {k}");
        walked += 1;
    }
    assert_eq!(walked, model.len());
}
