//! # Restart Round-Trips
//!
//! The durability contract: a map is its backing file. Dropping every
//! handle and reopening the same directory/name pair must observe the same
//! association, and because entries never move without a rehash, the same
//! iteration order too.

use lgdb::{GraphLib, NodeId, PersistentMap, SubgraphId};
use tempfile::tempdir;

#[test]
fn hundred_entries_survive_reopen_in_order() {
    let dir = tempdir().unwrap();

    let order_before: Vec<(u64, u64)> = {
        let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "m").unwrap();
        for k in 0u64..100 {
            map.set(k, k ^ 0xabcd);
        }
        map.iter().collect()
    };
    assert_eq!(order_before.len(), 100);

    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "m").unwrap();
    assert_eq!(map.len(), 100);
    for k in 0u64..100 {
        assert_eq!(map.get(&k), k ^ 0xabcd);
    }

    let order_after: Vec<(u64, u64)> = map.iter().collect();
    assert_eq!(order_before, order_after, "slot order must be stable");
}

#[test]
fn growth_survives_reopen() {
    let dir = tempdir().unwrap();

    {
        let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "big").unwrap();
        for k in 0u64..20_000 {
            map.set(k, k.wrapping_mul(0x9e37_79b9));
        }
    }

    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "big").unwrap();
    assert_eq!(map.len(), 20_000);
    for k in (0u64..20_000).step_by(613) {
        assert_eq!(map.get(&k), k.wrapping_mul(0x9e37_79b9));
    }
}

#[test]
fn erases_are_durable() {
    let dir = tempdir().unwrap();

    {
        let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "er").unwrap();
        for k in 0u64..2000 {
            map.set(k, k);
        }
        for k in (0u64..2000).step_by(3) {
            map.erase(&k);
        }
    }

    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "er").unwrap();
    for k in 0u64..2000 {
        assert_eq!(map.has(&k), k % 3 != 0, "key {k}");
    }
}

#[test]
fn cleared_map_reopens_empty() {
    let dir = tempdir().unwrap();

    {
        let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "cl").unwrap();
        map.set(1, 1);
        map.clear();
    }

    let map: PersistentMap<u64, u64> = PersistentMap::open(dir.path(), "cl").unwrap();
    assert!(map.is_empty());
    assert!(!map.has(&1));
}

#[test]
fn graph_library_survives_reopen() {
    let dir = tempdir().unwrap();

    let name_id = {
        let lib = GraphLib::open(dir.path()).unwrap();
        let top = lib.open_subgraph(SubgraphId(1)).unwrap();
        let alu = lib.names().intern("alu0");
        top.add_node(NodeId(1), 3, 32, alu);
        top.add_instance(NodeId(2), SubgraphId(5));

        let sub = lib.open_subgraph(SubgraphId(5)).unwrap();
        sub.add_node(NodeId(1), 7, 1, lgdb::StrId::NONE);
        alu
    };

    let lib = GraphLib::open(dir.path()).unwrap();
    let top = lib.open_subgraph(SubgraphId(1)).unwrap();
    let rec = top.node(NodeId(1)).unwrap();
    assert_eq!(rec.op, 3);
    assert_eq!(rec.bits, 32);
    assert_eq!(rec.name, name_id);
    assert_eq!(lib.names().resolve(rec.name), "alu0");
    assert_eq!(top.instance(NodeId(2)), Some(SubgraphId(5)));

    let sub = lib.open_subgraph(SubgraphId(5)).unwrap();
    assert!(!sub.is_empty());
}
