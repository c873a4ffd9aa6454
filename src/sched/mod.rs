//! # Bottom-Up Hierarchy Scheduler
//!
//! A pass over a parent subgraph may depend on having already run over
//! every subgraph it instantiates, directly or transitively. The scheduler
//! turns the instance tree into rounds: round 0 is every subgraph that
//! instantiates nothing (level 0), and each later round runs the subgraphs
//! whose deepest dependency finished in an earlier round. Within a round
//! all callbacks run concurrently on the worker pool and a barrier closes
//! the round; since the ids in one round are distinct and subgraph handles
//! are shared per id, no map is ever touched by two workers at once.
//!
//! ## Level computation
//!
//! One bottom-up sweep of the instance tree pushes each node's current
//! level up the full parent chain (`level(parent) >= level(child) + 1`),
//! visiting strictly deeper instances first. A final fixpoint pass over
//! the distinct parent/child subgraph pairs then enforces the ordering
//! invariant outright, so correctness never hangs on the sweep order for
//! pathological instance DAGs. Levels are heights over the subgraph DAG:
//! dispatch by ascending level is exactly "children first".
//!
//! ## Failure
//!
//! The scheduler catches nothing. A failing callback surfaces at the
//! round's barrier after its peers finish, stops dispatch of later rounds,
//! and propagates to the caller.

mod pool;

pub use pool::WorkerPool;

use std::sync::Arc;

use eyre::Result;
use hashbrown::{HashMap, HashSet};

use crate::graph::{GraphLib, HierTree, Subgraph, SubgraphId};

/// Scheduling level per distinct subgraph in the tree: 0 for leaves, and
/// strictly greater than the level of every instantiated subgraph
/// otherwise. Exposed separately from [`run_bottom_up`] so passes (and
/// tests) can inspect the rounds a hierarchy would produce.
pub fn schedule_levels(tree: &HierTree) -> HashMap<SubgraphId, u32> {
    let mut levels: HashMap<SubgraphId, u32> = HashMap::new();

    tree.each_bottom_up_fast(|idx, sub| {
        let own = *levels.entry(sub).or_insert(0);
        let mut need = own + 1;
        let mut cur = idx;
        while let Some(parent) = tree.parent(cur) {
            let psub = tree.subgraph(parent);
            let entry = levels.entry(psub).or_insert(need);
            if *entry < need {
                *entry = need;
            }
            need = *entry + 1;
            cur = parent;
        }
    });

    // Fixpoint over the instantiation edges. The sweep above already lands
    // on heights for every realistic hierarchy; this pass is the invariant
    // the correctness argument stands on.
    let mut edges: HashSet<(SubgraphId, SubgraphId)> = HashSet::new();
    for idx in tree.depth_preorder() {
        if let Some(parent) = tree.parent(idx) {
            edges.insert((tree.subgraph(parent), tree.subgraph(idx)));
        }
    }
    loop {
        let mut changed = false;
        for (parent, child) in &edges {
            let child_level = levels[child];
            let parent_level = levels.get_mut(parent).expect("parent seen in sweep");
            if *parent_level <= child_level {
                *parent_level = child_level + 1;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    levels
}

/// Runs `f` once per distinct subgraph reachable from `root` (the root
/// included), children strictly before parents, with each round's
/// callbacks executing in parallel on `pool`.
///
/// Empty subgraphs are levelled but not dispatched. The first callback
/// failure stops dispatch after its round drains and propagates out.
pub fn run_bottom_up<F>(
    lib: &GraphLib,
    root: SubgraphId,
    pool: &WorkerPool,
    f: F,
) -> Result<()>
where
    F: Fn(&Subgraph) -> Result<()> + Send + Sync + 'static,
{
    let tree = lib.build_hier_tree(root)?;
    let mut pending = schedule_levels(&tree);
    let f = Arc::new(f);

    let mut level = 0u32;
    while !pending.is_empty() {
        let batch: Vec<SubgraphId> = pending
            .iter()
            .filter(|(_, l)| **l <= level)
            .map(|(id, _)| *id)
            .collect();
        for id in &batch {
            pending.remove(id);
        }

        let mut dispatched = 0usize;
        for id in batch {
            let sg = lib.open_subgraph(id)?;
            if sg.is_empty() {
                continue;
            }
            let f = Arc::clone(&f);
            pool.add(move || f(&sg));
            dispatched += 1;
        }

        tracing::debug!(level, dispatched, remaining = pending.len(), "bottom-up round");
        if dispatched > 0 {
            pool.wait_all()?;
        }
        level += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;

    #[test]
    fn levels_for_a_chain_with_shared_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let lib = GraphLib::open(dir.path()).unwrap();

        // T instantiates S and P; P instantiates S. S must run before P
        // even though one S site is shallow.
        let t = lib.open_subgraph(SubgraphId(1)).unwrap();
        let p = lib.open_subgraph(SubgraphId(2)).unwrap();
        t.add_instance(NodeId(1), SubgraphId(3));
        t.add_instance(NodeId(2), SubgraphId(2));
        p.add_instance(NodeId(1), SubgraphId(3));

        let tree = lib.build_hier_tree(SubgraphId(1)).unwrap();
        let levels = schedule_levels(&tree);

        assert_eq!(levels[&SubgraphId(3)], 0);
        assert!(levels[&SubgraphId(2)] > levels[&SubgraphId(3)]);
        assert!(levels[&SubgraphId(1)] > levels[&SubgraphId(2)]);
    }
}
