//! # Hierarchical Graph Index
//!
//! A circuit design is a library of subgraphs: each subgraph is a directed
//! graph of nodes and edges stored in its own persistent maps, and nodes
//! may instantiate other subgraphs, forming a containment hierarchy. The
//! same subgraph can be instantiated at many sites, so the hierarchy is a
//! DAG of subgraph ids expanded into a tree of instances.
//!
//! [`GraphLib`] owns the library directory and shares one [`Subgraph`]
//! handle per id across every instance site; [`HierTree`] is the expanded
//! instance tree a pass traverses. The iteration primitives here are the
//! read side of the system; the parallel bottom-up dispatch lives in
//! [`crate::sched`].

mod subgraph;
mod tree;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::map::hash::{hash_bytes, MapHash};
use crate::map::StrArena;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use subgraph::Subgraph;
pub use tree::{HierIndex, HierNode, HierTree, MAX_HIER_DEPTH};

/// Identity of a subgraph within one library. Stable across processes:
/// backing file names are derived from it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct SubgraphId(pub u32);

impl MapHash for SubgraphId {
    fn map_hash(&self) -> u64 {
        self.0.map_hash()
    }
}

/// Node identity local to one subgraph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct NodeId(pub u32);

impl MapHash for NodeId {
    fn map_hash(&self) -> u64 {
        self.0.map_hash()
    }
}

/// Fixed-size node payload: cell kind, output width, interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NodeRecord {
    pub op: u32,
    pub bits: u32,
    pub name: crate::map::StrId,
}

/// Directed connection `driver -> sink` at the sink's port `pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EdgeKey {
    pub driver: NodeId,
    pub sink: NodeId,
    pub pid: u32,
}

impl MapHash for EdgeKey {
    fn map_hash(&self) -> u64 {
        hash_bytes(zerocopy::IntoBytes::as_bytes(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EdgeRecord {
    pub bits: u32,
}

/// A library of subgraphs rooted at one directory. Subgraph handles are
/// memoized: every instance site referring to an id shares one `Arc`, so a
/// pass touching a subgraph through two sites sees one map, one lock.
pub struct GraphLib {
    path: PathBuf,
    names: StrArena,
    opened: Mutex<HashMap<SubgraphId, Arc<Subgraph>>>,
}

impl GraphLib {
    pub fn open(path: impl AsRef<Path>) -> Result<GraphLib> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)
            .wrap_err_with(|| format!("failed to create library '{}'", path.display()))?;
        let names = StrArena::open(&path, "lgdb_names")?;
        Ok(GraphLib {
            path,
            names,
            opened: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The library-wide name arena node records intern into.
    pub fn names(&self) -> &StrArena {
        &self.names
    }

    /// Opens the subgraph `id`, sharing the handle with every other caller.
    pub fn open_subgraph(&self, id: SubgraphId) -> Result<Arc<Subgraph>> {
        let mut opened = self.opened.lock();
        if let Some(sg) = opened.get(&id) {
            return Ok(Arc::clone(sg));
        }
        let sg = Arc::new(Subgraph::open(&self.path, id)?);
        opened.insert(id, Arc::clone(&sg));
        Ok(sg)
    }

    /// Expands the instance tree below (and including) `root`.
    pub fn build_hier_tree(&self, root: SubgraphId) -> Result<HierTree> {
        HierTree::build(self, root)
    }

    /// Invokes `f` on each distinct subgraph id reachable from `root`
    /// exactly once, after all of its descendants; the root comes last.
    /// An error from `f` stops the walk and propagates.
    pub fn each_subgraph_unique_bottom_up<F>(&self, root: SubgraphId, mut f: F) -> Result<()>
    where
        F: FnMut(&Subgraph) -> Result<()>,
    {
        let mut visited = HashSet::new();
        self.bottom_up_rec(root, 0, &mut visited, &mut f)
    }

    fn bottom_up_rec<F>(
        &self,
        id: SubgraphId,
        depth: usize,
        visited: &mut HashSet<SubgraphId>,
        f: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&Subgraph) -> Result<()>,
    {
        ensure!(
            depth <= MAX_HIER_DEPTH,
            "instance hierarchy exceeds depth {MAX_HIER_DEPTH}; cycle through subgraph {}?",
            id.0
        );

        let sg = self.open_subgraph(id)?;

        // Collect before descending: callbacks must never run under a
        // ref-locked instance map.
        let mut children: Vec<SubgraphId> = Vec::new();
        sg.each_local_unique_instance(|child| {
            children.push(child);
            true
        });

        for child in children {
            if !visited.contains(&child) {
                self.bottom_up_rec(child, depth + 1, visited, f)?;
            }
        }
        if visited.insert(id) {
            f(&sg)?;
        }
        Ok(())
    }
}
