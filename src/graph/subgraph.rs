//! # Subgraph Storage
//!
//! One subgraph is three persistent maps under the library directory:
//!
//! ```text
//! lg_<id>_nodes   NodeId  -> NodeRecord
//! lg_<id>_inst    NodeId  -> SubgraphId   (instance sites)
//! lg_<id>_edges   EdgeKey -> EdgeRecord   (adjacency)
//! ```
//!
//! Nothing here caches: every accessor goes straight to the maps, which is
//! what keeps a subgraph usable from whichever scheduler round opens it,
//! before or after its regions were reclaimed.

use std::path::Path;

use eyre::Result;

use super::{EdgeKey, EdgeRecord, NodeId, NodeRecord, SubgraphId};
use crate::map::{PersistentMap, StrId};

pub struct Subgraph {
    id: SubgraphId,
    nodes: PersistentMap<NodeId, NodeRecord>,
    instances: PersistentMap<NodeId, SubgraphId>,
    edges: PersistentMap<EdgeKey, EdgeRecord>,
}

impl Subgraph {
    pub(crate) fn open(dir: &Path, id: SubgraphId) -> Result<Self> {
        Ok(Subgraph {
            id,
            nodes: PersistentMap::open(dir, &format!("lg_{}_nodes", id.0))?,
            instances: PersistentMap::open(dir, &format!("lg_{}_inst", id.0))?,
            edges: PersistentMap::open(dir, &format!("lg_{}_edges", id.0))?,
        })
    }

    pub fn id(&self) -> SubgraphId {
        self.id
    }

    /// A subgraph with neither nodes nor instance sites. Empty subgraphs
    /// are levelled but never dispatched by the scheduler.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.instances.is_empty()
    }

    pub fn num_nodes(&self) -> u64 {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> u64 {
        self.edges.len()
    }

    pub fn num_instances(&self) -> u64 {
        self.instances.len()
    }

    pub fn add_node(&self, nid: NodeId, op: u32, bits: u32, name: StrId) {
        self.nodes.set(nid, NodeRecord { op, bits, name });
    }

    pub fn node(&self, nid: NodeId) -> Option<NodeRecord> {
        self.nodes.find(&nid).value()
    }

    pub fn del_node(&self, nid: NodeId) -> bool {
        self.instances.erase(&nid);
        self.nodes.erase(&nid) != 0
    }

    /// Records that node `nid` instantiates `sub`. The node itself may or
    /// may not carry a record; hierarchy passes only consult the sites.
    pub fn add_instance(&self, nid: NodeId, sub: SubgraphId) {
        self.instances.set(nid, sub);
    }

    pub fn instance(&self, nid: NodeId) -> Option<SubgraphId> {
        self.instances.find(&nid).value()
    }

    pub fn add_edge(&self, driver: NodeId, sink: NodeId, pid: u32, rec: EdgeRecord) {
        self.edges.set(EdgeKey { driver, sink, pid }, rec);
    }

    pub fn edge(&self, driver: NodeId, sink: NodeId, pid: u32) -> Option<EdgeRecord> {
        self.edges.find(&EdgeKey { driver, sink, pid }).value()
    }

    pub fn del_edge(&self, driver: NodeId, sink: NodeId, pid: u32) -> bool {
        self.edges.erase(&EdgeKey { driver, sink, pid }) != 0
    }

    /// Visits every instance site, stopping early when `f` returns false.
    /// Returns false iff the walk was stopped.
    pub fn each_local_instance_fast<F>(&self, mut f: F) -> bool
    where
        F: FnMut(NodeId, SubgraphId) -> bool,
    {
        for (nid, sub) in self.instances.iter() {
            if !f(nid, sub) {
                return false;
            }
        }
        true
    }

    /// Visits each distinct instantiated subgraph id once, in first-site
    /// order. Stops early when `f` returns false.
    pub fn each_local_unique_instance<F>(&self, mut f: F) -> bool
    where
        F: FnMut(SubgraphId) -> bool,
    {
        let mut visited = hashbrown::HashSet::new();
        for (_, sub) in self.instances.iter() {
            if visited.insert(sub) && !f(sub) {
                return false;
            }
        }
        true
    }

    /// Iterates node records. Callers must not mutate the node map while
    /// the iterator is alive.
    pub fn each_node_fast<F>(&self, mut f: F) -> bool
    where
        F: FnMut(NodeId, NodeRecord) -> bool,
    {
        for (nid, rec) in self.nodes.iter() {
            if !f(nid, rec) {
                return false;
            }
        }
        true
    }

    pub fn each_edge_fast<F>(&self, mut f: F) -> bool
    where
        F: FnMut(EdgeKey, EdgeRecord) -> bool,
    {
        for (key, rec) in self.edges.iter() {
            if !f(key, rec) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_edge_instance_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sg = Subgraph::open(dir.path(), SubgraphId(7)).unwrap();

        assert!(sg.is_empty());

        sg.add_node(NodeId(1), 3, 8, StrId::NONE);
        sg.add_node(NodeId(2), 4, 1, StrId::NONE);
        sg.add_edge(NodeId(1), NodeId(2), 0, EdgeRecord { bits: 8 });
        sg.add_instance(NodeId(2), SubgraphId(9));

        assert!(!sg.is_empty());
        assert_eq!(sg.num_nodes(), 2);
        assert_eq!(sg.node(NodeId(1)).unwrap().bits, 8);
        assert_eq!(sg.edge(NodeId(1), NodeId(2), 0).unwrap().bits, 8);
        assert!(sg.edge(NodeId(2), NodeId(1), 0).is_none());
        assert_eq!(sg.instance(NodeId(2)), Some(SubgraphId(9)));

        assert!(sg.del_edge(NodeId(1), NodeId(2), 0));
        assert!(!sg.del_edge(NodeId(1), NodeId(2), 0));
        assert!(sg.del_node(NodeId(2)));
        assert_eq!(sg.instance(NodeId(2)), None);
    }

    #[test]
    fn unique_instance_walk_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let sg = Subgraph::open(dir.path(), SubgraphId(1)).unwrap();

        sg.add_instance(NodeId(10), SubgraphId(2));
        sg.add_instance(NodeId(11), SubgraphId(2));
        sg.add_instance(NodeId(12), SubgraphId(3));

        let mut seen = Vec::new();
        sg.each_local_unique_instance(|sub| {
            seen.push(sub);
            true
        });
        seen.sort();
        assert_eq!(seen, vec![SubgraphId(2), SubgraphId(3)]);

        let mut count = 0;
        sg.each_local_instance_fast(|_, _| {
            count += 1;
            count < 2
        });
        assert_eq!(count, 2, "early stop after the second site");
    }
}
