//! # Instance Tree
//!
//! The containment hierarchy expanded from a root subgraph: one tree node
//! per instance site, carrying the instantiated subgraph id and a parent
//! link. The tree is rebuilt from the instance maps whenever a pass needs
//! it; it is a traversal artifact, not persistent state.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::{GraphLib, SubgraphId};

/// Deeper than any sane design; a hierarchy that reaches this is assumed
/// to contain an instance cycle.
pub const MAX_HIER_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HierIndex(pub u32);

impl HierIndex {
    pub const ROOT: HierIndex = HierIndex(0);
}

#[derive(Debug)]
pub struct HierNode {
    parent: u32,
    sub: SubgraphId,
    depth: u32,
    children: SmallVec<[u32; 4]>,
}

impl HierNode {
    pub fn subgraph(&self) -> SubgraphId {
        self.sub
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

#[derive(Debug)]
pub struct HierTree {
    nodes: Vec<HierNode>,
}

impl HierTree {
    pub(crate) fn build(lib: &GraphLib, root: SubgraphId) -> Result<HierTree> {
        let mut nodes = vec![HierNode {
            parent: u32::MAX,
            sub: root,
            depth: 0,
            children: SmallVec::new(),
        }];

        let mut stack = vec![0u32];
        while let Some(at) = stack.pop() {
            let (sub, depth) = (nodes[at as usize].sub, nodes[at as usize].depth);
            ensure!(
                (depth as usize) < MAX_HIER_DEPTH,
                "instance hierarchy exceeds depth {MAX_HIER_DEPTH}; cycle through subgraph {}?",
                sub.0
            );

            let sg = lib.open_subgraph(sub)?;
            let mut sites: Vec<SubgraphId> = Vec::new();
            sg.each_local_instance_fast(|_, child| {
                sites.push(child);
                true
            });

            for child in sites {
                let idx = nodes.len() as u32;
                nodes.push(HierNode {
                    parent: at,
                    sub: child,
                    depth: depth + 1,
                    children: SmallVec::new(),
                });
                nodes[at as usize].children.push(idx);
                stack.push(idx);
            }
        }

        Ok(HierTree { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        // There is always a root.
        false
    }

    pub fn node(&self, idx: HierIndex) -> &HierNode {
        &self.nodes[idx.0 as usize]
    }

    pub fn subgraph(&self, idx: HierIndex) -> SubgraphId {
        self.nodes[idx.0 as usize].sub
    }

    pub fn parent(&self, idx: HierIndex) -> Option<HierIndex> {
        let p = self.nodes[idx.0 as usize].parent;
        (p != u32::MAX).then_some(HierIndex(p))
    }

    /// Depth-first preorder over all instances, root first.
    pub fn depth_preorder(&self) -> impl Iterator<Item = HierIndex> + '_ {
        Preorder {
            tree: self,
            stack: vec![0],
        }
    }

    /// Preorder walk that stops as soon as `f` returns false. The node's
    /// subtree is still entered before the stop takes effect on siblings;
    /// stopping means "stop the traversal", not "skip my children".
    pub fn each_instance_fast<F>(&self, mut f: F)
    where
        F: FnMut(HierIndex, &HierNode) -> bool,
    {
        let mut stack = vec![0u32];
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i as usize];
            if !f(HierIndex(i), node) {
                return;
            }
            for &c in node.children.iter().rev() {
                stack.push(c);
            }
        }
    }

    /// Visits every instance with strictly deeper instances first. This is
    /// the order the level computation relies on: by the time a node is
    /// visited, every walk from below it has already run.
    pub fn each_bottom_up_fast<F>(&self, mut f: F)
    where
        F: FnMut(HierIndex, SubgraphId),
    {
        let mut order: Vec<u32> = (0..self.nodes.len() as u32).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.nodes[i as usize].depth));
        for i in order {
            f(HierIndex(i), self.nodes[i as usize].sub);
        }
    }
}

struct Preorder<'a> {
    tree: &'a HierTree,
    stack: Vec<u32>,
}

impl Iterator for Preorder<'_> {
    type Item = HierIndex;

    fn next(&mut self) -> Option<HierIndex> {
        let i = self.stack.pop()?;
        let node = &self.tree.nodes[i as usize];
        for &c in node.children.iter().rev() {
            self.stack.push(c);
        }
        Some(HierIndex(i))
    }
}
