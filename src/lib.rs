//! # LGDB - Persistent Hierarchical Graph Database
//!
//! LGDB is the storage and traversal core of a hardware-description
//! compiler: circuit designs are hierarchical graphs, and transformation
//! passes walk them bottom-up, in parallel, across process invocations.
//! Everything rests on one data structure: a Robin Hood hash table whose
//! slot array lives directly in a file-backed memory mapping.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │   Passes (external, callback-driven)   │
//! ├───────────────────────────────────────┤
//! │   sched: bottom-up rounds + pool       │
//! ├───────────────────────────────────────┤
//! │   graph: subgraphs, instances, tree    │
//! ├───────────────────────────────────────┤
//! │   map: persistent Robin Hood tables    │
//! │        + string interning arena        │
//! ├───────────────────────────────────────┤
//! │   storage: region registry + GC        │
//! └───────────────────────────────────────┘
//! ```
//!
//! - [`storage`]: every mapping in the process is owned by the GC registry,
//!   which can reclaim idle regions through per-owner callbacks.
//! - [`map`]: `PersistentMap<K, V>` with fixed-size bit-copyable records;
//!   get/set/erase/iterate, lazy reload, info-byte probe rejection, and
//!   growth that prefers reclaiming an encoding bit over reallocating.
//! - [`graph`]: `GraphLib` opens subgraphs by id and shares them across
//!   instance sites; `HierTree` expands the containment hierarchy.
//! - [`sched`]: computes dependency levels over the instance tree and runs
//!   pass callbacks children-first in barrier-synchronized rounds.
//!
//! ## Durability model
//!
//! A map is its file: no write-ahead log, no serialization step, no cache
//! between the table and the kernel. Reopening a library directory in a
//! new process observes every entry in the same slot it occupied before,
//! which also makes iteration order stable across restarts.
//!
//! ## Concurrency model
//!
//! Individual maps are single-writer; the scheduler guarantees that one
//! round never touches the same subgraph from two workers. The only
//! cross-thread machinery inside a map is the in-use flag that fences the
//! GC registry's reclamation callback.
//!
//! ## Quick start
//!
//! ```ignore
//! use lgdb::{GraphLib, NodeId, SubgraphId, WorkerPool};
//!
//! let lib = GraphLib::open("./design")?;
//! let top = lib.open_subgraph(SubgraphId(1))?;
//! let name = lib.names().intern("alu");
//! top.add_node(NodeId(1), /*op=*/ 3, /*bits=*/ 32, name);
//!
//! let pool = WorkerPool::new(0);
//! lgdb::sched::run_bottom_up(&lib, SubgraphId(1), &pool, |sg| {
//!     // children of sg have already been visited
//!     Ok(())
//! })?;
//! ```

pub mod graph;
pub mod map;
pub mod sched;
pub mod storage;

pub use graph::{
    EdgeKey, EdgeRecord, GraphLib, HierIndex, HierNode, HierTree, NodeId, NodeRecord, Subgraph,
    SubgraphId,
};
pub use map::{FixedRecord, MapHash, MapIter, MapKey, PersistentMap, StrArena, StrId};
pub use sched::{run_bottom_up, schedule_levels, WorkerPool};
pub use storage::{GcRegistry, Reclaim};
