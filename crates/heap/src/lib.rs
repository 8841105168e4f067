//! Heap snapshot graph and leak scanning.

/// Snapshot fixtures for tests in this and downstream crates.
#[cfg(any(test, feature = "test-support"))]
pub mod builder;
mod dominators;
pub mod scan;
pub mod snapshot;

pub use scan::{
    retaining_path, LeakFinding, LeakScanner, Link, NodePredicate, RetainingPath, Retention,
    WatchedType,
};
pub use snapshot::{Edge, EdgeIndex, EdgeKind, HeapSnapshot, Node, NodeIndex};
