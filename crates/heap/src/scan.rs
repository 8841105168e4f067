//! Leak scanning: find watched nodes and explain why they are still alive.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use leakwatch_core::ScanConfig;

use crate::snapshot::{EdgeIndex, HeapSnapshot, Node, NodeIndex};

/// Decides whether a node is evidence of a leak.
pub trait NodePredicate {
    fn matches(&self, node: &Node<'_>) -> bool;
}

impl<F> NodePredicate for F
where
    F: Fn(&Node<'_>) -> bool,
{
    fn matches(&self, node: &Node<'_>) -> bool {
        self(node)
    }
}

/// Matches nodes of one snapshot type whose name is one of the watched names.
#[derive(Debug, Clone)]
pub struct WatchedType {
    node_type: String,
    names: Vec<String>,
}

impl WatchedType {
    pub fn new(node_type: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            node_type: node_type.into(),
            names,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        let names = config
            .watched_types
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .collect();
        Self::new(config.node_type.trim(), names)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl NodePredicate for WatchedType {
    fn matches(&self, node: &Node<'_>) -> bool {
        node.kind() == self.node_type && self.names.iter().any(|n| n == node.name())
    }
}

/// One hop of a retaining path: `retainer` holds the previous node through `edge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub retainer: NodeIndex,
    pub edge: EdgeIndex,
}

/// References from a node out to the root. `links[0]` retains the node
/// itself; the last link's retainer is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainingPath {
    pub target: NodeIndex,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retention {
    Path(RetainingPath),
    /// No retaining chain reaches the root. Usually a snapshot artifact
    /// (garbage the collector left behind), so it is reported, not raised.
    Unreachable,
}

impl Retention {
    pub fn path(&self) -> Option<&RetainingPath> {
        match self {
            Retention::Path(p) => Some(p),
            Retention::Unreachable => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeakFinding<'s> {
    pub node: Node<'s>,
    pub retention: Retention,
}

/// Shortest retaining path from `target` to the root, breadth-first over
/// incoming non-weak edges. Ties go to the retainer discovered first.
pub fn retaining_path(snapshot: &HeapSnapshot, target: NodeIndex) -> Retention {
    if target == NodeIndex::ROOT {
        return Retention::Path(RetainingPath {
            target,
            links: Vec::new(),
        });
    }

    // came_from[u] = edge u -> v, where v is one step closer to the target.
    let mut came_from: HashMap<NodeIndex, EdgeIndex> = HashMap::new();
    let mut queue = VecDeque::from([target]);

    while let Some(current) = queue.pop_front() {
        for edge in snapshot.node(current).retainers() {
            if !edge.kind().is_retaining() {
                continue;
            }
            let retainer = edge.from().index();
            if retainer == target || came_from.contains_key(&retainer) {
                continue;
            }
            came_from.insert(retainer, edge.index());
            if retainer == NodeIndex::ROOT {
                return Retention::Path(unwind(snapshot, target, &came_from));
            }
            queue.push_back(retainer);
        }
    }
    Retention::Unreachable
}

fn unwind(
    snapshot: &HeapSnapshot,
    target: NodeIndex,
    came_from: &HashMap<NodeIndex, EdgeIndex>,
) -> RetainingPath {
    let mut links = Vec::new();
    let mut current = NodeIndex::ROOT;
    while current != target {
        let edge = came_from[&current];
        links.push(Link {
            retainer: current,
            edge,
        });
        current = snapshot.edge(edge).to().index();
    }
    links.reverse();
    RetainingPath { target, links }
}

impl RetainingPath {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Root-first rendering, e.g. `(synthetic) @1 -[global]-> Window @3 -[c]-> Container @5`.
    /// With `max_links > 0`, only the links nearest the target are shown.
    pub fn render(&self, snapshot: &HeapSnapshot, max_links: usize) -> String {
        let shown = if max_links > 0 && self.links.len() > max_links {
            &self.links[..max_links]
        } else {
            &self.links[..]
        };
        let mut out = String::new();
        if shown.len() < self.links.len() {
            out.push_str("... ");
        }
        for (i, link) in shown.iter().rev().enumerate() {
            if i == 0 {
                out.push_str(&snapshot.node(link.retainer).to_string());
            }
            out.push_str(&format!(" -[{}]-> ", snapshot.edge(link.edge).label()));
            out.push_str(&snapshot.edge(link.edge).to().to_string());
        }
        if shown.is_empty() {
            out.push_str(&snapshot.node(self.target).to_string());
        }
        out
    }
}

/// Lazily yields a finding for every node matching the predicate.
pub struct Findings<'s, 'p, P: ?Sized> {
    snapshot: &'s HeapSnapshot,
    predicate: &'p P,
    next: u32,
}

impl<'s, 'p, P: NodePredicate + ?Sized> Iterator for Findings<'s, 'p, P> {
    type Item = LeakFinding<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        while (self.next as usize) < self.snapshot.node_count() {
            let node = self.snapshot.node(NodeIndex(self.next));
            self.next += 1;
            if self.predicate.matches(&node) {
                return Some(LeakFinding {
                    node,
                    retention: retaining_path(self.snapshot, node.index()),
                });
            }
        }
        None
    }
}

pub struct LeakScanner<P> {
    predicate: P,
}

impl<P: NodePredicate> LeakScanner<P> {
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }

    pub fn predicate(&self) -> &P {
        &self.predicate
    }

    /// Read-only pass over the snapshot; calling it again restarts from the
    /// first node and yields the same findings.
    pub fn scan<'s, 'p>(&'p self, snapshot: &'s HeapSnapshot) -> Findings<'s, 'p, P> {
        Findings {
            snapshot,
            predicate: &self.predicate,
            next: 0,
        }
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retention::Path(p) => write!(f, "path of {} link(s)", p.len()),
            Retention::Unreachable => write!(f, "no path to root"),
        }
    }
}
