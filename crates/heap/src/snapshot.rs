//! In-memory heap snapshot graph.
//!
//! Parses the V8 `.heapsnapshot` JSON layout: flat `nodes`/`edges` integer
//! arrays described by `snapshot.meta`, plus a string table. Node 0 is the
//! synthetic root; edges are stored grouped by owning node, in node order.

use leakwatch_core::{Error, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::dominators;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeIndex(pub u32);

impl NodeIndex {
    pub const ROOT: NodeIndex = NodeIndex(0);

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl EdgeIndex {
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Context,
    Element,
    Property,
    Internal,
    Hidden,
    Shortcut,
    Weak,
    Other,
}

impl EdgeKind {
    pub fn from_name(s: &str) -> Self {
        match s {
            "context" => Self::Context,
            "element" => Self::Element,
            "property" => Self::Property,
            "internal" => Self::Internal,
            "hidden" => Self::Hidden,
            "shortcut" => Self::Shortcut,
            "weak" => Self::Weak,
            _ => Self::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Element => "element",
            Self::Property => "property",
            Self::Internal => "internal",
            Self::Hidden => "hidden",
            Self::Shortcut => "shortcut",
            Self::Weak => "weak",
            Self::Other => "other",
        }
    }

    /// Weak references do not keep their target alive.
    pub fn is_retaining(&self) -> bool {
        !matches!(self, Self::Weak)
    }

    /// Element and hidden edges carry a numeric index instead of a string id.
    fn is_indexed(&self) -> bool {
        matches!(self, Self::Element | Self::Hidden)
    }
}

#[derive(Debug, Clone, Copy)]
enum EdgeName {
    String(u32),
    Index(u32),
}

#[derive(Debug, Clone)]
struct NodeRecord {
    kind: u32,
    name: u32,
    id: u64,
    self_size: u64,
    first_edge: u32,
    edge_count: u32,
}

#[derive(Debug, Clone)]
struct EdgeRecord {
    kind: EdgeKind,
    name: EdgeName,
    from: u32,
    to: u32,
}

/// Incoming edges, bucketed by target node in edge discovery order.
pub(crate) struct Retainers {
    offsets: Vec<u32>,
    edges: Vec<u32>,
}

/// An owned, immutable heap graph.
pub struct HeapSnapshot {
    node_types: Vec<String>,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
    strings: Vec<String>,
    retainers: OnceCell<Retainers>,
    retained_sizes: OnceCell<Vec<u64>>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    snapshot: RawHeader,
    nodes: Vec<u64>,
    edges: Vec<u64>,
    strings: Vec<String>,
}

#[derive(Deserialize)]
struct RawHeader {
    meta: RawMeta,
    #[serde(default)]
    node_count: Option<usize>,
    #[serde(default)]
    edge_count: Option<usize>,
}

#[derive(Deserialize)]
struct RawMeta {
    node_fields: Vec<String>,
    node_types: Vec<Value>,
    edge_fields: Vec<String>,
    edge_types: Vec<Value>,
}

fn parse_err(msg: impl Into<String>) -> Error {
    Error::SnapshotParse(msg.into())
}

fn field_pos(fields: &[String], name: &str) -> Result<usize> {
    fields
        .iter()
        .position(|f| f == name)
        .ok_or_else(|| parse_err(format!("meta is missing field '{}'", name)))
}

fn type_names(types: &[Value], pos: usize, what: &str) -> Result<Vec<String>> {
    types
        .get(pos)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .ok_or_else(|| parse_err(format!("meta {} type list is not an array", what)))
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| parse_err(format!("{} {} out of range", what, value)))
}

impl HeapSnapshot {
    /// Parse a complete snapshot payload.
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: RawSnapshot = serde_json::from_str(payload)
            .map_err(|e| parse_err(format!("invalid snapshot JSON: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSnapshot) -> Result<Self> {
        let meta = &raw.snapshot.meta;

        let node_width = meta.node_fields.len();
        let n_type = field_pos(&meta.node_fields, "type")?;
        let n_name = field_pos(&meta.node_fields, "name")?;
        let n_id = field_pos(&meta.node_fields, "id")?;
        let n_size = field_pos(&meta.node_fields, "self_size")?;
        let n_edges = field_pos(&meta.node_fields, "edge_count")?;

        let edge_width = meta.edge_fields.len();
        let e_type = field_pos(&meta.edge_fields, "type")?;
        let e_name = field_pos(&meta.edge_fields, "name_or_index")?;
        let e_to = field_pos(&meta.edge_fields, "to_node")?;

        let node_types = type_names(&meta.node_types, n_type, "node")?;
        let edge_kinds: Vec<EdgeKind> = type_names(&meta.edge_types, e_type, "edge")?
            .iter()
            .map(|s| EdgeKind::from_name(s))
            .collect();

        if raw.nodes.is_empty() {
            return Err(parse_err("snapshot has no nodes"));
        }
        if raw.nodes.len() % node_width != 0 {
            return Err(parse_err("nodes array length is not a multiple of node_fields"));
        }
        if raw.edges.len() % edge_width != 0 {
            return Err(parse_err("edges array length is not a multiple of edge_fields"));
        }
        let node_count = raw.nodes.len() / node_width;
        let edge_count = raw.edges.len() / edge_width;
        if let Some(declared) = raw.snapshot.node_count {
            if declared != node_count {
                return Err(parse_err(format!(
                    "declared {} nodes but found {}",
                    declared, node_count
                )));
            }
        }
        if let Some(declared) = raw.snapshot.edge_count {
            if declared != edge_count {
                return Err(parse_err(format!(
                    "declared {} edges but found {}",
                    declared, edge_count
                )));
            }
        }
        let string_count = raw.strings.len() as u64;

        let mut nodes = Vec::with_capacity(node_count);
        let mut next_edge: u64 = 0;
        for fields in raw.nodes.chunks_exact(node_width) {
            let kind = fields[n_type];
            if kind as usize >= node_types.len() {
                return Err(parse_err(format!("unknown node type {}", kind)));
            }
            let name = fields[n_name];
            if name >= string_count {
                return Err(parse_err(format!("node name string {} out of range", name)));
            }
            let edges_here = fields[n_edges];
            nodes.push(NodeRecord {
                kind: to_u32(kind, "node type")?,
                name: to_u32(name, "string index")?,
                id: fields[n_id],
                self_size: fields[n_size],
                first_edge: to_u32(next_edge, "edge index")?,
                edge_count: to_u32(edges_here, "edge count")?,
            });
            next_edge += edges_here;
        }
        if next_edge != edge_count as u64 {
            return Err(parse_err(format!(
                "nodes own {} edges but edges array holds {}",
                next_edge, edge_count
            )));
        }

        let mut edges = Vec::with_capacity(edge_count);
        for (from, node) in nodes.iter().enumerate() {
            let start = node.first_edge as usize;
            for e in start..start + node.edge_count as usize {
                let fields = &raw.edges[e * edge_width..(e + 1) * edge_width];
                let kind = *edge_kinds
                    .get(fields[e_type] as usize)
                    .ok_or_else(|| parse_err(format!("unknown edge type {}", fields[e_type])))?;
                let name = if kind.is_indexed() {
                    EdgeName::Index(to_u32(fields[e_name], "element index")?)
                } else {
                    if fields[e_name] >= string_count {
                        return Err(parse_err(format!(
                            "edge name string {} out of range",
                            fields[e_name]
                        )));
                    }
                    EdgeName::String(to_u32(fields[e_name], "string index")?)
                };
                let to_offset = fields[e_to] as usize;
                if to_offset % node_width != 0 || to_offset / node_width >= node_count {
                    return Err(parse_err(format!("edge points at invalid node offset {}", to_offset)));
                }
                edges.push(EdgeRecord {
                    kind,
                    name,
                    from: from as u32,
                    to: (to_offset / node_width) as u32,
                });
            }
        }

        Ok(Self {
            node_types,
            nodes,
            edges,
            strings: raw.strings,
            retainers: OnceCell::new(),
            retained_sizes: OnceCell::new(),
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn root(&self) -> Node<'_> {
        self.node(NodeIndex::ROOT)
    }

    pub fn node(&self, index: NodeIndex) -> Node<'_> {
        Node {
            snapshot: self,
            index,
        }
    }

    pub fn edge(&self, index: EdgeIndex) -> Edge<'_> {
        Edge {
            snapshot: self,
            index,
        }
    }

    /// All nodes in snapshot order. Restartable: each call starts over.
    pub fn nodes(&self) -> impl Iterator<Item = Node<'_>> + '_ {
        (0..self.nodes.len() as u32).map(move |i| self.node(NodeIndex(i)))
    }

    pub(crate) fn retainers(&self) -> &Retainers {
        self.retainers.get_or_init(|| {
            let mut offsets = vec![0u32; self.nodes.len() + 1];
            for edge in &self.edges {
                offsets[edge.to as usize + 1] += 1;
            }
            for i in 1..offsets.len() {
                offsets[i] += offsets[i - 1];
            }
            let mut cursor = offsets.clone();
            let mut edges = vec![0u32; self.edges.len()];
            for (i, edge) in self.edges.iter().enumerate() {
                let slot = &mut cursor[edge.to as usize];
                edges[*slot as usize] = i as u32;
                *slot += 1;
            }
            Retainers { offsets, edges }
        })
    }

    fn retained_sizes(&self) -> &[u64] {
        self.retained_sizes
            .get_or_init(|| dominators::retained_sizes(self))
    }

    /// Retaining (non-weak) edges as `(from, to)` pairs, in edge order.
    pub(crate) fn retaining_edges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.edges
            .iter()
            .filter(|e| e.kind.is_retaining())
            .map(|e| (e.from, e.to))
    }

    pub(crate) fn self_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.iter().map(|n| n.self_size)
    }
}

impl fmt::Debug for HeapSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapSnapshot")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("strings", &self.strings.len())
            .finish()
    }
}

/// A node borrowed from its snapshot.
#[derive(Clone, Copy)]
pub struct Node<'s> {
    snapshot: &'s HeapSnapshot,
    index: NodeIndex,
}

impl<'s> Node<'s> {
    fn record(&self) -> &'s NodeRecord {
        &self.snapshot.nodes[self.index.get()]
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Heap object id, stable across snapshots of the same page.
    pub fn id(&self) -> u64 {
        self.record().id
    }

    /// Semantic type tag: "object", "closure", "native", ...
    pub fn kind(&self) -> &'s str {
        &self.snapshot.node_types[self.record().kind as usize]
    }

    pub fn name(&self) -> &'s str {
        &self.snapshot.strings[self.record().name as usize]
    }

    pub fn self_size(&self) -> u64 {
        self.record().self_size
    }

    /// Size freed if this node were collected. Computed for the whole
    /// snapshot on first use.
    pub fn retained_size(&self) -> u64 {
        self.snapshot.retained_sizes()[self.index.get()]
    }

    pub fn is_root(&self) -> bool {
        self.index == NodeIndex::ROOT
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge<'s>> + 's {
        let snapshot = self.snapshot;
        let record = self.record();
        let start = record.first_edge;
        (start..start + record.edge_count).map(move |i| snapshot.edge(EdgeIndex(i)))
    }

    /// Incoming edges, weak ones included, in discovery order.
    pub fn retainers(&self) -> impl Iterator<Item = Edge<'s>> + 's {
        let snapshot = self.snapshot;
        let retainers = snapshot.retainers();
        let i = self.index.get();
        let range = retainers.offsets[i] as usize..retainers.offsets[i + 1] as usize;
        retainers.edges[range]
            .iter()
            .map(move |&e| snapshot.edge(EdgeIndex(e)))
    }
}

impl fmt::Display for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name.is_empty() {
            write!(f, "({}) @{}", self.kind(), self.id())
        } else {
            write!(f, "{} @{}", name, self.id())
        }
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("index", &self.index.0)
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// An edge borrowed from its snapshot.
#[derive(Clone, Copy)]
pub struct Edge<'s> {
    snapshot: &'s HeapSnapshot,
    index: EdgeIndex,
}

impl<'s> Edge<'s> {
    fn record(&self) -> &'s EdgeRecord {
        &self.snapshot.edges[self.index.get()]
    }

    pub fn index(&self) -> EdgeIndex {
        self.index
    }

    pub fn kind(&self) -> EdgeKind {
        self.record().kind
    }

    pub fn from(&self) -> Node<'s> {
        self.snapshot.node(NodeIndex(self.record().from))
    }

    pub fn to(&self) -> Node<'s> {
        self.snapshot.node(NodeIndex(self.record().to))
    }

    /// Property name, or the element index rendered as `[n]`.
    pub fn label(&self) -> String {
        match self.record().name {
            EdgeName::String(s) => self.snapshot.strings[s as usize].clone(),
            EdgeName::Index(i) => format!("[{}]", i),
        }
    }
}

impl fmt::Debug for Edge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("kind", &self.kind())
            .field("label", &self.label())
            .field("from", &self.record().from)
            .field("to", &self.record().to)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SnapshotBuilder;

    fn sample() -> HeapSnapshot {
        let mut b = SnapshotBuilder::new();
        let gc_roots = b.node("synthetic", "(GC roots)", 0);
        let window = b.node("object", "Window", 64);
        let list = b.node("array", "", 16);
        let container = b.node("object", "Container", 32);
        b.element(SnapshotBuilder::ROOT, gc_roots, 1);
        b.property(gc_roots, window, "global");
        b.property(window, list, "items");
        b.element(list, container, 0);
        b.weak(window, container, "cache");
        HeapSnapshot::parse(&b.build()).unwrap()
    }

    #[test]
    fn test_parse_nodes_and_edges() {
        let snap = sample();
        assert_eq!(snap.node_count(), 5);
        assert_eq!(snap.edge_count(), 5);

        let window = snap.node(NodeIndex(2));
        assert_eq!(window.kind(), "object");
        assert_eq!(window.name(), "Window");
        assert_eq!(window.self_size(), 64);

        let labels: Vec<String> = window.edges().map(|e| e.label()).collect();
        assert_eq!(labels, vec!["items".to_string(), "cache".to_string()]);
        assert_eq!(window.edges().nth(1).unwrap().kind(), EdgeKind::Weak);
    }

    #[test]
    fn test_element_edges_render_index() {
        let snap = sample();
        let list = snap.node(NodeIndex(3));
        let edge = list.edges().next().unwrap();
        assert_eq!(edge.label(), "[0]");
        assert_eq!(edge.to().name(), "Container");
    }

    #[test]
    fn test_retainers_in_discovery_order() {
        let snap = sample();
        let container = snap.node(NodeIndex(4));
        let from: Vec<&str> = container.retainers().map(|e| e.from().name()).collect();
        assert_eq!(from, vec!["Window", ""]);
        // Order matches edge order: the array's element edge comes after Window's edges.
        let kinds: Vec<EdgeKind> = container.retainers().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EdgeKind::Weak, EdgeKind::Element]);
    }

    #[test]
    fn test_display_uses_kind_for_unnamed_nodes() {
        let snap = sample();
        assert_eq!(snap.node(NodeIndex(3)).to_string(), "(array) @7");
        assert_eq!(snap.node(NodeIndex(4)).to_string(), "Container @9");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            HeapSnapshot::parse("{\"snapshot\":"),
            Err(Error::SnapshotParse(_))
        ));
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let payload = r#"{
            "snapshot": {
                "meta": {
                    "node_fields": ["type","name","id","self_size","edge_count"],
                    "node_types": [["synthetic","object"],"string","number","number","number"],
                    "edge_fields": ["type","name_or_index","to_node"],
                    "edge_types": [["property","weak"],"string_or_number","node"]
                },
                "node_count": 1,
                "edge_count": 1
            },
            "nodes": [0,0,1,0,1],
            "edges": [0,0,5],
            "strings": [""]
        }"#;
        let err = HeapSnapshot::parse(payload).unwrap_err();
        assert!(matches!(err, Error::SnapshotParse(msg) if msg.contains("invalid node offset")));
    }

    #[test]
    fn test_rejects_edge_count_mismatch() {
        let payload = r#"{
            "snapshot": {
                "meta": {
                    "node_fields": ["type","name","id","self_size","edge_count"],
                    "node_types": [["synthetic"],"string","number","number","number"],
                    "edge_fields": ["type","name_or_index","to_node"],
                    "edge_types": [["property"],"string_or_number","node"]
                }
            },
            "nodes": [0,0,1,0,2],
            "edges": [0,0,0],
            "strings": [""]
        }"#;
        assert!(matches!(
            HeapSnapshot::parse(payload),
            Err(Error::SnapshotParse(_))
        ));
    }

    #[test]
    fn test_rejects_empty_nodes() {
        let payload = r#"{
            "snapshot": { "meta": {
                "node_fields": ["type","name","id","self_size","edge_count"],
                "node_types": [["synthetic"]],
                "edge_fields": ["type","name_or_index","to_node"],
                "edge_types": [["property"]]
            } },
            "nodes": [], "edges": [], "strings": []
        }"#;
        assert!(HeapSnapshot::parse(payload).is_err());
    }
}
