//! Builds heap snapshot payloads in the V8 JSON layout.
//!
//! Used to construct small, exact graphs for tests without a browser.

use serde_json::json;
use std::collections::HashMap;

const NODE_TYPES: &[&str] = &[
    "hidden",
    "array",
    "string",
    "object",
    "code",
    "closure",
    "regexp",
    "number",
    "native",
    "synthetic",
    "concatenated string",
    "sliced string",
    "symbol",
    "bigint",
];

const EDGE_TYPES: &[&str] = &[
    "context", "element", "property", "internal", "hidden", "shortcut", "weak",
];

const NODE_WIDTH: usize = 6;
const EDGE_WIDTH: usize = 3;

struct PendingEdge {
    kind: usize,
    name_or_index: u64,
    to: usize,
}

pub struct SnapshotBuilder {
    strings: Vec<String>,
    string_ids: HashMap<String, u64>,
    nodes: Vec<(usize, u64, u64)>,
    edges: Vec<Vec<PendingEdge>>,
}

impl SnapshotBuilder {
    pub const ROOT: usize = 0;

    /// A builder holding only the synthetic root.
    pub fn new() -> Self {
        let mut builder = Self {
            strings: Vec::new(),
            string_ids: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        };
        builder.node("synthetic", "", 0);
        builder
    }

    fn intern(&mut self, s: &str) -> u64 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u64;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    /// Add a node and return its index. Unknown kinds fall back to "hidden".
    pub fn node(&mut self, kind: &str, name: &str, self_size: u64) -> usize {
        let kind = NODE_TYPES.iter().position(|k| *k == kind).unwrap_or(0);
        let name = self.intern(name);
        self.nodes.push((kind, name, self_size));
        self.edges.push(Vec::new());
        self.nodes.len() - 1
    }

    pub fn edge(&mut self, from: usize, to: usize, kind: &str, name: &str) {
        let kind_pos = EDGE_TYPES.iter().position(|k| *k == kind).unwrap_or(2);
        let name_or_index = match kind {
            "element" | "hidden" => name.parse().unwrap_or(0),
            _ => self.intern(name),
        };
        self.edges[from].push(PendingEdge {
            kind: kind_pos,
            name_or_index,
            to,
        });
    }

    pub fn property(&mut self, from: usize, to: usize, name: &str) {
        self.edge(from, to, "property", name);
    }

    pub fn element(&mut self, from: usize, to: usize, index: u32) {
        self.edge(from, to, "element", &index.to_string());
    }

    pub fn weak(&mut self, from: usize, to: usize, name: &str) {
        self.edge(from, to, "weak", name);
    }

    /// Serialize to the `.heapsnapshot` JSON text. Node ids are `2 * index + 1`.
    pub fn build(&self) -> String {
        let mut nodes = Vec::with_capacity(self.nodes.len() * NODE_WIDTH);
        let mut edges = Vec::new();
        for (i, (kind, name, size)) in self.nodes.iter().enumerate() {
            let out = &self.edges[i];
            nodes.extend_from_slice(&[
                *kind as u64,
                *name,
                (2 * i + 1) as u64,
                *size,
                out.len() as u64,
                0,
            ]);
            for edge in out {
                edges.extend_from_slice(&[
                    edge.kind as u64,
                    edge.name_or_index,
                    (edge.to * NODE_WIDTH) as u64,
                ]);
            }
        }

        json!({
            "snapshot": {
                "meta": {
                    "node_fields": ["type", "name", "id", "self_size", "edge_count", "trace_node_id"],
                    "node_types": [NODE_TYPES, "string", "number", "number", "number", "number"],
                    "edge_fields": ["type", "name_or_index", "to_node"],
                    "edge_types": [EDGE_TYPES, "string_or_number", "node"],
                },
                "node_count": self.nodes.len(),
                "edge_count": edges.len() / EDGE_WIDTH,
            },
            "nodes": nodes,
            "edges": edges,
            "strings": self.strings,
        })
        .to_string()
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}
