//! Retained sizes from the dominator tree over retaining edges.

use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::snapshot::HeapSnapshot;

/// Retained size for every node, indexed like the snapshot's nodes.
/// Nodes unreachable from the root retain only themselves.
pub(crate) fn retained_sizes(snapshot: &HeapSnapshot) -> Vec<u64> {
    let n = snapshot.node_count();
    let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(n, snapshot.edge_count());
    for _ in 0..n {
        graph.add_node(());
    }
    for (from, to) in snapshot.retaining_edges() {
        graph.add_edge(NodeIndex::new(from as usize), NodeIndex::new(to as usize), ());
    }

    let doms = dominators::simple_fast(&graph, NodeIndex::new(0));

    let mut children: Vec<Vec<u32>> = vec![Vec::new(); n];
    for i in 1..n {
        if let Some(idom) = doms.immediate_dominator(NodeIndex::new(i)) {
            children[idom.index()].push(i as u32);
        }
    }

    let mut sizes: Vec<u64> = snapshot.self_sizes().collect();

    // Post-order over the dominator tree without recursion.
    let mut stack: Vec<(u32, bool)> = vec![(0, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            let total: u64 = children[node as usize]
                .iter()
                .map(|&c| sizes[c as usize])
                .sum();
            sizes[node as usize] += total;
        } else {
            stack.push((node, true));
            for &child in &children[node as usize] {
                stack.push((child, false));
            }
        }
    }
    sizes
}
