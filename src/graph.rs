/*!
# Particle lineage graph

An optional recorder of the ancestry relation between generations: one vertex
per `(generation, slot)` pair, one edge from each particle to its parent slot
in the previous generation. When an iteration does not resample, the parent
mapping is the identity; when it does, the parents are the resampler's
flattened indices.

The graph is only ever appended to. Rolling an iteration back with
`iterate_back` does not remove vertices or edges; the recorded lineage keeps
the undone generation.
*/

use std::collections::HashMap;
use std::io;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

/// Ancestry of the particle system across generations.
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    graph: DiGraph<(usize, usize), ()>,
    index: HashMap<(usize, usize), NodeIndex>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, vertex: (usize, usize)) -> NodeIndex {
        match self.index.get(&vertex) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(vertex);
                self.index.insert(vertex, idx);
                idx
            }
        }
    }

    /// Records the ancestry of the generation being produced at evolution
    /// time `time` (called before the time index advances).
    ///
    /// At time 0 the generation-1 vertices are seeded without edges. Later,
    /// each new slot `i` is linked to `(time, parents[i])`, or to
    /// `(time, i)` when no resampling occurred.
    pub(crate) fn record_generation(&mut self, time: usize, parents: Option<&[usize]>, n: usize) {
        if time == 0 {
            for slot in 0..n {
                self.intern((1, slot));
            }
        } else {
            for slot in 0..n {
                let parent = (time, parents.map_or(slot, |p| p[slot]));
                let u = self.intern(parent);
                let v = self.intern((time + 1, slot));
                self.graph.add_edge(u, v, ());
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the parent slots of `(generation, slot)`, empty for roots.
    pub fn parents(&self, generation: usize, slot: usize) -> Vec<(usize, usize)> {
        match self.index.get(&(generation, slot)) {
            Some(&idx) => self
                .graph
                .edges_directed(idx, petgraph::Direction::Incoming)
                .map(|e| self.graph[e.source()])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Streams the lineage in Graphviz dot form.
    pub fn write_dot<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "digraph lineage {{")?;
        for idx in self.graph.node_indices() {
            let (generation, slot) = self.graph[idx];
            writeln!(
                writer,
                "    {} [label=\"{},{}\"];",
                idx.index(),
                generation,
                slot
            )?;
        }
        for edge in self.graph.edge_references() {
            writeln!(
                writer,
                "    {} -> {};",
                edge.source().index(),
                edge.target().index()
            )?;
        }
        writeln!(writer, "}}")
    }
}
