use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet, BTreeSet};
use crate::core::error::{Result, TuneError};
use crate::core::instruction::{Instruction, InstructionKind, StateSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Read after write.
    True,
    /// Write after read.
    Anti,
    /// Write after write.
    Output,
    /// Memory operations that static analysis cannot prove disjoint.
    Alias,
    /// Program order pinned by control flow or synchronization.
    Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: usize,
    pub latency: u32,
    pub kind: InstructionKind,
    pub predecessors: Vec<usize>,
    pub successors: Vec<usize>,
    pub earliest_start: u32,
    pub latest_start: u32,
}

/// Instruction dependency DAG. Nodes live in an arena indexed by their position in
/// the source instruction stream.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    edge_set: HashSet<(usize, usize)>,
    horizon: u32,
}

impl DependencyGraph {
    fn with_nodes(latencies: impl Iterator<Item = (u32, InstructionKind)>) -> Self {
        let nodes = latencies.enumerate().map(|(id, (latency, kind))| Node {
            id,
            latency,
            kind,
            predecessors: Vec::new(),
            successors: Vec::new(),
            earliest_start: 0,
            latest_start: 0,
        }).collect();
        Self { nodes, ..Default::default() }
    }

    /// Raw graph from explicit edges. Used for analysis of externally built graphs and
    /// does not check acyclicity; `compute_timing` does.
    pub fn from_edges(latencies: &[u32], edges: &[(usize, usize)]) -> Self {
        let mut graph = Self::with_nodes(latencies.iter().map(|&l| (l, InstructionKind::Arithmetic)));
        for &(from, to) in edges {
            graph.add_edge(from, to, DependencyKind::True);
        }
        graph
    }

    pub fn build(instructions: &[Instruction]) -> Self {
        let mut graph = Self::with_nodes(instructions.iter().map(|i| (i.latency, i.kind)));

        let mut last_writer: HashMap<&str, usize> = HashMap::new();
        let mut readers: HashMap<&str, Vec<usize>> = HashMap::new();
        // Writer of the address base register seen by each memory instruction.
        let mut base_version: Vec<Option<usize>> = vec![None; instructions.len()];
        let mut memory_ops: Vec<usize> = Vec::new();
        let mut last_barrier: Option<usize> = None;

        for (i, inst) in instructions.iter().enumerate() {
            let uses = inst.uses();
            let defs = inst.defs();

            for reg in &uses {
                if let Some(&w) = last_writer.get(reg) {
                    graph.add_edge(w, i, DependencyKind::True);
                }
            }
            for reg in &defs {
                if let Some(&w) = last_writer.get(reg) {
                    graph.add_edge(w, i, DependencyKind::Output);
                }
                if let Some(rs) = readers.get(reg) {
                    for &r in rs.iter().filter(|&&r| r != i) {
                        graph.add_edge(r, i, DependencyKind::Anti);
                    }
                }
            }

            if inst.touches_memory() {
                if let Some(mem) = inst.memory_operand() {
                    base_version[i] = last_writer.get(mem.base.as_str()).copied();
                }
                for &j in &memory_ops {
                    let prev = &instructions[j];
                    if (prev.is_store() || inst.is_store())
                        && may_alias(prev, base_version[j], inst, base_version[i])
                    {
                        graph.add_edge(j, i, DependencyKind::Alias);
                    }
                }
                memory_ops.push(i);
            }

            if matches!(inst.kind, InstructionKind::Control | InstructionKind::Sync) {
                let from = last_barrier.map(|b| b + 1).unwrap_or(0);
                for j in from..i {
                    graph.add_edge(j, i, DependencyKind::Order);
                }
                if let Some(b) = last_barrier {
                    graph.add_edge(b, i, DependencyKind::Order);
                }
                last_barrier = Some(i);
            } else if let Some(b) = last_barrier {
                graph.add_edge(b, i, DependencyKind::Order);
            }

            for reg in &uses {
                if !defs.contains(reg) {
                    readers.entry(reg).or_default().push(i);
                }
            }
            for reg in defs {
                readers.remove(reg);
                last_writer.insert(reg, i);
            }
        }
        graph
    }

    /// Adds `from -> to` unless it is a self-edge or already present. Returns whether
    /// the edge was inserted.
    pub fn add_edge(&mut self, from: usize, to: usize, kind: DependencyKind) -> bool {
        if from == to || !self.edge_set.insert((from, to)) {
            return false;
        }
        self.nodes[from].successors.push(to);
        self.nodes[to].predecessors.push(from);
        self.edges.push(Edge { from, to, kind });
        true
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.edge_set.contains(&(from, to))
    }

    /// Kahn's algorithm, lowest index first among ready nodes.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.predecessors.len()).collect();
        let mut ready: BTreeSet<usize> = indegree.iter().enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(n) = ready.pop_first() {
            order.push(n);
            for &s in &self.nodes[n].successors {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.insert(s);
                }
            }
        }
        if order.len() < self.nodes.len() {
            let node = indegree.iter().position(|&d| d > 0).unwrap_or(0);
            return Err(TuneError::CyclicDependency { node });
        }
        Ok(order)
    }

    /// Forward and backward passes. Returns the horizon: the critical-path length and
    /// the unscheduled lower bound on execution time.
    pub fn compute_timing(&mut self) -> Result<u32> {
        let order = self.topological_order()?;

        for &n in &order {
            let es = self.nodes[n].predecessors.iter()
                .map(|&p| self.nodes[p].earliest_start + self.nodes[p].latency)
                .max()
                .unwrap_or(0);
            self.nodes[n].earliest_start = es;
        }

        let horizon = self.nodes.iter()
            .map(|n| n.earliest_start + n.latency)
            .max()
            .unwrap_or(0);

        for &n in order.iter().rev() {
            let latency = self.nodes[n].latency;
            let anchor = self.nodes[n].successors.iter()
                .map(|&s| self.nodes[s].latest_start)
                .min()
                .unwrap_or(horizon);
            self.nodes[n].latest_start = anchor.saturating_sub(latency);
        }

        self.horizon = horizon;
        Ok(horizon)
    }

    pub fn horizon(&self) -> u32 {
        self.horizon
    }

    pub fn slack(&self, n: usize) -> u32 {
        let node = &self.nodes[n];
        node.latest_start - node.earliest_start
    }

    /// Every zero-slack node.
    pub fn critical_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&n| self.slack(n) == 0).collect()
    }

    /// One longest chain through zero-slack nodes; its latencies sum to the horizon.
    pub fn critical_path(&self) -> Vec<usize> {
        let mut path = Vec::new();
        let start = (0..self.nodes.len()).find(|&n| {
            self.slack(n) == 0 && self.nodes[n].earliest_start == 0
        });
        let Some(mut current) = start else { return path };
        loop {
            path.push(current);
            let node = &self.nodes[current];
            let finish = node.earliest_start + node.latency;
            let next = node.successors.iter().copied()
                .filter(|&s| self.slack(s) == 0 && self.nodes[s].earliest_start == finish)
                .min();
            match next {
                Some(s) => current = s,
                None => break,
            }
        }
        path
    }
}

fn may_alias(a: &Instruction, a_version: Option<usize>, b: &Instruction, b_version: Option<usize>) -> bool {
    let (sa, sb) = (a.state_space(), b.state_space());
    if let (Some(sa), Some(sb)) = (sa, sb) {
        if sa != sb && sa != StateSpace::Generic && sb != StateSpace::Generic {
            return false;
        }
    }
    match (a.memory_operand(), b.memory_operand()) {
        (Some(ma), Some(mb)) if ma.base == mb.base && a_version == b_version => {
            let (wa, wb) = (a.element_bytes() as i64, b.element_bytes() as i64);
            ma.offset < mb.offset + wb && mb.offset < ma.offset + wa
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instruction::Kernel;
    use proptest::prelude::*;

    fn body(src: &str) -> Vec<Instruction> {
        Kernel::parse(src).unwrap().body
    }

    #[test]
    fn test_true_dependency_edges() {
        let insts = body("ld.global.f32 %f1, [%rd1];\nadd.f32 %f2, %f1, %f1;\nmul.f32 %f3, %f4, %f4;");
        let graph = DependencyGraph::build(&insts);
        assert!(graph.has_edge(0, 1));
        assert!(!graph.has_edge(0, 2));
        assert!(!graph.has_edge(1, 2));
    }

    #[test]
    fn test_alias_disproved_by_offsets() {
        let insts = body(
            "st.global.f32 [%rd1], %f1;\nld.global.f32 %f2, [%rd1+4];\nld.global.f32 %f3, [%rd1];\nld.shared.f32 %f4, [%rd1];",
        );
        let graph = DependencyGraph::build(&insts);
        assert!(!graph.has_edge(0, 1), "disjoint offsets on the same base never alias");
        assert_eq!(graph.edges.iter().find(|e| e.from == 0 && e.to == 2).map(|e| e.kind), Some(DependencyKind::Alias));
        assert!(!graph.has_edge(0, 3), "different state spaces never alias");
    }

    #[test]
    fn test_alias_conservative_after_base_redefinition() {
        let insts = body("st.global.f32 [%rd1], %f1;\nadd.s64 %rd1, %rd1, 4;\nld.global.f32 %f2, [%rd1+4];");
        let graph = DependencyGraph::build(&insts);
        assert!(graph.has_edge(0, 2));
    }

    #[test]
    fn test_barrier_orders_everything() {
        let insts = body("add.f32 %f1, %f2, %f3;\nbar.sync 0;\nmul.f32 %f4, %f5, %f6;");
        let graph = DependencyGraph::build(&insts);
        assert!(graph.has_edge(0, 1));
        assert!(graph.has_edge(1, 2));
    }

    #[test]
    fn test_timing_on_diamond() {
        // 0 -> 1 -> 3, 0 -> 2 -> 3
        let mut graph = DependencyGraph::from_edges(&[2, 10, 3, 1], &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let horizon = graph.compute_timing().unwrap();
        assert_eq!(horizon, 13);
        assert_eq!(graph.nodes[3].earliest_start, 12);
        assert_eq!(graph.slack(2), 7);
        assert_eq!(graph.critical_path(), vec![0, 1, 3]);
        assert_eq!(graph.critical_nodes(), vec![0, 1, 3]);
    }

    #[test]
    fn test_self_edges_are_never_recorded() {
        let mut graph = DependencyGraph::from_edges(&[3, 5], &[(0, 1)]);
        for kind in [DependencyKind::True, DependencyKind::Anti, DependencyKind::Order] {
            assert!(!graph.add_edge(1, 1, kind));
        }
        assert!(!graph.add_edge(0, 1, DependencyKind::Alias));
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.nodes[1].predecessors, vec![0]);
        assert_eq!(graph.compute_timing().unwrap(), 8);

        // an instruction reading its own destination depends only on the earlier writer
        let insts = body("mov.u32 %r1, 1;\nadd.u32 %r1, %r1, 1;");
        let graph = DependencyGraph::build(&insts);
        assert!(!graph.has_edge(1, 1));
        assert!(graph.has_edge(0, 1));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = DependencyGraph::from_edges(&[1, 1, 1], &[(0, 1), (1, 2), (2, 1)]);
        assert!(matches!(graph.compute_timing(), Err(TuneError::CyclicDependency { .. })));
    }

    fn arb_dag() -> impl Strategy<Value = (Vec<u32>, Vec<(usize, usize)>)> {
        (1usize..24).prop_flat_map(|n| {
            let lats = proptest::collection::vec(0u32..20, n);
            let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2))
                .prop_map(|pairs| {
                    pairs.into_iter()
                        .filter(|(a, b)| a != b)
                        .map(|(a, b)| if a < b { (a, b) } else { (b, a) })
                        .collect::<Vec<_>>()
                });
            (lats, edges)
        })
    }

    proptest! {
        #[test]
        fn prop_earliest_never_exceeds_latest((lats, edges) in arb_dag()) {
            let mut graph = DependencyGraph::from_edges(&lats, &edges);
            let horizon = graph.compute_timing().unwrap();
            for node in &graph.nodes {
                prop_assert!(node.earliest_start <= node.latest_start);
                prop_assert!(node.latest_start + node.latency <= horizon);
            }
            let chain: u32 = graph.critical_path().iter().map(|&n| graph.nodes[n].latency).sum();
            prop_assert_eq!(chain, horizon);
        }
    }
}
