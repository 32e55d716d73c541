//! Dependency-graph instruction scheduling.
//!
//! The scheduler reorders a kernel body inside its basic blocks (control and sync
//! instructions are pinned by ordering edges), optionally software-pipelines a single
//! loop by unrolling it with renamed iteration-local registers, and backs off when the
//! result needs more registers than allowed. Short forward branches are if-converted
//! into predicated instructions on targets that support it.

use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};
use crate::core::error::{Result, TuneError};
use crate::core::graph::DependencyGraph;
use crate::core::instruction::{induction_registers, Instruction, InstructionKind, Kernel, LoopRegion, StateSpace};
use crate::optimizer::HardwareProfile;

const MAX_ADJUSTMENT_PASSES: usize = 4;
/// Longest branch-over sequence turned into predicated instructions.
const IF_CONVERSION_LIMIT: usize = 4;
/// Iteration distances checked when proving a loop free of far memory hazards.
const HAZARD_SCAN_DISTANCE: i64 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ILPConfig {
    /// Maximum number of slots an instruction may move away from its original position.
    pub max_instruction_distance: usize,
    /// Unrolled loops run whole groups of `unroll_factor` iterations without a
    /// remainder loop, so pipelining is only applied when this is set.
    pub allow_speculative_execution: bool,
    pub unroll_factor: usize,
    pub enable_dual_issue: bool,
}

impl Default for ILPConfig {
    fn default() -> Self {
        Self {
            max_instruction_distance: 16,
            allow_speculative_execution: false,
            unroll_factor: 1,
            enable_dual_issue: true,
        }
    }
}

/// What the target's issue logic can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureConstraints {
    /// Instructions the warp scheduler can look ahead; bounds reordering distance.
    pub instruction_buffer_size: usize,
    pub supports_predication: bool,
    pub supports_dual_issue: bool,
}

impl ArchitectureConstraints {
    /// NVIDIA parts issue two instructions per cycle up to Pascal and keep a deeper
    /// buffer from Volta on. AMD targets execute under an exec mask rather than PTX
    /// guard predicates; RDNA3 (`gfx11`) pairs VALU instructions.
    pub fn for_hardware(hw: &HardwareProfile) -> Self {
        let arch = hw.arch.as_str();
        if let Some(sm) = arch.strip_prefix("sm_").and_then(|v| v.parse::<u32>().ok()) {
            return Self {
                instruction_buffer_size: if sm >= 70 { 32 } else { 16 },
                supports_predication: true,
                supports_dual_issue: sm < 70,
            };
        }
        Self {
            instruction_buffer_size: 16,
            supports_predication: false,
            supports_dual_issue: arch.starts_with("gfx11"),
        }
    }
}

impl Default for ArchitectureConstraints {
    fn default() -> Self {
        Self { instruction_buffer_size: usize::MAX, supports_predication: true, supports_dual_issue: true }
    }
}

/// Least slack first, ties broken by lower original index.
fn critical_first(graph: &DependencyGraph, candidates: &[usize]) -> Option<usize> {
    candidates.iter().copied().min_by_key(|&n| (graph.slack(n), n))
}

fn pinned(kind: InstructionKind) -> bool {
    matches!(kind, InstructionKind::Control | InstructionKind::Sync)
}

/// Two instructions of different issue classes may share a cycle.
fn pairable(a: InstructionKind, b: InstructionKind) -> bool {
    a != b && !pinned(a) && !pinned(b)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPressure {
    pub max_live_registers: usize,
    /// Live register count at each instruction.
    pub pressure_points: Vec<usize>,
    pub spill_candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterAllocation {
    pub register_mapping: BTreeMap<String, usize>,
    pub total_registers_used: usize,
    /// More values are simultaneously live than the register budget allows.
    pub spill_needed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingResult {
    pub optimized_source: String,
    pub kernel: Kernel,
    /// Estimated issue length before scheduling divided by the length after.
    pub estimated_speedup: f64,
    pub optimization_steps: Vec<String>,
    pub register_allocation: RegisterAllocation,
    pub critical_path_length: u32,
}

#[derive(Debug, Clone)]
pub struct InstructionScheduler {
    pub ilp: ILPConfig,
    pub arch: ArchitectureConstraints,
    pub max_registers: usize,
}

struct Attempt {
    kernel: Kernel,
    multiplicity: u32,
    critical_path_length: u32,
    steps: Vec<String>,
}

impl InstructionScheduler {
    pub fn new(ilp: ILPConfig, max_registers: usize) -> Self {
        Self { ilp, arch: ArchitectureConstraints::default(), max_registers }
    }

    /// Restricts reordering and pairing to what `arch` can issue.
    pub fn with_architecture(mut self, arch: ArchitectureConstraints) -> Self {
        self.ilp.enable_dual_issue &= arch.supports_dual_issue;
        self.ilp.max_instruction_distance = self.ilp.max_instruction_distance.min(arch.instruction_buffer_size);
        self.arch = arch;
        self
    }

    pub fn optimize_scheduling(&self, kernel: &Kernel) -> SchedulingResult {
        let (converted, mut steps) = self.apply_architecture_optimizations(kernel);
        let mut unroll = self.ilp.unroll_factor.max(1);
        let mut distance = self.ilp.max_instruction_distance;

        let mut pass = 0;
        loop {
            let mut attempt = match self.schedule_once(&converted, unroll, distance) {
                Ok(a) => a,
                Err(e) => return self.fallback(kernel, steps, e),
            };
            let allocation = self.optimize_register_allocation(&attempt.kernel, self.max_registers);
            let exhausted = (unroll == 1 && distance == 0) || pass == MAX_ADJUSTMENT_PASSES;
            if !allocation.spill_needed || exhausted {
                steps.append(&mut attempt.steps);
                if allocation.spill_needed {
                    warn!(
                        "[Scheduler] {} needs {} registers (limit {}), spill required",
                        kernel.name, allocation.total_registers_used, self.max_registers
                    );
                    steps.push(format!(
                        "spill required: {} live registers exceed limit {}",
                        allocation.total_registers_used, self.max_registers
                    ));
                    let pressure = analyze_register_pressure(&attempt.kernel);
                    let spilled = pressure.spill_candidates.len().saturating_sub(self.max_registers);
                    steps.push(format!(
                        "spill candidates at peak of {} live: {}",
                        pressure.max_live_registers,
                        pressure.spill_candidates[..spilled].join(", ")
                    ));
                }
                return self.finish(kernel, attempt, allocation, steps);
            }
            steps.push(format!(
                "register pressure {} > {}: reducing unroll {} -> {}, distance {} -> {}",
                allocation.total_registers_used, self.max_registers,
                unroll, (unroll / 2).max(1), distance, distance / 2
            ));
            unroll = (unroll / 2).max(1);
            distance /= 2;
            pass += 1;
        }
    }

    /// Reorders `kernel` by an externally supplied graph. No pipelining is attempted.
    pub fn schedule_with_graph(&self, kernel: &Kernel, mut graph: DependencyGraph) -> SchedulingResult {
        let critical = match graph.compute_timing() {
            Ok(h) => h,
            Err(e) => return self.fallback(kernel, Vec::new(), e),
        };
        let order = self.list_schedule(&graph, self.ilp.max_instruction_distance);
        let body = order.iter().map(|&i| kernel.body[i].clone()).collect();
        let attempt = Attempt {
            kernel: kernel.with_body(body),
            multiplicity: 1,
            critical_path_length: critical,
            steps: vec![format!("list scheduled {} instructions", order.len())],
        };
        let allocation = self.optimize_register_allocation(&attempt.kernel, self.max_registers);
        self.finish(kernel, attempt, allocation, Vec::new())
    }

    fn schedule_once(&self, kernel: &Kernel, unroll: usize, distance: usize) -> Result<Attempt> {
        let mut steps = Vec::new();
        let mut working = kernel.clone();
        let mut multiplicity = 1;

        if unroll > 1 {
            if let Some(region) = kernel.find_loop() {
                let body = &kernel.body[region.start + 1..region.end];
                if !self.ilp.allow_speculative_execution {
                    steps.push(format!("software pipelining of {} skipped: speculative execution disabled", region.label));
                } else if !validate_data_dependencies(body) {
                    steps.push(format!("software pipelining of {} skipped: cross-iteration hazard", region.label));
                } else {
                    working = unroll_loop(kernel, &region, unroll);
                    multiplicity = unroll as u32;
                    steps.push(format!("software pipelined loop {} with unroll factor {}", region.label, unroll));
                }
            }
        }

        let mut graph = DependencyGraph::build(&working.body);
        let critical_path_length = graph.compute_timing()?;
        let order = self.list_schedule(&graph, distance);
        let scheduled = working.with_body(order.iter().map(|&i| working.body[i].clone()).collect());

        let before = self.estimate_cycles(&working, 1);
        let after = self.estimate_cycles(&scheduled, 1);
        let moved = order.iter().enumerate().filter(|(pos, i)| *pos != **i).count();
        if after <= before && moved > 0 {
            steps.push(format!(
                "list scheduling moved {} of {} instructions ({} -> {} cycles)",
                moved, order.len(), before, after
            ));
            working = scheduled;
        } else if moved > 0 {
            steps.push("list schedule slower than source order, kept source order".to_string());
        }

        Ok(Attempt { kernel: working, multiplicity, critical_path_length, steps })
    }

    fn finish(&self, original: &Kernel, attempt: Attempt, allocation: RegisterAllocation, mut steps: Vec<String>) -> SchedulingResult {
        let before = self.estimate_cycles(original, attempt.multiplicity);
        let after = self.estimate_cycles(&attempt.kernel, 1);
        let estimated_speedup = if after == 0 { 1.0 } else { before as f64 / after as f64 };
        if steps.is_empty() {
            steps = attempt.steps;
        }
        info!(
            "[Scheduler] {}: critical path {} cycles, estimated speedup {:.2}x, {} registers",
            original.name, attempt.critical_path_length, estimated_speedup, allocation.total_registers_used
        );
        SchedulingResult {
            optimized_source: attempt.kernel.to_source(),
            kernel: attempt.kernel,
            estimated_speedup,
            optimization_steps: steps,
            register_allocation: allocation,
            critical_path_length: attempt.critical_path_length,
        }
    }

    fn fallback(&self, kernel: &Kernel, mut steps: Vec<String>, err: TuneError) -> SchedulingResult {
        warn!("[Scheduler] {}: {}, keeping original instruction order", kernel.name, err);
        steps.push(format!("defect: {}; original order kept", err));
        SchedulingResult {
            optimized_source: kernel.to_source(),
            kernel: kernel.clone(),
            estimated_speedup: 1.0,
            optimization_steps: steps,
            register_allocation: self.optimize_register_allocation(kernel, self.max_registers),
            critical_path_length: 0,
        }
    }

    /// Cycle-driven list scheduling over a timed graph. Returns original node indices in
    /// their new order. No node lands more than `distance` slots from its source
    /// position as long as every edge points forward in the source order.
    pub fn list_schedule(&self, graph: &DependencyGraph, distance: usize) -> Vec<usize> {
        self.list_schedule_cycles(graph, distance).into_iter().map(|(node, _)| node).collect()
    }

    /// Like [`list_schedule`](Self::list_schedule), with the issue cycle of each node.
    /// With dual issue enabled a ready node of a different issue class may share the
    /// cycle of the node placed before it.
    pub fn list_schedule_cycles(&self, graph: &DependencyGraph, distance: usize) -> Vec<(usize, u32)> {
        let n = graph.len();
        let mut placed = vec![false; n];
        let mut pending: Vec<usize> = graph.nodes.iter().map(|node| node.predecessors.len()).collect();
        let mut finish = vec![0u32; n];
        let mut order = Vec::with_capacity(n);
        let mut oldest = 0;
        let mut cycle = 0u32;
        // Cycle and class of a node whose issue slot still has room for a partner.
        let mut open: Option<(u32, InstructionKind)> = None;

        let start_time = |node: usize, finish: &[u32]| -> u32 {
            graph.nodes[node].predecessors.iter().map(|&p| finish[p]).max().unwrap_or(0)
        };

        for t in 0..n {
            while oldest < n && placed[oldest] {
                oldest += 1;
            }

            let (pick, issue) = if t >= oldest + distance && pending[oldest] == 0 {
                (oldest, cycle.max(start_time(oldest, &finish)))
            } else {
                let window_end = (t + distance).min(n - 1);
                let mut candidates: Vec<usize> = (oldest..=window_end)
                    .filter(|&i| !placed[i] && pending[i] == 0)
                    .collect();
                if candidates.is_empty() {
                    candidates = (0..n).filter(|&i| !placed[i] && pending[i] == 0).collect();
                }
                let partner = open.and_then(|(at, kind)| {
                    let partners: Vec<usize> = candidates.iter().copied()
                        .filter(|&c| start_time(c, &finish) <= at && pairable(kind, graph.nodes[c].kind))
                        .collect();
                    critical_first(graph, &partners).map(|c| (c, at))
                });
                match partner {
                    Some(paired) => paired,
                    None => {
                        let earliest = candidates.iter().map(|&c| start_time(c, &finish)).min().unwrap_or(cycle);
                        cycle = cycle.max(earliest);
                        let available: Vec<usize> = candidates.iter().copied()
                            .filter(|&c| start_time(c, &finish) <= cycle)
                            .collect();
                        let Some(pick) = critical_first(graph, &available) else { break };
                        (pick, cycle.max(start_time(pick, &finish)))
                    }
                }
            };

            let kind = graph.nodes[pick].kind;
            open = match open {
                Some((at, _)) if at == issue => None,
                _ if self.ilp.enable_dual_issue && !pinned(kind) => Some((issue, kind)),
                _ => None,
            };
            finish[pick] = issue + graph.nodes[pick].latency;
            cycle = issue + 1;
            placed[pick] = true;
            for &s in &graph.nodes[pick].successors {
                pending[s] -= 1;
            }
            order.push((pick, issue));
        }
        debug!("[Scheduler] list schedule: {:?}", order);
        order
    }

    /// Replaces `@p bra L; <short body>; L:` by the body guarded with the negated
    /// predicate when the target predicates instructions and `L` has no other use.
    pub fn apply_architecture_optimizations(&self, kernel: &Kernel) -> (Kernel, Vec<String>) {
        let mut steps = Vec::new();
        if !self.arch.supports_predication {
            return (kernel.clone(), steps);
        }
        let body = &kernel.body;
        let mut out = Vec::with_capacity(body.len());
        let mut i = 0;
        while i < body.len() {
            match if_convertible(body, i) {
                Some((guard, label_at)) => {
                    let negated = negate_guard(&guard);
                    out.extend(body[i + 1..label_at].iter().map(|inst| inst.clone().with_guard(Some(negated.clone()))));
                    steps.push(format!(
                        "if-converted branch over {} instructions to {}",
                        label_at - i - 1, body[i].operands[0]
                    ));
                    i = label_at + 1;
                }
                None => {
                    out.push(body[i].clone());
                    i += 1;
                }
            }
        }
        if !steps.is_empty() {
            debug!("[Scheduler] {}: {}", kernel.name, steps.join("; "));
        }
        (kernel.with_body(out), steps)
    }

    /// In-order issue estimate. A loop body counts `loop_multiplicity` times.
    pub fn estimate_cycles(&self, kernel: &Kernel, loop_multiplicity: u32) -> u32 {
        let dual = self.ilp.enable_dual_issue;
        match kernel.find_loop() {
            Some(LoopRegion { start, end, .. }) => {
                issue_length(&kernel.body[..start], dual)
                    + issue_length(&kernel.body[start..=end], dual) * loop_multiplicity
                    + issue_length(&kernel.body[end + 1..], dual)
            }
            None => issue_length(&kernel.body, dual),
        }
    }

    pub fn optimize_register_allocation(&self, kernel: &Kernel, max_registers: usize) -> RegisterAllocation {
        let intervals = live_intervals(kernel);
        let mut sorted: Vec<(&String, (usize, usize))> = intervals.iter().map(|(r, &iv)| (r, iv)).collect();
        sorted.sort_by(|(ra, (sa, _)), (rb, (sb, _))| sa.cmp(sb).then_with(|| ra.cmp(rb)));

        let mut mapping = BTreeMap::new();
        let mut active: Vec<(usize, usize)> = Vec::new(); // (end, slot)
        let mut free: Vec<usize> = Vec::new();
        let mut slots = 0;
        for (reg, (start, end)) in sorted {
            active.retain(|&(e, slot)| {
                if e < start {
                    free.push(slot);
                    false
                } else {
                    true
                }
            });
            free.sort_unstable_by(|a, b| b.cmp(a));
            let slot = free.pop().unwrap_or_else(|| {
                slots += 1;
                slots - 1
            });
            active.push((end, slot));
            mapping.insert(reg.clone(), slot);
        }

        RegisterAllocation {
            register_mapping: mapping,
            total_registers_used: slots,
            spill_needed: slots > max_registers,
        }
    }
}

/// Live count per instruction and the registers that are live at the peak.
pub fn analyze_register_pressure(kernel: &Kernel) -> RegisterPressure {
    let intervals = live_intervals(kernel);
    let mut pressure_points = vec![0usize; kernel.body.len()];
    for &(start, end) in intervals.values() {
        for p in &mut pressure_points[start..=end] {
            *p += 1;
        }
    }
    let max_live = pressure_points.iter().copied().max().unwrap_or(0);
    let peak = pressure_points.iter().position(|&p| p == max_live).unwrap_or(0);
    let mut at_peak: Vec<(&String, usize)> = intervals.iter()
        .filter(|(_, iv)| iv.0 <= peak && peak <= iv.1)
        .map(|(r, &(s, e))| (r, e - s))
        .collect();
    at_peak.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    RegisterPressure {
        max_live_registers: max_live,
        pressure_points,
        spill_candidates: at_peak.into_iter().map(|(r, _)| r.clone()).collect(),
    }
}

/// `[first, last]` occurrence per general-purpose register. Values carried around the
/// loop stay live across the whole loop region. Predicates live in their own file and
/// are not counted.
fn live_intervals(kernel: &Kernel) -> HashMap<String, (usize, usize)> {
    let mut intervals: HashMap<String, (usize, usize)> = HashMap::new();
    for (i, inst) in kernel.body.iter().enumerate() {
        for reg in inst.uses().into_iter().chain(inst.defs()) {
            if reg.starts_with("%p") {
                continue;
            }
            let entry = intervals.entry(reg.to_string()).or_insert((i, i));
            entry.1 = i;
        }
    }
    if let Some(region) = kernel.find_loop() {
        for reg in loop_carried(&kernel.body[region.start + 1..region.end]) {
            if let Some(iv) = intervals.get_mut(reg.as_str()) {
                iv.0 = iv.0.min(region.start);
                iv.1 = iv.1.max(region.end);
            }
        }
    }
    intervals
}

/// Registers read in a loop body before being written there.
fn loop_carried(body: &[Instruction]) -> HashSet<String> {
    let mut written = HashSet::new();
    let mut carried = HashSet::new();
    for inst in body {
        for reg in inst.uses() {
            if !written.contains(reg) {
                carried.insert(reg.to_string());
            }
        }
        for reg in inst.defs() {
            written.insert(reg.to_string());
        }
    }
    carried
}

/// In-order issue: an instruction waits for its operands and for the issue port, which
/// a low-throughput instruction holds for several cycles.
fn issue_length(insts: &[Instruction], dual_issue: bool) -> u32 {
    let graph = DependencyGraph::build(insts);
    let mut issue = vec![0u32; insts.len()];
    let mut next_free = 0u32;
    let mut prev: Option<usize> = None;
    let mut paired = false;
    let mut end = 0u32;

    for (i, inst) in insts.iter().enumerate() {
        let ready = graph.nodes[i].predecessors.iter()
            .map(|&p| issue[p] + insts[p].latency)
            .max()
            .unwrap_or(0);
        if inst.is_pseudo() {
            issue[i] = ready.max(prev.map_or(0, |p| issue[p]));
            continue;
        }
        let cycle = match prev {
            Some(p) if dual_issue && !paired && ready <= issue[p] && can_pair(&insts[p], inst) && !graph.has_edge(p, i) => {
                paired = true;
                issue[p]
            }
            _ => {
                paired = false;
                ready.max(next_free)
            }
        };
        issue[i] = cycle;
        next_free = next_free.max(cycle + inst.issue_cycles());
        prev = Some(i);
        end = end.max(cycle + inst.latency);
    }
    end
}

fn can_pair(a: &Instruction, b: &Instruction) -> bool {
    if !pairable(a.kind, b.kind) {
        return false;
    }
    let a_defs = a.defs();
    !b.defs().iter().any(|d| a_defs.contains(d))
}

/// `(guard, label index)` when `body[at]` is a guarded branch over at most
/// `IF_CONVERSION_LIMIT` plain instructions to a label nothing else jumps to.
fn if_convertible(body: &[Instruction], at: usize) -> Option<(String, usize)> {
    let branch = &body[at];
    let guard = branch.guard.clone()?;
    if !branch.is_branch() {
        return None;
    }
    let target = branch.operands.first()?;
    let label_at = (at + 1..body.len()).find(|&i| body[i].label_name() == Some(target.as_str()))?;
    let skipped = &body[at + 1..label_at];
    let plain = skipped.iter().all(|i| i.guard.is_none() && !pinned(i.kind));
    let single_use = body.iter().enumerate()
        .filter(|(i, inst)| *i != at && inst.is_branch() && inst.operands.first() == Some(target))
        .count() == 0;
    (!skipped.is_empty() && skipped.len() <= IF_CONVERSION_LIMIT && plain && single_use)
        .then_some((guard, label_at))
}

fn negate_guard(guard: &str) -> String {
    match guard.strip_prefix("@!") {
        Some(pred) => format!("@{}", pred),
        None => format!("@!{}", guard.trim_start_matches('@')),
    }
}

/// Allows pipelining only when no memory hazard reaches further than one iteration and
/// the body is a single basic block.
pub fn validate_data_dependencies(body: &[Instruction]) -> bool {
    if body.iter().any(|i| matches!(i.kind, InstructionKind::Control | InstructionKind::Sync)) {
        return false;
    }

    let mut def_count: HashMap<&str, usize> = HashMap::new();
    for inst in body {
        for d in inst.defs() {
            *def_count.entry(d).or_default() += 1;
        }
    }
    let induction = induction_registers(body);

    for (si, store) in body.iter().enumerate().filter(|(_, i)| i.is_store()) {
        for (mi, other) in body.iter().enumerate().filter(|(mi, i)| *mi != si && i.touches_memory()) {
            if let (Some(a), Some(b)) = (store.state_space(), other.state_space()) {
                if a != b && a != StateSpace::Generic && b != StateSpace::Generic {
                    continue;
                }
            }
            let (Some(ms), Some(mo)) = (store.memory_operand(), other.memory_operand()) else {
                return false;
            };
            if ms.base != mo.base {
                return false;
            }
            let ws = store.element_bytes() as i64;
            let wo = other.element_bytes() as i64;
            match induction.get(ms.base.as_str()) {
                None if def_count.contains_key(ms.base.as_str()) => return false,
                None => {
                    // Loop-invariant address: an overlap repeats on every iteration.
                    if ms.offset < mo.offset + wo && mo.offset < ms.offset + ws {
                        return false;
                    }
                }
                Some(&(def_pos, step)) => {
                    if step == 0 {
                        return false;
                    }
                    let norm = |pos: usize, off: i64| if pos > def_pos { off + step } else { off };
                    let (os, oo) = (norm(si, ms.offset), norm(mi, mo.offset));
                    for d in 2..=HAZARD_SCAN_DISTANCE {
                        let shifted = os + d * step;
                        let back = oo + d * step;
                        if (shifted < oo + wo && oo < shifted + ws) || (back < os + ws && os < back + wo) {
                            return false;
                        }
                    }
                }
            }
        }
    }
    true
}

/// Replicates the loop body `factor` times. Registers first written inside the body are
/// renamed in every copy but the last, so live-out values keep their names.
pub fn unroll_loop(kernel: &Kernel, region: &LoopRegion, factor: usize) -> Kernel {
    let body = &kernel.body[region.start + 1..region.end];
    let carried = loop_carried(body);
    let local: HashSet<String> = body.iter()
        .flat_map(|i| i.defs())
        .filter(|r| !carried.contains(*r))
        .map(|r| r.to_string())
        .collect();

    let mut out = kernel.with_body(Vec::with_capacity(kernel.body.len() + body.len() * factor));
    out.body.extend_from_slice(&kernel.body[..=region.start]);
    let mut introduced = BTreeSet::new();
    for copy in 0..factor {
        let last = copy + 1 == factor;
        for inst in body {
            if last {
                out.body.push(inst.clone());
                continue;
            }
            let rename = |reg: &str| {
                local.contains(reg).then(|| format!("{}_u{}", reg, copy))
            };
            let renamed = inst.rename_registers(&rename);
            introduced.extend(renamed.defs().into_iter()
                .filter(|r| !local.contains(*r) && !carried.contains(*r))
                .map(str::to_string));
            out.body.push(renamed);
        }
    }
    out.body.extend_from_slice(&kernel.body[region.end..]);
    for reg in &introduced {
        out.declare_register(reg);
    }
    out
}
