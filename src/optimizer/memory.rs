use serde::{Serialize, Deserialize};
use std::collections::HashSet;
use tracing::{debug, info};
use crate::core::instruction::{
    induction_registers, parse_immediate, registers_in, Instruction, InstructionKind, Kernel, MemoryOperand, StateSpace,
};
use crate::optimizer::HardwareProfile;
use crate::semantic::swizzle::BankConflictSimulator;

/// Global-memory transaction granularity in bytes.
pub const SEGMENT_BYTES: u64 = 32;
/// Largest stride, in elements, that is staged through shared memory.
const MAX_STAGE_FACTOR: i64 = 8;
const MAX_PREFETCH_DISTANCE: usize = 16;
const ANALYSIS_DEPTH: usize = 32;
const CACHE_OPERATORS: &[&str] = &["ca", "cg", "cs", "lu", "cv", "nc"];
/// Thread indices that vary inside a warp once blocks are multi-dimensional.
const OUTER_THREAD_INDICES: &[&str] = &["%tid.y", "%tid.z"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub cache_line_size: u32,
    pub warp_size: u32,
    pub shared_memory_banks: u32,
    pub bank_width: u32,
    pub shared_memory_per_block: usize,
    pub max_threads_per_block: u32,
    pub memory_latency_cycles: u32,
    pub l1_cache_size: usize,
    pub l2_cache_size: usize,
    /// Strided accesses below this coalescence rate are rewritten.
    pub coalescence_threshold: f64,
}

impl MemoryConfig {
    pub fn from_hardware(hw: &HardwareProfile) -> Self {
        Self {
            cache_line_size: hw.cache_line_size,
            warp_size: hw.warp_size,
            shared_memory_banks: hw.shared_memory_banks,
            bank_width: hw.bank_width,
            shared_memory_per_block: hw.shared_memory_per_block,
            max_threads_per_block: hw.max_threads_per_block,
            memory_latency_cycles: hw.memory_latency_cycles,
            l1_cache_size: hw.l1_cache_size,
            l2_cache_size: hw.l2_cache_size,
            coalescence_threshold: 0.5,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::from_hardware(&HardwareProfile::rtx3070())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessPatternKind {
    Sequential,
    Strided,
    Random,
    Coalesced,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAccessPattern {
    pub pattern_type: AccessPatternKind,
    /// Byte distance between neighbouring lanes, 0 when not constant.
    pub stride_size: i64,
    pub element_size: u32,
    /// Bytes delivered to lanes divided by bytes moved in 32-byte segments, capped at 1.
    pub coalescence_rate: f64,
    pub has_bank_conflicts: bool,
}

impl MemoryAccessPattern {
    pub fn coalesced(element_size: u32) -> Self {
        Self {
            pattern_type: AccessPatternKind::Coalesced,
            stride_size: element_size as i64,
            element_size,
            coalescence_rate: 1.0,
            has_bank_conflicts: false,
        }
    }

    /// Lane addresses that cannot be related statically: one segment per lane.
    pub fn random(element_size: u32) -> Self {
        Self {
            pattern_type: AccessPatternKind::Random,
            stride_size: 0,
            element_size,
            coalescence_rate: (element_size as f64 / SEGMENT_BYTES as f64).min(1.0),
            has_bank_conflicts: true,
        }
    }
}

/// One global memory instruction and how its warp-wide access behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessSite {
    pub index: usize,
    /// Address bytes added per lane, `None` when the address is data dependent.
    pub lane_stride: Option<i64>,
    pub pattern: MemoryAccessPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessOptimization {
    pub kernel: Kernel,
    pub ptx_code: String,
    pub optimization_steps: Vec<String>,
    pub estimated_improvement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemoryConfig {
    pub block_size: usize,
    pub elements_per_thread: usize,
    /// Padding in elements appended to every row of `block_size` elements.
    pub padding_size: usize,
    pub use_double_buffering: bool,
    pub footprint_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStrategy {
    pub prefer_l1_cache: bool,
    /// Route loads through the read-only (texture) path.
    pub use_texture_cache: bool,
    pub prefetch_distance: usize,
    pub cache_hints: Vec<String>,
}

impl CacheStrategy {
    pub fn cache_operator(&self) -> &'static str {
        if self.use_texture_cache {
            "nc"
        } else if self.prefer_l1_cache {
            "ca"
        } else {
            "cg"
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOptimizer {
    pub config: MemoryConfig,
}

impl MemoryOptimizer {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    /// Classifies the byte addresses one warp touches in a single instruction.
    pub fn classify(&self, addresses: &[u64], element_size: u32) -> MemoryAccessPattern {
        let Some(&first) = addresses.first() else {
            return MemoryAccessPattern::coalesced(element_size);
        };
        let elem = element_size.max(1) as u64;
        let lo = addresses.iter().copied().min().unwrap_or(first);
        let hi = addresses.iter().copied().max().unwrap_or(first);
        let stride = addresses.get(1).map(|&a| a as i64 - first as i64).unwrap_or(0);
        let constant = addresses.windows(2).all(|w| w[1] as i64 - w[0] as i64 == stride);

        let pattern_type = if addresses.iter().all(|&a| a == first) {
            AccessPatternKind::Broadcast
        } else if hi + elem - lo <= self.config.cache_line_size as u64 {
            AccessPatternKind::Coalesced
        } else if constant && stride == elem as i64 {
            AccessPatternKind::Sequential
        } else if constant && stride.unsigned_abs() > elem {
            AccessPatternKind::Strided
        } else {
            AccessPatternKind::Random
        };

        let simulator = BankConflictSimulator::new(self.config.shared_memory_banks, self.config.bank_width);
        MemoryAccessPattern {
            pattern_type,
            stride_size: if constant { stride } else { 0 },
            element_size,
            coalescence_rate: coalescence_rate(addresses, elem),
            has_bank_conflicts: simulator.has_address_conflicts(addresses),
        }
    }

    /// Patterns of every global load and store in the kernel.
    pub fn analyze_kernel(&self, kernel: &Kernel) -> Vec<AccessSite> {
        let warp = self.config.warp_size as i64;
        kernel.body.iter().enumerate()
            .filter(|(_, inst)| inst.touches_memory() && is_global(inst))
            .filter_map(|(index, inst)| {
                let mem = inst.memory_operand()?;
                let elem = inst.element_bytes();
                let lane_stride = lane_coefficient(&kernel.body, index, &mem.base, ANALYSIS_DEPTH);
                let pattern = match lane_stride {
                    Some(stride) => {
                        // Lane 0 sits on an aligned line far from zero so negative strides stay positive.
                        let origin = 1i64 << 32;
                        let addresses: Vec<u64> = (0..warp)
                            .map(|lane| (origin + mem.offset + lane * stride) as u64)
                            .collect();
                        self.classify(&addresses, elem)
                    }
                    None => MemoryAccessPattern::random(elem),
                };
                Some(AccessSite { index, lane_stride, pattern })
            })
            .collect()
    }

    /// Worst site by coalescence rate; a kernel without global accesses counts as coalesced.
    pub fn dominant_pattern(&self, kernel: &Kernel) -> MemoryAccessPattern {
        self.analyze_kernel(kernel).into_iter()
            .map(|s| s.pattern)
            .min_by(|a, b| a.coalescence_rate.total_cmp(&b.coalescence_rate))
            .unwrap_or_else(|| MemoryAccessPattern::coalesced(4))
    }

    pub fn optimize_access_pattern(&self, kernel: &Kernel, pattern: &MemoryAccessPattern) -> AccessOptimization {
        let unchanged = |step: String| AccessOptimization {
            kernel: kernel.clone(),
            ptx_code: kernel.to_source(),
            optimization_steps: vec![step],
            estimated_improvement: 0.0,
        };
        if pattern.pattern_type != AccessPatternKind::Strided
            || pattern.coalescence_rate >= self.config.coalescence_threshold
        {
            return unchanged(format!(
                "{:?} access (coalescence {:.2}) left unchanged",
                pattern.pattern_type, pattern.coalescence_rate
            ));
        }

        let mut budget = self.config.shared_memory_per_block;
        let mut steps = Vec::new();
        let mut stage_at: Vec<(usize, StagePlan)> = Vec::new();
        for site in self.analyze_kernel(kernel) {
            let inst = &kernel.body[site.index];
            let Some(stride) = site.lane_stride else { continue };
            if !self.is_stageable(inst, &site, stride) {
                continue;
            }
            // Warp-cooperative loads need every lane of the warp to arrive together.
            if under_divergent_control(&kernel.body, site.index) {
                steps.push(format!("load {} not staged: reached under divergent control flow", site.index));
                continue;
            }
            let base = inst.memory_operand().map(|m| m.base).unwrap_or_default();
            if derives_from(&kernel.body, site.index, &base, OUTER_THREAD_INDICES, ANALYSIS_DEPTH) {
                steps.push(format!("load {} not staged: address depends on %tid.y or %tid.z", site.index));
                continue;
            }
            let plan = self.stage_plan(inst.element_bytes() as i64, stride);
            let bytes = plan.buffer_bytes as usize;
            if bytes > budget {
                steps.push(format!("load {} not staged: {}B exceeds remaining shared memory", site.index, bytes));
                continue;
            }
            budget -= bytes;
            stage_at.push((site.index, plan));
        }
        if stage_at.is_empty() {
            steps.push("no stageable strided loads".to_string());
            return AccessOptimization { optimization_steps: steps, ..unchanged(String::new()) };
        }

        let mut out = kernel.with_body(Vec::with_capacity(kernel.body.len() + stage_at.len() * 24));
        let mut introduced = Vec::new();
        let mut next = stage_at.iter().peekable();
        for (index, inst) in kernel.body.iter().enumerate() {
            match next.peek() {
                Some(&&(site, plan)) if site == index => {
                    let n = out.header.iter().filter(|l| l.contains("ptxtune_stage")).count();
                    let staged = self.stage_load(inst, &plan, n);
                    out.header.push(staged.declaration);
                    introduced.extend(staged.registers);
                    out.body.extend(staged.body);
                    steps.push(format!(
                        "staged strided load {} (stride {}B, padding {}) through shared buffer ptxtune_stage{}",
                        index, plan.stride, plan.padding, n
                    ));
                    next.next();
                }
                _ => out.body.push(inst.clone()),
            }
        }
        for reg in &introduced {
            out.declare_register(reg);
        }

        let tx_ratio = 1.0 / pattern.coalescence_rate.max(f64::EPSILON);
        let estimated_improvement = tx_ratio.min(self.config.warp_size as f64) - 1.0;
        info!(
            "[Memory] {}: staged {} strided loads, estimated improvement {:.2}",
            kernel.name, stage_at.len(), estimated_improvement
        );
        AccessOptimization {
            ptx_code: out.to_source(),
            kernel: out,
            optimization_steps: steps,
            estimated_improvement,
        }
    }

    fn is_stageable(&self, inst: &Instruction, site: &AccessSite, stride: i64) -> bool {
        let elem = inst.element_bytes() as i64;
        inst.base_op() == "ld"
            && inst.guard.is_none()
            && !inst.opcode.split('.').any(|p| p == "v2" || p == "v4")
            && (elem == 4 || elem == 8)
            && site.pattern.pattern_type == AccessPatternKind::Strided
            && site.pattern.coalescence_rate < self.config.coalescence_threshold
            && stride > 0
            && stride % elem == 0
            && stride / elem <= MAX_STAGE_FACTOR
    }

    /// Shared buffer layout for one staged load. Rows of one warp-width of elements are
    /// padded so that the strided read back is free of bank conflicts.
    fn stage_plan(&self, elem: i64, stride: i64) -> StagePlan {
        let warp = self.config.warp_size.max(1) as i64;
        let factor = stride / elem;
        let simulator = BankConflictSimulator::new(self.config.shared_memory_banks, self.config.bank_width);
        let reads: Vec<u64> = (0..warp).map(|lane| (lane * factor) as u64).collect();
        let padding = simulator.row_padding(&reads, warp as u64, elem as u64, warp as u64) as i64;
        let tile_bytes = factor * (warp + padding) * elem;
        let warps = (self.config.max_threads_per_block as i64 + warp - 1) / warp;
        StagePlan { elem, stride, factor, padding, tile_bytes, buffer_bytes: warps * tile_bytes }
    }

    /// Cooperative stride-1 loads of the warp's footprint into a per-warp shared tile,
    /// then each lane reads its own element back. A warp that is not fully populated
    /// takes the original load instead.
    fn stage_load(&self, inst: &Instruction, plan: &StagePlan, n: usize) -> StagedLoad {
        let warp = self.config.warp_size.max(1) as i64;
        let StagePlan { elem, stride, factor, padding, tile_bytes, buffer_bytes } = *plan;
        let mem = inst.memory_operand().unwrap_or(MemoryOperand { base: String::new(), offset: 0 });
        let bits = elem * 8;
        let value_prefix = if elem == 8 { "%rd" } else { "%r" };
        let value_type = inst.opcode.rsplit('.').next().unwrap_or("b32");
        let log2_warp = warp.trailing_zeros().to_string();

        let r32 = |name: &str| format!("%r_stage{}_{}", n, name);
        let r64 = |name: &str| format!("%rd_stage{}_{}", n, name);
        let (mask, lane, linear, dim, index, slot, row) =
            (r32("mask"), r32("lane"), r32("warp"), r32("dim"), r32("tid"), r32("slot"), r32("row"));
        let (lo, off, src, buf, tile, dst, read) =
            (r64("lo"), r64("off"), r64("src"), r64("buf"), r64("tile"), r64("dst"), r64("rd"));
        let partial = format!("%p_stage{}_partial", n);
        let tail = format!("%p_stage{}_tail", n);
        let symbol = format!("ptxtune_stage{}", n);
        let direct = format!("{}_direct", symbol);
        let done = format!("{}_done", symbol);
        let base = if mem.base.is_empty() { "0".to_string() } else { mem.base.clone() };
        let ins = |op: &str, ops: Vec<String>| Instruction::new(op, ops);

        let mut body = vec![
            ins("activemask.b32", vec![mask.clone()]),
            ins("setp.ne.b32", vec![partial.clone(), mask.clone(), "-1".into()]),
            ins("bra", vec![direct.clone()]).with_guard(Some(format!("@{}", partial))),
            ins("mov.u32", vec![lane.clone(), "%laneid".into()]),
            // linear thread index, x fastest
            ins("mov.u32", vec![linear.clone(), "%tid.z".into()]),
            ins("mov.u32", vec![dim.clone(), "%ntid.y".into()]),
            ins("mov.u32", vec![index.clone(), "%tid.y".into()]),
            ins("mad.lo.u32", vec![linear.clone(), linear.clone(), dim.clone(), index.clone()]),
            ins("mov.u32", vec![dim.clone(), "%ntid.x".into()]),
            ins("mov.u32", vec![index.clone(), "%tid.x".into()]),
            ins("mad.lo.u32", vec![linear.clone(), linear.clone(), dim.clone(), index.clone()]),
            ins("shr.u32", vec![linear.clone(), linear.clone(), log2_warp.clone()]),
            ins("mul.wide.u32", vec![lo.clone(), lane.clone(), elem.to_string()]),
            ins("mul.wide.u32", vec![off.clone(), lane.clone(), stride.to_string()]),
            ins("sub.s64", vec![src.clone(), base, off.clone()]),
            ins("add.s64", vec![src.clone(), src.clone(), lo.clone()]),
            ins("mov.u64", vec![buf.clone(), symbol.clone()]),
            ins("mul.wide.u32", vec![tile.clone(), linear.clone(), tile_bytes.to_string()]),
            ins("add.s64", vec![buf.clone(), buf.clone(), tile.clone()]),
            ins("add.s64", vec![dst.clone(), buf.clone(), lo.clone()]),
            // the last chunk only covers the footprint (warp - 1) * stride + elem
            ins("setp.lt.u32", vec![tail.clone(), lane.clone(), (warp - factor + 1).to_string()]),
        ];
        let mut registers = vec![
            mask.clone(), lane.clone(), linear, dim, index, slot.clone(), partial, tail.clone(),
            lo, off.clone(), src.clone(), buf.clone(), tile, dst.clone(), read.clone(),
        ];
        for j in 0..factor {
            let value = format!("{}_stage{}_v{}", value_prefix, n, j);
            let guard = (j + 1 == factor).then(|| format!("@{}", tail));
            let from = mem.offset + j * warp * elem;
            let to = j * (warp + padding) * elem;
            body.push(ins(&format!("ld.global.b{}", bits), vec![value.clone(), address(&src, from)]).with_guard(guard.clone()));
            body.push(ins(&format!("st.shared.b{}", bits), vec![address(&dst, to), value.clone()]).with_guard(guard));
            registers.push(value);
        }
        body.push(ins("bar.warp.sync", vec![mask]));
        body.push(ins("mul.lo.u32", vec![slot.clone(), lane, factor.to_string()]));
        if padding > 0 {
            body.push(ins("shr.u32", vec![row.clone(), slot.clone(), log2_warp]));
            body.push(ins("mad.lo.u32", vec![slot.clone(), row.clone(), padding.to_string(), slot.clone()]));
            registers.push(row);
        }
        body.push(ins("mul.wide.u32", vec![off.clone(), slot, elem.to_string()]));
        body.push(ins("add.s64", vec![read.clone(), buf, off]));
        let mut readback = inst.operands.clone();
        if let Some(operand) = readback.iter_mut().find(|o| o.trim_start().starts_with('[')) {
            *operand = address(&read, 0);
        }
        body.push(ins(&format!("ld.shared.{}", value_type), readback));
        body.push(ins("bra.uni", vec![done.clone()]));
        body.push(Instruction::label(&direct));
        body.push(inst.clone());
        body.push(Instruction::label(&done));

        StagedLoad {
            declaration: format!(".shared .align {} .b8 {}[{}];", elem.max(16), symbol, buffer_bytes),
            registers,
            body,
        }
    }

    /// Picks a shared-memory tiling for `data_size` elements processed over `iterations`
    /// passes.
    pub fn optimize_shared_memory(&self, data_size: usize, pattern: &MemoryAccessPattern, iterations: usize) -> SharedMemoryConfig {
        let elem = pattern.element_size.max(1) as usize;
        let warp = self.config.warp_size.max(1) as usize;
        let capacity = self.config.shared_memory_per_block;
        let bank_span = (self.config.shared_memory_banks * self.config.bank_width).max(1) as usize;
        let padding_for = |block: usize| (0..bank_span).find(|p| ((block + p) * elem) % bank_span != 0).unwrap_or(0);

        let mut block_size = data_size.next_power_of_two().clamp(warp, 256.max(warp));
        let mut elements_per_thread = data_size.div_ceil(block_size).clamp(1, 8);
        let mut padding_size = padding_for(block_size);
        let footprint = |block: usize, pad: usize, ept: usize| (block + pad) * ept * elem;

        while footprint(block_size, padding_size, elements_per_thread) > capacity {
            if elements_per_thread > 1 {
                elements_per_thread /= 2;
            } else if block_size > warp {
                block_size /= 2;
                padding_size = padding_for(block_size);
            } else {
                break;
            }
        }
        let footprint_bytes = footprint(block_size, padding_size, elements_per_thread);
        let use_double_buffering = iterations > 1 && footprint_bytes * 2 <= capacity;
        debug!(
            "[Memory] shared tiling: block {} x {} elems, padding {}, double buffering {}",
            block_size, elements_per_thread, padding_size, use_double_buffering
        );
        SharedMemoryConfig { block_size, elements_per_thread, padding_size, use_double_buffering, footprint_bytes }
    }

    pub fn optimize_cache_usage(&self, pattern: &MemoryAccessPattern, compute_cycles_per_element: f64) -> CacheStrategy {
        let compute = compute_cycles_per_element.max(1.0);
        // Lines prefetched ahead by a full block must still fit in L2.
        let in_flight = self.config.cache_line_size as usize * self.config.max_threads_per_block as usize;
        let max_distance = (self.config.l2_cache_size / in_flight.max(1)).clamp(1, MAX_PREFETCH_DISTANCE);
        let prefetch_distance = match pattern.pattern_type {
            AccessPatternKind::Random | AccessPatternKind::Broadcast => 0,
            _ => ((self.config.memory_latency_cycles as f64 / compute).ceil() as usize).clamp(1, max_distance),
        };
        // Neighbouring lanes reuse a strided line only while the block's lines stay in L1.
        let strided_tile = self.config.max_threads_per_block as usize
            * (pattern.stride_size.unsigned_abs() as usize).max(self.config.cache_line_size as usize);
        let (prefer_l1_cache, use_texture_cache) = match pattern.pattern_type {
            AccessPatternKind::Broadcast => (true, true),
            AccessPatternKind::Strided => (strided_tile <= self.config.l1_cache_size, false),
            AccessPatternKind::Sequential | AccessPatternKind::Coalesced | AccessPatternKind::Random => (false, false),
        };
        let mut strategy = CacheStrategy { prefer_l1_cache, use_texture_cache, prefetch_distance, cache_hints: Vec::new() };
        strategy.cache_hints.push(format!("ld.global.{}", strategy.cache_operator()));
        if prefetch_distance > 0 {
            strategy.cache_hints.push(format!("prefetch.global.L2 distance {}", prefetch_distance));
        }
        strategy
    }

    /// Annotates global loads with the strategy's cache operator and prefetches loop
    /// loads whose address advances by a constant.
    pub fn apply_cache_strategy(&self, kernel: &Kernel, strategy: &CacheStrategy) -> Kernel {
        let writes_global = kernel.body.iter().any(|i| i.is_store() && is_global(i));
        // The read-only path is only valid when nothing in the kernel writes global memory.
        let operator = match strategy.cache_operator() {
            "nc" if writes_global => "ca",
            op => op,
        };

        let mut prefetch_steps: Vec<Option<i64>> = vec![None; kernel.body.len()];
        if strategy.prefetch_distance > 0 {
            if let Some(region) = kernel.find_loop() {
                let induction = induction_registers(&kernel.body[region.start + 1..region.end]);
                for (i, inst) in kernel.body.iter().enumerate().take(region.end).skip(region.start + 1) {
                    if inst.base_op() != "ld" || !is_global(inst) {
                        continue;
                    }
                    if let Some(mem) = inst.memory_operand() {
                        if let Some(&(_, step)) = induction.get(mem.base.as_str()) {
                            prefetch_steps[i] = Some(mem.offset + step * strategy.prefetch_distance as i64);
                        }
                    }
                }
            }
        }

        let mut body = Vec::with_capacity(kernel.body.len());
        for (i, inst) in kernel.body.iter().enumerate() {
            if let (Some(ahead), Some(mem)) = (prefetch_steps[i], inst.memory_operand()) {
                body.push(Instruction::new("prefetch.global.L2", vec![address(&mem.base, ahead)]));
            }
            let mut inst = inst.clone();
            if inst.base_op() == "ld" && is_global(&inst) && !has_cache_operator(&inst) {
                inst.opcode = with_cache_operator(&inst.opcode, operator);
            }
            body.push(inst);
        }
        kernel.with_body(body)
    }
}

#[derive(Debug, Clone, Copy)]
struct StagePlan {
    elem: i64,
    stride: i64,
    /// Elements per lane stride; also the number of cooperative chunks.
    factor: i64,
    padding: i64,
    tile_bytes: i64,
    buffer_bytes: i64,
}

struct StagedLoad {
    declaration: String,
    registers: Vec<String>,
    body: Vec<Instruction>,
}

fn address(base: &str, offset: i64) -> String {
    match offset {
        0 => format!("[{}]", base),
        off => format!("[{}{:+}]", base, off),
    }
}

/// Whether some lanes may arrive at `index` without the rest of their warp: an earlier
/// branch or exit, a guarded barrier, or a loop whose back edge is taken per lane.
fn under_divergent_control(body: &[Instruction], index: usize) -> bool {
    let diverged = body[..index].iter().any(|i| {
        (i.kind == InstructionKind::Control && !i.is_pseudo())
            || (i.kind == InstructionKind::Sync && i.guard.is_some())
    });
    let in_loop = body[..index].iter()
        .filter_map(Instruction::label_name)
        .any(|label| body[index + 1..].iter().any(|i| {
            i.is_branch() && i.guard.is_some() && i.operands.first().map(String::as_str) == Some(label)
        }));
    diverged || in_loop
}

/// Whether `operand` is computed from one of `specials` through the definitions before
/// `before`. Chains deeper than `depth` count as dependent.
fn derives_from(body: &[Instruction], before: usize, operand: &str, specials: &[&str], depth: usize) -> bool {
    let op = operand.trim().trim_start_matches('[');
    if specials.iter().any(|s| op.starts_with(s)) {
        return true;
    }
    let Some(&reg) = registers_in(op).first() else {
        return false;
    };
    if depth == 0 {
        return true;
    }
    let Some(def) = (0..before).rev().find(|&i| body[i].defs().contains(&reg)) else {
        return false;
    };
    body[def].operands.iter().skip(1)
        .any(|src| derives_from(body, def, src, specials, depth - 1))
}

fn is_global(inst: &Instruction) -> bool {
    matches!(inst.state_space(), Some(StateSpace::Global) | Some(StateSpace::Generic))
}

fn has_cache_operator(inst: &Instruction) -> bool {
    inst.opcode.split('.').any(|p| CACHE_OPERATORS.contains(&p) || p.starts_with("L1::") || p.starts_with("L2::"))
}

fn with_cache_operator(opcode: &str, operator: &str) -> String {
    let mut parts: Vec<&str> = opcode.split('.').collect();
    let at = parts.iter().position(|p| *p == "global").map(|p| p + 1).unwrap_or(1);
    parts.insert(at.min(parts.len()), operator);
    parts.join(".")
}

/// Bytes delivered to lanes over bytes moved in 32-byte segments, capped at 1.
pub fn coalescence_rate(addresses: &[u64], element_size: u64) -> f64 {
    let moved = transactions(addresses, element_size) as f64 * SEGMENT_BYTES as f64;
    if moved == 0.0 {
        return 1.0;
    }
    let useful = addresses.len() as f64 * element_size as f64;
    (useful / moved).min(1.0)
}

/// Distinct 32-byte segments touched by one warp-wide access.
pub fn transactions(addresses: &[u64], element_size: u64) -> usize {
    let mut segments = HashSet::new();
    for &a in addresses {
        let last = a + element_size.max(1) - 1;
        for seg in a / SEGMENT_BYTES..=last / SEGMENT_BYTES {
            segments.insert(seg);
        }
    }
    segments.len()
}

/// Bytes an address register advances per lane, found by walking definitions back to
/// `%tid.x` / `%laneid`. `None` when the value depends on loaded data or a non-constant
/// product.
fn lane_coefficient(body: &[Instruction], before: usize, operand: &str, depth: usize) -> Option<i64> {
    let op = operand.trim();
    if op.starts_with("%tid.x") || op == "%laneid" {
        return Some(1);
    }
    if parse_immediate(op).is_some() {
        return Some(0);
    }
    let Some(&reg) = registers_in(op).first() else {
        // Other special registers and symbols are uniform across the warp.
        return Some(0);
    };
    if depth == 0 {
        return None;
    }
    let Some(def) = (0..before).rev().find(|&i| body[i].defs().contains(&reg)) else {
        return Some(0);
    };
    let inst = &body[def];
    let src = |k: usize| inst.operands.get(k).map(String::as_str).unwrap_or("0");
    let coef = |k: usize| lane_coefficient(body, def, src(k), depth - 1);

    match inst.base_op() {
        "mov" | "cvt" | "cvta" => coef(1),
        "ld" | "ldu" => match inst.state_space() {
            Some(StateSpace::Param) | Some(StateSpace::Const) => Some(0),
            _ => None,
        },
        "add" => Some(coef(1)? + coef(2)?),
        "sub" => Some(coef(1)? - coef(2)?),
        "mul" => scale(coef(1)?, src(1), coef(2)?, src(2)),
        "shl" => {
            let shift = u32::try_from(parse_immediate(src(2))?).ok()?;
            coef(1)?.checked_shl(shift)
        }
        "mad" => Some(scale(coef(1)?, src(1), coef(2)?, src(2))? + coef(3)?),
        _ => None,
    }
}

fn scale(ca: i64, a: &str, cb: i64, b: &str) -> Option<i64> {
    match (ca, cb) {
        (0, 0) => Some(0),
        (c, 0) => parse_immediate(b).map(|k| c * k),
        (0, c) => parse_immediate(a).map(|k| k * c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> MemoryOptimizer {
        MemoryOptimizer::default()
    }

    fn lanes(stride: u64) -> Vec<u64> {
        (0..32).map(|l| 4096 + l * stride).collect()
    }

    fn strided_kernel(stride: u32) -> Kernel {
        Kernel::parse(&format!(
            r#"
.visible .entry gather(
    .param .u64 src
)
{{
    ld.param.u64 %rd1, [src];
    mov.u32 %r1, %tid.x;
    mul.wide.u32 %rd2, %r1, {};
    add.s64 %rd3, %rd1, %rd2;
    ld.global.f32 %f1, [%rd3];
    add.f32 %f2, %f1, %f1;
    ret;
}}
"#,
            stride
        )).unwrap()
    }

    #[test]
    fn test_classification_order() {
        let opt = optimizer();
        assert_eq!(opt.classify(&[512; 32], 4).pattern_type, AccessPatternKind::Broadcast);
        let coalesced = opt.classify(&lanes(4), 4);
        assert_eq!(coalesced.pattern_type, AccessPatternKind::Coalesced);
        assert_eq!(coalesced.coalescence_rate, 1.0);
        assert_eq!(opt.classify(&lanes(8), 8).pattern_type, AccessPatternKind::Sequential);
        let strided = opt.classify(&lanes(8), 4);
        assert_eq!(strided.pattern_type, AccessPatternKind::Strided);
        assert!((strided.coalescence_rate - 0.5).abs() < 1e-9);
        assert!(strided.has_bank_conflicts);
        let scattered: Vec<u64> = (0..32).map(|l| (l * 7919 % 97) * 256).collect();
        assert_eq!(opt.classify(&scattered, 4).pattern_type, AccessPatternKind::Random);
    }

    #[test]
    fn test_static_lane_stride() {
        let opt = optimizer();
        let sites = opt.analyze_kernel(&strided_kernel(4));
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].lane_stride, Some(4));
        assert_eq!(sites[0].pattern.pattern_type, AccessPatternKind::Coalesced);

        let sites = opt.analyze_kernel(&strided_kernel(16));
        assert_eq!(sites[0].lane_stride, Some(16));
        assert_eq!(sites[0].pattern.pattern_type, AccessPatternKind::Strided);
        assert!((sites[0].pattern.coalescence_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_data_dependent_address_is_random() {
        let kernel = Kernel::parse("ld.global.u64 %rd1, [%rd9];\nld.global.f32 %f1, [%rd1];").unwrap();
        let sites = optimizer().analyze_kernel(&kernel);
        assert_eq!(sites[1].lane_stride, None);
        assert_eq!(sites[1].pattern.pattern_type, AccessPatternKind::Random);
        // %rd9 is never written: uniform across the warp
        assert_eq!(sites[0].pattern.pattern_type, AccessPatternKind::Broadcast);
    }

    #[test]
    fn test_coalesced_input_is_untouched() {
        let opt = optimizer();
        let kernel = strided_kernel(4);
        let pattern = opt.dominant_pattern(&kernel);
        let result = opt.optimize_access_pattern(&kernel, &pattern);
        assert_eq!(result.kernel, kernel);
        assert_eq!(result.ptx_code, kernel.to_source());
        assert_eq!(result.estimated_improvement, 0.0);
    }

    fn staged(kernel: &Kernel) -> AccessOptimization {
        let opt = optimizer();
        opt.optimize_access_pattern(kernel, &opt.dominant_pattern(kernel))
    }

    #[test]
    fn test_strided_load_is_staged() {
        let opt = optimizer();
        let kernel = strided_kernel(16);
        let result = staged(&kernel);
        assert!((result.estimated_improvement - 3.0).abs() < 1e-9);
        assert!(result.ptx_code.contains("activemask.b32 %r_stage0_mask;"));
        assert!(result.ptx_code.contains("bar.warp.sync %r_stage0_mask;"));
        assert!(!result.ptx_code.contains("bar.warp.sync -1;"));
        // 32 warps x 4 rows of (32 + 1 padding) words
        assert!(result.kernel.header.iter().any(|l| l == ".shared .align 16 .b8 ptxtune_stage0[16896];"));
        assert!(result.kernel.header.contains(&".reg .b64 %rd_stage0_src;".to_string()));
        assert!(result.kernel.header.contains(&".reg .pred %p_stage0_tail;".to_string()));
        // four cooperative loads, the original load now reads shared memory
        let global_loads: Vec<&Instruction> = result.kernel.body.iter().filter(|i| i.opcode == "ld.global.b32").collect();
        assert_eq!(global_loads.len(), 4);
        assert!(result.kernel.body.iter().any(|i| i.opcode == "ld.shared.f32" && i.operands[0] == "%f1"));
        // the cooperative loads are unit stride
        let sites = opt.analyze_kernel(&result.kernel);
        for site in sites.iter().filter(|s| result.kernel.body[s.index].opcode == "ld.global.b32") {
            assert_eq!(site.lane_stride, Some(4));
        }
        // running again changes nothing: the fallback load sits behind a branch
        let again = staged(&result.kernel);
        assert_eq!(again.kernel, result.kernel);
        assert!(Kernel::parse(&result.ptx_code).is_ok());
    }

    #[test]
    fn test_staged_warp_index_is_linear_over_the_block() {
        let result = staged(&strided_kernel(16));
        let rendered: Vec<String> = result.kernel.body.iter().map(Instruction::render).collect();
        let at = |line: &str| rendered.iter().position(|l| l == line).unwrap();
        let z = at("mov.u32 %r_stage0_warp, %tid.z;");
        let y = at("mad.lo.u32 %r_stage0_warp, %r_stage0_warp, %r_stage0_dim, %r_stage0_tid;");
        let x = at("mov.u32 %r_stage0_tid, %tid.x;");
        let shift = at("shr.u32 %r_stage0_warp, %r_stage0_warp, 5;");
        assert!(z < y && y < x && x < shift);
        assert!(rendered.contains(&"mov.u32 %r_stage0_dim, %ntid.x;".to_string()));
        assert!(rendered.contains(&"mul.wide.u32 %rd_stage0_tile, %r_stage0_warp, 528;".to_string()));
    }

    #[test]
    fn test_last_chunk_is_trimmed_to_the_footprint() {
        let result = staged(&strided_kernel(16));
        let body = &result.kernel.body;
        // the footprint is (32 - 1) * 16 + 4 = 500 bytes; the last chunk starts at 384
        assert!(body.iter().any(|i| i.render() == "setp.lt.u32 %p_stage0_tail, %r_stage0_lane, 29;"));
        let loads: Vec<&Instruction> = body.iter().filter(|i| i.opcode == "ld.global.b32").collect();
        assert!(loads[..3].iter().all(|i| i.guard.is_none()));
        assert_eq!(loads[3].guard.as_deref(), Some("@%p_stage0_tail"));
        assert_eq!(loads[3].operands[1], "[%rd_stage0_src+384]");
        let stores: Vec<&Instruction> = body.iter().filter(|i| i.opcode == "st.shared.b32").collect();
        assert_eq!(stores[3].guard.as_deref(), Some("@%p_stage0_tail"));
        // padded rows: chunk j starts at j * 33 words
        assert_eq!(stores[1].operands[0], "[%rd_stage0_dst+132]");
        assert!(body.iter().any(|i| i.render() == "mad.lo.u32 %r_stage0_slot, %r_stage0_row, 1, %r_stage0_slot;"));
    }

    #[test]
    fn test_partial_warp_takes_the_original_load() {
        let result = staged(&strided_kernel(16));
        let body = &result.kernel.body;
        let branch = body.iter().position(|i| i.render() == "@%p_stage0_partial bra ptxtune_stage0_direct;").unwrap();
        let direct = body.iter().position(|i| i.label_name() == Some("ptxtune_stage0_direct")).unwrap();
        let done = body.iter().position(|i| i.label_name() == Some("ptxtune_stage0_done")).unwrap();
        assert!(branch < direct && direct + 2 == done);
        assert_eq!(body[direct + 1].render(), "ld.global.f32 %f1, [%rd3];");
        assert_eq!(body[direct - 1].render(), "bra.uni ptxtune_stage0_done;");
    }

    #[test]
    fn test_divergent_loads_are_not_staged() {
        let guarded_exit = Kernel::parse(
            "mov.u32 %r1, %tid.x;\nsetp.ge.u32 %p1, %r1, %r9;\n@%p1 ret;\nmul.wide.u32 %rd2, %r1, 16;\nadd.s64 %rd3, %rd1, %rd2;\nld.global.f32 %f1, [%rd3];",
        ).unwrap();
        let result = staged(&guarded_exit);
        assert_eq!(result.kernel, guarded_exit);
        assert!(result.optimization_steps.iter().any(|s| s.contains("divergent control flow")));

        let looped = Kernel::parse(
            "mov.u32 %r1, %tid.x;\nmul.wide.u32 %rd2, %r1, 16;\nLOOP:\nadd.s64 %rd3, %rd1, %rd2;\nld.global.f32 %f1, [%rd3];\nsetp.lt.u32 %p1, %r1, %r9;\n@%p1 bra LOOP;",
        ).unwrap();
        let result = staged(&looped);
        assert_eq!(result.kernel, looped);
        assert!(result.optimization_steps.iter().any(|s| s.contains("divergent control flow")));
    }

    #[test]
    fn test_outer_thread_index_addresses_are_not_staged() {
        let kernel = Kernel::parse(
            "mov.u32 %r1, %tid.x;\nmov.u32 %r2, %tid.y;\nmul.wide.u32 %rd2, %r1, 16;\nmul.wide.u32 %rd4, %r2, 512;\nadd.s64 %rd3, %rd1, %rd2;\nadd.s64 %rd3, %rd3, %rd4;\nld.global.f32 %f1, [%rd3];",
        ).unwrap();
        let result = staged(&kernel);
        assert_eq!(result.kernel, kernel);
        assert!(result.optimization_steps.iter().any(|s| s.contains("%tid.y or %tid.z")));
    }

    #[test]
    fn test_shared_memory_padding_and_buffering() {
        let opt = optimizer();
        let pattern = MemoryAccessPattern::coalesced(4);
        let cfg = opt.optimize_shared_memory(4096, &pattern, 4);
        assert_eq!(cfg.block_size, 256);
        assert_eq!(cfg.elements_per_thread, 8);
        assert_eq!(cfg.padding_size, 1);
        assert_ne!(((cfg.block_size + cfg.padding_size) * 4) % 128, 0);
        assert!(cfg.use_double_buffering);
        assert!(!opt.optimize_shared_memory(4096, &pattern, 1).use_double_buffering);

        let small = MemoryOptimizer::new(MemoryConfig { shared_memory_per_block: 2048, ..Default::default() });
        let cfg = small.optimize_shared_memory(4096, &pattern, 4);
        assert!(cfg.footprint_bytes <= 2048);
        assert!(!cfg.use_double_buffering);
    }

    #[test]
    fn test_cache_strategy_and_prefetch() {
        let opt = optimizer();
        let strategy = opt.optimize_cache_usage(&MemoryAccessPattern::coalesced(4), 100.0);
        assert_eq!(strategy.prefetch_distance, 4);
        assert_eq!(strategy.cache_operator(), "cg");
        assert_eq!(opt.optimize_cache_usage(&MemoryAccessPattern::coalesced(4), 1.0).prefetch_distance, 16);
        assert_eq!(opt.optimize_cache_usage(&MemoryAccessPattern::random(4), 1.0).prefetch_distance, 0);
        // 512 KiB of L2 holds four lines ahead for 1024 threads
        let small_l2 = MemoryOptimizer::new(MemoryConfig { l2_cache_size: 512 * 1024, ..Default::default() });
        assert_eq!(small_l2.optimize_cache_usage(&MemoryAccessPattern::coalesced(4), 1.0).prefetch_distance, 4);

        let kernel = Kernel::parse("LOOP:\nld.global.f32 %f1, [%rd1+8];\nadd.s64 %rd1, %rd1, 4;\n@%p1 bra LOOP;\nret;").unwrap();
        let applied = opt.apply_cache_strategy(&kernel, &strategy);
        assert_eq!(applied.body[1].render(), "prefetch.global.L2 [%rd1+24];");
        assert_eq!(applied.body[2].opcode, "ld.global.cg.f32");
    }

    #[test]
    fn test_strided_lines_prefer_l1_only_when_they_fit() {
        let strided = optimizer().classify(&lanes(16), 4);
        assert!(optimizer().optimize_cache_usage(&strided, 10.0).prefer_l1_cache);
        let tiny_l1 = MemoryOptimizer::new(MemoryConfig { l1_cache_size: 64 * 1024, ..Default::default() });
        let strategy = tiny_l1.optimize_cache_usage(&strided, 10.0);
        assert!(!strategy.prefer_l1_cache);
        assert_eq!(strategy.cache_operator(), "cg");
    }

    #[test]
    fn test_read_only_path_requires_no_global_stores() {
        let opt = optimizer();
        let broadcast = opt.classify(&[64; 32], 4);
        let strategy = opt.optimize_cache_usage(&broadcast, 10.0);
        assert!(strategy.use_texture_cache);
        let pure = Kernel::parse("ld.global.f32 %f1, [%rd1];").unwrap();
        assert_eq!(opt.apply_cache_strategy(&pure, &strategy).body[0].opcode, "ld.global.nc.f32");
        let writes = Kernel::parse("ld.global.f32 %f1, [%rd1];\nst.global.f32 [%rd2], %f1;").unwrap();
        assert_eq!(opt.apply_cache_strategy(&writes, &strategy).body[0].opcode, "ld.global.ca.f32");
    }
}
