//! Thread-block candidates derived from what a kernel does.

use serde::{Serialize, Deserialize};
use tracing::debug;
use crate::core::config::{Dim3, TuningParameter};
use crate::core::instruction::{InstructionKind, Kernel};
use crate::optimizer::combiner::static_shared_bytes;
use crate::optimizer::memory::{AccessPatternKind, MemoryOptimizer};
use crate::optimizer::policy::{LaunchTemplate, ParameterSpace, PARAM_BLOCK_X, PARAM_BLOCK_Y, PARAM_REGISTERS};
use crate::optimizer::scheduler::InstructionScheduler;
use crate::optimizer::HardwareProfile;

/// Below this many arithmetic instructions per global access a kernel waits on memory.
const MEMORY_BOUND_INTENSITY: f64 = 4.0;
/// Warps per block a memory-bound kernel needs to keep enough loads in flight.
const MIN_WARPS_MEMORY_BOUND: u32 = 4;
/// Compute-bound blocks stay at or below this so registers remain for unrolling.
const MAX_THREADS_COMPUTE_BOUND: u32 = 512;
const PROBLEM_SIZE: u32 = 1 << 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelFeatures {
    /// Arithmetic instructions per global load or store.
    pub compute_intensity: f64,
    pub access_pattern: AccessPatternKind,
    pub register_usage: usize,
    /// Statically declared shared memory in bytes.
    pub shared_memory_usage: usize,
    /// Indexes threads by `%tid.y` or `%tid.z`.
    pub multidimensional: bool,
}

impl KernelFeatures {
    pub fn is_memory_bound(&self) -> bool {
        self.compute_intensity < MEMORY_BOUND_INTENSITY
            || matches!(self.access_pattern, AccessPatternKind::Strided | AccessPatternKind::Random)
    }
}

pub fn analyze_kernel_features(kernel: &Kernel, memory: &MemoryOptimizer, scheduler: &InstructionScheduler) -> KernelFeatures {
    let global = memory.analyze_kernel(kernel).len();
    let arithmetic = kernel.body.iter()
        .filter(|i| matches!(i.kind, InstructionKind::Arithmetic | InstructionKind::Special))
        .count();
    let multidimensional = kernel.body.iter()
        .flat_map(|i| i.operands.iter())
        .any(|op| op.contains("%tid.y") || op.contains("%tid.z"));
    KernelFeatures {
        compute_intensity: arithmetic as f64 / global.max(1) as f64,
        access_pattern: memory.dominant_pattern(kernel).pattern_type,
        register_usage: scheduler.optimize_register_allocation(kernel, scheduler.max_registers).total_registers_used,
        shared_memory_usage: static_shared_bytes(kernel),
        multidimensional,
    }
}

/// Block shapes and register budgets worth trying for a kernel with `features` on `hw`.
pub fn thread_block_space(hw: &HardwareProfile, features: &KernelFeatures) -> ParameterSpace {
    let warp = hw.warp_size.max(1);
    let max_threads = hw.max_threads_per_block.max(warp);

    let mut min_threads = warp;
    let mut max_block = max_threads;
    if features.is_memory_bound() {
        min_threads = min_threads.max(MIN_WARPS_MEMORY_BOUND * warp);
    } else {
        max_block = max_block.min(MAX_THREADS_COMPUTE_BOUND.max(warp));
    }
    // Few blocks fit next to a large static buffer, so each must bring more warps.
    if features.shared_memory_usage > 0 {
        let resident = (hw.shared_memory_per_sm / features.shared_memory_usage).max(1) as u32;
        let warps = hw.max_warps_per_sm.div_ceil(resident.min(hw.max_blocks_per_sm.max(1)));
        min_threads = min_threads.max(warps * warp);
    }

    let base_registers = features.register_usage.next_power_of_two().max(32) as i64;
    let registers: Vec<i64> = [base_registers, base_registers * 2]
        .into_iter()
        .filter(|&r| r <= hw.max_registers_per_thread as i64)
        .collect();
    let registers = if registers.is_empty() { vec![hw.max_registers_per_thread as i64] } else { registers };
    let fewest_registers = registers[0] as u64;

    let mut block_x: Vec<i64> = std::iter::successors(Some(warp), |&b| b.checked_mul(2))
        .take_while(|&b| b <= max_threads)
        .filter(|&b| b <= max_block && b >= min_threads.min(max_threads))
        .filter(|&b| b as u64 * fewest_registers <= hw.registers_per_sm as u64)
        .map(i64::from)
        .collect();
    if block_x.is_empty() {
        block_x.push(warp as i64);
    }
    let block_y: &[i64] = if features.multidimensional { &[1, 2, 4] } else { &[1] };

    debug!(
        "[Tuner] block candidates x {:?}, y {:?}, registers {:?} (intensity {:.2}, {:?})",
        block_x, block_y, registers, features.compute_intensity, features.access_pattern
    );
    ParameterSpace::new(vec![
        TuningParameter::new(PARAM_BLOCK_X, &block_x),
        TuningParameter::new(PARAM_BLOCK_Y, block_y),
        TuningParameter::new(PARAM_REGISTERS, &registers),
    ]).with_template(LaunchTemplate { problem_size: Dim3::linear(PROBLEM_SIZE), ..Default::default() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::memory::MemoryConfig;
    use crate::optimizer::scheduler::ILPConfig;

    fn features(kernel: &str) -> KernelFeatures {
        let kernel = Kernel::parse(kernel).unwrap();
        let memory = MemoryOptimizer::new(MemoryConfig::default());
        let scheduler = InstructionScheduler::new(ILPConfig::default(), 255);
        analyze_kernel_features(&kernel, &memory, &scheduler)
    }

    fn values(space: &ParameterSpace, name: &str) -> Vec<i64> {
        space.parameters.iter().find(|p| p.name == name).unwrap().possible_values.clone()
    }

    const COPY: &str = "mov.u32 %r1, %tid.x;\nmul.wide.u32 %rd3, %r1, 4;\nadd.s64 %rd4, %rd1, %rd3;\nadd.s64 %rd5, %rd2, %rd3;\nld.global.f32 %f1, [%rd4];\nst.global.f32 [%rd5], %f1;\nret;";

    #[test]
    fn test_memory_bound_kernel_gets_wide_blocks() {
        let f = features(COPY);
        assert!((f.compute_intensity - 2.0).abs() < 1e-9);
        assert!(f.is_memory_bound());
        assert!(!f.multidimensional);
        let space = thread_block_space(&HardwareProfile::rtx3070(), &f);
        assert_eq!(values(&space, PARAM_BLOCK_X), vec![128, 256, 512, 1024]);
        assert_eq!(values(&space, PARAM_BLOCK_Y), vec![1]);
        assert_eq!(values(&space, PARAM_REGISTERS), vec![32, 64]);
    }

    #[test]
    fn test_compute_bound_kernel_keeps_blocks_small() {
        let mut body = String::from("mov.u32 %r1, %tid.x;\nmov.u32 %r2, %tid.y;\nld.global.f32 %f1, [%rd1];\n");
        for _ in 0..12 {
            body.push_str("fma.rn.f32 %f1, %f1, %f1, %f1;\n");
        }
        let f = features(&body);
        assert!(!f.is_memory_bound());
        assert!(f.multidimensional);
        let space = thread_block_space(&HardwareProfile::rtx3070(), &f);
        assert_eq!(values(&space, PARAM_BLOCK_X), vec![32, 64, 128, 256, 512]);
        assert_eq!(values(&space, PARAM_BLOCK_Y), vec![1, 2, 4]);
    }

    #[test]
    fn test_large_static_buffer_raises_the_smallest_block() {
        let hw = HardwareProfile::rtx3070();
        let f = KernelFeatures {
            compute_intensity: 2.0,
            access_pattern: AccessPatternKind::Coalesced,
            register_usage: 8,
            shared_memory_usage: 48 * 1024,
            multidimensional: false,
        };
        // two blocks per SM by shared memory, 48 warps to fill: 24 warps per block
        assert_eq!(values(&thread_block_space(&hw, &f), PARAM_BLOCK_X), vec![1024]);
    }

    #[test]
    fn test_heavy_register_use_bounds_blocks_and_budgets() {
        let hw = HardwareProfile::rtx3070();
        let f = KernelFeatures {
            compute_intensity: 8.0,
            access_pattern: AccessPatternKind::Coalesced,
            register_usage: 150,
            shared_memory_usage: 0,
            multidimensional: false,
        };
        let space = thread_block_space(&hw, &f);
        assert_eq!(values(&space, PARAM_REGISTERS), vec![255]);
        // 255 registers: 65536 / 255 leaves room for 256 threads
        assert_eq!(values(&space, PARAM_BLOCK_X), vec![32, 64, 128, 256]);
    }
}
