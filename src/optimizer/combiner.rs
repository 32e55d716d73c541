use tracing::{debug, info, warn};
use crate::core::config::{KernelConfig, TuningParameter};
use crate::core::instruction::Kernel;
use crate::optimizer::benchmark::TrialRunner;
use crate::optimizer::memory::SharedMemoryConfig;
use crate::optimizer::policy::TuningConstraints;
use crate::optimizer::scheduler::InstructionScheduler;
use crate::optimizer::HardwareProfile;

pub const PARAM_DOUBLE_BUFFER: &str = "double_buffer";

/// A kernel body produced by the memory optimizer, or the untouched original.
#[derive(Debug, Clone)]
pub struct MemoryVariant {
    pub label: String,
    pub kernel: Kernel,
    pub estimated_improvement: f64,
}

#[derive(Debug, Clone)]
pub struct Combination {
    pub label: String,
    pub memory: String,
    pub scheduled: bool,
    pub double_buffered: bool,
    pub source: String,
    pub config: KernelConfig,
    /// `(1 + estimated_improvement) * estimated_speedup`. Used for ordering only.
    pub estimate: f64,
    pub measured: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct CombineOutcome {
    pub best: Option<Combination>,
    pub dropped: usize,
    pub measurements: usize,
    pub log: Vec<String>,
}

/// Bytes of statically declared `.shared` storage in the kernel header.
pub fn static_shared_bytes(kernel: &Kernel) -> usize {
    kernel.header.iter()
        .filter(|l| l.trim_start().starts_with(".shared"))
        .filter_map(|l| {
            let open = l.rfind('[')?;
            let close = l[open..].find(']')? + open;
            l[open + 1..close].trim().parse::<usize>().ok()
        })
        .sum()
}

pub struct ConfigCombiner {
    pub constraints: TuningConstraints,
    pub hardware: HardwareProfile,
    pub measure_budget: usize,
}

impl ConfigCombiner {
    pub fn new(constraints: TuningConstraints, hardware: HardwareProfile, measure_budget: usize) -> Self {
        Self { constraints, hardware, measure_budget }
    }

    /// Memory variant x schedule variant x double buffering. Schedules identical to the
    /// source order are not duplicated, and double buffering is only offered for
    /// variants that stage through shared memory when the tiling allows it.
    pub fn enumerate(
        &self,
        variants: &[MemoryVariant],
        scheduler: &InstructionScheduler,
        shared: &SharedMemoryConfig,
        base: &KernelConfig,
    ) -> Vec<Combination> {
        let mut out = Vec::new();
        for variant in variants {
            let original = variant.kernel.to_source();
            let scheduled = scheduler.optimize_scheduling(&variant.kernel);
            let mut schedules = vec![(false, variant.kernel.clone(), 1.0)];
            if scheduled.optimized_source != original {
                schedules.push((true, scheduled.kernel.clone(), scheduled.estimated_speedup));
            }

            for (is_scheduled, kernel, speedup) in schedules {
                let static_bytes = static_shared_bytes(&kernel);
                let registers = scheduler
                    .optimize_register_allocation(&kernel, scheduler.max_registers)
                    .total_registers_used as u32;
                let buffering: &[bool] = if static_bytes > 0 && shared.use_double_buffering {
                    &[false, true]
                } else {
                    &[false]
                };
                for &double_buffered in buffering {
                    let mut config = base.clone();
                    config.shared_memory_size += static_bytes * if double_buffered { 2 } else { 1 };
                    config.registers_per_thread = config.registers_per_thread.max(registers);
                    config.parameters.push(
                        TuningParameter::new(PARAM_DOUBLE_BUFFER, &[0, 1]).with_value(double_buffered as i64),
                    );
                    let label = format!(
                        "{}{}{}",
                        variant.label,
                        if is_scheduled { "+scheduled" } else { "" },
                        if double_buffered { "+double-buffered" } else { "" },
                    );
                    out.push(Combination {
                        label,
                        memory: variant.label.clone(),
                        scheduled: is_scheduled,
                        double_buffered,
                        source: kernel.to_source(),
                        config,
                        estimate: (1.0 + variant.estimated_improvement) * speedup,
                        measured: None,
                    });
                }
            }
        }
        out
    }

    /// Drops invalid combinations, then measures the most promising ones within the
    /// budget. Without a runner or budget the best estimate is returned unmeasured.
    pub fn select(&self, combinations: Vec<Combination>, runner: Option<&TrialRunner>) -> CombineOutcome {
        let mut outcome = CombineOutcome::default();
        let mut valid: Vec<Combination> = Vec::new();
        for c in combinations {
            match self.constraints.check(&c.config, &self.hardware) {
                Ok(()) => valid.push(c),
                Err(v) => {
                    outcome.dropped += 1;
                    outcome.log.push(format!("{} dropped: {}", c.label, v));
                }
            }
        }
        // Stable sort keeps enumeration order among equal estimates, so the plainer
        // variant wins ties.
        valid.sort_by(|a, b| b.estimate.total_cmp(&a.estimate));

        if valid.is_empty() {
            warn!("[Combiner] every combination violates the constraints");
            outcome.log.push("no valid combination".to_string());
            return outcome;
        }

        let budget = if runner.is_some() { self.measure_budget.min(valid.len()) } else { 0 };
        if let Some(runner) = runner {
            for c in valid.iter_mut().take(budget) {
                outcome.measurements += 1;
                match runner.run_exclusive(&c.source, &c.config) {
                    Ok(score) if score.is_finite() => {
                        debug!("[Combiner] {} measured {:.4}", c.label, score);
                        outcome.log.push(format!("{} measured {:.4} (estimate {:.2})", c.label, score, c.estimate));
                        c.measured = Some(score);
                    }
                    Ok(_) => outcome.log.push(format!("{} produced a non-finite score", c.label)),
                    Err(e) => outcome.log.push(format!("{} failed: {}", c.label, e)),
                }
            }
        }

        // Earlier (better-estimated) combinations win ties between measurements.
        let mut measured_best: Option<&Combination> = None;
        for c in valid.iter().filter(|c| c.measured.is_some()) {
            if measured_best.map_or(true, |b| c.measured > b.measured) {
                measured_best = Some(c);
            }
        }
        let best = measured_best.unwrap_or(&valid[0]).clone();

        info!(
            "[Combiner] selected {} ({})",
            best.label,
            match best.measured {
                Some(m) => format!("measured {:.4}", m),
                None => format!("estimate {:.2}, unmeasured", best.estimate),
            }
        );
        outcome.log.push(format!("selected {}", best.label));
        outcome.best = Some(best);
        outcome
    }
}
