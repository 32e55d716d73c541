use ptxtune::config::TunerConfig;
use ptxtune::core::cache::ResultCache;
use ptxtune::optimizer::benchmark::Workload;
use ptxtune::optimizer::memory::{AccessPatternKind, MemoryConfig, MemoryOptimizer};
use ptxtune::optimizer::scheduler::{ILPConfig, InstructionScheduler};
use ptxtune::optimizer::search::GeneticParams;
use ptxtune::{HardwareProfile, Kernel, KernelPipeline, TunerState};

const COPY: &str = r#"
.visible .entry copy(
    .param .u64 src,
    .param .u64 dst
)
{
    ld.param.u64 %rd1, [src];
    ld.param.u64 %rd2, [dst];
    mov.u32 %r1, %tid.x;
    mul.wide.u32 %rd3, %r1, 4;
    add.s64 %rd4, %rd1, %rd3;
    add.s64 %rd5, %rd2, %rd3;
    ld.global.f32 %f1, [%rd4];
    st.global.f32 [%rd5], %f1;
    ret;
}
"#;

const GATHER: &str = r#"
.visible .entry gather(
    .param .u64 src,
    .param .u64 dst
)
{
    ld.param.u64 %rd1, [src];
    ld.param.u64 %rd2, [dst];
    mov.u32 %r1, %tid.x;
    mul.wide.u32 %rd3, %r1, 16;
    add.s64 %rd4, %rd1, %rd3;
    ld.global.f32 %f1, [%rd4];
    ld.global.f32 %f2, [%rd4+4];
    mul.f32 %f3, %f1, %f2;
    mul.wide.u32 %rd6, %r1, 4;
    add.s64 %rd5, %rd2, %rd6;
    st.global.f32 [%rd5], %f3;
    ret;
}
"#;

fn config(dir: &std::path::Path) -> TunerConfig {
    TunerConfig {
        cache_dir: Some(dir.to_path_buf()),
        samples_per_trial: 1,
        measure_budget: 8,
        genetic: GeneticParams { population_size: 8, num_generations: 8, ..Default::default() },
        ..Default::default()
    }
}

#[test]
fn test_coalesced_kernel_is_left_alone_by_memory_optimizer() {
    let kernel = Kernel::parse(COPY).unwrap();
    let opt = MemoryOptimizer::new(MemoryConfig::default());
    let pattern = opt.dominant_pattern(&kernel);
    assert_eq!(pattern.pattern_type, AccessPatternKind::Coalesced);
    let result = opt.optimize_access_pattern(&kernel, &pattern);
    assert_eq!(result.ptx_code, kernel.to_source());
    assert_eq!(result.estimated_improvement, 0.0);
}

#[test]
fn test_scheduler_output_is_a_parseable_permutation() {
    let kernel = Kernel::parse(GATHER).unwrap();
    let scheduler = InstructionScheduler::new(ILPConfig::default(), 255);
    let result = scheduler.optimize_scheduling(&kernel);
    let reparsed = Kernel::parse(&result.optimized_source).unwrap();
    let mut before: Vec<String> = kernel.body.iter().map(|i| i.render()).collect();
    let mut after: Vec<String> = reparsed.body.iter().map(|i| i.render()).collect();
    before.sort();
    after.sort();
    assert_eq!(before, after);
    assert!(result.estimated_speedup >= 1.0);
    assert_eq!(reparsed.body.last().map(|i| i.opcode.as_str()), Some("ret"));
}

#[test]
fn test_pipeline_end_to_end_and_cached_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let hw = HardwareProfile::rtx3070();
    let pipeline = KernelPipeline::simulated(hw.clone(), config(dir.path()), Workload::default());

    let result = pipeline.optimize_kernel(GATHER).unwrap();
    assert_eq!(result.kernel_name, "gather");
    assert!(result.is_measured());
    assert!(!result.from_cache);
    assert_ne!(result.termination, TunerState::Cancelled);
    assert!(pipeline.constraints.check(&result.best_config, &hw).is_ok());
    let source = result.optimized_source.clone().unwrap();
    assert!(Kernel::parse(&source).is_ok());
    assert!(result.optimization_log.iter().any(|l| l.contains("dominant access Strided")));
    assert!(result.evaluations > 0);

    assert_eq!(ResultCache::in_dir(dir.path()).len(), 1);
    let again = pipeline.optimize_kernel(GATHER).unwrap();
    assert!(again.from_cache);
    assert_eq!(again.evaluations, 0);
    assert_eq!(again.best_config, result.best_config);
    assert_eq!(again.optimized_source, result.optimized_source);
}

#[test]
fn test_pipeline_on_coalesced_kernel_keeps_its_memory_accesses() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.use_result_cache = false;
    let pipeline = KernelPipeline::simulated(HardwareProfile::a100(), cfg, Workload::default());
    let result = pipeline.optimize_kernel(COPY).unwrap();
    assert!(result.is_measured());
    let optimized = Kernel::parse(&result.optimized_source.unwrap()).unwrap();
    assert!(!optimized.header.iter().any(|l| l.contains("ptxtune_stage")));
    assert!(ResultCache::in_dir(dir.path()).is_empty());
}
