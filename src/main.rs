use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use chrono::Local;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ptxtune::config::{StrategyKind, TunerConfig};
use ptxtune::optimizer::benchmark::Workload;
use ptxtune::{HardwareProfile, KernelPipeline};

const USAGE: &str = "Usage: ptxtune <kernel.ptx> [--arch sm_86|sm_80|gfx90a] [--config cfg.json] \
[--strategy genetic|random|model] [--out result.json]";

struct Args {
    kernel: PathBuf,
    arch: String,
    config: Option<PathBuf>,
    strategy: Option<StrategyKind>,
    out: PathBuf,
}

fn parse_args(args: &[String]) -> Result<Args, Box<dyn std::error::Error>> {
    let mut kernel = None;
    let mut arch = "sm_86".to_string();
    let mut config = None;
    let mut strategy = None;
    let mut out = PathBuf::from("ptxtune_result.json");

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = || it.next().cloned().ok_or_else(|| format!("{} needs a value\n{}", arg, USAGE));
        match arg.as_str() {
            "--arch" => arch = value()?,
            "--config" => config = Some(PathBuf::from(value()?)),
            "--strategy" => strategy = Some(value()?.parse::<StrategyKind>()?),
            "--out" => out = PathBuf::from(value()?),
            "-h" | "--help" => return Err(USAGE.into()),
            other if other.starts_with("--") => return Err(format!("unknown option {}\n{}", other, USAGE).into()),
            other => kernel = Some(PathBuf::from(other)),
        }
    }
    let kernel = kernel.ok_or(USAGE)?;
    Ok(Args { kernel, arch, config, strategy, out })
}

fn load_config(path: Option<&Path>) -> ptxtune::Result<TunerConfig> {
    let config = match path {
        Some(p) => TunerConfig::from_file(p)?,
        None => TunerConfig::default(),
    };
    config.apply_env()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let mut config = load_config(args.config.as_deref())?;
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    let hardware = HardwareProfile::by_arch(&args.arch)
        .ok_or_else(|| format!("unknown architecture {} (expected sm_86, sm_80 or gfx90a)", args.arch))?;

    let source = fs::read_to_string(&args.kernel)?;
    info!("[Tuner] tuning {} for {} ({})", args.kernel.display(), hardware.name, hardware.arch);

    let pipeline = KernelPipeline::simulated(hardware.clone(), config.clone(), Workload::default());
    let result = pipeline.optimize_kernel(&source)?;

    println!("Kernel:      {}", result.kernel_name);
    println!("Best config: {}", result.best_config.describe());
    println!("Metric:      {:.4}", result.performance_metric);
    println!("Termination: {:?}{}", result.termination, if result.from_cache { " (cached)" } else { "" });
    println!("Evaluations: {}", result.evaluations);
    for line in &result.optimization_log {
        println!("  - {}", line);
    }

    let report = json!({
        "timestamp": Local::now().to_rfc3339(),
        "kernel_path": args.kernel.display().to_string(),
        "hardware": hardware,
        "strategy": config.search_strategy(),
        "result": result,
    });
    fs::write(&args.out, serde_json::to_string_pretty(&report)?)?;
    println!("Results saved to {}", args.out.display());
    Ok(())
}
