//! Bring a configured system up, push frames through it and report.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cadence_config::{SystemConfig, validate_system};
use clap::Args;

use crate::runtime::{RunningSystem, SinkReport};

/// Run a system of containers with synthetic input.
#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the system TOML file
    pub file: PathBuf,

    /// Frames to push into every entry input
    #[arg(short, long, default_value = "8")]
    pub frames: usize,

    /// How long to wait for frames to reach the terminal outputs, in ms
    #[arg(long, default_value = "2000")]
    pub wait_ms: u64,

    /// Timeout for each command acknowledgement, in ms
    #[arg(long, default_value = "1000")]
    pub timeout_ms: u64,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

struct PathReport {
    id: u32,
    algo_us: u32,
    ext_in_us: u32,
    ext_out_us: u32,
    total_us: u32,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> anyhow::Result<()> {
    let config = SystemConfig::load(&args.file)
        .with_context(|| format!("loading {}", args.file.display()))?;
    validate_system(&config).with_context(|| format!("{} is invalid", args.file.display()))?;

    let mut system =
        RunningSystem::launch(config, Duration::from_millis(args.timeout_ms))?;

    let fed = system.feed(args.frames)?;
    let sinks = system.collect(args.frames, Duration::from_millis(args.wait_ms));

    let mut paths = Vec::new();
    for path in &system.config().paths {
        let d = system.path_delay(&path.vertices)?;
        paths.push(PathReport {
            id: path.id,
            algo_us: d.algo_us,
            ext_in_us: d.ext_in_us,
            ext_out_us: d.ext_out_us,
            total_us: d.total_us(),
        });
    }

    if args.json {
        let report = to_json(&system, fed, args.frames, &sinks, &paths);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&system, fed, args.frames, &sinks, &paths);
    }

    system.shutdown();
    Ok(())
}

fn print_text(
    system: &RunningSystem,
    fed: usize,
    frames: usize,
    sinks: &[SinkReport],
    paths: &[PathReport],
) {
    let config = system.config();
    println!("System: {}", config.name);
    println!();
    println!(
        "{:<16} {:>10} {:>10} {:>10} {:>4} {:>10}",
        "Container", "Frame us", "Period us", "Proc us", "RT", "Relaunches"
    );
    let relaunches = system.relaunches();
    for ((c, info), relaunched) in config
        .containers
        .iter()
        .zip(system.proc_info())
        .zip(relaunches)
    {
        println!(
            "{:<16} {:>10} {:>10} {:>10} {:>4} {:>10}",
            c.name,
            info.frame_us,
            info.period_us,
            info.proc_us,
            if info.real_time { "yes" } else { "no" },
            relaunched
        );
    }

    println!();
    println!("Fed {frames} frames into {fed} entry input(s)");
    for s in sinks {
        println!(
            "  {} received {} buffers ({} bytes, {} markers)",
            s.port, s.buffers, s.bytes, s.markers
        );
    }

    if !paths.is_empty() {
        println!();
        for p in paths {
            println!(
                "Path {}: {} us (algo {}, ingress {}, egress {})",
                p.id, p.total_us, p.algo_us, p.ext_in_us, p.ext_out_us
            );
        }
    }
}

fn to_json(
    system: &RunningSystem,
    fed: usize,
    frames: usize,
    sinks: &[SinkReport],
    paths: &[PathReport],
) -> serde_json::Value {
    let config = system.config();
    let containers: Vec<serde_json::Value> = config
        .containers
        .iter()
        .zip(system.proc_info())
        .zip(system.relaunches())
        .map(|((c, info), relaunches)| {
            serde_json::json!({
                "name": c.name,
                "instance": c.instance,
                "frame_us": info.frame_us,
                "period_us": info.period_us,
                "proc_us": info.proc_us,
                "real_time": info.real_time,
                "relaunches": relaunches,
            })
        })
        .collect();

    serde_json::json!({
        "system": config.name,
        "frames": frames,
        "fed_inputs": fed,
        "containers": containers,
        "sinks": sinks.iter().map(|s| serde_json::json!({
            "port": s.port.to_string(),
            "buffers": s.buffers,
            "bytes": s.bytes,
            "markers": s.markers,
        })).collect::<Vec<_>>(),
        "paths": paths.iter().map(|p| serde_json::json!({
            "id": p.id,
            "algo_us": p.algo_us,
            "ext_in_us": p.ext_in_us,
            "ext_out_us": p.ext_out_us,
            "total_us": p.total_us,
        })).collect::<Vec<_>>(),
    })
}
