//! Check configuration files without running anything.

use std::path::PathBuf;

use anyhow::Context;
use cadence_config::{
    ContainerConfig, SystemConfig, ValidationError, validate_container, validate_system,
};
use clap::Args;

/// Validate a system or container configuration.
#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the TOML file
    pub file: PathBuf,

    /// Treat the file as a single container instead of a system
    #[arg(long)]
    pub container: bool,
}

/// Run the validate command.
pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let result = if args.container {
        let config = ContainerConfig::load(&args.file)
            .with_context(|| format!("loading {}", args.file.display()))?;
        println!("Container:   {} (0x{:X})", config.name, config.instance);
        print_graph_summary(&config);
        validate_container(&config)
    } else {
        let system = SystemConfig::load(&args.file)
            .with_context(|| format!("loading {}", args.file.display()))?;
        println!("System:      {}", display_name(&system.name));
        println!("Containers:  {}", system.containers.len());
        println!("Connections: {}", system.connections.len());
        println!("Paths:       {}", system.paths.len());
        for container in &system.containers {
            println!();
            println!("Container:   {} (0x{:X})", container.name, container.instance);
            print_graph_summary(container);
        }
        validate_system(&system)
    };

    match result {
        Ok(()) => {
            println!();
            println!("OK");
            Ok(())
        }
        Err(err) => {
            println!();
            for problem in problems(&err) {
                println!("error: {problem}");
            }
            anyhow::bail!("{} is invalid", args.file.display())
        }
    }
}

fn print_graph_summary(config: &ContainerConfig) {
    let g = &config.graph;
    println!("  Subgraphs: {}", g.subgraphs.len());
    println!("  Modules:   {}", g.modules.len());
    println!(
        "  External:  {} in, {} out, {} control",
        g.external_inputs.len(),
        g.external_outputs.len(),
        g.external_controls.len()
    );
}

fn display_name(name: &str) -> &str {
    if name.is_empty() { "(unnamed)" } else { name }
}

fn problems(err: &ValidationError) -> Vec<String> {
    match err {
        ValidationError::Multiple(errs) => errs.iter().map(ToString::to_string).collect(),
        other => vec![other.to_string()],
    }
}
