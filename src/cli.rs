use crate::config::config::HarnessConfig;
use crate::config::validator::validate_script;
use crate::core::script::Script;
use crate::exec::executor::{PhaseExecutor, RunReport};
use crate::observability::metrics::get_metrics;
use crate::targets::registry::{list_targets, target_for};
use crate::testing::scenarios;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script against its registered target library
    Run {
        /// Script file (JSON)
        #[arg(long)]
        script: PathBuf,
        /// Harness config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a script without running it
    Validate {
        /// Script file (JSON)
        #[arg(long)]
        script: PathBuf,
        /// Harness config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the built-in scenarios
    Scenarios {
        /// Run a single scenario by name
        #[arg(long)]
        name: Option<String>,
        /// Print Prometheus metrics after the runs
        #[arg(long)]
        metrics: bool,
        /// Harness config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List registered target libraries and their handle kinds
    Targets,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            script,
            config,
            json,
        } => run_script(&script, config.as_deref(), json)?,
        Commands::Validate { script, config } => validate(&script, config.as_deref())?,
        Commands::Scenarios {
            name,
            metrics,
            config,
        } => run_scenarios(name.as_deref(), metrics, config.as_deref())?,
        Commands::Targets => {
            print_targets()?;
            0
        }
    };
    std::process::exit(code);
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    HarnessConfig::load_or_default(path).context("loading harness config")
}

fn run_script(path: &Path, config: Option<&Path>, json: bool) -> Result<i32> {
    let config = load_config(config)?;
    let script = Script::load(path).with_context(|| format!("loading {}", path.display()))?;
    let library = target_for(&script.library)?;
    let executor = PhaseExecutor::new(config)?;

    // Scripts the validator rejects still get a classified exit code.
    let report = match executor.execute(&script, library) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(executor.run_entry(&script, target_for(&script.library)?));
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.exit_code())
}

fn print_report(report: &RunReport) {
    println!(
        "{} [{}] run {}: {:?} in {}ms (exit {})",
        report.script,
        report.library,
        report.run_id,
        report.outcome(),
        report.duration_ms,
        report.exit_code()
    );
    for timing in &report.phases {
        println!(
            "  {:<10} {:>3} ops {:>6}ms",
            timing.phase.as_str(),
            timing.operations,
            timing.duration_ms
        );
    }
    if let Some(error) = report.error() {
        println!("  error: {}", error);
    }
    println!("  {}", handle_summary(report));
    println!(
        "  record: {} entries, digest {}",
        report.record.len(),
        report.record_digest
    );
}

fn handle_summary(report: &RunReport) -> String {
    format!(
        "handles: {} tracked, {} leaked; teardown: {} steps, {} fallbacks",
        report.handles.len(),
        report.leaked.len(),
        report.teardown.steps.len(),
        report.teardown.fallbacks.len()
    )
}

fn validate(path: &Path, config: Option<&Path>) -> Result<i32> {
    let config = load_config(config)?;
    let script = Script::load(path).with_context(|| format!("loading {}", path.display()))?;
    let result = validate_script(&script, false)?;
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
    if target_for(&script.library).is_err() {
        println!("error: no target library registered as '{}'", script.library);
        return Ok(1);
    }
    if result.is_valid() {
        println!(
            "{}: ok ({} operations, strict mode {})",
            script.name,
            script.operations.len(),
            if config.strict_mode { "on" } else { "off" }
        );
        Ok(0)
    } else {
        Ok(1)
    }
}

fn run_scenarios(name: Option<&str>, metrics: bool, config: Option<&Path>) -> Result<i32> {
    let config = load_config(config)?;
    let selected = match name {
        Some(name) => vec![scenarios::find(name)?],
        None => scenarios::builtin(),
    };

    let mut mismatches = 0;
    for scenario in &selected {
        let report = scenarios::run_script(&config, &scenario.script)?;
        let matched = scenario.matches(&report);
        if !matched {
            mismatches += 1;
        }
        println!(
            "{:<24} {:<8} {:?} (exit {}, {}ms)",
            scenario.name,
            if matched { "ok" } else { "MISMATCH" },
            report.outcome(),
            report.exit_code(),
            report.duration_ms
        );
        if !matched {
            if let Some(error) = report.error() {
                println!("    {}", error);
            }
        }
    }

    if metrics {
        println!();
        print!("{}", get_metrics().export_prometheus());
    }
    Ok(if mismatches == 0 { 0 } else { 1 })
}

fn print_targets() -> Result<()> {
    for (name, version) in list_targets() {
        let library = target_for(name)?;
        let kinds: Vec<String> = library
            .kinds()
            .iter()
            .map(|kind| {
                let destructor = library.destructor(kind).unwrap_or("-");
                format!("{} ({})", kind, destructor)
            })
            .collect();
        println!("{} {}", name, version);
        for kind in kinds {
            println!("  {}", kind);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_summary_counts_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::default().with_workspace_root(dir.path().to_path_buf());
        let report = scenarios::run_script(&config, &scenarios::malformed_parse()).unwrap();
        let summary = handle_summary(&report);
        assert!(summary.contains("0 leaked"), "{}", summary);
        assert!(summary.contains("teardown: 1 steps"), "{}", summary);
        assert!(summary.ends_with("0 fallbacks"), "{}", summary);
    }
}
