use anyhow::{Context, Result};
use bench_runner::{BenchConfig, CaseRepository, RunCoordinator, WorkspaceManager};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "cairn-bench",
    version,
    about = "Benchmark matrix for file-access interception overhead"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full case x strategy matrix and archive the session
    Run {
        /// Configuration file (defaults to ./bench.yaml when present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the case root directory
        #[arg(long)]
        commands_dir: Option<PathBuf>,
        /// Override the warmup run count
        #[arg(long)]
        warmup: Option<u32>,
        /// Emit machine-readable JSON instead of log output
        #[arg(long)]
        json: bool,
    },
    /// List the discovered benchmark cases without running anything
    List {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        commands_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Remove harness residue
    Clean {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Restore the shared workspace to its baseline
        #[arg(long)]
        workspace: bool,
        /// Remove unarchived session directories under the benchmarks root
        #[arg(long)]
        sessions: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run_command(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            commands_dir,
            warmup,
            json,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(dir) = commands_dir {
                cfg.commands_dir = dir;
            }
            if let Some(warmup) = warmup {
                cfg.warmup = warmup;
            }
            let run = || -> Result<serde_json::Value> {
                let outcome = RunCoordinator::new(cfg.clone()).run()?;
                Ok(json!({
                    "ok": true,
                    "session": outcome.session,
                    "archive": outcome.archive,
                    "cases": outcome.cases,
                    "measurements": outcome.measurements,
                    "failures": outcome.failures,
                }))
            };
            if json {
                command_json_mode(run)
            } else {
                let payload = run()?;
                println!(
                    "session {} -> {} ({} measurements, {} failures)",
                    payload["session"].as_str().unwrap_or_default(),
                    payload["archive"].as_str().unwrap_or_default(),
                    payload["measurements"],
                    payload["failures"],
                );
                Ok(())
            }
        }
        Commands::List {
            config,
            commands_dir,
            json,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(dir) = commands_dir {
                cfg.commands_dir = dir;
            }
            let list = || -> Result<serde_json::Value> {
                let cases = CaseRepository::new(&cfg.commands_dir).list_cases()?;
                let entries: Vec<serde_json::Value> = cases
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id(),
                            "category": c.category,
                            "name": c.name,
                            "sweeps": c.sweeps(),
                        })
                    })
                    .collect();
                Ok(json!({ "ok": true, "cases": entries }))
            };
            if json {
                command_json_mode(list)
            } else {
                let payload = list()?;
                if let Some(cases) = payload["cases"].as_array() {
                    for case in cases {
                        let id = case["id"].as_str().unwrap_or_default();
                        if case["sweeps"].as_bool().unwrap_or(false) {
                            println!("{} [sweep]", id);
                        } else {
                            println!("{}", id);
                        }
                    }
                }
                Ok(())
            }
        }
        Commands::Clean {
            config,
            workspace,
            sessions,
            json,
        } => {
            let cfg = load_config(config.as_deref())?;
            let clean = || -> Result<serde_json::Value> {
                let mut removed_sessions = 0usize;
                if workspace {
                    let manager = WorkspaceManager::new(&cfg.workspace_dir)?;
                    manager.restore().context("restoring workspace baseline")?;
                }
                if sessions {
                    removed_sessions = remove_session_dirs(&cfg.benchmarks_dir)?;
                }
                Ok(json!({
                    "ok": true,
                    "workspace_restored": workspace,
                    "sessions_removed": removed_sessions,
                }))
            };
            if json {
                command_json_mode(clean)
            } else {
                let payload = clean()?;
                println!(
                    "workspace restored: {}, sessions removed: {}",
                    payload["workspace_restored"], payload["sessions_removed"],
                );
                Ok(())
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<BenchConfig> {
    match path {
        Some(path) => Ok(BenchConfig::load(path)?),
        None => {
            let default = Path::new("bench.yaml");
            if default.is_file() {
                Ok(BenchConfig::load(default)?)
            } else {
                Ok(BenchConfig::default())
            }
        }
    }
}

/// Session directories (not archives) left behind by interrupted runs.
fn remove_session_dirs(benchmarks_dir: &Path) -> Result<usize> {
    if !benchmarks_dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0usize;
    for entry in fs::read_dir(benchmarks_dir)
        .with_context(|| format!("reading {}", benchmarks_dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())
                .with_context(|| format!("removing {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn command_json_mode(body: impl FnOnce() -> Result<serde_json::Value>) -> Result<()> {
    match body() {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Err(e) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "ok": false,
                    "error": format!("{:#}", e),
                }))?
            );
            std::process::exit(1);
        }
    }
}
