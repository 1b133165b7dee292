mod design;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use design::{TwoArmDesign, TwoArmSimulator};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use trialsim_runner::{
    ProgressPlan, ResultBundle, RunOptions, RunOutcome, SaveOptions, SeedStream, TrialSpec,
};

const LOG_ENV: &str = "TRIALSIM_LOG";

#[derive(Parser)]
#[command(
    name = "trialsim",
    version,
    about = "Reproducible replicate runner for adaptive trial simulations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate, reuse, or grow a cached set of replicates of the two-arm design
    Run {
        /// YAML file with optional `run:` and `design:` sections
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        n_rep: Option<usize>,
        /// Result bundle to create, reuse, or grow
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        grow: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Keep the per-look history of every replicate
        #[arg(long)]
        full: bool,
        #[arg(long)]
        progress: Option<f64>,
        #[arg(long)]
        no_compress: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show how new replicates would be batched for progress reporting
    Plan {
        #[arg(long)]
        n_new: usize,
        #[arg(long, default_value_t = 0)]
        prev: usize,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[arg(long, default_value_t = 0.1)]
        progress: f64,
        #[arg(long)]
        json: bool,
    },
    /// Describe a saved result bundle
    Inspect {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the per-replicate seed states derived from a base seed
    Seeds {
        #[arg(long)]
        seed: u32,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunFile {
    #[serde(default)]
    run: RunSection,
    #[serde(default)]
    design: Option<TwoArmDesign>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunSection {
    n_rep: Option<usize>,
    path: Option<PathBuf>,
    overwrite: Option<bool>,
    grow: Option<bool>,
    workers: Option<usize>,
    base_seed: Option<u64>,
    sparse: Option<bool>,
    progress: Option<f64>,
    compress: Option<bool>,
    pretty: Option<bool>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            n_rep,
            path,
            overwrite,
            grow,
            workers,
            seed,
            full,
            progress,
            no_compress,
            json,
        } => {
            let file = match config.as_deref() {
                Some(p) => load_run_file(p)?,
                None => RunFile::default(),
            };
            let section = file.run;
            let n_rep = n_rep
                .or(section.n_rep)
                .ok_or_else(|| anyhow!("n_rep is required (--n-rep or run.n_rep)"))?;
            let mut options = RunOptions::new(n_rep);
            options.path = path.or(section.path);
            options.overwrite = overwrite || section.overwrite.unwrap_or(false);
            options.grow = grow || section.grow.unwrap_or(false);
            options.workers = workers.or(section.workers);
            options.base_seed = seed.or(section.base_seed);
            options.sparse = if full {
                false
            } else {
                section.sparse.unwrap_or(true)
            };
            options.progress = progress.or(section.progress);
            options.save = SaveOptions {
                compress: !no_compress && section.compress.unwrap_or(true),
                pretty: section.pretty.unwrap_or(false),
            };

            let design = file.design.unwrap_or_default();
            let simulator = TwoArmSimulator::for_design(&design)?;
            tracing::debug!(
                structure = %design.structure_digest(),
                stopping_rule = %design.stopping_rule,
                "design loaded"
            );
            let outcome = trialsim_runner::run_trials(design, &simulator, &options, None)?;
            let summary = outcome_summary(&outcome, options.path.as_deref());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": summary,
                })));
            }
            print_fields(&summary);
        }
        Commands::Plan {
            n_new,
            prev,
            workers,
            progress,
            json,
        } => {
            if n_new == 0 || workers == 0 {
                return Err(anyhow!("--n-new and --workers must be at least 1"));
            }
            if !(progress > 0.0 && progress <= 1.0) {
                return Err(anyhow!("--progress must be in (0, 1], got {}", progress));
            }
            let plan = ProgressPlan::new(progress, prev, n_new, workers);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": plan,
                })));
            }
            println!("{}", plan.start_message);
            for (batch, message) in plan.batches.iter().zip(plan.messages.iter()) {
                let first = batch.first().copied().unwrap_or(0);
                let last = batch.last().copied().unwrap_or(0);
                println!("{}  replicates {}..={}", message, first, last);
            }
        }
        Commands::Inspect { path, json } => {
            let bundle: ResultBundle<Value, Value> = trialsim_runner::load(&path)?
                .ok_or_else(|| anyhow!("no result bundle at {}", path.display()))?;
            let summary = bundle_summary(&bundle);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "inspect",
                    "bundle": summary,
                })));
            }
            println!("path: {}", path.display());
            print_fields(&summary);
        }
        Commands::Seeds { seed, count, json } => {
            let stream = SeedStream::generate(Some(seed), count);
            let states: Vec<Value> = stream
                .states()
                .iter()
                .enumerate()
                .map(|(i, state)| {
                    json!({
                        "replicate": i + 1,
                        "state": state.map(|s| s.words().to_vec()),
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "seeds",
                    "base_seed": seed,
                    "states": states,
                })));
            }
            for (i, state) in stream.states().iter().enumerate() {
                if let Some(state) = state {
                    let words: Vec<String> = state.words().iter().map(u32::to_string).collect();
                    println!("{:>6}: {}", i + 1, words.join(" "));
                }
            }
        }
    }
    Ok(None)
}

fn load_run_file(path: &Path) -> Result<RunFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading run config {}", path.display()))?;
    let file: RunFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing run config {}", path.display()))?;
    Ok(file)
}

fn outcome_summary<S, R>(outcome: &RunOutcome<S, R>, path: Option<&Path>) -> Value {
    let mut summary = bundle_summary(&outcome.bundle);
    if let Some(obj) = summary.as_object_mut() {
        obj.insert("action".to_string(), json!(outcome.action.as_str()));
        obj.insert("simulated".to_string(), json!(outcome.simulated));
        obj.insert("workers".to_string(), json!(outcome.workers));
        obj.insert(
            "run_elapsed_s".to_string(),
            json!(outcome.elapsed.as_secs_f64()),
        );
        obj.insert(
            "path".to_string(),
            json!(path.map(|p| p.display().to_string())),
        );
    }
    summary
}

fn bundle_summary<S, R>(bundle: &ResultBundle<S, R>) -> Value {
    json!({
        "schema_version": bundle.schema_version,
        "engine_version": bundle.engine_version,
        "n_rep": bundle.n_rep,
        "base_seed": bundle.base_seed,
        "sparse": bundle.sparse,
        "elapsed_s": bundle.elapsed.as_secs_f64(),
        "created_at": bundle.created_at.to_rfc3339(),
        "updated_at": bundle.updated_at.to_rfc3339(),
    })
}

fn print_fields(summary: &Value) {
    if let Some(obj) = summary.as_object() {
        for (key, value) in obj {
            match value {
                Value::String(s) => println!("{}: {}", key, s),
                Value::Null => println!("{}: none", key),
                other => println!("{}: {}", key, other),
            }
        }
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Inspect { json, .. }
        | Commands::Seeds { json, .. } => *json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_file_parses_both_sections() {
        let raw = r#"
run:
  n_rep: 200
  workers: 4
  base_seed: 123
  progress: 0.25
  compress: false
design:
  control_rate: 0.35
  treatment_rate: 0.25
  looks: [50, 100]
  stopping_rule: "diff < -0.1"
"#;
        let file: RunFile = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(file.run.n_rep, Some(200));
        assert_eq!(file.run.workers, Some(4));
        assert_eq!(file.run.compress, Some(false));
        let design = file.design.expect("design");
        assert_eq!(design.looks, vec![50, 100]);
        assert!(design.validate().is_ok());
    }

    #[test]
    fn run_file_rejects_unknown_keys() {
        let raw = "run:\n  n_reps: 10\n";
        assert!(serde_yaml::from_str::<RunFile>(raw).is_err());
    }

    #[test]
    fn plan_command_rejects_bad_progress() {
        let err = run_command(Commands::Plan {
            n_new: 10,
            prev: 0,
            workers: 2,
            progress: 1.5,
            json: true,
        })
        .expect_err("bad progress");
        assert!(err.to_string().contains("--progress"));
    }

    #[test]
    fn plan_command_emits_json_payload() {
        let payload = run_command(Commands::Plan {
            n_new: 97,
            prev: 0,
            workers: 4,
            progress: 0.25,
            json: true,
        })
        .expect("plan")
        .expect("payload");
        assert_eq!(payload["plan"]["breakpoints"], json!([28, 52, 76, 97]));
    }

    #[test]
    fn run_and_inspect_round_trip() {
        let root = std::env::temp_dir().join(format!(
            "trialsim_cli_test_{}_{}",
            std::process::id(),
            unique_suffix()
        ));
        let path = root.join("bundle.zip");
        let payload = run_command(Commands::Run {
            config: None,
            n_rep: Some(6),
            path: Some(path.clone()),
            overwrite: false,
            grow: false,
            workers: Some(2),
            seed: Some(123),
            full: false,
            progress: Some(0.5),
            no_compress: false,
            json: true,
        })
        .expect("run")
        .expect("payload");
        assert_eq!(payload["run"]["action"], json!("new"));
        assert_eq!(payload["run"]["n_rep"], json!(6));
        assert_eq!(payload["run"]["workers"], json!(2));

        let reused = run_command(Commands::Run {
            config: None,
            n_rep: Some(6),
            path: Some(path.clone()),
            overwrite: false,
            grow: false,
            workers: Some(2),
            seed: Some(123),
            full: false,
            progress: None,
            no_compress: false,
            json: true,
        })
        .expect("reuse")
        .expect("payload");
        assert_eq!(reused["run"]["action"], json!("reuse"));
        assert_eq!(reused["run"]["simulated"], json!(0));
        assert_eq!(reused["run"]["workers"], Value::Null);

        let inspected = run_command(Commands::Inspect {
            path: path.clone(),
            json: true,
        })
        .expect("inspect")
        .expect("payload");
        assert_eq!(inspected["bundle"]["n_rep"], json!(6));
        assert_eq!(inspected["bundle"]["base_seed"], json!(123));
        let _ = std::fs::remove_dir_all(root);
    }

    fn unique_suffix() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    }
}
