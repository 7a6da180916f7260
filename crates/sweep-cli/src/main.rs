use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use sweep_runner::lifecycle::Outcome;
use sweep_runner::{
    allowed_actions, Project, ProjectOptions, SchedulerRegistry, State, SweepError, UserCommand,
    DEFAULT_SWEEP_FILE,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Generate and submit batch jobs for parameter sweeps")]
struct Cli {
    /// Sweep file (TOML, or YAML by extension)
    #[arg(long, global = true, default_value = DEFAULT_SWEEP_FILE)]
    file: PathBuf,
    /// TOML snippet merged over the sweep file, e.g. -p 'scheduler = "LOCAL"'
    #[arg(short = 'p', long = "param", global = true)]
    params: Vec<String>,
    /// Do not ask before overwriting or deleting files
    #[arg(short, long, global = true)]
    force: bool,
    #[arg(short, long, global = true, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,
    #[arg(short, long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Write batch files and work directories
    Generate,
    /// Submit batch files, generating them first if needed
    Run,
    /// Cancel submitted jobs
    Cancel,
    /// Remove everything generate and run created
    Purge,
    /// Current lifecycle state, allowed actions and job progress
    Status,
    /// Generated directories, batch files and detected outputs
    List,
    /// Print every batch file without writing anything
    Show,
    /// Zip the work directories and the effective configuration
    Archive,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let json_mode = cli.json;
    match run_command(&cli) {
        Ok(Some(payload)) => {
            let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(true);
            emit_json(&payload);
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .chain()
                    .find_map(|e| e.downcast_ref::<SweepError>())
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(cli: &Cli) -> Result<Option<Value>> {
    let options = ProjectOptions {
        sweep_file: cli.file.clone(),
        overrides: cli.params.clone(),
        force: cli.force,
    };
    let registry = SchedulerRegistry::with_builtin();
    tracing::debug!(file = %cli.file.display(), schedulers = ?registry.names(), "opening project");
    let mut project = match Project::open(&options, &registry) {
        Ok(project) => project,
        Err(err) if is_unknown_scheduler(&err) => {
            let state = Project::stored_state(&cli.file)?;
            if cli.json {
                return Ok(Some(unknown_scheduler_payload(&err, state)));
            }
            println!("status: {}", state);
            println!("allowed actions: {}", allowed_actions(state).join(", "));
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    let lifecycle_command = match cli.command {
        Commands::Generate => Some(UserCommand::Generate),
        Commands::Run => Some(UserCommand::Run),
        Commands::Cancel => Some(UserCommand::Cancel),
        Commands::Purge => Some(UserCommand::Purge),
        Commands::Status => Some(UserCommand::Status),
        _ => None,
    };
    if let Some(command) = lifecycle_command {
        let outcome = project.execute(command)?;
        return report_outcome(&project, &outcome, cli.json);
    }

    match cli.command {
        Commands::List => {
            let listing = project.listing();
            if cli.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "directories": paths_to_json(&listing.directories),
                    "batch_scripts": paths_to_json(&listing.batch_scripts),
                    "output_files": paths_to_json(&listing.output_files),
                })));
            }
            print_paths("directories", &listing.directories);
            print_paths("batch files", &listing.batch_scripts);
            print_paths("output files", &listing.output_files);
        }
        Commands::Show => {
            let rendered = project.show()?;
            if cli.json {
                let scripts: Vec<Value> = rendered
                    .iter()
                    .map(|(file, text)| json!({ "file": file.display().to_string(), "text": text }))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "scheduler": project.scheduler_name(),
                    "scripts": scripts,
                })));
            }
            for (file, text) in rendered {
                println!("==> {} <==", file.display());
                print!("{}", text);
                println!();
            }
        }
        Commands::Archive => {
            let (path, files) = project.archive()?;
            if cli.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "archive",
                    "archive": path.display().to_string(),
                    "files": files,
                })));
            }
            println!("archive: {}", path.display());
            println!("files: {}", files);
        }
        Commands::Config => {
            let config = project.config().raw().clone();
            if cli.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "config",
                    "config": config,
                })));
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Generate
        | Commands::Run
        | Commands::Cancel
        | Commands::Purge
        | Commands::Status => {}
    }
    Ok(None)
}

fn report_outcome(project: &Project, outcome: &Outcome, json: bool) -> Result<Option<Value>> {
    let show_outputs = matches!(outcome.state, State::Running | State::Completed)
        && outcome.command == UserCommand::Status.as_str();
    let output_files = if show_outputs {
        project.listing().output_files
    } else {
        Vec::new()
    };
    let jobs = if show_outputs {
        project.job_stats()?
    } else {
        Vec::new()
    };

    if json {
        return Ok(Some(json!({
            "ok": outcome.ok,
            "command": outcome.command,
            "state": outcome.state.as_str(),
            "stayed": outcome.stayed,
            "message": outcome.message,
            "allowed_actions": outcome.allowed_actions,
            "output_files": paths_to_json(&output_files),
            "jobs": serde_json::to_value(&jobs)?,
        })));
    }

    if !outcome.message.is_empty() && outcome.ok {
        println!("{}", outcome.message);
    }
    println!("status: {}", outcome.state);
    println!("allowed actions: {}", outcome.allowed_actions.join(", "));
    for job in &jobs {
        println!(
            "job {}: {} ({})",
            job.job_id,
            job.stats.state,
            job.script.display()
        );
    }
    if show_outputs {
        print_paths("output files", &output_files);
    }
    if !outcome.ok {
        return Err(anyhow!("{}", outcome.message));
    }
    Ok(None)
}

fn is_unknown_scheduler(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SweepError>(),
        Some(SweepError::UnknownScheduler { .. })
    )
}

/// Error payload carrying the persisted state and its allowed actions.
fn unknown_scheduler_payload(err: &anyhow::Error, state: State) -> Value {
    let mut payload = json_error("unknown_scheduler", format!("{:#}", err), json!({}));
    payload["state"] = json!(state.as_str());
    payload["allowed_actions"] = json!(allowed_actions(state));
    payload
}

fn paths_to_json(paths: &[PathBuf]) -> Value {
    json!(paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>())
}

fn print_paths(label: &str, paths: &[PathBuf]) {
    println!("{} ({}):", label, paths.len());
    for path in paths {
        println!("  {}", path.display());
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
