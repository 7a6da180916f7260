//! Scheduler backends: how a batch script is laid out, submitted, queried
//! and cancelled. Every backend shares the same namespace keys and the
//! same `filename`/`output` fields so the lifecycle code stays
//! backend-agnostic.

mod local;
mod slurm;

pub use local::LocalScheduler;
pub use slurm::SlurmScheduler;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::apply_conditionals;
use crate::config::SweepConfig;
use crate::error::{SweepError, SweepResult};
use crate::jobstep::{expand_job_steps, BenchmarkTemplate, JobStep};
use crate::namespace::{resolve_entries, ResolvedNamespace};
use crate::sequence::Scalar;
use crate::util::{absolutize, shell_quote};

pub const SLURM: &str = "SLURM";
pub const LOCAL: &str = "LOCAL";

/// Namespace prefix shared by the built-in backends, so a sweep file moves
/// between them unchanged.
pub const SBATCH_PREFIX: &str = "SBATCH_";

/// Everything needed to render one batch file for one process count.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchScript {
    pub namespace: ResolvedNamespace,
    pub env_exports: Vec<(String, Scalar)>,
    pub setup: String,
    pub modules: Vec<String>,
    pub steps: Vec<JobStep>,
    pub cleanup: String,
    /// Absolute path of the batch file.
    pub filename: PathBuf,
    /// Output path pattern relative to the submission directory.
    pub output: String,
}

impl BatchScript {
    pub fn procs(&self) -> u64 {
        self.namespace.procs()
    }

    pub fn nodes(&self) -> u64 {
        self.namespace.nodes()
    }
}

/// A job accepted by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: String,
    /// Absolute path of the job's output file once `%j` is substituted.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub state: String,
    pub exit_code: Option<i32>,
}

pub trait Scheduler {
    fn name(&self) -> &'static str;

    /// Prefix under which namespace entries are exposed to templates.
    fn param_prefix(&self) -> &'static str {
        SBATCH_PREFIX
    }

    fn render(&self, script: &BatchScript) -> String;

    /// Hands the already written batch file to the backend. `base_dir` is
    /// the submission directory.
    fn submit(&self, script: &BatchScript, base_dir: &Path) -> SweepResult<SubmittedJob>;

    fn query_stats(&self, job: &SubmittedJob) -> SweepResult<JobStats>;

    fn cancel(&self, jobs: &[SubmittedJob]) -> SweepResult<()>;

    fn build(&self, config: &SweepConfig, procs: u64, base_dir: &Path) -> SweepResult<BatchScript> {
        build_batch_script(self.param_prefix(), config, procs, base_dir)
    }
}

/// Resolves the namespace for `procs`, applies conditional overrides,
/// expands the job steps and resolves the export block and filename.
pub fn build_batch_script(
    prefix: &str,
    config: &SweepConfig,
    procs: u64,
    base_dir: &Path,
) -> SweepResult<BatchScript> {
    let namespace = ResolvedNamespace::resolve(
        &config.scheduler_params,
        procs,
        config.max_procs_per_node,
        prefix,
    )?;
    let benchmarks = apply_conditionals(&config.benchmarks, &config.conditionals, &namespace)?;
    let template = BenchmarkTemplate::from_value(&benchmarks)?;
    let steps = expand_job_steps(&template, &namespace, base_dir)?;
    let (env_exports, _) = resolve_entries(config.env_vars.entries(), namespace.formatted(), "")?;
    let filename = absolutize(
        base_dir,
        Path::new(&namespace.formatted().render(&config.batchfile_name)?),
    );
    debug!(procs, file = %filename.display(), steps = steps.len(), "built batch script");
    let output = namespace.output();
    Ok(BatchScript {
        namespace,
        env_exports,
        setup: config.setup.clone(),
        modules: config.modules.clone(),
        steps,
        cleanup: config.cleanup.clone(),
        filename,
        output,
    })
}

/// Export block, setup, module line, one line per job step, cleanup.
pub(crate) fn render_body(script: &BatchScript, launcher: Option<&str>) -> String {
    let mut lines = Vec::new();
    for (key, value) in &script.env_exports {
        lines.push(format!("export {}={}", key, shell_quote(&value.to_string())));
    }
    if !script.setup.trim().is_empty() {
        lines.push(script.setup.trim_end().to_string());
    }
    if !script.modules.is_empty() {
        lines.push(format!("module load {}", script.modules.join(" ")));
    }
    lines.push(String::new());
    for step in &script.steps {
        lines.push(step.command_line(launcher));
    }
    if !script.cleanup.trim().is_empty() {
        lines.push(String::new());
        lines.push(script.cleanup.trim_end().to_string());
    }
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

/// Runs `cmd` to completion and returns its stdout; a spawn failure or a
/// non-zero exit is an `ExternalProcess` error.
pub(crate) fn run_capture(mut cmd: Command) -> SweepResult<String> {
    let shown = format!("{:?}", cmd);
    debug!(command = %shown, "running");
    let output = cmd.output().map_err(|e| SweepError::ExternalProcess {
        command: shown.clone(),
        status: e.to_string(),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string();
        return Err(SweepError::ExternalProcess {
            command: shown,
            status: format!("{} {}", output.status, tail).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub type SchedulerFactory = fn() -> Box<dyn Scheduler>;

/// Name to factory map, populated at startup and handed to the project.
#[derive(Debug, Clone, Default)]
pub struct SchedulerRegistry {
    factories: BTreeMap<String, SchedulerFactory>,
}

fn slurm_factory() -> Box<dyn Scheduler> {
    Box::new(SlurmScheduler::default())
}

fn local_factory() -> Box<dyn Scheduler> {
    Box::new(LocalScheduler::default())
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(SLURM, slurm_factory);
        registry.register(LOCAL, local_factory);
        registry
    }

    /// Names are matched case-insensitively.
    pub fn register(&mut self, name: &str, factory: SchedulerFactory) {
        self.factories.insert(name.to_ascii_uppercase(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn create(&self, name: &str) -> SweepResult<Box<dyn Scheduler>> {
        self.factories
            .get(&name.to_ascii_uppercase())
            .map(|factory| factory())
            .ok_or_else(|| SweepError::UnknownScheduler {
                name: name.to_string(),
                known: self.names(),
            })
    }
}
