use std::path::Path;
use std::process::Command;

use tracing::info;

use super::{render_body, run_capture, BatchScript, JobStats, Scheduler, SubmittedJob, SLURM};
use crate::error::{SweepError, SweepResult};
use crate::sequence::Scalar;
use crate::util::absolutize;

const LAUNCHER: &str = "srun";

/// Cluster backend driven through `sbatch`, `sacct` and `scancel`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: String,
    sacct: String,
    scancel: String,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        SlurmScheduler {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
        }
    }
}

impl SlurmScheduler {
    /// Uses the given programs instead of the ones on `PATH`.
    pub fn with_commands(
        sbatch: impl Into<String>,
        sacct: impl Into<String>,
        scancel: impl Into<String>,
    ) -> Self {
        SlurmScheduler {
            sbatch: sbatch.into(),
            sacct: sacct.into(),
            scancel: scancel.into(),
        }
    }
}

fn directive(key: &str, value: &Scalar) -> Option<String> {
    let short = key.chars().count() == 1;
    match (value, short) {
        (Scalar::Bool(false), _) => None,
        (Scalar::Bool(true), true) => Some(format!("#SBATCH -{}", key)),
        (Scalar::Bool(true), false) => Some(format!("#SBATCH --{}", key)),
        (other, true) => Some(format!("#SBATCH -{} {}", key, other)),
        (other, false) => Some(format!("#SBATCH --{}={}", key, other)),
    }
}

/// Parses the id out of `Submitted batch job <id>`.
fn parse_job_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Submitted batch job")
            .map(|rest| rest.trim().to_string())
            .filter(|id| !id.is_empty())
    })
}

/// First non-empty `State|ExitCode` row of `sacct --parsable2` output.
fn parse_sacct(stdout: &str) -> Option<JobStats> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split('|');
    let state = fields.next()?.trim().to_string();
    let exit_code = fields
        .next()
        .and_then(|code| code.split(':').next())
        .and_then(|code| code.trim().parse::<i32>().ok());
    Some(JobStats { state, exit_code })
}

impl Scheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        SLURM
    }

    fn render(&self, script: &BatchScript) -> String {
        let entries = script.namespace.entries();
        let long = entries.iter().filter(|(k, _)| k.chars().count() > 1);
        let short = entries.iter().filter(|(k, _)| k.chars().count() == 1);
        let mut text = String::from("#!/bin/bash\n");
        for (key, value) in long.chain(short) {
            if let Some(line) = directive(key, value) {
                text.push_str(&line);
                text.push('\n');
            }
        }
        text.push('\n');
        text.push_str(&render_body(script, Some(LAUNCHER)));
        text
    }

    fn submit(&self, script: &BatchScript, base_dir: &Path) -> SweepResult<SubmittedJob> {
        let mut cmd = Command::new(&self.sbatch);
        cmd.arg(&script.filename).current_dir(base_dir);
        let stdout = run_capture(cmd)?;
        let job_id = parse_job_id(&stdout).ok_or_else(|| SweepError::ExternalProcess {
            command: format!("{} {}", self.sbatch, script.filename.display()),
            status: format!("unexpected output: {}", stdout.trim()),
        })?;
        let output = absolutize(base_dir, Path::new(&script.output.replace("%j", &job_id)));
        info!(job_id = job_id.as_str(), script = %script.filename.display(), "submitted");
        Ok(SubmittedJob {
            job_id,
            output: output.to_string_lossy().into_owned(),
            exit_code: None,
        })
    }

    fn query_stats(&self, job: &SubmittedJob) -> SweepResult<JobStats> {
        let mut cmd = Command::new(&self.sacct);
        cmd.args([
            "-j",
            job.job_id.as_str(),
            "--format=State,ExitCode",
            "--noheader",
            "--parsable2",
        ]);
        let stdout = run_capture(cmd)?;
        Ok(parse_sacct(&stdout).unwrap_or(JobStats {
            state: "UNKNOWN".to_string(),
            exit_code: None,
        }))
    }

    fn cancel(&self, jobs: &[SubmittedJob]) -> SweepResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new(&self.scancel);
        cmd.args(jobs.iter().map(|j| j.job_id.as_str()));
        run_capture(cmd)?;
        info!(count = jobs.len(), "cancelled jobs");
        Ok(())
    }
}
