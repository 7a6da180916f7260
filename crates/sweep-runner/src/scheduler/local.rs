use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;
use tracing::{debug, info};

use super::{render_body, BatchScript, JobStats, Scheduler, SubmittedJob, LOCAL};
use crate::error::{SweepError, SweepResult};
use crate::util::absolutize;

/// Runs batch files directly with a shell on this machine.
#[derive(Debug, Clone)]
pub struct LocalScheduler {
    shell: String,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        LocalScheduler {
            shell: "bash".to_string(),
        }
    }
}

impl Scheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        LOCAL
    }

    fn render(&self, script: &BatchScript) -> String {
        let mut text = String::from("#!/bin/bash\n");
        for (key, value) in script.namespace.entries() {
            text.push_str(&format!("# {}: {}\n", key, value));
        }
        text.push('\n');
        text.push_str(&render_body(script, None));
        text
    }

    /// Blocks until the script exits; stdout and stderr go to the output file,
    /// whose directory must already exist. A non-zero exit comes back as the
    /// job's `exit_code`.
    fn submit(&self, script: &BatchScript, base_dir: &Path) -> SweepResult<SubmittedJob> {
        let job_id = Utc::now().timestamp_micros().to_string();
        let output = absolutize(base_dir, Path::new(&script.output.replace("%j", &job_id)));
        let log = fs::File::create(&output)?;
        let command = format!("{} {}", self.shell, script.filename.display());
        debug!(command = command.as_str(), output = %output.display(), "running locally");
        let status = Command::new(&self.shell)
            .arg(&script.filename)
            .current_dir(base_dir)
            .stdout(log.try_clone()?)
            .stderr(log)
            .status()
            .map_err(|e| SweepError::ExternalProcess {
                command,
                status: e.to_string(),
            })?;
        info!(
            job_id = job_id.as_str(),
            script = %script.filename.display(),
            %status,
            "finished"
        );
        Ok(SubmittedJob {
            job_id,
            output: output.to_string_lossy().into_owned(),
            // -1 when killed by a signal
            exit_code: Some(status.code().unwrap_or(-1)),
        })
    }

    fn query_stats(&self, job: &SubmittedJob) -> SweepResult<JobStats> {
        let state = match job.exit_code {
            Some(0) => "COMPLETED",
            Some(_) => "FAILED",
            None => "UNKNOWN",
        };
        Ok(JobStats {
            state: state.to_string(),
            exit_code: job.exit_code,
        })
    }

    fn cancel(&self, jobs: &[SubmittedJob]) -> SweepResult<()> {
        debug!(count = jobs.len(), "local jobs run synchronously; nothing to cancel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::scheduler::build_batch_script;
    use crate::util::test_dir;
    use serde_json::json;

    fn config() -> SweepConfig {
        SweepConfig::from_value(json!({
            "scaleup": [2],
            "scheduler": "LOCAL",
            "scheduler_params": { "job-name": "local", "output": "logs/{SBATCH_job-name}-%j.out" },
            "benchmarks": {
                "workdir": ".",
                "command_dir": "/bin",
                "command": "echo",
                "arguments": ["hello"]
            }
        }))
        .expect("config")
    }

    #[test]
    fn render_has_comments_but_no_directives() {
        let script = build_batch_script("SBATCH_", &config(), 2, Path::new("/p")).expect("build");
        let text = LocalScheduler::default().render(&script);
        assert!(text.starts_with("#!/bin/bash\n# n: 2\n# N: 1\n# job-name: local\n"));
        assert!(!text.contains("#SBATCH"));
        assert!(!text.contains("srun"));
    }

    #[test]
    fn submit_runs_script_and_captures_output() {
        let dir = test_dir("local_submit");
        let scheduler = LocalScheduler::default();
        let script = build_batch_script("SBATCH_", &config(), 2, &dir).expect("build");
        fs::write(&script.filename, scheduler.render(&script)).expect("write script");
        fs::create_dir_all(dir.join("logs")).expect("logs dir");

        let job = scheduler.submit(&script, &dir).expect("submit");
        assert_eq!(job.exit_code, Some(0));
        assert!(job.output.starts_with(&*dir.join("logs").to_string_lossy()));
        let captured = fs::read_to_string(&job.output).expect("output file");
        assert_eq!(captured.trim(), "hello");
        assert_eq!(
            scheduler.query_stats(&job).expect("stats").state,
            "COMPLETED"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn failing_script_reports_its_exit_code() {
        let dir = test_dir("local_fail");
        let scheduler = LocalScheduler::default();
        let script = build_batch_script("SBATCH_", &config(), 2, &dir).expect("build");
        fs::write(&script.filename, "#!/bin/bash\necho broken\nexit 4\n").expect("write script");
        fs::create_dir_all(dir.join("logs")).expect("logs dir");

        let job = scheduler.submit(&script, &dir).expect("submit");
        assert_eq!(job.exit_code, Some(4));
        assert_eq!(fs::read_to_string(&job.output).expect("output").trim(), "broken");
        assert_eq!(scheduler.query_stats(&job).expect("stats").state, "FAILED");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_output_directory_is_an_error() {
        let dir = test_dir("local_no_logs");
        let scheduler = LocalScheduler::default();
        let script = build_batch_script("SBATCH_", &config(), 2, &dir).expect("build");
        fs::write(&script.filename, scheduler.render(&script)).expect("write script");
        assert!(matches!(scheduler.submit(&script, &dir), Err(SweepError::Io(_))));
        let _ = fs::remove_dir_all(dir);
    }
}
