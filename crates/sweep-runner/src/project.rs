//! A sweep project: one sweep file, the directory it lives in, the
//! selected backend and the persisted state next to it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::write_archive;
use crate::config::{load_sweep_file, project_root, SweepConfig};
use crate::lifecycle::{Lifecycle, Outcome, ProjectActions, State, UserCommand};
use crate::prompts::{AssumeYes, Confirm, StdinConfirm};
use crate::scheduler::{BatchScript, JobStats, Scheduler, SchedulerRegistry};
use crate::store::{ProjectStore, DEFAULT_STORE_FILE};
use crate::util::{absolutize, atomic_write_bytes, ensure_dir};

#[derive(Debug, Clone)]
pub struct ProjectOptions {
    pub sweep_file: PathBuf,
    pub overrides: Vec<String>,
    /// Answer yes to every confirmation prompt.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub directories: Vec<PathBuf>,
    pub batch_scripts: Vec<PathBuf>,
    pub output_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStats {
    pub script: PathBuf,
    pub job_id: String,
    pub stats: JobStats,
}

pub struct Project {
    root: PathBuf,
    config: SweepConfig,
    scheduler: Box<dyn Scheduler>,
    store: ProjectStore,
    confirm: Box<dyn Confirm>,
}

impl Project {
    /// Loads the sweep file and resolves its backend in `registry`.
    pub fn open(options: &ProjectOptions, registry: &SchedulerRegistry) -> Result<Project> {
        let config = load_sweep_file(&options.sweep_file, &options.overrides)?;
        let scheduler = registry.create(&config.scheduler)?;
        let confirm: Box<dyn Confirm> = if options.force {
            Box::new(AssumeYes)
        } else {
            Box::new(StdinConfirm)
        };
        Project::new(project_root(&options.sweep_file), config, scheduler, confirm)
    }

    /// Persisted lifecycle state of the project owning `sweep_file`, read
    /// without loading the sweep file or its backend.
    pub fn stored_state(sweep_file: &Path) -> Result<State> {
        let store = ProjectStore::open(&project_root(sweep_file).join(DEFAULT_STORE_FILE))?;
        Ok(Lifecycle::open(&store).state())
    }

    pub fn new(
        root: PathBuf,
        config: SweepConfig,
        scheduler: Box<dyn Scheduler>,
        confirm: Box<dyn Confirm>,
    ) -> Result<Project> {
        let store = ProjectStore::open(&root.join(DEFAULT_STORE_FILE))?;
        debug!(root = %root.display(), scheduler = scheduler.name(), "opened project");
        Ok(Project {
            root,
            config,
            scheduler,
            store,
            confirm,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.name()
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    /// Routes a user command through the state machine.
    pub fn execute(&mut self, command: UserCommand) -> Result<Outcome> {
        let mut lifecycle = Lifecycle::open(&self.store);
        lifecycle.execute(command, self)
    }

    /// Builds every batch script in process-count order, stopping at the
    /// first one that fails to expand.
    pub fn batch_scripts(&self) -> Result<Vec<BatchScript>> {
        self.config
            .process_counts()?
            .into_iter()
            .map(|procs| -> Result<BatchScript> {
                self.scheduler
                    .build(&self.config, procs, &self.root)
                    .with_context(|| format!("building batch file for {} processes", procs))
            })
            .collect()
    }

    /// Rendered batch files, nothing written.
    pub fn show(&self) -> Result<Vec<(PathBuf, String)>> {
        Ok(self
            .batch_scripts()?
            .into_iter()
            .map(|script| {
                let text = self.scheduler.render(&script);
                (script.filename, text)
            })
            .collect())
    }

    pub fn listing(&self) -> Listing {
        Listing {
            directories: self.store.directories(),
            batch_scripts: self.store.batch_scripts(),
            output_files: self.store.output_files(),
        }
    }

    /// Backend status of every submitted job. Query failures are logged and
    /// the job is left out.
    pub fn job_stats(&self) -> Result<Vec<ScriptStats>> {
        let mut out = Vec::new();
        for (script, job) in self.store.submitted_jobs()? {
            match self.scheduler.query_stats(&job) {
                Ok(stats) => out.push(ScriptStats {
                    script,
                    job_id: job.job_id,
                    stats,
                }),
                Err(err) => warn!(job_id = job.job_id.as_str(), "status query failed: {}", err),
            }
        }
        Ok(out)
    }

    /// Zips the generated work directories and the effective configuration
    /// into `<archive_name>.zip` in the project root.
    pub fn archive(&self) -> Result<(PathBuf, usize)> {
        let out = self.root.join(format!("{}.zip", self.config.archive_name));
        let count = write_archive(&out, &self.root, &self.store.directories(), self.config.raw())?;
        Ok((out, count))
    }

    /// Creates `dir`, recording every component that did not exist before,
    /// outermost first.
    fn create_tracked_dir(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(dir);
        while let Some(d) = cursor {
            if d.as_os_str().is_empty() || d.exists() {
                break;
            }
            missing.push(d.to_path_buf());
            cursor = d.parent();
        }
        ensure_dir(dir)?;
        for created in missing.iter().rev() {
            self.store.add_directory(created)?;
        }
        Ok(())
    }

    fn remove_tracked_file(path: &Path) -> Result<()> {
        if path.is_file() {
            fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}

impl ProjectActions for Project {
    fn store_mut(&mut self) -> &mut ProjectStore {
        &mut self.store
    }

    fn generate(&mut self) -> Result<()> {
        let mut overwrite_confirmed = false;
        for procs in self.config.process_counts()? {
            let script = self
                .scheduler
                .build(&self.config, procs, &self.root)
                .with_context(|| format!("building batch file for {} processes", procs))?;
            if script.filename.exists() && !overwrite_confirmed {
                let question = format!(
                    "{} already exists. Overwrite existing batch files?",
                    script.filename.display()
                );
                if !self.confirm.confirm(&question)? {
                    bail!("not overwriting existing batch files");
                }
                overwrite_confirmed = true;
            }
            for step in &script.steps {
                let workdir = absolutize(&self.root, &step.workdir);
                self.create_tracked_dir(&workdir)?;
            }
            if let Some(parent) = script.filename.parent() {
                self.create_tracked_dir(parent)?;
            }
            let output = absolutize(&self.root, Path::new(&script.output));
            if let Some(parent) = output.parent().filter(|p| !p.to_string_lossy().contains('%')) {
                self.create_tracked_dir(parent)?;
            }
            let text = self.scheduler.render(&script);
            atomic_write_bytes(&script.filename, text.as_bytes())?;
            self.store.add_batch_script(&script.filename)?;
            info!(
                procs,
                nodes = script.nodes(),
                file = %script.filename.display(),
                "wrote batch file"
            );
        }
        let digest = self.config.digest();
        self.store.set_config_digest(Some(&digest))?;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if let Some(stored) = self.store.config_digest() {
            if stored != self.config.digest() {
                warn!("sweep configuration changed since generate; purge and generate to apply it");
            }
        }
        for procs in self.config.process_counts()? {
            let script = self.scheduler.build(&self.config, procs, &self.root)?;
            if !script.filename.is_file() {
                return Err(anyhow!(
                    "batch file {} is missing; purge and generate again",
                    script.filename.display()
                ));
            }
            let job = self
                .scheduler
                .submit(&script, &self.root)
                .with_context(|| format!("submitting {}", script.filename.display()))?;
            if let Some(code) = job.exit_code.filter(|code| *code != 0) {
                self.store.add_output_file(Path::new(&job.output))?;
                bail!(
                    "{} exited with status {}; see {}",
                    script.filename.display(),
                    code,
                    job.output
                );
            }
            self.store.record_submission(&script.filename, &job)?;
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        let jobs: Vec<_> = self
            .store
            .submitted_jobs()?
            .into_iter()
            .map(|(_, job)| job)
            .collect();
        self.scheduler.cancel(&jobs)?;
        self.store.clear_submissions()?;
        Ok(())
    }

    fn purge(&mut self) -> Result<()> {
        if !self
            .confirm
            .confirm("Remove all generated batch files, output files and directories?")?
        {
            bail!("purge declined");
        }
        for path in self.store.output_files() {
            Project::remove_tracked_file(&path)?;
        }
        for path in self.store.batch_scripts() {
            Project::remove_tracked_file(&path)?;
        }
        for dir in self.store.directories().iter().rev() {
            if dir.is_dir() {
                fs::remove_dir_all(dir).with_context(|| format!("removing {}", dir.display()))?;
            }
        }
        self.store.clear_generated_files()?;
        self.store.clear_submissions()?;
        self.store.set_config_digest(None)?;
        Ok(())
    }

    fn scan(&mut self) -> Result<bool> {
        let jobs = self.store.submitted_jobs()?;
        let mut all_present = !jobs.is_empty();
        for (_, job) in jobs {
            let output = PathBuf::from(&job.output);
            if !output.exists() {
                all_present = false;
                continue;
            }
            if self.store.add_output_file(&output)? {
                info!(output = %output.display(), "detected output file");
            }
        }
        Ok(all_present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SweepError, SweepResult};
    use crate::scheduler::{render_body, LocalScheduler, SlurmScheduler, SubmittedJob};
    use crate::util::test_dir;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records submissions; fails on the `fail_at`-th submit if set.
    struct RecordingScheduler {
        submitted: Rc<RefCell<Vec<u64>>>,
        cancelled: Rc<RefCell<usize>>,
        fail_at: Option<usize>,
    }

    impl Scheduler for RecordingScheduler {
        fn name(&self) -> &'static str {
            "RECORDING"
        }

        fn render(&self, script: &BatchScript) -> String {
            format!("#!/bin/bash\n{}", render_body(script, None))
        }

        fn submit(&self, script: &BatchScript, base_dir: &Path) -> SweepResult<SubmittedJob> {
            let mut submitted = self.submitted.borrow_mut();
            if self.fail_at == Some(submitted.len()) {
                return Err(SweepError::ExternalProcess {
                    command: "submit".to_string(),
                    status: "exit status: 1".to_string(),
                });
            }
            submitted.push(script.procs());
            let id = submitted.len().to_string();
            let output = base_dir.join(script.output.replace("%j", &id));
            Ok(SubmittedJob {
                job_id: id,
                output: output.to_string_lossy().into_owned(),
                exit_code: None,
            })
        }

        fn query_stats(&self, job: &SubmittedJob) -> SweepResult<JobStats> {
            Ok(JobStats {
                state: "RUNNING".to_string(),
                exit_code: job.exit_code,
            })
        }

        fn cancel(&self, jobs: &[SubmittedJob]) -> SweepResult<()> {
            *self.cancelled.borrow_mut() += jobs.len();
            Ok(())
        }
    }

    fn config(value: serde_json::Value) -> SweepConfig {
        SweepConfig::from_value(value).expect("config")
    }

    fn two_scale_config() -> SweepConfig {
        config(json!({
            "scaleup": [1, 2],
            "max_procs_per_node": 4,
            "benchmarks": {
                "workdir": "runs/{SBATCH_n}",
                "command": "bench",
                "arguments": ["x"],
                "num_settings": 1
            }
        }))
    }

    #[test]
    fn two_process_counts_give_two_single_step_batch_files() {
        let root = test_dir("project_e2e");
        let mut project = Project::new(
            root.clone(),
            two_scale_config(),
            Box::new(SlurmScheduler::default()),
            Box::new(AssumeYes),
        )
        .expect("project");

        let pairs: Vec<(u64, u64)> = project
            .batch_scripts()
            .expect("scripts")
            .iter()
            .map(|s| (s.procs(), s.nodes()))
            .collect();
        assert_eq!(pairs, vec![(1, 1), (2, 1)]);

        let outcome = project.execute(UserCommand::Generate).expect("generate");
        assert!(outcome.ok, "{}", outcome.message);
        let executable = root.join("bench");
        for procs in [1, 2] {
            let path = root.join(format!("benchmark_job-{}.batch", procs));
            let text = fs::read_to_string(&path).expect("batch file");
            let steps: Vec<&str> = text
                .lines()
                .filter(|l| l.contains(&*executable.to_string_lossy()))
                .collect();
            assert_eq!(steps.len(), 1, "{}", text);
            assert!(steps[0].ends_with(&format!("{} x && popd &>/dev/null", executable.display())));
            assert!(text.contains(&format!("#SBATCH -n {}", procs)));
            assert!(text.contains("#SBATCH -N 1"));
        }
        assert_eq!(
            project.listing().directories,
            vec![root.join("runs"), root.join("runs/1"), root.join("runs/2")]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_submission_stops_remaining_scripts() {
        let root = test_dir("project_fail_fast");
        let submitted = Rc::new(RefCell::new(Vec::new()));
        let scheduler = RecordingScheduler {
            submitted: submitted.clone(),
            cancelled: Rc::new(RefCell::new(0)),
            fail_at: Some(1),
        };
        let mut project = Project::new(
            root.clone(),
            two_scale_config(),
            Box::new(scheduler),
            Box::new(AssumeYes),
        )
        .expect("project");

        let outcome = project.execute(UserCommand::Run).expect("run");
        assert!(!outcome.ok);
        assert_eq!(outcome.state, State::Generated);
        assert_eq!(*submitted.borrow(), vec![1]);
        assert_eq!(project.store().submitted_jobs().expect("jobs").len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn expansion_error_aborts_before_writing_that_script() {
        let root = test_dir("project_expand_error");
        let config = config(json!({
            "scaleup": [1, 8],
            "benchmarks": { "workdir": "w", "command": "c" },
            "conditional": [
                { "condition": "n > 4", "benchmarks": { "workdir": "{UNDEFINED}" } }
            ]
        }));
        let mut project = Project::new(
            root.clone(),
            config,
            Box::new(SlurmScheduler::default()),
            Box::new(AssumeYes),
        )
        .expect("project");
        let outcome = project.execute(UserCommand::Generate).expect("generate");
        assert!(!outcome.ok);
        assert!(outcome.message.contains("UNDEFINED"), "{}", outcome.message);
        assert_eq!(outcome.state, State::Init);
        assert!(root.join("benchmark_job-1.batch").is_file());
        assert!(!root.join("benchmark_job-8.batch").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn local_run_completes_and_purge_removes_everything() {
        let root = test_dir("project_local");
        let config = config(json!({
            "scaleup": [1, 2],
            "scheduler": "LOCAL",
            "scheduler_params": { "output": "logs/{SBATCH_job-name}-{SBATCH_n}-%j.out" },
            "benchmarks": {
                "workdir": "runs/{SBATCH_n}",
                "command_dir": "/bin",
                "command": "echo",
                "arguments": ["x"]
            }
        }));
        let mut project = Project::new(
            root.clone(),
            config,
            Box::new(LocalScheduler::default()),
            Box::new(AssumeYes),
        )
        .expect("project");

        let outcome = project.execute(UserCommand::Run).expect("run");
        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.state, State::Completed);
        let outputs = project.listing().output_files;
        assert_eq!(outputs.len(), 2);
        for output in &outputs {
            assert_eq!(fs::read_to_string(output).expect("output").trim(), "x");
        }
        let stats = project.job_stats().expect("stats");
        assert!(stats.iter().all(|s| s.stats.state == "COMPLETED"));

        let outcome = project.execute(UserCommand::Purge).expect("purge");
        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.state, State::Init);
        assert!(!root.join("runs").exists());
        assert!(!root.join("logs").exists());
        assert!(!root.join("benchmark_job-1.batch").exists());
        assert!(outputs.iter().all(|o| !o.exists()));
        let listing = project.listing();
        assert!(listing.directories.is_empty() && listing.batch_scripts.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_local_run_keeps_output_for_purge() {
        let root = test_dir("project_local_fail");
        let config = config(json!({
            "scaleup": [1, 2],
            "scheduler": "LOCAL",
            "scheduler_params": { "output": "logs/{SBATCH_n}-%j.out" },
            "benchmarks": { "workdir": ".", "command_dir": "/bin", "command": "false" }
        }));
        let mut project = Project::new(
            root.clone(),
            config,
            Box::new(LocalScheduler::default()),
            Box::new(AssumeYes),
        )
        .expect("project");

        let outcome = project.execute(UserCommand::Run).expect("run");
        assert!(!outcome.ok);
        assert!(outcome.message.contains("exited with status 1"), "{}", outcome.message);
        assert_eq!(outcome.state, State::Generated);
        let outputs = project.listing().output_files;
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].starts_with(root.join("logs")));
        assert!(project.store().submitted_jobs().expect("jobs").is_empty());

        let outcome = project.execute(UserCommand::Purge).expect("purge");
        assert!(outcome.ok, "{}", outcome.message);
        assert!(!root.join("logs").exists());
        assert!(!outputs[0].exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_backend_still_exposes_stored_state() {
        let root = test_dir("project_unknown_backend");
        let sweep_file = root.join("sweep.toml");
        fs::write(
            &sweep_file,
            "scaleup = [1]\nscheduler = \"PBS\"\n[benchmarks]\nworkdir = \".\"\ncommand = \"bench\"\n",
        )
        .expect("sweep file");
        let options = ProjectOptions {
            sweep_file: sweep_file.clone(),
            overrides: Vec::new(),
            force: true,
        };
        let err = match Project::open(&options, &SchedulerRegistry::with_builtin()) {
            Ok(_) => panic!("PBS must not resolve"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::UnknownScheduler { .. })
        ));
        assert_eq!(Project::stored_state(&sweep_file).expect("state"), State::Init);

        let mut store = ProjectStore::open(&root.join(DEFAULT_STORE_FILE)).expect("store");
        store.set_status("generated").expect("status");
        assert_eq!(Project::stored_state(&sweep_file).expect("state"), State::Generated);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn declined_overwrite_keeps_project_in_init() {
        struct No;
        impl Confirm for No {
            fn confirm(&mut self, _question: &str) -> Result<bool> {
                Ok(false)
            }
        }

        let root = test_dir("project_decline");
        fs::write(root.join("benchmark_job-1.batch"), "old").expect("existing");
        let mut project = Project::new(
            root.clone(),
            two_scale_config(),
            Box::new(SlurmScheduler::default()),
            Box::new(No),
        )
        .expect("project");
        let outcome = project.execute(UserCommand::Generate).expect("generate");
        assert!(!outcome.ok);
        assert_eq!(outcome.state, State::Init);
        assert_eq!(
            fs::read_to_string(root.join("benchmark_job-1.batch")).expect("kept"),
            "old"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cancel_clears_submissions() {
        let root = test_dir("project_cancel");
        let cancelled = Rc::new(RefCell::new(0));
        let scheduler = RecordingScheduler {
            submitted: Rc::new(RefCell::new(Vec::new())),
            cancelled: cancelled.clone(),
            fail_at: None,
        };
        let mut project = Project::new(
            root.clone(),
            two_scale_config(),
            Box::new(scheduler),
            Box::new(AssumeYes),
        )
        .expect("project");
        assert_eq!(project.execute(UserCommand::Run).expect("run").state, State::Running);
        let outcome = project.execute(UserCommand::Cancel).expect("cancel");
        assert_eq!(outcome.state, State::Generated);
        assert_eq!(*cancelled.borrow(), 2);
        assert!(project.store().submitted_jobs().expect("jobs").is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
