//! Expansion of the benchmark template into concrete job steps.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{SweepError, SweepResult};
use crate::namespace::ResolvedNamespace;
use crate::sequence::{generator_from_config, Scalar, Sequence, SweepSpec};
use crate::template::Bindings;
use crate::util::{absolutize, shell_quote};

pub const ARGUMENTS_BINDING: &str = "arguments";

/// Typed form of the `benchmarks` block, after conditional overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkTemplate {
    pub workdir: String,
    pub command_dir: String,
    pub command: String,
    pub arguments: Vec<SweepSpec>,
    pub env_vars: Vec<(String, SweepSpec)>,
    pub num_settings: usize,
    pub use_subshell: bool,
}

impl BenchmarkTemplate {
    pub fn from_value(value: &Value) -> SweepResult<BenchmarkTemplate> {
        let text = |key: &str| -> SweepResult<Option<String>> {
            match value.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => Scalar::from_value(v)
                    .map(|s| Some(s.to_string()))
                    .ok_or_else(|| SweepError::config(format!("benchmarks.{} must be a string", key))),
            }
        };
        let workdir = text("workdir")?
            .ok_or_else(|| SweepError::config("benchmarks.workdir is required"))?;
        let command = text("command")?
            .ok_or_else(|| SweepError::config("benchmarks.command is required"))?;
        let command_dir = text("command_dir")?.unwrap_or_else(|| ".".to_string());

        let num_settings = match value.get("num_settings") {
            None => 1,
            Some(v) => v
                .as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .ok_or_else(|| {
                    SweepError::config("benchmarks.num_settings must be a non-negative integer")
                })? as usize,
        };

        let arguments = match value.get("arguments") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| SweepSpec::parse(&format!("{}[{}]", ARGUMENTS_BINDING, i), v))
                .collect::<SweepResult<Vec<_>>>()?,
            Some(_) => return Err(SweepError::config("benchmarks.arguments must be a list")),
        };

        let env_vars = match value.get("env_vars") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| -> SweepResult<(String, SweepSpec)> {
                    Ok((k.clone(), SweepSpec::parse(&format!("env_vars.{}", k), v)?))
                })
                .collect::<SweepResult<Vec<_>>>()?,
            Some(_) => return Err(SweepError::config("benchmarks.env_vars must be a table")),
        };

        Ok(BenchmarkTemplate {
            workdir,
            command_dir,
            command,
            arguments,
            env_vars,
            num_settings,
            use_subshell: value.get("use_subshell").map(truthy).unwrap_or(false),
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !matches!(
            s.to_lowercase().as_str(),
            "" | "no" | "false" | "f" | "0" | "off"
        ),
        _ => false,
    }
}

/// One concrete command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStep {
    pub workdir: PathBuf,
    pub command_dir: PathBuf,
    pub executable: PathBuf,
    pub arguments: Vec<Scalar>,
    pub env: Vec<(String, Scalar)>,
    pub use_subshell: bool,
}

impl JobStep {
    /// Executable followed by its arguments, shell-quoted.
    pub fn argv_string(&self) -> String {
        std::iter::once(shell_quote(&self.executable.to_string_lossy()))
            .chain(self.arguments.iter().map(|a| shell_quote(&a.to_string())))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn env_string(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(&v.to_string())))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `pushd <workdir> && [ENV=..] [launcher] <argv> && popd`, optionally
    /// wrapped in `echo $( ... )`.
    pub fn command_line(&self, launcher: Option<&str>) -> String {
        let mut invocation = Vec::new();
        let env = self.env_string();
        if !env.is_empty() {
            invocation.push(env);
        }
        if let Some(launcher) = launcher {
            invocation.push(launcher.to_string());
        }
        invocation.push(self.argv_string());
        let line = format!(
            "pushd {} &>/dev/null && {} && popd &>/dev/null",
            shell_quote(&self.workdir.to_string_lossy()),
            invocation.join(" ")
        );
        if self.use_subshell {
            format!("echo $({})", line)
        } else {
            line
        }
    }
}

/// Draws one value per generator for each of the `num_settings` settings and
/// resolves the directory templates for that setting. Relative command
/// directories are anchored at `base_dir`.
pub fn expand_job_steps(
    template: &BenchmarkTemplate,
    namespace: &ResolvedNamespace,
    base_dir: &Path,
) -> SweepResult<Vec<JobStep>> {
    let n = template.num_settings;
    let mut argument_generators: Vec<Sequence> = template
        .arguments
        .iter()
        .enumerate()
        .map(|(i, spec)| generator_from_config(&format!("{}[{}]", ARGUMENTS_BINDING, i), spec, n))
        .collect::<SweepResult<_>>()?;
    let mut env_generators: Vec<(String, Sequence)> = template
        .env_vars
        .iter()
        .map(|(k, spec)| -> SweepResult<(String, Sequence)> {
            let generator = generator_from_config(&format!("env_vars.{}", k), spec, n)?;
            Ok((k.clone(), generator))
        })
        .collect::<SweepResult<_>>()?;

    let mut steps = Vec::with_capacity(n);
    for setting in 0..n {
        let arguments = argument_generators
            .iter_mut()
            .enumerate()
            .map(|(i, g)| {
                g.next()
                    .ok_or_else(|| exhausted(&format!("{}[{}]", ARGUMENTS_BINDING, i), n, setting))
            })
            .collect::<SweepResult<Vec<_>>>()?;
        let env = env_generators
            .iter_mut()
            .map(|(k, g)| {
                g.next()
                    .map(|v| (k.clone(), v))
                    .ok_or_else(|| exhausted(&format!("env_vars.{}", k), n, setting))
            })
            .collect::<SweepResult<Vec<_>>>()?;

        let mut bindings = Bindings::new();
        for (k, v) in env.iter() {
            bindings.insert(k.clone(), v.clone());
        }
        bindings.extend(namespace.formatted());
        bindings.insert_list(ARGUMENTS_BINDING, arguments.clone());

        let workdir = PathBuf::from(bindings.render(&template.workdir)?);
        let command_dir = PathBuf::from(bindings.render(&template.command_dir)?);
        let executable = absolutize(base_dir, &command_dir.join(&template.command));

        steps.push(JobStep {
            workdir,
            command_dir,
            executable,
            arguments,
            env,
            use_subshell: template.use_subshell,
        });
    }
    Ok(steps)
}

fn exhausted(name: &str, needed: usize, found: usize) -> SweepError {
    SweepError::InsufficientValues {
        name: name.to_string(),
        needed,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use serde_json::json;

    fn namespace(procs: u64) -> ResolvedNamespace {
        ResolvedNamespace::resolve(&Namespace::new(), procs, 4, "SBATCH_").expect("namespace")
    }

    #[test]
    fn expands_arguments_and_env_per_setting() {
        let template = BenchmarkTemplate::from_value(&json!({
            "workdir": "out/{SBATCH_n}/{OMP_NUM_THREADS}-{arguments[1]}",
            "command_dir": "bin/{arguments[0]}",
            "command": "bench",
            "arguments": ["fast", {"start": 10, "step": 5}, ["a", "b", "c"]],
            "env_vars": { "OMP_NUM_THREADS": [1, 2, 4] },
            "num_settings": 3
        }))
        .expect("template");
        let steps = expand_job_steps(&template, &namespace(8), Path::new("/proj")).expect("expand");
        assert_eq!(steps.len(), 3);
        let workdirs: Vec<_> = steps.iter().map(|s| s.workdir.clone()).collect();
        assert_eq!(
            workdirs,
            vec![
                PathBuf::from("out/8/1-10"),
                PathBuf::from("out/8/2-15"),
                PathBuf::from("out/8/4-20")
            ]
        );
        assert_eq!(steps[2].executable, PathBuf::from("/proj/bin/fast/bench"));
        assert_eq!(
            steps[1].arguments,
            vec![Scalar::from("fast"), Scalar::Int(15), Scalar::from("b")]
        );
        assert_eq!(steps[0].env, vec![("OMP_NUM_THREADS".to_string(), Scalar::Int(1))]);
    }

    #[test]
    fn short_argument_list_is_insufficient() {
        let template = BenchmarkTemplate::from_value(&json!({
            "workdir": "w",
            "command": "c",
            "arguments": [["only-one"]],
            "num_settings": 2
        }))
        .expect("template");
        match expand_job_steps(&template, &namespace(1), Path::new("/p")) {
            Err(SweepError::InsufficientValues { name, needed, found }) => {
                assert_eq!(name, "arguments[0]");
                assert_eq!((needed, found), (2, 1));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn workdir_with_unknown_name_is_unresolved() {
        let template = BenchmarkTemplate::from_value(&json!({
            "workdir": "{NOPE}",
            "command": "c"
        }))
        .expect("template");
        assert!(matches!(
            expand_job_steps(&template, &namespace(1), Path::new("/p")),
            Err(SweepError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn command_line_wraps_launcher_and_subshell() {
        let mut step = JobStep {
            workdir: PathBuf::from("run 1"),
            command_dir: PathBuf::from("."),
            executable: PathBuf::from("/p/bench"),
            arguments: vec![Scalar::from("x"), Scalar::Int(3)],
            env: vec![("A".to_string(), Scalar::Int(1))],
            use_subshell: false,
        };
        assert_eq!(
            step.command_line(Some("srun")),
            "pushd 'run 1' &>/dev/null && A=1 srun /p/bench x 3 && popd &>/dev/null"
        );
        step.use_subshell = true;
        step.env.clear();
        assert_eq!(
            step.command_line(None),
            "echo $(pushd 'run 1' &>/dev/null && /p/bench x 3 && popd &>/dev/null)"
        );
    }

    #[test]
    fn template_defaults() {
        let template = BenchmarkTemplate::from_value(&json!({
            "workdir": "w",
            "command": "c",
            "use_subshell": "off"
        }))
        .expect("template");
        assert_eq!(template.num_settings, 1);
        assert_eq!(template.command_dir, ".");
        assert!(!template.use_subshell);
        assert!(BenchmarkTemplate::from_value(&json!({"command": "c"})).is_err());
    }
}
