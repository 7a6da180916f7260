//! Sweep file loading: TOML or YAML into an order-preserving JSON tree,
//! built-in defaults underneath, `-p` overrides on top, then typed parsing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::condition::{deep_merge, ConditionalOverride};
use crate::error::{SweepError, SweepResult};
use crate::namespace::{Namespace, DEFAULT_MAX_PROCS_PER_NODE};
use crate::sequence::{scale_up_generator, SweepSpec};
use crate::util::canonical_json_digest;

pub const DEFAULT_SWEEP_FILE: &str = "sweep.toml";
pub const DEFAULT_ARCHIVE_NAME: &str = "sweep";

/// Outer-axis length used when the process-count sweep never ends on its own
/// and no `max_batchfiles` is configured.
pub const DEFAULT_UNBOUNDED_BATCHFILES: usize = 1;

const DEFAULTS: &str = r#"
max_procs_per_node = 4
batchfile_name = "{SBATCH_job-name}-{SBATCH_n}.batch"
setup = ""
cleanup = ""
scheduler = "SLURM"

[env_vars]

[scheduler_params]
job-name = "benchmark_job"
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    raw: Value,
    pub scaleup: SweepSpec,
    pub max_batchfiles: Option<usize>,
    pub scheduler: String,
    pub max_procs_per_node: u64,
    pub batchfile_name: String,
    pub setup: String,
    pub cleanup: String,
    pub modules: Vec<String>,
    pub env_vars: Namespace,
    pub scheduler_params: Namespace,
    pub benchmarks: Value,
    pub conditionals: Vec<ConditionalOverride>,
    pub archive_name: String,
}

impl SweepConfig {
    /// Parses a user document after merging it over the built-in defaults.
    pub fn from_value(user: Value) -> SweepResult<SweepConfig> {
        let mut raw = defaults()?;
        deep_merge(&mut raw, &user);
        if let Some(alias) = raw.get("sbatch_params").cloned() {
            if let Some(params) = raw.get_mut("scheduler_params") {
                deep_merge(params, &alias);
            }
        }

        let scaleup = SweepSpec::parse(
            "scaleup",
            raw.get("scaleup")
                .ok_or_else(|| SweepError::config("'scaleup' is required"))?,
        )?;
        let max_batchfiles = match raw.get("max_batchfiles") {
            None => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| SweepError::config("'max_batchfiles' must be an integer"))?
                    as usize,
            ),
        };
        let max_procs_per_node = match raw.get("max_procs_per_node") {
            None => DEFAULT_MAX_PROCS_PER_NODE,
            Some(v) => v
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| SweepError::config("'max_procs_per_node' must be a positive integer"))?,
        };
        let modules = match raw.get("modules") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| SweepError::config("'modules' entries must be strings"))
                })
                .collect::<SweepResult<Vec<_>>>()?,
            Some(Value::String(s)) => s.split_whitespace().map(|m| m.to_string()).collect(),
            Some(_) => return Err(SweepError::config("'modules' must be a list")),
        };
        let conditionals = match raw.get("conditional") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(ConditionalOverride::from_value)
                .collect::<SweepResult<Vec<_>>>()?,
            Some(_) => return Err(SweepError::config("'conditional' must be a list of tables")),
        };
        let benchmarks = raw
            .get("benchmarks")
            .cloned()
            .filter(|v| v.is_object())
            .ok_or_else(|| SweepError::config("'benchmarks' table is required"))?;

        Ok(SweepConfig {
            scaleup,
            max_batchfiles,
            scheduler: string_field(&raw, "scheduler")?.unwrap_or_else(|| "SLURM".to_string()),
            max_procs_per_node,
            batchfile_name: string_field(&raw, "batchfile_name")?
                .unwrap_or_else(|| "{SBATCH_job-name}-{SBATCH_n}.batch".to_string()),
            setup: string_field(&raw, "setup")?.unwrap_or_default(),
            cleanup: string_field(&raw, "cleanup")?.unwrap_or_default(),
            modules,
            env_vars: Namespace::from_value("env_vars", raw.get("env_vars").unwrap_or(&Value::Null))?,
            scheduler_params: Namespace::from_value(
                "scheduler_params",
                raw.get("scheduler_params").unwrap_or(&Value::Null),
            )?,
            benchmarks,
            conditionals,
            archive_name: string_field(&raw, "archive_name")?
                .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string()),
            raw,
        })
    }

    /// Effective configuration (defaults + file + overrides).
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn digest(&self) -> String {
        canonical_json_digest(&self.raw)
    }

    /// Process counts of the outer sweep, in generation order.
    pub fn process_counts(&self) -> SweepResult<Vec<u64>> {
        let sequence = scale_up_generator(&self.scaleup);
        let limit = match (sequence.is_bounded(), self.max_batchfiles) {
            (_, Some(limit)) => limit,
            (true, None) => usize::MAX,
            (false, None) => {
                warn!(
                    "scaleup has no end; generating {} batch file(s) (set max_batchfiles to change)",
                    DEFAULT_UNBOUNDED_BATCHFILES
                );
                DEFAULT_UNBOUNDED_BATCHFILES
            }
        };
        sequence
            .take(limit)
            .map(|value| {
                value
                    .as_i64()
                    .filter(|n| *n > 0)
                    .map(|n| n as u64)
                    .ok_or_else(|| SweepError::InvalidSweep {
                        name: "scaleup".to_string(),
                        reason: format!("process count must be a positive integer, got {}", value),
                    })
            })
            .collect()
    }
}

fn string_field(raw: &Value, key: &str) -> SweepResult<Option<String>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SweepError::config(format!("'{}' must be a string", key))),
    }
}

fn defaults() -> SweepResult<Value> {
    toml::from_str::<Value>(DEFAULTS)
        .map_err(|e| SweepError::config(format!("built-in defaults: {}", e)))
}

/// Parses a sweep document; YAML for `.yaml`/`.yml`, TOML otherwise.
pub fn parse_document(raw: &str, path: &Path) -> Result<Value> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let value = if ext == "yaml" || ext == "yml" {
        let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw)
            .with_context(|| format!("parsing YAML sweep file {}", path.display()))?;
        serde_json::to_value(yaml_value)?
    } else {
        toml::from_str::<Value>(raw)
            .with_context(|| format!("parsing TOML sweep file {}", path.display()))?
    };
    if !value.is_object() {
        return Err(anyhow!("sweep file {} must be a table", path.display()));
    }
    Ok(value)
}

/// Merges each `-p` TOML snippet over `config`, in order.
pub fn apply_user_overrides(mut config: Value, overrides: &[String]) -> SweepResult<Value> {
    for snippet in overrides {
        let parsed = toml::from_str::<Value>(snippet).map_err(|e| {
            SweepError::config(format!("override parameter \"{}\": {}", snippet, e))
        })?;
        debug!(snippet = snippet.as_str(), "applying override");
        deep_merge(&mut config, &parsed);
    }
    Ok(config)
}

/// Reads, merges and parses a sweep file.
pub fn load_sweep_file(path: &Path, overrides: &[String]) -> Result<SweepConfig> {
    if !path.is_file() {
        return Err(anyhow!("sweep file not found: {}", path.display()));
    }
    debug!(path = %path.display(), "loading sweep file");
    let raw = fs::read_to_string(path)?;
    let user = parse_document(&raw, path)?;
    let user = apply_user_overrides(user, overrides)?;
    let config = SweepConfig::from_value(user)
        .with_context(|| format!("reading sweep file {}", path.display()))?;
    Ok(config)
}

/// Directory holding the sweep file; generated paths are relative to it.
pub fn project_root(sweep_file: &Path) -> PathBuf {
    let dir = sweep_file.parent().unwrap_or(Path::new("."));
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}
