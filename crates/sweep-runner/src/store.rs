//! Flat JSON key/value file holding the project state between invocations.
//!
//! The whole file is read on open and rewritten atomically on every flush.
//! No locking: two `sweep` processes sharing one project race on this file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::scheduler::SubmittedJob;
use crate::util::atomic_write_json_pretty;

pub const DEFAULT_STORE_FILE: &str = ".sweep_state.json";

pub const KEY_DIRECTORIES: &str = "generated_directories";
pub const KEY_BATCH_SCRIPTS: &str = "generated_batch_scripts";
pub const KEY_OUTPUT_FILES: &str = "detected_output_files";
pub const KEY_COUNTER: &str = "state_counter";
pub const KEY_STATUS: &str = "status";
pub const KEY_SUBMITTED_JOBS: &str = "submitted_jobs";
pub const KEY_CONFIG_DIGEST: &str = "config_digest";
pub const KEY_UPDATED_AT: &str = "updated_at";

#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    data: Map<String, Value>,
}

impl JsonStore {
    /// Opens the store, reading the backing file if it exists.
    pub fn open(path: &Path) -> Result<JsonStore> {
        let mut store = JsonStore {
            path: path.to_path_buf(),
            data: Map::new(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// In-memory only; see `store_value` and `flush`.
    pub fn set(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn store_value(&mut self, key: &str, value: Value) -> Result<()> {
        self.set(key, value);
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.data
            .insert(KEY_UPDATED_AT.to_string(), json!(Utc::now().to_rfc3339()));
        atomic_write_json_pretty(&self.path, &Value::Object(self.data.clone()))
            .with_context(|| format!("writing state file {}", self.path.display()))?;
        trace!(path = %self.path.display(), "flushed state");
        Ok(())
    }

    /// Replaces the in-memory state with the file contents, or with an
    /// empty state when the file does not exist.
    pub fn load(&mut self) -> Result<()> {
        self.data = if self.path.exists() {
            let raw = fs::read_to_string(&self.path)?;
            match serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("parsing state file {}", self.path.display()))?
            {
                Value::Object(map) => map,
                _ => anyhow::bail!("state file {} is not a JSON object", self.path.display()),
            }
        } else {
            Map::new()
        };
        Ok(())
    }
}

/// Typed project bookkeeping on top of `JsonStore`.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    store: JsonStore,
}

impl ProjectStore {
    pub fn open(path: &Path) -> Result<ProjectStore> {
        Ok(ProjectStore {
            store: JsonStore::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn reload(&mut self) -> Result<()> {
        self.store.load()
    }

    pub fn status(&self) -> Option<String> {
        self.store
            .get(KEY_STATUS)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn set_status(&mut self, status: &str) -> Result<()> {
        self.store.store_value(KEY_STATUS, json!(status))
    }

    pub fn counter(&self) -> u64 {
        self.store
            .get(KEY_COUNTER)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Records a created directory; returns `false` if it was already known.
    pub fn add_directory(&mut self, path: &Path) -> Result<bool> {
        self.add_to_set(KEY_DIRECTORIES, path)
    }

    pub fn add_batch_script(&mut self, path: &Path) -> Result<bool> {
        self.add_to_set(KEY_BATCH_SCRIPTS, path)
    }

    pub fn add_output_file(&mut self, path: &Path) -> Result<bool> {
        self.add_to_set(KEY_OUTPUT_FILES, path)
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.set_members(KEY_DIRECTORIES)
    }

    pub fn batch_scripts(&self) -> Vec<PathBuf> {
        self.set_members(KEY_BATCH_SCRIPTS)
    }

    pub fn output_files(&self) -> Vec<PathBuf> {
        self.set_members(KEY_OUTPUT_FILES)
    }

    pub fn has_output_file(&self, path: &Path) -> bool {
        self.store
            .get(KEY_OUTPUT_FILES)
            .and_then(|v| v.get(&*path.to_string_lossy()))
            .is_some()
    }

    /// Empties the three artifact sets in a single flush.
    pub fn clear_generated_files(&mut self) -> Result<()> {
        for key in [KEY_DIRECTORIES, KEY_BATCH_SCRIPTS, KEY_OUTPUT_FILES] {
            self.store.set(key, json!({}));
        }
        self.bump_counter();
        self.store.flush()
    }

    /// Submitted jobs keyed by batch file, in submission order.
    pub fn submitted_jobs(&self) -> Result<Vec<(PathBuf, SubmittedJob)>> {
        let Some(Value::Object(map)) = self.store.get(KEY_SUBMITTED_JOBS) else {
            return Ok(Vec::new());
        };
        map.iter()
            .map(|(script, job)| -> Result<(PathBuf, SubmittedJob)> {
                let job = serde_json::from_value::<SubmittedJob>(job.clone())
                    .with_context(|| format!("submitted job entry for {}", script))?;
                Ok((PathBuf::from(script), job))
            })
            .collect()
    }

    pub fn record_submission(&mut self, script: &Path, job: &SubmittedJob) -> Result<()> {
        let mut jobs = self.object(KEY_SUBMITTED_JOBS);
        jobs.insert(script.to_string_lossy().into_owned(), serde_json::to_value(job)?);
        self.store.set(KEY_SUBMITTED_JOBS, Value::Object(jobs));
        self.bump_counter();
        self.store.flush()
    }

    pub fn clear_submissions(&mut self) -> Result<()> {
        self.store.store_value(KEY_SUBMITTED_JOBS, json!({}))
    }

    pub fn config_digest(&self) -> Option<String> {
        self.store
            .get(KEY_CONFIG_DIGEST)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn set_config_digest(&mut self, digest: Option<&str>) -> Result<()> {
        let value = digest.map(|d| json!(d)).unwrap_or(Value::Null);
        self.store.store_value(KEY_CONFIG_DIGEST, value)
    }

    fn add_to_set(&mut self, key: &str, path: &Path) -> Result<bool> {
        let member = path.to_string_lossy().into_owned();
        let mut set = self.object(key);
        if set.contains_key(&member) {
            return Ok(false);
        }
        set.insert(member.clone(), json!(true));
        self.store.set(key, Value::Object(set));
        self.bump_counter();
        self.store.flush()?;
        debug!(set = key, path = member.as_str(), "recorded");
        Ok(true)
    }

    fn set_members(&self, key: &str) -> Vec<PathBuf> {
        match self.store.get(key) {
            Some(Value::Object(map)) => map.keys().map(PathBuf::from).collect(),
            _ => Vec::new(),
        }
    }

    fn object(&self, key: &str) -> Map<String, Value> {
        match self.store.get(key) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    fn bump_counter(&mut self) {
        let next = self.counter() + 1;
        self.store.set(KEY_COUNTER, json!(next));
    }
}
