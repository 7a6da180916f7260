//! Ordered, self-referential parameter namespaces.
//!
//! Entries are resolved strictly left to right: a string entry may reference
//! the external bindings and any entry declared before it, under the
//! backend prefix (`{SBATCH_job-name}`). A forward reference is an
//! `UnresolvedReference`, never a silent empty string.

use serde_json::Value;
use tracing::debug;

use crate::error::{SweepError, SweepResult};
use crate::sequence::Scalar;
use crate::template::Bindings;

pub const KEY_PROCS: &str = "n";
pub const KEY_NODES: &str = "N";
pub const KEY_JOB_NAME: &str = "job-name";
pub const KEY_OUTPUT: &str = "output";
pub const PROCS_ON_NODE: &str = "procs_on_node";

pub const DEFAULT_JOB_NAME: &str = "benchmark_job";
pub const DEFAULT_MAX_PROCS_PER_NODE: u64 = 4;

/// Declaration-ordered association list of raw entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Namespace {
    entries: Vec<(String, Scalar)>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(name: &str, value: &Value) -> SweepResult<Namespace> {
        let mut namespace = Namespace::new();
        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (key, raw) in map.iter() {
                    let scalar = Scalar::from_value(raw).ok_or_else(|| {
                        SweepError::config(format!("{}.{} must be a scalar", name, key))
                    })?;
                    namespace.push(key.clone(), scalar);
                }
            }
            _ => return Err(SweepError::config(format!("{} must be a table", name))),
        }
        Ok(namespace)
    }

    /// Appends an entry, replacing an existing one with the same key in place.
    pub fn push(&mut self, key: impl Into<String>, value: Scalar) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn entries(&self) -> &[(String, Scalar)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves `entries` in order against `external`, exposing each resolved
/// entry to later ones as `{prefix}{key}`. Returns the resolved entries and
/// the final binding pool.
pub fn resolve_entries(
    entries: &[(String, Scalar)],
    external: &Bindings,
    prefix: &str,
) -> SweepResult<(Vec<(String, Scalar)>, Bindings)> {
    let mut pool = external.clone();
    let mut resolved = Vec::with_capacity(entries.len());
    for (key, raw) in entries {
        let value = match raw {
            Scalar::Str(template) => Scalar::Str(pool.render(template)?),
            other => other.clone(),
        };
        pool.insert(format!("{}{}", prefix, key), value.clone());
        resolved.push((key.clone(), value));
    }
    Ok((resolved, pool))
}

/// Nodes needed for `procs` processes with full node-wise allocation.
pub fn node_count(procs: u64, max_procs_per_node: u64) -> u64 {
    procs.div_ceil(max_procs_per_node.max(1))
}

/// Scheduler parameters resolved for one process count.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNamespace {
    prefix: String,
    entries: Vec<(String, Scalar)>,
    formatted: Bindings,
    procs: u64,
    nodes: u64,
    procs_on_node: u64,
}

impl ResolvedNamespace {
    /// Builds the scheduler namespace for `procs` processes. `n` and `N`
    /// resolve first; user entries follow in declaration order. A missing
    /// `job-name` is filled in ahead of the user entries, and a missing
    /// `output` right after `job-name`.
    pub fn resolve(
        params: &Namespace,
        procs: u64,
        max_procs_per_node: u64,
        prefix: &str,
    ) -> SweepResult<ResolvedNamespace> {
        let nodes = node_count(procs, max_procs_per_node);
        let procs_on_node = procs.min(max_procs_per_node);

        let default_output = params.get(KEY_OUTPUT).is_none().then(|| {
            (
                KEY_OUTPUT.to_string(),
                Scalar::Str(format!(
                    "{{{p}{}}}-{{{p}{}}}-%j.out",
                    KEY_JOB_NAME,
                    KEY_PROCS,
                    p = prefix
                )),
            )
        });

        let mut ordered = vec![
            (KEY_PROCS.to_string(), Scalar::Int(procs as i64)),
            (KEY_NODES.to_string(), Scalar::Int(nodes as i64)),
        ];
        if params.get(KEY_JOB_NAME).is_none() {
            ordered.push((KEY_JOB_NAME.to_string(), Scalar::from(DEFAULT_JOB_NAME)));
            ordered.extend(default_output.clone());
        }
        for (key, value) in params.entries() {
            if key == KEY_PROCS || key == KEY_NODES {
                continue;
            }
            ordered.push((key.clone(), value.clone()));
            if key == KEY_JOB_NAME {
                ordered.extend(default_output.clone());
            }
        }

        let mut external = Bindings::new();
        external.insert(PROCS_ON_NODE, Scalar::Int(procs_on_node as i64));
        let (entries, formatted) = resolve_entries(&ordered, &external, prefix)?;
        debug!(procs, nodes, entries = entries.len(), "resolved scheduler namespace");

        Ok(ResolvedNamespace {
            prefix: prefix.to_string(),
            entries,
            formatted,
            procs,
            nodes,
            procs_on_node,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn entries(&self) -> &[(String, Scalar)] {
        &self.entries
    }

    /// Every entry under the backend prefix, plus the external bindings.
    pub fn formatted(&self) -> &Bindings {
        &self.formatted
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn procs(&self) -> u64 {
        self.procs
    }

    pub fn nodes(&self) -> u64 {
        self.nodes
    }

    pub fn procs_on_node(&self) -> u64 {
        self.procs_on_node
    }

    pub fn job_name(&self) -> String {
        self.get(KEY_JOB_NAME)
            .map(|v| v.to_string())
            .unwrap_or_else(|| DEFAULT_JOB_NAME.to_string())
    }

    /// Output path pattern, possibly containing the scheduler's `%j`.
    pub fn output(&self) -> String {
        self.get(KEY_OUTPUT).map(|v| v.to_string()).unwrap_or_default()
    }
}
