use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;
use walkdir::WalkDir;
use zip::write::FileOptions;

pub const CONFIG_ENTRY: &str = "sweep.json";

/// Zip entry name for `path`: relative to `root` when inside it.
fn entry_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('\\', "/")
}

/// Bundles every file under `directories` plus the effective configuration.
/// Returns the number of files archived, the configuration included.
pub fn write_archive(
    out: &Path,
    root: &Path,
    directories: &[PathBuf],
    config: &Value,
) -> Result<usize> {
    let mut files = BTreeSet::new();
    for dir in directories.iter().filter(|d| d.is_dir()) {
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && entry.path() != out {
                files.insert(entry.path().to_path_buf());
            }
        }
    }

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = FileOptions::default();
    writer.start_file(CONFIG_ENTRY, options)?;
    writer.write_all(&serde_json::to_vec_pretty(config)?)?;
    for path in &files {
        writer.start_file(entry_name(root, path), options)?;
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        writer.write_all(&data)?;
    }
    writer.finish()?;
    info!(archive = %out.display(), files = files.len() + 1, "archive written");
    Ok(files.len() + 1)
}
