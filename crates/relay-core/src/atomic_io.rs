//! Whole-file replacement for state the bot rewrites in place: the health
//! snapshot and the storage marker.
//!
//! Content is staged in a sibling file, synced, then renamed over the target,
//! so a reader sees either the previous snapshot or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn staging_path(target: &Path, dir: &Path) -> PathBuf {
    let stem = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("snapshot");
    let sequence = STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{stem}.staging-{}-{sequence}", std::process::id()))
}

fn stage(staging: &Path, content: &str) -> Result<()> {
    let mut file = File::create(staging)
        .with_context(|| format!("cannot stage snapshot at {}", staging.display()))?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("cannot flush staged snapshot {}", staging.display()))
}

/// Replaces `path` with `content`. Missing parent directories are created;
/// a directory at `path` is refused.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("snapshot path is empty");
    }
    if path.is_dir() {
        bail!("snapshot target {} is a directory", path.display());
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("cannot create snapshot directory {}", dir.display()))?;

    let staging = staging_path(path, dir);
    let replaced = stage(&staging, content).and_then(|()| {
        fs::rename(&staging, path)
            .with_context(|| format!("cannot move staged snapshot onto {}", path.display()))
    });
    if replaced.is_err() {
        let _ = fs::remove_file(&staging);
    }
    replaced
}
