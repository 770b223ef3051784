use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use relay_contract::{PersistentStorage, StorageError, StorageOperation};
use relay_core::{current_unix_timestamp_ms, write_text_atomic};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

pub(crate) const BACKUP_DIR: &str = "backups";
pub(crate) const STORE_MARKER_FILE: &str = "store.json";
pub(crate) const BACKUP_MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `StoreMarker` used across Relay components.
pub(crate) struct StoreMarker {
    pub(crate) schema_version: u32,
    pub(crate) session_id: String,
    pub(crate) connected_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `BackupEntry` used across Relay components.
pub(crate) struct BackupEntry {
    pub(crate) path: String,
    pub(crate) bytes: u64,
    pub(crate) sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `BackupManifest` used across Relay components.
pub(crate) struct BackupManifest {
    pub(crate) schema_version: u32,
    pub(crate) session_id: String,
    pub(crate) created_unix_ms: u64,
    pub(crate) entries: Vec<BackupEntry>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn collect_entries(root: &Path, dir: &Path, entries: &mut Vec<BackupEntry>) -> Result<()> {
    let mut children = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read entries of {}", dir.display()))?;
    children.sort_by_key(|entry| entry.file_name());
    for child in children {
        let path = child.path();
        let file_type = child
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_dir() {
            if dir == root && child.file_name() == BACKUP_DIR {
                continue;
            }
            collect_entries(root, &path, entries)?;
        } else if file_type.is_file() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            entries.push(BackupEntry {
                path: relative.to_string_lossy().replace('\\', "/"),
                bytes: bytes.len() as u64,
                sha256: sha256_hex(&bytes),
            });
        }
    }
    Ok(())
}

/// Builds a manifest of every file under `root` except earlier backups.
pub(crate) fn build_backup_manifest(
    root: &Path,
    session_id: &str,
    now_unix_ms: u64,
) -> Result<BackupManifest> {
    let mut entries = Vec::new();
    collect_entries(root, root, &mut entries)?;
    Ok(BackupManifest {
        schema_version: BACKUP_MANIFEST_SCHEMA_VERSION,
        session_id: session_id.to_string(),
        created_unix_ms: now_unix_ms,
        entries,
    })
}

/// Directory-backed store. `backup` writes a checksummed manifest of the
/// state directory under `backups/`.
pub(crate) struct FileStorage {
    root: PathBuf,
    session_id: String,
    connected: AtomicBool,
}

impl FileStorage {
    pub(crate) fn new(root: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            session_id: session_id.into(),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    fn connect_blocking(&self) -> Result<()> {
        std::fs::create_dir_all(self.backup_dir())
            .with_context(|| format!("failed to create {}", self.backup_dir().display()))?;
        let marker = StoreMarker {
            schema_version: BACKUP_MANIFEST_SCHEMA_VERSION,
            session_id: self.session_id.clone(),
            connected_unix_ms: current_unix_timestamp_ms(),
        };
        let payload =
            serde_json::to_string_pretty(&marker).context("failed to encode store marker")?;
        write_text_atomic(&self.root.join(STORE_MARKER_FILE), &payload)
    }

    fn backup_blocking(&self) -> Result<PathBuf> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("storage at {} is not connected", self.root.display());
        }
        let now_unix_ms = current_unix_timestamp_ms();
        let manifest = build_backup_manifest(&self.root, &self.session_id, now_unix_ms)?;
        let payload =
            serde_json::to_string_pretty(&manifest).context("failed to encode backup manifest")?;
        let path = self
            .backup_dir()
            .join(format!("backup-{now_unix_ms}.json"));
        write_text_atomic(&path, &payload)?;
        Ok(path)
    }
}

#[async_trait]
impl PersistentStorage for FileStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connect_blocking()
            .map_err(|error| StorageError::new(StorageOperation::Connect, format!("{error:#}")))?;
        self.connected.store(true, Ordering::SeqCst);
        info!(root = %self.root.display(), "file storage connected");
        Ok(())
    }

    async fn backup(&self) -> Result<(), StorageError> {
        let path = self
            .backup_blocking()
            .map_err(|error| StorageError::new(StorageOperation::Backup, format!("{error:#}")))?;
        info!(manifest = %path.display(), "backup written");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(StorageError::new(
                StorageOperation::Disconnect,
                "storage was not connected",
            ));
        }
        info!(root = %self.root.display(), "file storage disconnected");
        Ok(())
    }
}
