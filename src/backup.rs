//! Backup manager
//!
//! Snapshots live in `backups/<app>/<id>/`, where the id is the creation
//! timestamp. A `full` snapshot holds `tree.tar.gz` (the working tree) and
//! `metadata.json` (the application record); a `config` snapshot, taken on
//! removal, holds only the metadata. Snapshots are assembled in a `.tmp`
//! directory and renamed into place, so a listed snapshot is always
//! complete. Nothing is pruned automatically.

use crate::error::{DeployError, Result};
use crate::fsutil;
use crate::models::AppRecord;
use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TREE_ARCHIVE: &str = "tree.tar.gz";
const METADATA_FILE: &str = "metadata.json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Working tree and record
    Full,
    /// Record only
    Config,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Config => write!(f, "config"),
        }
    }
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub record: AppRecord,
}

/// Listing entry
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub id: String,
    pub app: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub revision: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    backups_dir: PathBuf,
    apps_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backups_dir: PathBuf, apps_dir: PathBuf) -> Self {
        Self {
            backups_dir,
            apps_dir,
        }
    }

    fn app_dir(&self, app: &str) -> PathBuf {
        self.backups_dir.join(app)
    }

    fn backup_dir(&self, app: &str, id: &str) -> PathBuf {
        self.app_dir(app).join(id)
    }

    /// Snapshot the working tree and the record
    pub fn create_full(&self, record: &AppRecord) -> Result<BackupInfo> {
        self.create(record, BackupKind::Full)
    }

    /// Snapshot the record only
    pub fn create_config(&self, record: &AppRecord) -> Result<BackupInfo> {
        self.create(record, BackupKind::Config)
    }

    fn create(&self, record: &AppRecord, kind: BackupKind) -> Result<BackupInfo> {
        let created_at = Utc::now();
        let id = self.unique_id(&record.name, created_at)?;
        let final_dir = self.backup_dir(&record.name, &id);
        let tmp_dir = self.backup_dir(&record.name, &format!("{}{}", id, TMP_SUFFIX));

        fsutil::remove_dir_if_exists(&tmp_dir)?;
        std::fs::create_dir_all(&tmp_dir)
            .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;

        let result = (|| -> anyhow::Result<()> {
            if kind == BackupKind::Full {
                let tree = self.apps_dir.join(&record.name);
                write_archive(&tree, &tmp_dir.join(TREE_ARCHIVE))?;
            }
            let metadata = BackupMetadata {
                id: id.clone(),
                kind,
                created_at,
                record: record.clone(),
            };
            let json = serde_json::to_vec_pretty(&metadata)?;
            fsutil::write_atomic(&tmp_dir.join(METADATA_FILE), &json)?;
            std::fs::rename(&tmp_dir, &final_dir)
                .with_context(|| format!("Failed to finalize backup {}", id))?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fsutil::remove_dir_if_exists(&tmp_dir);
            return Err(DeployError::Internal(
                e.context(format!("Backup of {} failed", record.name)),
            ));
        }

        info!(app = %record.name, backup = %id, kind = %kind, "Backup created");
        self.info(&record.name, &id)
    }

    /// Timestamp id, suffixed when two snapshots land in the same millisecond
    fn unique_id(&self, app: &str, at: DateTime<Utc>) -> Result<String> {
        let base = at.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut id = base.clone();
        let mut n = 1;
        while self.backup_dir(app, &id).exists() {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        Ok(id)
    }

    pub fn exists(&self, app: &str, id: &str) -> bool {
        self.backup_dir(app, id).join(METADATA_FILE).is_file()
    }

    /// Metadata of one snapshot
    pub fn metadata(&self, app: &str, id: &str) -> Result<BackupMetadata> {
        let path = self.backup_dir(app, id).join(METADATA_FILE);
        if !path.is_file() {
            return Err(DeployError::BackupNotFound(format!("{}/{}", app, id)));
        }
        let content = std::fs::read(&path)?;
        let metadata = serde_json::from_slice(&content)
            .with_context(|| format!("Corrupt backup metadata at {}", path.display()))?;
        Ok(metadata)
    }

    pub fn info(&self, app: &str, id: &str) -> Result<BackupInfo> {
        let metadata = self.metadata(app, id)?;
        let size_bytes = dir_size(&self.backup_dir(app, id));
        Ok(BackupInfo {
            id: metadata.id,
            app: app.to_string(),
            kind: metadata.kind,
            created_at: metadata.created_at,
            revision: metadata.record.revision,
            size_bytes,
        })
    }

    /// Snapshots of `app`, oldest first
    pub fn list(&self, app: &str) -> Result<Vec<BackupInfo>> {
        let dir = self.app_dir(app);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(TMP_SUFFIX))
            .collect();
        ids.sort();

        let mut backups = Vec::new();
        for id in ids {
            match self.info(app, &id) {
                Ok(info) => backups.push(info),
                Err(e) => debug!(app = %app, backup = %id, error = %e, "Skipping unreadable backup"),
            }
        }
        Ok(backups)
    }

    /// Newest snapshot of the given kind, if any
    pub fn latest(&self, app: &str, kind: Option<BackupKind>) -> Result<Option<BackupInfo>> {
        Ok(self
            .list(app)?
            .into_iter()
            .filter(|b| kind.map_or(true, |k| b.kind == k))
            .last())
    }

    /// Replace `dest` with the snapshot's working tree
    pub fn restore_tree(&self, app: &str, id: &str, dest: &Path) -> Result<()> {
        let archive = self.backup_dir(app, id).join(TREE_ARCHIVE);
        if !archive.is_file() {
            return Err(DeployError::BackupNotFound(format!(
                "{}/{} has no working tree",
                app, id
            )));
        }

        fsutil::remove_dir_if_exists(dest)?;
        std::fs::create_dir_all(dest)?;

        let file = File::open(&archive)?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        tar.set_preserve_permissions(true);
        tar.unpack(dest)
            .with_context(|| format!("Failed to extract backup {}/{}", app, id))?;

        info!(app = %app, backup = %id, "Working tree restored");
        Ok(())
    }

    pub fn has_tree(&self, app: &str, id: &str) -> bool {
        self.backup_dir(app, id).join(TREE_ARCHIVE).is_file()
    }

    /// Delete every snapshot of `app`
    pub fn delete_all(&self, app: &str) -> Result<usize> {
        let count = self.list(app)?.len();
        fsutil::remove_dir_if_exists(&self.app_dir(app))?;
        info!(app = %app, count, "Backups deleted");
        Ok(count)
    }
}

fn write_archive(src: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = File::create(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    if src.is_dir() {
        builder
            .append_dir_all(".", src)
            .with_context(|| format!("Failed to archive {}", src.display()))?;
    }
    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}
