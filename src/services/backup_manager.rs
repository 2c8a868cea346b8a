use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::Serialize;
use walkdir::WalkDir;

use crate::errors::{Result, VerificationError};
use crate::utils::file::copy_atomic;

pub const BACKUP_EXTENSION: &str = ".bak";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub path: PathBuf,
    pub size: u64,
    #[serde(skip)]
    pub modified: SystemTime,
}

/// Timestamped copies of install files: `<backup_root>/<relative dir>/<name>.<YYYYMMDD_HHMMSS>.bak`.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_root: PathBuf,
    source_root: PathBuf,
}

impl BackupManager {
    /// `source_root` is the install dir whose layout is mirrored under `backup_root`.
    pub fn new(backup_root: PathBuf, source_root: PathBuf) -> Self {
        Self {
            backup_root,
            source_root,
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copies `path` into the backup tree. `Ok(None)` when there is nothing to back up.
    pub fn create_backup(&self, path: &Path) -> Result<Option<PathBuf>> {
        if !path.is_file() {
            return Ok(None);
        }
        let file_name = file_name_of(path)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = self
            .backup_dir_for(path)
            .join(format!("{file_name}.{timestamp}{BACKUP_EXTENSION}"));

        copy_atomic(path, &backup_path).map_err(|err| {
            VerificationError::new(
                "backup file",
                Some(path.to_path_buf()),
                format!("failed to back up to {}: {err}", backup_path.display()),
            )
        })?;
        tracing::info!(source = %path.display(), backup = %backup_path.display(), "created backup");
        Ok(Some(backup_path))
    }

    /// Copies the most recently modified backup of `path` back over it.
    pub fn restore_file(&self, path: &Path) -> Result<PathBuf> {
        let newest = self
            .list_backups(path)?
            .into_iter()
            .max_by_key(|entry| entry.modified)
            .ok_or_else(|| {
                VerificationError::new(
                    "restore",
                    Some(path.to_path_buf()),
                    "no backup found",
                )
            })?;

        copy_atomic(&newest.path, path).map_err(|err| {
            VerificationError::new(
                "restore file",
                Some(path.to_path_buf()),
                format!("failed to restore from {}: {err}", newest.path.display()),
            )
        })?;
        tracing::info!(restored = %path.display(), backup = %newest.path.display(), "restored from backup");
        Ok(newest.path)
    }

    pub fn list_backups(&self, path: &Path) -> Result<Vec<BackupEntry>> {
        let file_name = file_name_of(path)?;
        let search_dir = self.backup_dir_for(path);
        let entries = match std::fs::read_dir(&search_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(VerificationError::new(
                    "list backups",
                    Some(search_dir),
                    err.to_string(),
                )
                .into())
            }
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_backup_of(&name, &file_name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupEntry {
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(backups)
    }

    /// Every backup under the root, relative to it.
    pub fn list_all_backups(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = WalkDir::new(&self.backup_root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(BACKUP_EXTENSION))
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.backup_root)
                    .ok()
                    .map(Path::to_path_buf)
            })
            .collect();
        found.sort();
        found
    }

    /// Deletes backups older than `max_age`. Unreadable entries are logged and skipped.
    pub fn cleanup_old_backups(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for entry in WalkDir::new(&self.backup_root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable backup entry");
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || !entry.file_name().to_string_lossy().ends_with(BACKUP_EXTENSION)
            {
                continue;
            }
            let modified = match entry.metadata().map(|meta| meta.modified()) {
                Ok(Ok(modified)) => modified,
                Ok(Err(err)) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "no mtime for backup");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "cannot stat backup");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "failed to remove old backup")
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, root = %self.backup_root.display(), "pruned old backups");
        }
        removed
    }

    fn backup_dir_for(&self, path: &Path) -> PathBuf {
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let relative: PathBuf = match parent.strip_prefix(&self.source_root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => parent
                .components()
                .filter(|component| matches!(component, Component::Normal(_)))
                .collect(),
        };
        self.backup_root.join(relative)
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            VerificationError::new("backup", Some(path.to_path_buf()), "path has no file name")
                .into()
        })
}

fn is_backup_of(candidate: &str, original: &str) -> bool {
    candidate.len() > original.len() + BACKUP_EXTENSION.len()
        && candidate.starts_with(original)
        && candidate.ends_with(BACKUP_EXTENSION)
}
