use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;

use launcher_sync::services::BackupManager;
use launcher_sync::AppState;

use super::split_csv;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Reference install directory
    pub dir: PathBuf,

    #[arg(short, long)]
    pub version: String,

    /// Output file (default: manifests/manifest_<version>.json under the data root)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Ignore globs, comma separated
    #[arg(long)]
    pub ignore: Option<String>,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Install directory the files belong to
    pub dir: PathBuf,

    /// Files to back up, relative to `dir`
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Backup directory (default: <dir>/.backups)
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    pub dir: PathBuf,

    /// File to restore, relative to `dir`
    pub file: PathBuf,

    #[arg(long)]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    pub dir: PathBuf,

    /// Remove backups older than this many days (default from config)
    #[arg(long)]
    pub max_age_days: Option<u64>,

    #[arg(long)]
    pub backup_dir: Option<PathBuf>,
}

fn backups_for(dir: &Path, backup_dir: Option<PathBuf>) -> BackupManager {
    BackupManager::new(backup_dir.unwrap_or_else(|| dir.join(".backups")), dir.to_path_buf())
}

pub async fn generate(state: &AppState, args: GenerateArgs) -> Result<()> {
    let mut ignore = state.config.verify.ignore.clone();
    ignore.extend(split_csv(args.ignore.as_deref()));
    let manifests = state.manifests.clone();
    let path = tokio::task::spawn_blocking(move || {
        manifests.generate_and_save(&args.dir, &args.version, &ignore, args.output.as_deref())
    })
    .await??;
    println!("Manifest written to {}", path.display());
    Ok(())
}

pub fn backup(args: BackupArgs) -> Result<()> {
    let manager = backups_for(&args.dir, args.backup_dir);
    let mut missing = 0;
    for file in &args.files {
        match manager.create_backup(&args.dir.join(file))? {
            Some(path) => println!("{} -> {}", file.display(), path.display()),
            None => {
                missing += 1;
                eprintln!("{}: not found, skipped", file.display());
            }
        }
    }
    if missing == args.files.len() {
        bail!("none of the requested files exist under {}", args.dir.display());
    }
    Ok(())
}

pub fn restore(args: RestoreArgs) -> Result<()> {
    let manager = backups_for(&args.dir, args.backup_dir);
    let from = manager.restore_file(&args.dir.join(&args.file))?;
    println!("Restored {} from {}", args.file.display(), from.display());
    Ok(())
}

pub fn cleanup(state: &AppState, args: CleanupArgs) -> Result<()> {
    let days = args
        .max_age_days
        .unwrap_or(state.config.verify.backup_max_age_days);
    let manager = backups_for(&args.dir, args.backup_dir);
    let removed = manager.cleanup_old_backups(max_age(days));
    println!("Removed {removed} backups older than {days} days");
    Ok(())
}

fn max_age(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_saturates_for_huge_day_counts() {
        assert_eq!(max_age(2), Duration::from_secs(172_800));
        assert_eq!(max_age(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
