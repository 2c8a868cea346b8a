use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use launcher_sync::services::integrity::Report;
use launcher_sync::services::{VerificationStatus, VerifyOptions};
use launcher_sync::AppState;

use super::split_csv;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Install directory to check
    pub dir: PathBuf,

    /// Version whose manifest is used
    #[arg(short, long)]
    pub version: String,

    /// Explicit manifest file
    #[arg(short, long)]
    pub manifest: Option<PathBuf>,

    /// Report everything as skipped without reading files
    #[arg(long)]
    pub skip: bool,

    /// Do not back up modified files
    #[arg(long)]
    pub no_backup: bool,

    /// Backup directory (default: <dir>/.backups)
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Extra ignore globs, comma separated
    #[arg(long)]
    pub ignore: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log hashing progress for large files
    #[arg(long)]
    pub verbose: bool,
}

pub async fn run(state: &AppState, args: VerifyArgs) -> Result<ExitCode> {
    let mut options = VerifyOptions::new(&args.dir, args.version.as_str());
    options.manifest_path = args.manifest;
    options.skip = args.skip || state.config.verify.skip;
    options.create_backups = !args.no_backup && state.config.verify.create_backups;
    options.backup_dir = args.backup_dir;
    options.progress_interval = state.config.verify.progress_interval_bytes;
    options.ignore = state.config.verify.ignore.clone();
    options.ignore.extend(split_csv(args.ignore.as_deref()));
    if args.verbose {
        options.progress = Some(Arc::new(|read: u64, total: u64, name: &str| {
            let percent = if total > 0 { read * 100 / total } else { 100 };
            tracing::info!(file = name, percent, "hashing");
        }));
    }

    let report = state
        .verifier
        .verify_async(options)
        .await
        .with_context(|| format!("verification of {} failed to run", args.dir.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(ExitCode::from(exit_status(report.overall_status)))
}

pub fn exit_status(status: VerificationStatus) -> u8 {
    match status {
        VerificationStatus::Ok | VerificationStatus::Skipped => 0,
        VerificationStatus::Failed => 2,
        VerificationStatus::Warning => 3,
    }
}

fn print_report(report: &Report) {
    println!(
        "Verification of {} (version {}): {:?}",
        report.root_dir.display(),
        report.version,
        report.overall_status
    );
    for file in report.issues() {
        println!("  [{:?}] {}: {}", file.status, file.path, file.message);
    }
    let summary = &report.summary;
    println!(
        "{} files: {} passed, {} failed, {} warnings, {} skipped ({} missing, {} modified)",
        summary.total_files,
        summary.passed,
        summary.failed,
        summary.warnings,
        summary.skipped,
        summary.missing_files,
        summary.modified_files
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_status(VerificationStatus::Ok), 0);
        assert_eq!(exit_status(VerificationStatus::Skipped), 0);
        assert_eq!(exit_status(VerificationStatus::Failed), 2);
        assert_eq!(exit_status(VerificationStatus::Warning), 3);
    }
}
