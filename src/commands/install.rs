use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use launcher_sync::models::{BuildSelector, InstallRequest};
use launcher_sync::services::install_service::InstallOutcome;
use launcher_sync::AppState;

use super::verify::exit_status;
use super::{cancel_on_ctrl_c, progress_logger};

#[derive(Args, Debug)]
pub struct VersionsArgs {
    #[arg(short, long, default_value = "release")]
    pub branch: String,

    /// List every published version instead of only the latest
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    #[arg(short, long, default_value = "release")]
    pub branch: String,

    /// `auto`, `latest` or a version number
    #[arg(long, default_value = "auto")]
    pub build: BuildSelector,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn versions(state: &AppState, args: VersionsArgs) -> Result<()> {
    if args.all {
        let versions = state.resolver.list_all_versions(&args.branch).await?;
        let rendered: Vec<String> = versions.iter().map(u32::to_string).collect();
        println!("{}", rendered.join("\n"));
    } else {
        let latest = state.resolver.find_latest_version(&args.branch).await?;
        println!("{latest}");
    }
    Ok(())
}

pub async fn tool(state: &AppState) -> Result<()> {
    let (progress, logger) = progress_logger();
    let cancel = cancel_on_ctrl_c();
    let path = state.tools.ensure_tool(&progress, &cancel).await;
    drop(progress);
    let _ = logger.await;
    println!("{}", path?.display());
    Ok(())
}

pub async fn install(state: &AppState, args: InstallArgs) -> Result<ExitCode> {
    let (progress, logger) = progress_logger();
    let cancel = cancel_on_ctrl_c();

    state.tools.ensure_tool(&progress.scaled(0.0, 5.0), &cancel).await?;
    let request = InstallRequest {
        branch: args.branch,
        build: args.build,
    };
    let outcome = state
        .installs
        .ensure_installed(&request, &progress.scaled(5.0, 100.0), &cancel)
        .await;
    drop(progress);
    let _ = logger.await;
    let outcome = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    let status = outcome
        .verification
        .as_ref()
        .map(|report| exit_status(report.overall_status))
        .unwrap_or(0);
    Ok(ExitCode::from(status))
}

fn print_outcome(outcome: &InstallOutcome) {
    if outcome.updated {
        println!(
            "{} updated {} -> {}{} at {}",
            outcome.branch,
            outcome.previous_version,
            outcome.version,
            if outcome.reinstalled { " (full reinstall)" } else { "" },
            outcome.install_dir.display()
        );
    } else {
        println!(
            "{} version {} is up to date at {}",
            outcome.branch,
            outcome.version,
            outcome.install_dir.display()
        );
    }
    if let Some(runtime) = &outcome.runtime {
        let state = if runtime.installed { "installed" } else { "up to date" };
        println!("runtime {}: {state}", runtime.version);
    }
    if let Some(report) = &outcome.verification {
        println!(
            "verification: {:?} ({} files, {} failed, {} warnings)",
            report.overall_status,
            report.summary.total_files,
            report.summary.failed,
            report.summary.warnings
        );
    }
    if let Some(patch) = &outcome.domain_patch {
        println!("domain patch: client {:?}, server {:?}", patch.client, patch.server);
    }
}
