//! launcher-sync: operator CLI over the install, verify and patch services.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use launcher_sync::{logging, AppState};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "launcher-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: <root>/launcher.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data root holding caches, installs and manifests
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check an install against its manifest
    Verify(commands::verify::VerifyArgs),

    /// Hash a reference install into a manifest
    Generate(commands::manifest::GenerateArgs),

    /// Back up files of an install
    Backup(commands::manifest::BackupArgs),

    /// Restore a file from its newest backup
    Restore(commands::manifest::RestoreArgs),

    /// Delete old backups
    CleanupBackups(commands::manifest::CleanupArgs),

    /// Show the latest (or every) published version
    Versions(commands::install::VersionsArgs),

    /// Install or update a build
    Install(commands::install::InstallArgs),

    /// Rewrite the embedded domain in client and server binaries
    PatchDomain(commands::domain::PatchDomainArgs),

    /// Put domain-patched files back to their originals
    RestoreDomain(commands::domain::RestoreDomainArgs),

    /// Locate or install the diff-applier tool
    Tool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let state = AppState::load(cli.root.as_deref(), cli.config.as_deref())?;
    let level = cli.log_level.as_deref().unwrap_or(&state.config.log.level);
    logging::init(&state.paths.log_dir(), level)?;
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        root = %state.paths.root().display(),
        "launcher-sync starting"
    );

    match cli.command {
        Commands::Verify(args) => commands::verify::run(&state, args).await,
        Commands::Generate(args) => commands::manifest::generate(&state, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Backup(args) => commands::manifest::backup(args).map(|()| ExitCode::SUCCESS),
        Commands::Restore(args) => commands::manifest::restore(args).map(|()| ExitCode::SUCCESS),
        Commands::CleanupBackups(args) => {
            commands::manifest::cleanup(&state, args).map(|()| ExitCode::SUCCESS)
        }
        Commands::Versions(args) => commands::install::versions(&state, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Install(args) => commands::install::install(&state, args).await,
        Commands::PatchDomain(args) => commands::domain::patch(&state, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::RestoreDomain(args) => {
            commands::domain::restore(&state, args).map(|()| ExitCode::SUCCESS)
        }
        Commands::Tool => commands::install::tool(&state)
            .await
            .map(|()| ExitCode::SUCCESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_verify_with_globals_after_subcommand() {
        let cli = Cli::try_parse_from([
            "launcher-sync",
            "verify",
            "/games/release/auto",
            "--version",
            "7",
            "--ignore",
            "*.log,cache/**",
            "--root",
            "/data",
        ])
        .expect("parse");
        assert_eq!(cli.root, Some(PathBuf::from("/data")));
        match cli.command {
            Commands::Verify(args) => {
                assert_eq!(args.version, "7");
                assert_eq!(args.ignore.as_deref(), Some("*.log,cache/**"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_build_selector() {
        let cli = Cli::try_parse_from(["launcher-sync", "install", "--build", "12"]).expect("parse");
        match cli.command {
            Commands::Install(args) => {
                assert_eq!(args.build, launcher_sync::models::BuildSelector::Fixed(12));
                assert_eq!(args.branch, "release");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
