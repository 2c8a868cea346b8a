use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;

use launcher_sync::services::domain_patcher::{self, DomainPatchReport, TargetOutcome};
use launcher_sync::services::{DomainPatcher, ProgressReporter};
use launcher_sync::AppState;

#[derive(Args, Debug)]
pub struct PatchDomainArgs {
    /// Install directory; patches its client and server archive
    #[arg(long, conflicts_with_all = ["client", "server"])]
    pub dir: Option<PathBuf>,

    /// Client executable to patch
    #[arg(long)]
    pub client: Option<PathBuf>,

    /// Server archive to patch
    #[arg(long)]
    pub server: Option<PathBuf>,

    /// Replacement domain (default from config)
    #[arg(long)]
    pub domain: Option<String>,

    /// Domain to replace (default from config)
    #[arg(long)]
    pub original: Option<String>,
}

#[derive(Args, Debug)]
pub struct RestoreDomainArgs {
    /// Install directory; restores whichever of its targets has a backup
    #[arg(long, conflicts_with_all = ["client", "server"])]
    pub dir: Option<PathBuf>,

    #[arg(long)]
    pub client: Option<PathBuf>,

    #[arg(long)]
    pub server: Option<PathBuf>,
}

pub async fn patch(state: &AppState, args: PatchDomainArgs) -> Result<()> {
    if args.dir.is_none() && args.client.is_none() && args.server.is_none() {
        bail!("nothing to patch: pass --dir, --client or --server");
    }
    let mut config = state.config.domain_patch.clone();
    if let Some(domain) = args.domain {
        config.target_domain = domain;
    }
    if let Some(original) = args.original {
        config.original_domain = original;
    }
    let patcher = DomainPatcher::from_config(&config)?;

    let layout = args.dir.as_deref().map(|dir| state.installs.layout_for(dir));
    let report = tokio::task::spawn_blocking(move || {
        let progress = ProgressReporter::noop();
        if let Some(layout) = layout {
            return patcher.patch_install(&layout, &progress);
        }
        let client = match &args.client {
            Some(path) => TargetOutcome::from_result(path, patcher.patch_client(path, &progress)),
            None => TargetOutcome::Missing,
        };
        let server = match &args.server {
            Some(path) => {
                TargetOutcome::from_result(path, patcher.patch_server_archive(path, &progress))
            }
            None => TargetOutcome::Missing,
        };
        DomainPatchReport { client, server }
    })
    .await?;

    println!("client: {:?}", report.client);
    println!("server: {:?}", report.server);
    if report.has_failures() {
        bail!("domain patch failed");
    }
    Ok(())
}

pub fn restore(state: &AppState, args: RestoreDomainArgs) -> Result<()> {
    if let Some(dir) = &args.dir {
        let restored = domain_patcher::restore_install(&state.installs.layout_for(dir))?;
        println!("restored {restored} files in {}", dir.display());
        return Ok(());
    }
    if args.client.is_none() && args.server.is_none() {
        bail!("nothing to restore: pass --dir, --client or --server");
    }
    if let Some(path) = &args.client {
        domain_patcher::restore_client(path)?;
        println!("restored {}", path.display());
    }
    if let Some(path) = &args.server {
        domain_patcher::restore_server_archive(path)?;
        println!("restored {}", path.display());
    }
    Ok(())
}
