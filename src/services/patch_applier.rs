use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::PatchToolConfig;
use crate::errors::{LauncherError, Result};
use crate::models::PatchStep;
use crate::services::downloader::Downloader;
use crate::services::patch_resolver::{select_steps, PatchResolver};
use crate::services::progress::{ProgressReporter, ProgressStage};
use crate::utils::platform::hide_console_window;

const HEARTBEAT_LOW: f64 = 60.0;
const HEARTBEAT_HIGH: f64 = 75.0;
const HEARTBEAT_STEP: f64 = 0.5;

/// Inputs for one diff application.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub from: u32,
    pub to: u32,
    pub diff_path: PathBuf,
    pub signature_path: PathBuf,
    pub target_dir: PathBuf,
    pub staging_dir: PathBuf,
}

#[async_trait]
pub trait DiffApplier: Send + Sync {
    async fn apply(
        &self,
        request: &ApplyRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Liveness signal for an opaque tool: bounces inside a fixed band.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    value: f64,
    direction: f64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            value: HEARTBEAT_LOW,
            direction: HEARTBEAT_STEP,
        }
    }
}

impl Heartbeat {
    pub fn advance(&mut self) -> f64 {
        self.value += self.direction;
        if self.value >= HEARTBEAT_HIGH {
            self.value = HEARTBEAT_HIGH;
            self.direction = -HEARTBEAT_STEP;
        } else if self.value <= HEARTBEAT_LOW {
            self.value = HEARTBEAT_LOW;
            self.direction = HEARTBEAT_STEP;
        }
        self.value
    }
}

/// Runs `<tool> apply --staging-dir <dir> --signature <sig> <diff> <target>`.
#[derive(Debug, Clone)]
pub struct ExternalDiffApplier {
    tool_path: PathBuf,
    timeout: Duration,
    heartbeat: Duration,
}

enum Outcome {
    Exited(std::io::Result<std::process::Output>),
    TimedOut,
    Cancelled,
}

impl ExternalDiffApplier {
    pub fn new(tool_path: PathBuf, timeout: Duration, heartbeat: Duration) -> Self {
        Self {
            tool_path,
            timeout,
            heartbeat,
        }
    }

    pub fn from_config(tool_path: PathBuf, config: &PatchToolConfig) -> Self {
        Self::new(
            tool_path,
            Duration::from_secs(config.apply_timeout_secs.max(1)),
            Duration::from_secs(config.heartbeat_secs.max(1)),
        )
    }

    pub fn tool_path(&self) -> &Path {
        &self.tool_path
    }

    fn spawn_heartbeat(
        &self,
        progress: &ProgressReporter,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let progress = progress.clone();
        let period = self.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut beat = Heartbeat::default();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        progress.report(ProgressStage::Patch, beat.advance(), "Applying game patch...");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DiffApplier for ExternalDiffApplier {
    async fn apply(
        &self,
        request: &ApplyRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _ = tokio::fs::remove_dir_all(&request.staging_dir).await;
        tokio::fs::create_dir_all(&request.target_dir).await?;
        tokio::fs::create_dir_all(&request.staging_dir).await?;

        tracing::info!(
            tool = %self.tool_path.display(),
            from = request.from,
            to = request.to,
            diff = %request.diff_path.display(),
            target_dir = %request.target_dir.display(),
            staging = %request.staging_dir.display(),
            "running diff tool"
        );

        let mut command = Command::new(&self.tool_path);
        command
            .arg("apply")
            .arg("--staging-dir")
            .arg(&request.staging_dir)
            .arg("--signature")
            .arg(&request.signature_path)
            .arg(&request.diff_path)
            .arg(&request.target_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut command);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                remove_staging(&request.staging_dir).await;
                return Err(LauncherError::PatchApply {
                    from: request.from,
                    to: request.to,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("failed to start {}: {err}", self.tool_path.display()),
                });
            }
        };

        let stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(progress, stop.clone());

        // Dropping the wait future drops the child, which kills it.
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(result) => Outcome::Exited(result),
                Err(_) => Outcome::TimedOut,
            },
        };

        stop.cancel();
        let _ = heartbeat.await;

        match outcome {
            Outcome::Exited(Ok(output)) if output.status.success() => {
                tracing::info!(
                    from = request.from,
                    to = request.to,
                    stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                    "diff tool finished"
                );
                remove_staging(&request.staging_dir).await;
                progress.report(ProgressStage::Patch, 100.0, "Game patched!");
                Ok(())
            }
            Outcome::Exited(Ok(output)) => {
                remove_staging(&request.staging_dir).await;
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                tracing::error!(
                    from = request.from,
                    to = request.to,
                    exit_code = ?output.status.code(),
                    stdout = %stdout,
                    stderr = %stderr,
                    "diff tool failed"
                );
                Err(LauncherError::PatchApply {
                    from: request.from,
                    to: request.to,
                    exit_code: output.status.code(),
                    stdout,
                    stderr,
                })
            }
            Outcome::Exited(Err(err)) => {
                remove_staging(&request.staging_dir).await;
                Err(LauncherError::PatchApply {
                    from: request.from,
                    to: request.to,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: err.to_string(),
                })
            }
            Outcome::TimedOut => {
                remove_staging(&request.staging_dir).await;
                tracing::error!(
                    from = request.from,
                    to = request.to,
                    timeout_secs = self.timeout.as_secs(),
                    "diff tool timed out"
                );
                Err(LauncherError::PatchTimeout {
                    from: request.from,
                    to: request.to,
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Outcome::Cancelled => {
                remove_staging(&request.staging_dir).await;
                Err(LauncherError::Cancelled)
            }
        }
    }
}

async fn remove_staging(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %err, "failed to remove staging dir");
        }
    }
}

/// Downloads and applies the step chain for one install.
#[derive(Clone)]
pub struct PatchPipeline {
    resolver: PatchResolver,
    downloader: Downloader,
    applier: Arc<dyn DiffApplier>,
    cache_root: PathBuf,
    staging_root: PathBuf,
}

impl PatchPipeline {
    /// Artifacts land in `cache_root/<branch>`; each run stages under a fresh dir in `staging_root`.
    pub fn new(
        resolver: PatchResolver,
        downloader: Downloader,
        applier: Arc<dyn DiffApplier>,
        cache_root: PathBuf,
        staging_root: PathBuf,
    ) -> Self {
        Self {
            resolver,
            downloader,
            applier,
            cache_root,
            staging_root,
        }
    }

    pub fn resolver(&self) -> &PatchResolver {
        &self.resolver
    }

    pub fn artifact_paths(&self, branch: &str, step: &PatchStep) -> (PathBuf, PathBuf) {
        let dir = self.cache_root.join(branch);
        (
            dir.join(format!("{}_to_{}.pwr", step.from, step.to)),
            dir.join(format!("{}_to_{}.pwr.sig", step.from, step.to)),
        )
    }

    /// Brings `install_dir` from `current` up to `target` (0 = newest). Returns the version reached.
    pub async fn download_and_apply(
        &self,
        branch: &str,
        current: u32,
        target: u32,
        install_dir: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        tracing::info!(branch, from = current, to = target, "starting patch download");
        let chain = self.resolver.fetch_chain(branch, current).await?;
        let steps = select_steps(&chain, target);
        if steps.len() < chain.len() {
            tracing::info!(
                target_version = target,
                skipped = chain.len() - steps.len(),
                "reached target version, stopping"
            );
        }

        let total = steps.len().max(1) as f64;
        let mut reached = current;
        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LauncherError::Cancelled);
            }
            let band = progress.scaled(index as f64 * 100.0 / total, (index + 1) as f64 * 100.0 / total);
            band.report(
                ProgressStage::Patch,
                0.0,
                format!("Patching {} → {} ({}/{})", step.from, step.to, index + 1, steps.len()),
            );

            let (diff_path, signature_path) = self
                .fetch_artifacts(branch, step, &band.scaled(0.0, 50.0), cancel)
                .await
                .map_err(|err| in_step(step, err))?;

            let request = ApplyRequest {
                from: step.from,
                to: step.to,
                diff_path: diff_path.clone(),
                signature_path: signature_path.clone(),
                target_dir: install_dir.to_path_buf(),
                staging_dir: self.staging_root.join(uuid::Uuid::new_v4().to_string()),
            };
            if let Err(err) = self
                .applier
                .apply(&request, &band.scaled(50.0, 100.0), cancel)
                .await
            {
                let _ = tokio::fs::remove_file(&diff_path).await;
                let _ = tokio::fs::remove_file(&signature_path).await;
                tracing::error!(from = step.from, to = step.to, error = %err, "failed to apply patch");
                return Err(in_step(step, err));
            }

            tracing::info!(from = step.from, to = step.to, "patch applied");
            reached = step.to;
        }

        tracing::info!(branch, version = reached, steps = steps.len(), "all patches applied");
        Ok(reached)
    }

    async fn fetch_artifacts(
        &self,
        branch: &str,
        step: &PatchStep,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, PathBuf)> {
        let (diff_path, signature_path) = self.artifact_paths(branch, step);
        if diff_path.is_file() && signature_path.is_file() {
            tracing::debug!(from = step.from, to = step.to, "patch artifacts cached");
            progress.report(ProgressStage::Download, 100.0, "Patch files cached");
            return Ok((diff_path, signature_path));
        }
        if let Some(parent) = diff_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let diff_name = file_name(&diff_path);
        self.downloader
            .download(&step.diff_url, &diff_path, &diff_name, &progress.scaled(0.0, 90.0), cancel)
            .await?;
        let signature_name = file_name(&signature_path);
        self.downloader
            .download(
                &step.signature_url,
                &signature_path,
                &signature_name,
                &progress.scaled(90.0, 100.0),
                cancel,
            )
            .await?;
        Ok((diff_path, signature_path))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn in_step(step: &PatchStep, err: LauncherError) -> LauncherError {
    match err {
        LauncherError::Cancelled
        | LauncherError::PatchApply { .. }
        | LauncherError::PatchTimeout { .. } => err,
        other => LauncherError::PatchStep {
            from: step.from,
            to: step.to,
            source: Box::new(other),
        },
    }
}
