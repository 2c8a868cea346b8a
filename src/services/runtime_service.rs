//! Managed runtime: the per-branch JRE the server archive runs on.
//!
//! A branch publishes a small JSON manifest naming the runtime version and one
//! archive per platform. The runtime is unpacked into the install's runtime
//! directory and tagged with a version file so an unchanged, working runtime
//! is left alone.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{ApiConfig, RuntimeConfig};
use crate::errors::{LauncherError, Result};
use crate::services::api_client::ApiClient;
use crate::services::downloader::Downloader;
use crate::services::progress::{ProgressReporter, ProgressStage};
use crate::services::tool_service::{extract_zip_archive, probe_with_arg};
use crate::utils::file::{sibling_with_suffix, write_atomic};
use crate::utils::hash::sha256_file;
use crate::utils::paths::InstallLayout;
use crate::utils::platform::{mark_executable, Platform};

pub const RUNTIME_VERSION_FILE: &str = ".runtime-version";
const FINALIZE_ATTEMPTS: u32 = 5;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeArtifact {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeManifest {
    pub version: String,
    /// os -> arch -> archive
    pub download_url: HashMap<String, HashMap<String, RuntimeArtifact>>,
}

impl RuntimeManifest {
    pub fn artifact_for(&self, platform: &Platform) -> Result<&RuntimeArtifact> {
        let by_arch = self.download_url.get(&platform.os).ok_or_else(|| {
            LauncherError::NotFound(format!("no runtime for OS: {}", platform.os))
        })?;
        by_arch.get(&platform.arch).ok_or_else(|| {
            LauncherError::NotFound(format!(
                "no runtime for arch: {} on {}",
                platform.arch, platform.os
            ))
        })
    }
}

#[async_trait]
pub trait RuntimeManifestSource: Send + Sync {
    async fn fetch(&self, branch: &str) -> Result<RuntimeManifest>;
}

pub struct HttpRuntimeManifestSource {
    api: ApiClient,
    manifest_path: String,
}

impl HttpRuntimeManifestSource {
    pub fn new(api: ApiClient, manifest_path: String) -> Self {
        Self { api, manifest_path }
    }

    pub fn from_config(runtime: &RuntimeConfig, api: &ApiConfig) -> Self {
        Self::new(
            ApiClient::new(
                runtime.base_url.clone(),
                Duration::from_secs(api.timeout_secs.max(1)),
            ),
            runtime.manifest_path.clone(),
        )
    }
}

#[async_trait]
impl RuntimeManifestSource for HttpRuntimeManifestSource {
    async fn fetch(&self, branch: &str) -> Result<RuntimeManifest> {
        let path = self.manifest_path.replace("{branch}", branch);
        self.api.get(&path).await
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOutcome {
    pub version: String,
    pub path: PathBuf,
    /// A new runtime was unpacked on this call.
    pub installed: bool,
}

#[derive(Clone)]
pub struct RuntimeService {
    source: Arc<dyn RuntimeManifestSource>,
    downloader: Downloader,
    platform: Platform,
    cache_dir: PathBuf,
}

impl RuntimeService {
    pub fn new(
        source: Arc<dyn RuntimeManifestSource>,
        downloader: Downloader,
        platform: Platform,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            downloader,
            platform,
            cache_dir,
        }
    }

    /// Makes sure the runtime the branch asks for is unpacked and runnable.
    pub async fn ensure_runtime(
        &self,
        branch: &str,
        layout: &InstallLayout,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RuntimeOutcome> {
        let manifest = self.source.fetch(branch).await?;
        let version = manifest.version.clone();

        if installed_runtime_version(&layout.runtime_dir).as_deref() == Some(version.as_str())
            && probe_with_arg(&layout.runtime, "-version").await
        {
            tracing::info!(version = %version, "runtime already installed");
            progress.report(ProgressStage::Runtime, 100.0, format!("Runtime {version} ready"));
            return Ok(RuntimeOutcome {
                version,
                path: layout.runtime.clone(),
                installed: false,
            });
        }

        progress.report(ProgressStage::Runtime, 0.0, format!("Installing runtime {version}"));
        let artifact = manifest.artifact_for(&self.platform)?;
        let file_name = archive_file_name(&artifact.url, &version);
        let archive = self.cache_dir.join(&file_name);
        tracing::info!(version = %version, platform = %self.platform, archive = %archive.display(), "installing runtime");

        if archive.is_file() {
            tracing::info!(file = %archive.display(), "runtime archive cached");
            progress.report(ProgressStage::Runtime, 90.0, "Runtime archive cached");
        } else {
            tokio::fs::create_dir_all(&self.cache_dir).await?;
            self.downloader
                .download(&artifact.url, &archive, &file_name, &progress.scaled(0.0, 90.0), cancel)
                .await?;
        }

        progress.report(ProgressStage::Runtime, 92.0, "Verifying runtime archive");
        let expected = artifact.sha256.to_ascii_lowercase();
        let hashed = archive.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&hashed, |_| {})).await??;
        if actual != expected {
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(LauncherError::ChecksumMismatch {
                path: archive,
                expected,
                actual,
            });
        }

        progress.report(ProgressStage::Runtime, 95.0, "Extracting runtime");
        let executable = layout
            .runtime
            .strip_prefix(&layout.runtime_dir)
            .map(Path::to_path_buf)
            .map_err(|_| {
                LauncherError::Config(format!(
                    "runtime executable {} is outside the runtime dir {}",
                    layout.runtime.display(),
                    layout.runtime_dir.display()
                ))
            })?;
        let unpack_from = archive.clone();
        let unpack_to = layout.runtime_dir.clone();
        let unpack_version = version.clone();
        tokio::task::spawn_blocking(move || {
            install_runtime_archive(&unpack_from, &unpack_to, &executable, &unpack_version)
        })
        .await??;

        if !layout.runtime.is_file() {
            return Err(LauncherError::NotFound(format!(
                "runtime archive has no {}",
                layout.runtime.display()
            )));
        }
        mark_executable(&layout.runtime)?;
        let _ = tokio::fs::remove_file(&archive).await;

        tracing::info!(version = %version, dir = %layout.runtime_dir.display(), "runtime installed");
        progress.report(ProgressStage::Runtime, 100.0, format!("Runtime {version} installed"));
        Ok(RuntimeOutcome {
            version,
            path: layout.runtime.clone(),
            installed: true,
        })
    }
}

/// Runtime executable present. Whether it runs is checked by `ensure_runtime`.
pub fn check_runtime(layout: &InstallLayout) -> bool {
    layout.runtime.is_file()
}

pub fn installed_runtime_version(runtime_dir: &Path) -> Option<String> {
    std::fs::read_to_string(runtime_dir.join(RUNTIME_VERSION_FILE))
        .ok()
        .map(|content| content.trim().to_string())
        .filter(|version| !version.is_empty())
}

fn archive_file_name(url: &str, version: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("runtime-{version}.zip"))
}

fn is_tar_gz(archive: &Path) -> bool {
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Unpacks into `<dest>.tmp`, lifts a single wrapping directory, then swaps
/// the result in for `dest`.
fn install_runtime_archive(
    archive: &Path,
    dest: &Path,
    executable: &Path,
    version: &str,
) -> Result<()> {
    let temp = sibling_with_suffix(dest, "tmp");
    remove_dir_if_present(&temp)?;
    std::fs::create_dir_all(&temp)?;

    let unpacked = if is_tar_gz(archive) {
        extract_tar_gz(archive, &temp)
    } else {
        extract_zip_archive(archive, &temp).map(|_| ())
    };
    if let Err(err) = unpacked.and_then(|()| flatten_single_root(&temp, executable)) {
        let _ = std::fs::remove_dir_all(&temp);
        return Err(err);
    }
    write_atomic(&temp.join(RUNTIME_VERSION_FILE), version.as_bytes())?;

    remove_dir_if_present(dest)?;
    let mut attempt = 1;
    loop {
        match std::fs::rename(&temp, dest) {
            Ok(()) => return Ok(()),
            Err(err) if attempt < FINALIZE_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, "failed to move runtime into place, retrying");
                std::thread::sleep(FINALIZE_RETRY_DELAY);
                attempt += 1;
            }
            Err(err) => {
                let _ = std::fs::remove_dir_all(&temp);
                return Err(err.into());
            }
        }
    }
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    for entry in tar.entries()? {
        let mut entry = entry?;
        // `unpack_in` refuses entries that would land outside `dest`.
        if !entry.unpack_in(dest)? {
            tracing::warn!(entry = %entry.path()?.display(), "skipping archive entry outside destination");
        }
    }
    Ok(())
}

/// Runtime archives usually wrap everything in one `jdk-*` directory.
fn flatten_single_root(dir: &Path, executable: &Path) -> Result<()> {
    if dir.join(executable).exists() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    let [root] = entries.as_slice() else {
        return Ok(());
    };
    if !root.file_type()?.is_dir() {
        return Ok(());
    }

    let lifted = dir.join(format!(".flatten-{}", uuid::Uuid::new_v4()));
    std::fs::rename(root.path(), &lifted)?;
    for child in std::fs::read_dir(&lifted)? {
        let child = child?;
        std::fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    std::fs::remove_dir(&lifted)?;
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
