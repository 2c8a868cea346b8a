use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use crate::config::PatchToolConfig;
use crate::errors::{LauncherError, Result};
use crate::services::downloader::Downloader;
use crate::services::progress::{ProgressReporter, ProgressStage};
use crate::utils::platform::{hide_console_window, mark_executable, Platform};

const TOOL_BINARY: &str = "butler";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Locates, and when needed installs, the external diff-applier.
#[derive(Clone)]
pub struct ToolService {
    tools_dir: PathBuf,
    config: PatchToolConfig,
    platform: Platform,
    downloader: Downloader,
}

impl ToolService {
    pub fn new(
        tools_dir: PathBuf,
        config: PatchToolConfig,
        platform: Platform,
        downloader: Downloader,
    ) -> Self {
        Self {
            tools_dir,
            config,
            platform,
            downloader,
        }
    }

    pub fn managed_dir(&self) -> PathBuf {
        self.tools_dir.join(TOOL_BINARY)
    }

    pub fn tool_path(&self) -> PathBuf {
        if let Some(explicit) = &self.config.path {
            return explicit.clone();
        }
        let name = if cfg!(windows) {
            format!("{TOOL_BINARY}.exe")
        } else {
            TOOL_BINARY.to_string()
        };
        self.managed_dir().join(name)
    }

    pub fn download_url(&self) -> String {
        self.config
            .download_url_template
            .replace("{os}", &self.platform.os)
            .replace("{arch}", &self.platform.arch)
    }

    /// Returns a runnable tool path, downloading the managed copy when it is missing or broken.
    pub async fn ensure_tool(
        &self,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.tool_path();
        if probe(&path).await {
            tracing::info!(tool = %path.display(), "diff tool ready");
            return Ok(path);
        }
        if self.config.path.is_some() {
            return Err(LauncherError::Config(format!(
                "configured patch tool is not runnable: {}",
                path.display()
            )));
        }

        tracing::info!(tool = %path.display(), "diff tool missing or broken, reinstalling");
        self.install(progress, cancel).await?;

        if !probe(&path).await {
            return Err(LauncherError::NotFound(format!(
                "diff tool still not runnable after install: {}",
                path.display()
            )));
        }
        progress.report(ProgressStage::Install, 100.0, "Patch tool installed");
        Ok(path)
    }

    async fn install(&self, progress: &ProgressReporter, cancel: &CancellationToken) -> Result<()> {
        let dir = self.managed_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;

        let url = self.download_url();
        let archive = dir.join(format!("{TOOL_BINARY}.zip"));
        tracing::info!(url = %url, platform = %self.platform, "downloading diff tool");
        progress.report(ProgressStage::Install, 0.0, "Downloading patch tool...");
        self.downloader
            .download(
                &url,
                &archive,
                &format!("{TOOL_BINARY}.zip"),
                &progress.scaled(0.0, 70.0),
                cancel,
            )
            .await?;

        progress.report(ProgressStage::Install, 80.0, "Extracting patch tool");
        let extract_from = archive.clone();
        let extract_to = dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || extract_zip_archive(&extract_from, &extract_to))
                .await??;
        tracing::info!(files = extracted, dir = %dir.display(), "diff tool extracted");

        mark_executable(&self.tool_path())?;
        let _ = tokio::fs::remove_file(&archive).await;
        Ok(())
    }
}

/// `true` when `<path> --version` exits cleanly within the probe timeout.
pub async fn probe(path: &Path) -> bool {
    probe_with_arg(path, "--version").await
}

pub async fn probe_with_arg(path: &Path, arg: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    let mut command = Command::new(path);
    command
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    hide_console_window(&mut command);

    match tokio::time::timeout(PROBE_TIMEOUT, command.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(err)) => {
            tracing::debug!(tool = %path.display(), error = %err, "probe failed");
            false
        }
        Err(_) => {
            tracing::warn!(tool = %path.display(), "probe timed out");
            false
        }
    }
}

fn is_safe_relative_path(path: &Path) -> bool {
    path.components().all(|component| {
        !matches!(
            component,
            Component::Prefix(_) | Component::RootDir | Component::ParentDir
        )
    })
}

/// Extracts every entry that stays inside `dest`. Returns the number of files written.
pub fn extract_zip_archive(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }
        let entry_path = Path::new(&name);
        if !is_safe_relative_path(entry_path) {
            tracing::warn!(entry = %name, "skipping archive entry outside destination");
            continue;
        }
        let out_path = dest.join(entry_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn service(tools_dir: &Path, explicit: Option<PathBuf>) -> ToolService {
        let config = PatchToolConfig {
            path: explicit,
            ..PatchToolConfig::default()
        };
        ToolService::new(
            tools_dir.to_path_buf(),
            config,
            Platform::from_rust("linux", "x86_64"),
            Downloader::new(Default::default()),
        )
    }

    #[test]
    fn download_url_uses_platform_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), None);
        assert_eq!(
            service.download_url(),
            "https://broth.itch.zone/butler/linux-amd64/LATEST/archive/default"
        );
    }

    #[test]
    fn extraction_skips_escaping_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive_path = dir.path().join("tool.zip");
        let mut writer = zip::ZipWriter::new(File::create(&archive_path).expect("create"));
        writer.start_file("butler", FileOptions::default()).expect("start");
        writer.write_all(b"#!/bin/sh\n").expect("write");
        writer.start_file("lib/support.so", FileOptions::default()).expect("start");
        writer.write_all(b"so").expect("write");
        writer.start_file("../escape.txt", FileOptions::default()).expect("start");
        writer.write_all(b"nope").expect("write");
        writer.finish().expect("finish");

        let dest = dir.path().join("out");
        let written = extract_zip_archive(&archive_path, &dest).expect("extract");

        assert_eq!(written, 2);
        assert!(dest.join("butler").is_file());
        assert!(dest.join("lib").join("support.so").is_file());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn missing_explicit_tool_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), Some(dir.path().join("absent")));

        let err = service
            .ensure_tool(&ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect_err("not runnable");
        assert!(matches!(err, LauncherError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installed_tool_is_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), None);
        let path = service.tool_path();
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "#!/bin/sh\necho 15.0\n").expect("script");
        mark_executable(&path).expect("chmod");

        let found = service
            .ensure_tool(&ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("ready");
        assert_eq!(found, path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broken_tool_fails_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken");
        std::fs::write(&path, "#!/bin/sh\nexit 4\n").expect("script");
        mark_executable(&path).expect("chmod");

        assert!(!probe(&path).await);
    }
}
