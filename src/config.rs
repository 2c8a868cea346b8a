//! Launcher configuration.
//!
//! Loaded from `launcher.toml` under the data root, with environment variable
//! overrides applied on top. A missing file is written with defaults; a file
//! that fails to parse is moved aside to `launcher.toml.broken`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::utils::file::{rename_replace, sibling_with_suffix, write_atomic};

pub const CONFIG_FILE_NAME: &str = "launcher.toml";
pub const SKIP_VERIFY_ENV: &str = "LAUNCHER_SKIP_VERIFY";
/// Domain compiled into shipped clients.
pub const DEFAULT_ORIGINAL_DOMAIN: &str = "hytale.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub api: ApiConfig,
    pub download: DownloadConfig,
    pub patch_tool: PatchToolConfig,
    pub verify: VerifyConfig,
    pub domain_patch: DomainPatchConfig,
    pub layout: LayoutConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the patch service
    pub base_url: String,
    /// Path of the step-list endpoint, relative to `base_url`
    pub patch_steps_path: String,
    /// Artifact URL used for existence probes. Placeholders: {os} {arch} {branch} {version}
    pub patch_url_template: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://patches.example.com".to_string(),
            patch_steps_path: "v1/pwr".to_string(),
            patch_url_template:
                "https://patches.example.com/patches/{os}/{arch}/{branch}/0/{version}.pwr"
                    .to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub base_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    /// A transfer with no bytes for this long is abandoned and retried
    pub stall_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_retry_delay_secs: 3,
            max_retry_delay_secs: 60,
            stall_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatchToolConfig {
    /// Explicit path to the diff-applier; when unset it is managed under `tools/`
    pub path: Option<PathBuf>,
    /// Zip download for the managed tool. Placeholders: {os} {arch}
    pub download_url_template: String,
    pub apply_timeout_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for PatchToolConfig {
    fn default() -> Self {
        Self {
            path: None,
            download_url_template:
                "https://broth.itch.zone/butler/{os}-{arch}/LATEST/archive/default".to_string(),
            apply_timeout_secs: 30 * 60,
            heartbeat_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    pub skip: bool,
    pub create_backups: bool,
    pub progress_interval_bytes: u64,
    pub ignore: Vec<String>,
    pub backup_max_age_days: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            skip: false,
            create_backups: true,
            progress_interval_bytes: 100 * 1024 * 1024,
            ignore: Vec::new(),
            backup_max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DomainPatchConfig {
    pub enabled: bool,
    pub original_domain: String,
    pub target_domain: String,
    pub scheme: String,
    pub subdomains: Vec<String>,
    /// Crash-reporting endpoint embedded in the client, rewritten before the generic passes
    pub crash_report_endpoint: Option<String>,
    /// Replacement for `crash_report_endpoint`; `{scheme}` and `{domain}` are expanded
    pub crash_report_replacement: String,
}

impl Default for DomainPatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            original_domain: DEFAULT_ORIGINAL_DOMAIN.to_string(),
            target_domain: String::new(),
            scheme: "https://".to_string(),
            subdomains: vec![
                String::new(),
                "sessions.".to_string(),
                "account-data.".to_string(),
                "gameservers.".to_string(),
            ],
            crash_report_endpoint: None,
            crash_report_replacement: "{scheme}t@{domain}/2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutConfig {
    /// Client executable, relative to the install dir. `.exe` is appended on Windows.
    pub client_executable: String,
    pub server_archive: String,
    pub assets_archive: String,
    /// Directory the managed runtime is unpacked into, relative to the install dir
    pub runtime_dir: String,
    /// Managed runtime executable, relative to the install dir
    pub runtime_executable: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            client_executable: "Client/GameClient".to_string(),
            server_archive: "Server/GameServer.jar".to_string(),
            assets_archive: "Assets.zip".to_string(),
            runtime_dir: "runtime".to_string(),
            runtime_executable: "runtime/bin/java".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Install and repair the runtime alongside the game
    pub managed: bool,
    pub base_url: String,
    /// Per-branch runtime manifest, relative to `base_url`. Placeholder: {branch}
    pub manifest_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            managed: true,
            base_url: "https://launcher.example.com".to_string(),
            manifest_path: "version/{branch}/jre.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LauncherConfig {
    /// Loads `path`, creating it with defaults when absent. A corrupt file is
    /// renamed to `<name>.broken` and replaced with defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<LauncherConfig>(&content) {
                Ok(config) => config,
                Err(err) => {
                    let broken = sibling_with_suffix(path, "broken");
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "config is unreadable, moving it to {}",
                        broken.display()
                    );
                    rename_replace(path, &broken)?;
                    let config = LauncherConfig::default();
                    config.save(path)?;
                    config
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = LauncherConfig::default();
                config.save(path)?;
                tracing::info!(path = %path.display(), "wrote default config");
                config
            }
            Err(err) => return Err(err.into()),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(env_string);
    }

    /// Applies `LAUNCHER_*` overrides, reading values through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("LAUNCHER_API_BASE_URL") {
            self.api.base_url = value;
        }
        if let Some(value) = lookup("LAUNCHER_PATCH_TOOL") {
            self.patch_tool.path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("LAUNCHER_TARGET_DOMAIN") {
            self.domain_patch.target_domain = value;
            self.domain_patch.enabled = true;
        }
        if let Some(value) = lookup("LAUNCHER_RUNTIME_BASE_URL") {
            self.runtime.base_url = value;
        }
        if let Some(value) = lookup("LAUNCHER_LOG_LEVEL") {
            self.log.level = value;
        }
        if lookup(SKIP_VERIFY_ENV).is_some_and(|value| is_truthy(&value)) {
            self.verify.skip = true;
        }
    }
}

impl DownloadConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.base_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }
}

pub fn env_truthy(key: &str) -> bool {
    std::env::var(key).map(|value| is_truthy(&value)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);

        let config = LauncherConfig::load_or_default(&path).expect("load");

        assert!(path.exists());
        assert_eq!(config.download.max_attempts, 5);
        assert_eq!(config.patch_tool.apply_timeout_secs, 1800);
        assert_eq!(config.verify.progress_interval_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn broken_file_is_moved_aside() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "download = [not toml").expect("write");

        let config = LauncherConfig::load_or_default(&path).expect("load");

        assert_eq!(config.download, DownloadConfig::default());
        let broken = dir.path().join("launcher.toml.broken");
        assert_eq!(
            fs::read_to_string(broken).expect("broken copy"),
            "download = [not toml"
        );
        let rewritten = fs::read_to_string(&path).expect("rewritten");
        assert!(rewritten.contains("[download]"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[download]\nmax_attempts = 2\n").expect("write");

        let config = LauncherConfig::load_or_default(&path).expect("load");

        assert_eq!(config.download.max_attempts, 2);
        assert_eq!(config.download.max_retry_delay_secs, 60);
        assert_eq!(config.layout.assets_archive, "Assets.zip");
    }

    fn only(key: &'static str, value: &'static str) -> impl Fn(&str) -> Option<String> {
        move |name: &str| (name == key).then(|| value.to_string())
    }

    #[test]
    fn target_domain_override_enables_patching_with_default_original() {
        let mut config = LauncherConfig::default();
        config.apply_overrides(only("LAUNCHER_TARGET_DOMAIN", "example.io"));

        assert!(config.domain_patch.enabled);
        assert_eq!(config.domain_patch.target_domain, "example.io");
        assert_eq!(config.domain_patch.original_domain, DEFAULT_ORIGINAL_DOMAIN);
        assert!(!config.verify.skip);
    }

    #[test]
    fn skip_verify_override_accepts_truthy_values() {
        let mut config = LauncherConfig::default();
        config.apply_overrides(only(SKIP_VERIFY_ENV, "Yes"));
        assert!(config.verify.skip);

        let mut config = LauncherConfig::default();
        config.apply_overrides(only(SKIP_VERIFY_ENV, "0"));
        assert!(!config.verify.skip);
    }
}
