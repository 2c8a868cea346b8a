use std::path::{Path, PathBuf};

use crate::config::{env_string, LayoutConfig};

pub fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.launcher.toml").exists()
}

/// Data root: explicit override, `LAUNCHER_ROOT_DIR`, a portable install next to
/// the executable, then `~/.launcher-sync`.
pub fn resolve_root_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        if let Some(dir) = ensure_dir(path) {
            return dir;
        }
    }

    if let Some(value) = env_string("LAUNCHER_ROOT_DIR") {
        if let Some(dir) = ensure_dir(&PathBuf::from(value)) {
            return dir;
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(home) = home::home_dir() {
        if let Some(dir) = ensure_dir(&home.join(".launcher-sync")) {
            return dir;
        }
    }

    PathBuf::from(".")
}

#[derive(Debug, Clone)]
pub struct LauncherPaths {
    root: PathBuf,
}

impl LauncherPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(crate::config::CONFIG_FILE_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Downloaded diff and signature artifacts, one subdir per branch.
    pub fn patch_cache_root(&self) -> PathBuf {
        self.cache_dir().join("patches")
    }

    /// Runtime archives between download and extraction.
    pub fn runtime_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("runtime")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.cache_dir().join("staging")
    }

    pub fn games_dir(&self) -> PathBuf {
        self.root.join("games")
    }

    pub fn install_dir(&self, branch: &str, build_dir: &str) -> PathBuf {
        self.games_dir().join(branch).join(build_dir)
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn log_dir(&self) -> PathBuf {
        env_string("LAUNCHER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.join("logs"))
    }
}

/// Where the interesting files of one install live.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    pub dir: PathBuf,
    pub client: PathBuf,
    pub server_archive: PathBuf,
    pub assets_archive: PathBuf,
    pub runtime_dir: PathBuf,
    pub runtime: PathBuf,
}

impl InstallLayout {
    pub fn new(dir: &Path, layout: &LayoutConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            client: dir.join(with_exe_suffix(&layout.client_executable)),
            server_archive: dir.join(&layout.server_archive),
            assets_archive: dir.join(&layout.assets_archive),
            runtime_dir: dir.join(&layout.runtime_dir),
            runtime: dir.join(with_exe_suffix(&layout.runtime_executable)),
        }
    }
}

fn with_exe_suffix(relative: &str) -> String {
    if cfg!(windows) && !relative.to_ascii_lowercase().ends_with(".exe") {
        format!("{relative}.exe")
    } else {
        relative.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_root_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("data");
        assert_eq!(resolve_root_dir(Some(&root)), root);
        assert!(root.is_dir());
    }

    #[test]
    fn layout_joins_relative_paths() {
        let layout = InstallLayout::new(Path::new("/games/release/latest"), &LayoutConfig::default());
        assert_eq!(
            layout.server_archive,
            PathBuf::from("/games/release/latest/Server/GameServer.jar")
        );
        assert!(layout.client.starts_with("/games/release/latest/Client"));
        assert!(layout.runtime.starts_with(&layout.runtime_dir));
    }
}
