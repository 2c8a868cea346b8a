//! Versioned file inventories: `relative/path -> {size, sha256}`.
//!
//! Manifests live as `manifest_<version>.json` in the launcher's manifests
//! directory, outside any install dir so updates never overwrite them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::errors::{LauncherError, Result, VerificationError};
use crate::utils::file::write_atomic;
use crate::utils::hash::sha256_file;

pub const MANIFEST_PREFIX: &str = "manifest_";

/// Names never recorded when generating a manifest.
const TRANSIENT_SUFFIXES: [&str; 4] = [".part", ".original", ".tmp", ".bak"];
const SKIPPED_NAMES: [&str; 3] = [".version", ".runtime-version", ".backups"];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub size: u64,
    pub sha256: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Manifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

impl Manifest {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            created_at: Utc::now(),
            files: BTreeMap::new(),
            ignore: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|err| {
            VerificationError::new(
                "load manifest",
                Some(path.to_path_buf()),
                format!("failed to read manifest: {err}"),
            )
        })?;
        let manifest = serde_json::from_slice(&data).map_err(|err| {
            VerificationError::new(
                "parse manifest",
                Some(path.to_path_buf()),
                format!("failed to parse manifest JSON: {err}"),
            )
        })?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data).map_err(|err| {
            VerificationError::new(
                "save manifest",
                Some(path.to_path_buf()),
                format!("failed to save manifest: {err}"),
            )
        })?;
        Ok(())
    }

    pub fn expected(&self, relative_path: &str) -> Option<&FileRecord> {
        self.files.get(&normalize_relative_path(relative_path))
    }

    pub fn ignore_matcher(&self) -> Result<IgnoreMatcher> {
        IgnoreMatcher::new(&self.ignore)
    }
}

/// `Client\lib\a.jar` and `/Client/lib/a.jar` both become `Client/lib/a.jar`.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Glob ignore list. `*` does not cross directory separators; each path is
/// tried in both its native and slash-normalized form.
#[derive(Clone, Debug)]
pub struct IgnoreMatcher {
    set: GlobSet,
    empty: bool,
}

impl IgnoreMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| LauncherError::Config(format!("invalid ignore glob {pattern:?}: {err}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| LauncherError::Config(format!("invalid ignore list: {err}")))?;
        Ok(Self {
            set,
            empty: patterns.is_empty(),
        })
    }

    pub fn is_ignored(&self, relative_path: &str) -> bool {
        if self.empty {
            return false;
        }
        let slashed = relative_path.replace('\\', "/");
        let native = slashed.replace('/', &MAIN_SEPARATOR.to_string());
        self.set.is_match(&native) || self.set.is_match(&slashed)
    }
}

/// Reads, writes and generates manifests under one directory.
#[derive(Clone, Debug)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn default_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{MANIFEST_PREFIX}{version}.json"))
    }

    /// Explicit path, then the per-version default, then the first parseable
    /// `manifest_*` file in the store.
    pub fn resolve(&self, explicit: Option<&Path>, version: &str) -> Result<(Manifest, PathBuf)> {
        if let Some(path) = explicit {
            match Manifest::load(path) {
                Ok(manifest) => return Ok((manifest, path.to_path_buf())),
                Err(err) => tracing::warn!(error = %err, "explicit manifest unusable, trying defaults"),
            }
        }

        let default_path = self.default_path(version);
        match Manifest::load(&default_path) {
            Ok(manifest) => return Ok((manifest, default_path)),
            Err(err) => tracing::debug!(error = %err, "no manifest at default location"),
        }

        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            let mut candidates: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(MANIFEST_PREFIX))
                .map(|entry| entry.path())
                .collect();
            candidates.sort();
            for path in candidates {
                if let Ok(manifest) = Manifest::load(&path) {
                    tracing::info!(path = %path.display(), "using fallback manifest");
                    return Ok((manifest, path));
                }
            }
        }

        Err(VerificationError::new(
            "load manifest",
            None,
            format!("no manifest found for version {version}"),
        )
        .into())
    }

    pub fn has_manifest(&self, version: &str) -> bool {
        self.default_path(version).is_file()
    }

    /// Hashes every file under `root` except ignored, backup and transient files.
    pub fn generate(&self, root: &Path, version: &str, ignore: &[String]) -> Result<Manifest> {
        if !root.is_dir() {
            return Err(LauncherError::NotFound(format!(
                "install directory not found: {}",
                root.display()
            )));
        }
        let matcher = IgnoreMatcher::new(ignore)?;
        let mut manifest = Manifest::new(version);
        manifest.ignore = ignore.to_vec();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                entry.depth() == 0 || !SKIPPED_NAMES.contains(&name.as_ref())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if TRANSIENT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                continue;
            }
            let relative = match entry.path().strip_prefix(root) {
                Ok(relative) => normalize_relative_path(&relative.to_string_lossy()),
                Err(_) => continue,
            };
            if matcher.is_ignored(&relative) {
                continue;
            }
            let size = entry
                .metadata()
                .map(|meta| meta.len())
                .map_err(std::io::Error::from)?;
            let sha256 = sha256_file(entry.path(), |_| {})?;
            manifest.files.insert(relative, FileRecord { size, sha256 });
        }

        tracing::info!(
            version,
            files = manifest.files.len(),
            root = %root.display(),
            "generated manifest"
        );
        Ok(manifest)
    }

    pub fn generate_and_save(
        &self,
        root: &Path,
        version: &str,
        ignore: &[String],
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        let manifest = self.generate(root, version, ignore)?;
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(version));
        manifest.save(&path)?;
        Ok(path)
    }
}
