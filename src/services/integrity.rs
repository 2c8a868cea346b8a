use std::io;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{env_truthy, SKIP_VERIFY_ENV};
use crate::errors::{LauncherError, Result};
use crate::services::backup_manager::BackupManager;
use crate::services::manifest_service::{FileRecord, IgnoreMatcher, ManifestStore};
use crate::utils::hash::sha256_file;

pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationStatus {
    #[serde(rename = "OK")]
    Ok,
    Warning,
    Failed,
    Skipped,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileStatus {
    pub path: String,
    pub exists: bool,
    pub size: u64,
    pub expected_size: u64,
    pub hash: String,
    pub expected_hash: String,
    #[serde(rename = "match")]
    pub matched: bool,
    pub status: VerificationStatus,
    pub message: String,
}

impl FileStatus {
    fn pending(path: &str, expected: &FileRecord) -> Self {
        Self {
            path: path.to_string(),
            exists: false,
            size: 0,
            expected_size: expected.size,
            hash: String::new(),
            expected_hash: expected.sha256.clone(),
            matched: false,
            status: VerificationStatus::Failed,
            message: String::new(),
        }
    }

    fn fail(mut self, message: String) -> Self {
        self.status = VerificationStatus::Failed;
        self.message = message;
        self
    }

    pub fn needs_attention(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::Failed | VerificationStatus::Warning
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub total_files: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
    pub missing_files: usize,
    pub modified_files: usize,
}

impl Summary {
    fn from_files(files: &[FileStatus]) -> Self {
        let mut summary = Summary {
            total_files: files.len(),
            ..Summary::default()
        };
        for file in files {
            match file.status {
                VerificationStatus::Ok => summary.passed += 1,
                VerificationStatus::Failed => {
                    summary.failed += 1;
                    if !file.exists {
                        summary.missing_files += 1;
                    }
                }
                VerificationStatus::Warning => {
                    summary.warnings += 1;
                    if file.exists && !file.matched {
                        summary.modified_files += 1;
                    }
                }
                VerificationStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Report {
    pub version: String,
    pub root_dir: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<FileStatus>,
    pub overall_status: VerificationStatus,
    pub summary: Summary,
}

impl Report {
    pub fn issues(&self) -> impl Iterator<Item = &FileStatus> {
        self.files.iter().filter(|file| file.needs_attention())
    }
}

/// Failed beats Warning beats OK. An empty run is OK.
pub fn overall_status(files: &[FileStatus]) -> VerificationStatus {
    let mut overall = VerificationStatus::Ok;
    for file in files {
        match file.status {
            VerificationStatus::Failed => return VerificationStatus::Failed,
            VerificationStatus::Warning => overall = VerificationStatus::Warning,
            _ => {}
        }
    }
    overall
}

/// `(bytes_hashed, file_size, file_name)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Clone)]
pub struct VerifyOptions {
    pub root_dir: PathBuf,
    pub version: String,
    pub manifest_path: Option<PathBuf>,
    pub ignore: Vec<String>,
    pub create_backups: bool,
    /// Defaults to `<root_dir>/.backups`
    pub backup_dir: Option<PathBuf>,
    pub skip: bool,
    pub progress: Option<ProgressCallback>,
    pub progress_interval: u64,
    pub workers: Option<usize>,
}

impl VerifyOptions {
    pub fn new(root_dir: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            version: version.into(),
            manifest_path: None,
            ignore: Vec::new(),
            create_backups: true,
            backup_dir: None,
            skip: false,
            progress: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            workers: None,
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join(".backups"))
    }
}

/// Hash seam so tests can observe which files get hashed.
pub trait ContentHasher: Send + Sync {
    fn hash_file(&self, path: &Path, on_read: &mut dyn FnMut(u64)) -> io::Result<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash_file(&self, path: &Path, on_read: &mut dyn FnMut(u64)) -> io::Result<String> {
        sha256_file(path, on_read)
    }
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    manifests: ManifestStore,
    hasher: Arc<dyn ContentHasher>,
}

impl IntegrityVerifier {
    pub fn new(manifests: ManifestStore) -> Self {
        Self::with_hasher(manifests, Arc::new(Sha256Hasher))
    }

    pub fn with_hasher(manifests: ManifestStore, hasher: Arc<dyn ContentHasher>) -> Self {
        Self { manifests, hasher }
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub async fn verify_async(&self, options: VerifyOptions) -> Result<Report> {
        let verifier = self.clone();
        tokio::task::spawn_blocking(move || verifier.verify(&options)).await?
    }

    /// Checks every manifest entry under `options.root_dir`. Blocking.
    pub fn verify(&self, options: &VerifyOptions) -> Result<Report> {
        if options.skip || env_truthy(SKIP_VERIFY_ENV) {
            tracing::warn!(version = %options.version, "integrity verification skipped");
            return Ok(skipped_report(options));
        }

        let (manifest, manifest_path) = self
            .manifests
            .resolve(options.manifest_path.as_deref(), &options.version)?;
        tracing::info!(
            version = %options.version,
            manifest = %manifest_path.display(),
            files = manifest.files.len(),
            "verifying install"
        );

        let manifest_ignore = manifest.ignore_matcher()?;
        let caller_ignore = IgnoreMatcher::new(&options.ignore)?;
        let entries: Vec<(String, FileRecord)> = manifest
            .files
            .into_iter()
            .filter(|(path, _)| !manifest_ignore.is_ignored(path) && !caller_ignore.is_ignored(path))
            .collect();

        let backups = options
            .create_backups
            .then(|| BackupManager::new(options.backup_dir(), options.root_dir.clone()));
        let workers = resolve_workers(options.workers);
        let mut files = self.check_entries_parallel(options, &entries, backups.as_ref(), workers)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let summary = Summary::from_files(&files);
        let overall_status = overall_status(&files);
        tracing::info!(
            version = %options.version,
            status = ?overall_status,
            passed = summary.passed,
            failed = summary.failed,
            warnings = summary.warnings,
            "verification finished"
        );

        Ok(Report {
            version: options.version.clone(),
            root_dir: options.root_dir.clone(),
            timestamp: Utc::now(),
            files,
            overall_status,
            summary,
        })
    }

    fn check_entries_parallel(
        &self,
        options: &VerifyOptions,
        entries: &[(String, FileRecord)],
        backups: Option<&BackupManager>,
        worker_count: usize,
    ) -> Result<Vec<FileStatus>> {
        let next_index = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(entries.len()));

        thread::scope(|scope| {
            for _ in 0..worker_count.min(entries.len().max(1)) {
                scope.spawn(|| loop {
                    let index = next_index.fetch_add(1, Ordering::SeqCst);
                    let Some((path, expected)) = entries.get(index) else {
                        break;
                    };
                    let status = self.check_entry(options, path, expected, backups);
                    if let Ok(mut guard) = results.lock() {
                        guard.push(status);
                    }
                });
            }
        });

        results
            .into_inner()
            .map_err(|_| LauncherError::Config("verification results lock poisoned".to_string()))
    }

    fn check_entry(
        &self,
        options: &VerifyOptions,
        relative: &str,
        expected: &FileRecord,
        backups: Option<&BackupManager>,
    ) -> FileStatus {
        let mut status = FileStatus::pending(relative, expected);
        let full_path = options
            .root_dir
            .join(relative.replace('/', &MAIN_SEPARATOR.to_string()));

        let metadata = match std::fs::metadata(&full_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return status.fail("File missing - reinstallation recommended".to_string());
            }
            Err(err) => return status.fail(format!("Cannot access file: {err}")),
        };

        status.exists = true;
        status.size = metadata.len();
        if status.size != expected.size {
            let message = format!(
                "Size mismatch: expected {}, got {}",
                expected.size, status.size
            );
            return status.fail(message);
        }

        let hash = match self.hash_with_progress(options, &full_path, status.size) {
            Ok(hash) => hash,
            Err(err) => return status.fail(format!("Failed to calculate hash: {err}")),
        };
        status.matched = hash.eq_ignore_ascii_case(&expected.sha256);
        status.hash = hash;

        if status.matched {
            status.status = VerificationStatus::Ok;
            status.message = "File verified successfully".to_string();
            return status;
        }

        status.status = VerificationStatus::Warning;
        status.message = "File modified or corrupted".to_string();
        tracing::warn!(path = relative, "file modified or corrupted");
        if let Some(backups) = backups {
            if let Err(err) = backups.create_backup(&full_path) {
                tracing::warn!(path = relative, error = %err, "backup of modified file failed");
            }
        }
        status
    }

    fn hash_with_progress(&self, options: &VerifyOptions, path: &Path, size: u64) -> io::Result<String> {
        let interval = options.progress_interval.max(1);
        let callback = options.progress.as_ref().filter(|_| size > interval);
        let Some(callback) = callback else {
            return self.hasher.hash_file(path, &mut |_| {});
        };

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut last_report = 0_u64;
        let hash = self.hasher.hash_file(path, &mut |read| {
            if read - last_report >= interval {
                callback(read, size, &file_name);
                last_report = read;
            }
        })?;
        if last_report < size {
            callback(size, size, &file_name);
        }
        Ok(hash)
    }
}

fn skipped_report(options: &VerifyOptions) -> Report {
    Report {
        version: options.version.clone(),
        root_dir: options.root_dir.clone(),
        timestamp: Utc::now(),
        files: Vec::new(),
        overall_status: VerificationStatus::Skipped,
        summary: Summary {
            skipped: 1,
            ..Summary::default()
        },
    }
}

fn resolve_workers(value: Option<usize>) -> usize {
    let cores = thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4);
    value.unwrap_or(cores.min(8)).clamp(1, 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::manifest_service::Manifest;
    use crate::utils::hash::sha256_bytes;
    use std::collections::HashSet;

    struct CountingHasher {
        hashed: Mutex<HashSet<PathBuf>>,
    }

    impl CountingHasher {
        fn new() -> Self {
            Self {
                hashed: Mutex::new(HashSet::new()),
            }
        }

        fn hashed(&self, path: &Path) -> bool {
            self.hashed.lock().expect("hashed lock").contains(path)
        }
    }

    impl ContentHasher for CountingHasher {
        fn hash_file(&self, path: &Path, on_read: &mut dyn FnMut(u64)) -> io::Result<String> {
            self.hashed
                .lock()
                .expect("hashed lock")
                .insert(path.to_path_buf());
            sha256_file(path, on_read)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: ManifestStore,
    }

    fn fixture(files: &[(&str, &[u8])]) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("install");
        let store = ManifestStore::new(dir.path().join("manifests"));
        let mut manifest = Manifest::new("5");
        for (relative, data) in files {
            let path = root.join(relative);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(&path, data).expect("write");
            manifest.files.insert(
                relative.to_string(),
                FileRecord {
                    size: data.len() as u64,
                    sha256: sha256_bytes(data),
                },
            );
        }
        manifest.save(&store.default_path("5")).expect("save manifest");
        Fixture {
            _dir: dir,
            root,
            store,
        }
    }

    fn status_of<'a>(report: &'a Report, path: &str) -> &'a FileStatus {
        report
            .files
            .iter()
            .find(|file| file.path == path)
            .expect("file in report")
    }

    #[test]
    fn clean_install_is_ok() {
        let fx = fixture(&[("Assets.zip", b"assets"), ("Client/lib/a.jar", b"jar")]);
        let report = IntegrityVerifier::new(fx.store.clone())
            .verify(&VerifyOptions::new(&fx.root, "5"))
            .expect("verify");

        assert_eq!(report.overall_status, VerificationStatus::Ok);
        assert_eq!(report.summary.passed, 2);
        assert!(report.files.iter().all(|file| file.matched));
        assert_eq!(status_of(&report, "Assets.zip").message, "File verified successfully");
    }

    #[test]
    fn size_mismatch_fails_without_hashing() {
        let fx = fixture(&[("Assets.zip", b"assets"), ("Server/GameServer.jar", b"server")]);
        std::fs::write(fx.root.join("Assets.zip"), b"assets plus more").expect("grow");
        let hasher = Arc::new(CountingHasher::new());
        let verifier = IntegrityVerifier::with_hasher(fx.store.clone(), hasher.clone());

        let report = verifier.verify(&VerifyOptions::new(&fx.root, "5")).expect("verify");

        let assets = status_of(&report, "Assets.zip");
        assert_eq!(assets.status, VerificationStatus::Failed);
        assert_eq!(assets.message, "Size mismatch: expected 6, got 16");
        assert!(assets.hash.is_empty());
        assert!(!hasher.hashed(&fx.root.join("Assets.zip")));
        assert!(hasher.hashed(&fx.root.join("Server").join("GameServer.jar")));
        assert_eq!(report.overall_status, VerificationStatus::Failed);
    }

    #[test]
    fn modified_file_warns_and_is_backed_up() {
        let fx = fixture(&[("Client/lib/a.jar", b"original"), ("Assets.zip", b"assets")]);
        let target = fx.root.join("Client").join("lib").join("a.jar");
        std::fs::write(&target, b"tampered").expect("tamper");

        let report = IntegrityVerifier::new(fx.store.clone())
            .verify(&VerifyOptions::new(&fx.root, "5"))
            .expect("verify");

        let jar = status_of(&report, "Client/lib/a.jar");
        assert_eq!(jar.status, VerificationStatus::Warning);
        assert_eq!(jar.message, "File modified or corrupted");
        assert_eq!(report.overall_status, VerificationStatus::Warning);
        assert_eq!(report.summary.modified_files, 1);

        let backups = BackupManager::new(fx.root.join(".backups"), fx.root.clone());
        let listed = backups.list_backups(&target).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(std::fs::read(&listed[0].path).expect("read backup"), b"tampered");
    }

    #[test]
    fn missing_file_counts_as_missing() {
        let fx = fixture(&[("Assets.zip", b"assets"), ("Client/lib/a.jar", b"jar")]);
        std::fs::remove_file(fx.root.join("Assets.zip")).expect("remove");

        let report = IntegrityVerifier::new(fx.store.clone())
            .verify(&VerifyOptions::new(&fx.root, "5"))
            .expect("verify");

        let assets = status_of(&report, "Assets.zip");
        assert!(!assets.exists);
        assert_eq!(assets.message, "File missing - reinstallation recommended");
        assert_eq!(report.summary.missing_files, 1);
        assert_eq!(report.summary.failed, 1);
    }

    #[test]
    fn caller_ignore_list_excludes_files() {
        let fx = fixture(&[("Assets.zip", b"assets"), ("UserData/settings.json", b"{}")]);
        std::fs::remove_file(fx.root.join("UserData").join("settings.json")).expect("remove");
        let mut options = VerifyOptions::new(&fx.root, "5");
        options.ignore = vec!["UserData/*".to_string()];

        let report = IntegrityVerifier::new(fx.store.clone())
            .verify(&options)
            .expect("verify");

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.overall_status, VerificationStatus::Ok);
    }

    #[test]
    fn skip_flag_short_circuits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = VerifyOptions::new(dir.path(), "5");
        options.skip = true;

        let report = IntegrityVerifier::new(ManifestStore::new(dir.path().join("none")))
            .verify(&options)
            .expect("skipped verify needs no manifest");

        assert_eq!(report.overall_status, VerificationStatus::Skipped);
        assert!(report.files.is_empty());
        assert_eq!(report.summary.skipped, 1);
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = IntegrityVerifier::new(ManifestStore::new(dir.path().join("none")))
            .verify(&VerifyOptions::new(dir.path(), "5"))
            .expect_err("no manifest");
        assert!(matches!(err, LauncherError::Verification(_)));
    }

    #[test]
    fn progress_emitted_per_interval_plus_final() {
        let data = vec![7_u8; 10 * 1024 * 1024 + 5];
        let fx = fixture(&[("Assets.zip", &data), ("tiny.txt", b"t")]);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let mut options = VerifyOptions::new(&fx.root, "5");
        options.progress_interval = 4 * 1024 * 1024;
        options.progress = Some(Arc::new(move |read: u64, total: u64, name: &str| {
            sink.lock().expect("calls lock").push((read, total, name.to_string()));
        }));

        IntegrityVerifier::new(fx.store.clone())
            .verify(&options)
            .expect("verify");

        let calls = calls.lock().expect("calls lock");
        let total = data.len() as u64;
        assert_eq!(
            calls.iter().map(|call| call.0).collect::<Vec<_>>(),
            vec![4 * 1024 * 1024, 8 * 1024 * 1024, total]
        );
        assert!(calls.iter().all(|call| call.1 == total && call.2 == "Assets.zip"));
    }

    #[test]
    fn overall_precedence() {
        let make = |status| FileStatus {
            status,
            ..FileStatus::pending("x", &FileRecord { size: 0, sha256: String::new() })
        };
        assert_eq!(overall_status(&[]), VerificationStatus::Ok);
        assert_eq!(
            overall_status(&[make(VerificationStatus::Ok), make(VerificationStatus::Warning)]),
            VerificationStatus::Warning
        );
        assert_eq!(
            overall_status(&[make(VerificationStatus::Warning), make(VerificationStatus::Failed)]),
            VerificationStatus::Failed
        );
    }

    #[test]
    fn report_serializes_expected_field_names() {
        let fx = fixture(&[("Assets.zip", b"assets")]);
        let report = IntegrityVerifier::new(fx.store.clone())
            .verify(&VerifyOptions::new(&fx.root, "5"))
            .expect("verify");

        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["overall_status"], "OK");
        assert_eq!(json["files"][0]["match"], true);
        assert_eq!(json["files"][0]["expected_size"], 6);
        assert_eq!(json["summary"]["total_files"], 1);
    }
}
