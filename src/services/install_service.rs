use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use crate::config::{LayoutConfig, VerifyConfig};
use crate::errors::{LauncherError, Result};
use crate::models::{BuildSelector, InstallRequest, LaunchPlan, PlaySession};
use crate::services::domain_patcher::{DomainPatchReport, DomainPatcher};
use crate::services::integrity::{IntegrityVerifier, Report, VerifyOptions};
use crate::services::patch_applier::PatchPipeline;
use crate::services::progress::{ProgressReporter, ProgressStage};
use crate::services::runtime_service::{check_runtime, RuntimeOutcome, RuntimeService};
use crate::utils::file::write_atomic;
use crate::utils::paths::{InstallLayout, LauncherPaths};

pub const VERSION_SENTINEL: &str = ".version";

/// Supplies the session handed to the game on launch.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn play_session(&self) -> Result<PlaySession>;
}

/// Starts the installed game.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan, session: &PlaySession) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub branch: String,
    pub version: u32,
    pub install_dir: PathBuf,
    pub previous_version: u32,
    pub updated: bool,
    /// The incremental update failed and a clean install was done instead.
    pub reinstalled: bool,
    pub runtime: Option<RuntimeOutcome>,
    pub domain_patch: Option<DomainPatchReport>,
    pub verification: Option<Report>,
}

pub struct InstallService {
    paths: LauncherPaths,
    layout: LayoutConfig,
    verify: VerifyConfig,
    pipeline: PatchPipeline,
    verifier: IntegrityVerifier,
    domain_patcher: Option<DomainPatcher>,
    runtime: Option<RuntimeService>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstallService {
    pub fn new(
        paths: LauncherPaths,
        layout: LayoutConfig,
        verify: VerifyConfig,
        pipeline: PatchPipeline,
        verifier: IntegrityVerifier,
        domain_patcher: Option<DomainPatcher>,
    ) -> Self {
        Self {
            paths,
            layout,
            verify,
            pipeline,
            verifier,
            domain_patcher,
            runtime: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Keeps the managed runtime in sync on every install.
    pub fn with_runtime(mut self, runtime: RuntimeService) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn domain_patching_enabled(&self) -> bool {
        self.domain_patcher.is_some()
    }

    pub fn layout_for(&self, dir: &Path) -> InstallLayout {
        InstallLayout::new(dir, &self.layout)
    }

    fn lock_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(dir.to_path_buf()).or_default())
    }

    async fn resolve_target(&self, request: &InstallRequest) -> Result<u32> {
        let resolver = self.pipeline.resolver();
        match request.build {
            BuildSelector::Auto | BuildSelector::Latest => {
                resolver.find_latest_version(&request.branch).await
            }
            BuildSelector::Fixed(version) => {
                resolver.verify_version_exists(&request.branch, version).await?;
                Ok(version)
            }
        }
    }

    /// Installs or updates one target, syncs its runtime, domain-patches it and
    /// verifies the result. Domain-patched files are left out of verification
    /// since the manifest describes the unpatched build.
    pub async fn ensure_installed(
        &self,
        request: &InstallRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        progress.report(ProgressStage::Install, 0.0, "Resolving version...");
        let target = self.resolve_target(request).await?;
        let dir = self
            .paths
            .install_dir(&request.branch, &request.build.dir_name(target));

        let lock = self.lock_for(&dir);
        let _guard = lock.lock().await;

        let installed = check_installed(&self.layout_for(&dir));
        let current = match request.build {
            BuildSelector::Auto if installed => read_version_sentinel(&dir).unwrap_or(0),
            BuildSelector::Latest | BuildSelector::Fixed(_) if installed => target,
            _ => 0,
        };
        tracing::info!(
            branch = %request.branch,
            build = %request.build,
            current,
            target_version = target,
            dir = %dir.display(),
            "ensuring install"
        );

        let mut outcome = InstallOutcome {
            branch: request.branch.clone(),
            version: target,
            install_dir: dir.clone(),
            previous_version: current,
            updated: false,
            reinstalled: false,
            runtime: None,
            domain_patch: None,
            verification: None,
        };

        if current == target {
            tracing::info!(version = target, "install is up to date");
        } else {
            let patch_progress = progress.scaled(0.0, 75.0);
            let reinstalled = self
                .update_with_fallback(&request.branch, current, target, &dir, &patch_progress, cancel)
                .await?;
            outcome.updated = true;
            outcome.reinstalled = reinstalled;
            if request.build == BuildSelector::Auto {
                write_atomic(&dir.join(VERSION_SENTINEL), target.to_string().as_bytes())?;
            }
        }

        if let Some(runtime) = &self.runtime {
            let layout = self.layout_for(&dir);
            outcome.runtime = Some(
                runtime
                    .ensure_runtime(&request.branch, &layout, &progress.scaled(75.0, 85.0), cancel)
                    .await?,
            );
        }
        outcome.domain_patch = self.patch_domain(&dir, &progress.scaled(85.0, 90.0)).await;
        outcome.verification = self.verify_install(&dir, target, &progress.scaled(90.0, 100.0)).await;

        progress.report(ProgressStage::Complete, 100.0, "Game is ready");
        Ok(outcome)
    }

    /// Incremental update; on any failure, wipe the dir and install from scratch once.
    async fn update_with_fallback(
        &self,
        branch: &str,
        current: u32,
        target: u32,
        dir: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let original = match self
            .pipeline
            .download_and_apply(branch, current, target, dir, progress, cancel)
            .await
        {
            Ok(_) => return Ok(false),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => err,
        };

        tracing::warn!(
            branch,
            from = current,
            to = target,
            error = %original,
            "update failed, attempting full reinstall"
        );
        progress.report(ProgressStage::Install, 0.0, "Update failed, reinstalling...");
        clean_install_dir(dir).await;

        match self
            .pipeline
            .download_and_apply(branch, 0, target, dir, progress, cancel)
            .await
        {
            Ok(_) => Ok(true),
            Err(retry) if retry.is_cancelled() => Err(retry),
            Err(retry) => {
                tracing::error!(branch, error = %retry, "full reinstall failed");
                Err(LauncherError::ReinstallFailed {
                    original: Box::new(original),
                    retry: Box::new(retry),
                })
            }
        }
    }

    async fn verify_install(
        &self,
        dir: &Path,
        version: u32,
        progress: &ProgressReporter,
    ) -> Option<Report> {
        let version = version.to_string();
        if !self.verify.skip && !self.verifier.manifests().has_manifest(&version) {
            tracing::info!(version = %version, "no manifest for version, skipping verification");
            return None;
        }

        let mut options = VerifyOptions::new(dir, version.as_str());
        options.ignore = self.verify.ignore.clone();
        if self.domain_patcher.is_some() {
            options.ignore.extend(self.domain_patched_paths(dir));
        }
        options.create_backups = self.verify.create_backups;
        options.skip = self.verify.skip;
        options.progress_interval = self.verify.progress_interval_bytes;
        let reporter = progress.clone();
        options.progress = Some(Arc::new(move |read: u64, total: u64, name: &str| {
            let percent = if total > 0 { read as f64 * 100.0 / total as f64 } else { 100.0 };
            reporter.report(ProgressStage::Verify, percent, format!("Verifying {name}"));
        }));

        match self.verifier.verify_async(options).await {
            Ok(report) => {
                for issue in report.issues() {
                    tracing::warn!(path = %issue.path, status = ?issue.status, message = %issue.message, "integrity issue");
                }
                Some(report)
            }
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "verification could not run");
                None
            }
        }
    }

    /// Escaped globs for the files the domain patcher rewrites.
    fn domain_patched_paths(&self, dir: &Path) -> Vec<String> {
        let layout = self.layout_for(dir);
        [layout.client, layout.server_archive]
            .iter()
            .filter_map(|path| path.strip_prefix(dir).ok())
            .map(|relative| globset::escape(&relative.to_string_lossy().replace('\\', "/")))
            .collect()
    }

    async fn patch_domain(&self, dir: &Path, progress: &ProgressReporter) -> Option<DomainPatchReport> {
        let patcher = self.domain_patcher.clone()?;
        let layout = self.layout_for(dir);
        let progress = progress.clone();
        match tokio::task::spawn_blocking(move || patcher.patch_install(&layout, &progress)).await {
            Ok(report) => {
                if report.has_failures() {
                    tracing::warn!(?report, "domain patch incomplete");
                }
                Some(report)
            }
            Err(err) => {
                tracing::error!(error = %err, "domain patch task failed");
                None
            }
        }
    }

    /// Installed version for the request, without touching the network for `Auto` and `Fixed`.
    pub async fn installed_version(&self, request: &InstallRequest) -> Result<Option<(u32, PathBuf)>> {
        let (version, dir) = match request.build {
            BuildSelector::Auto => {
                let dir = self.paths.install_dir(&request.branch, "auto");
                match read_version_sentinel(&dir) {
                    Some(version) => (version, dir),
                    None => return Ok(None),
                }
            }
            BuildSelector::Fixed(version) => (
                version,
                self.paths.install_dir(&request.branch, &version.to_string()),
            ),
            BuildSelector::Latest => {
                let version = self.pipeline.resolver().find_latest_version(&request.branch).await?;
                (
                    version,
                    self.paths.install_dir(&request.branch, &version.to_string()),
                )
            }
        };
        let layout = self.layout_for(&dir);
        let runtime_ready = self.runtime.is_none() || check_runtime(&layout);
        if check_installed(&layout) && runtime_ready {
            Ok(Some((version, dir)))
        } else {
            Ok(None)
        }
    }

    /// Hands a verified install and a fresh session to the launcher collaborator.
    pub async fn launch(
        &self,
        request: &InstallRequest,
        sessions: &dyn SessionProvider,
        launcher: &dyn ProcessLauncher,
    ) -> Result<LaunchPlan> {
        let (version, dir) = self.installed_version(request).await?.ok_or_else(|| {
            LauncherError::NotFound(format!(
                "{} ({}) is not installed",
                request.branch, request.build
            ))
        })?;
        let layout = self.layout_for(&dir);
        let plan = LaunchPlan {
            branch: request.branch.clone(),
            version,
            game_dir: dir,
            client_path: layout.client,
            runtime_path: layout.runtime,
        };
        let session = sessions.play_session().await?;
        tracing::info!(branch = %plan.branch, version, client = %plan.client_path.display(), "launching");
        launcher.launch(&plan, &session).await?;
        Ok(plan)
    }
}

/// Client and server present, assets archive readable.
pub fn check_installed(layout: &InstallLayout) -> bool {
    if !layout.client.is_file() || !layout.server_archive.is_file() {
        return false;
    }
    match File::open(&layout.assets_archive).map(ZipArchive::new) {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            tracing::warn!(path = %layout.assets_archive.display(), error = %err, "assets archive is corrupt");
            false
        }
        Err(_) => false,
    }
}

pub fn read_version_sentinel(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join(VERSION_SENTINEL))
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Empties `dir` but keeps it. Entries that cannot be removed are logged and left.
async fn clean_install_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %err, "cannot read install dir for cleanup");
            }
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "cleanup listing failed");
                break;
            }
        };
        let path = entry.path();
        let removed = match entry.file_type().await {
            Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        if let Err(err) = removed {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove during cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::domain_patcher::{length_prefixed, TargetOutcome};
    use crate::services::integrity::VerificationStatus;
    use crate::services::manifest_service::ManifestStore;
    use crate::services::patch_applier::tests::{fast_downloader, seed_artifacts};
    use crate::services::patch_applier::{ApplyRequest, DiffApplier};
    use crate::services::patch_resolver::tests::{step, FakeSource};
    use crate::services::patch_resolver::PatchResolver;
    use crate::services::runtime_service::tests::{
        runtime_zip, service as runtime_service, FakeRuntimeSource,
    };
    use crate::utils::hash::sha256_bytes;
    use crate::services::version_cache::VersionCache;
    use crate::utils::platform::Platform;
    use std::io::Write;

    fn write_layout(dir: &Path, version: u32) {
        let layout = InstallLayout::new(dir, &LayoutConfig::default());
        for path in [&layout.client, &layout.server_archive, &layout.assets_archive] {
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        }
        let mut client = b"client ".to_vec();
        client.extend(length_prefixed("hytale.com"));
        std::fs::write(&layout.client, client).expect("client");
        std::fs::write(&layout.server_archive, format!("server {version}")).expect("server");
        let mut assets = zip::ZipWriter::new(File::create(&layout.assets_archive).expect("assets"));
        assets
            .start_file("version.txt", zip::write::FileOptions::default())
            .expect("entry");
        assets.write_all(version.to_string().as_bytes()).expect("write");
        assets.finish().expect("finish");
    }

    /// Lays down a complete install for `to`; fails for the listed starting versions.
    struct LayoutApplier {
        fail_from: Vec<u32>,
        applied: Mutex<Vec<(u32, u32)>>,
    }

    impl LayoutApplier {
        fn new(fail_from: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                fail_from,
                applied: Mutex::new(Vec::new()),
            })
        }

        fn applied(&self) -> Vec<(u32, u32)> {
            self.applied.lock().expect("applied").clone()
        }
    }

    #[async_trait]
    impl DiffApplier for LayoutApplier {
        async fn apply(
            &self,
            request: &ApplyRequest,
            _progress: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            if self.fail_from.contains(&request.from) {
                return Err(LauncherError::PatchApply {
                    from: request.from,
                    to: request.to,
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "signature mismatch".to_string(),
                });
            }
            write_layout(&request.target_dir, request.to);
            self.applied.lock().expect("applied").push((request.from, request.to));
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        paths: LauncherPaths,
        service: InstallService,
    }

    fn harness(
        steps: Vec<crate::models::PatchStep>,
        applier: Arc<LayoutApplier>,
        domain_patcher: Option<DomainPatcher>,
    ) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = LauncherPaths::new(dir.path().to_path_buf());
        seed_artifacts(&paths.patch_cache_root(), "release", &steps);
        let mut source = FakeSource::new(steps);
        source.published = vec![2, 3];
        let resolver = PatchResolver::new(
            Arc::new(source),
            Arc::new(VersionCache::default()),
            Platform::from_rust("linux", "x86_64"),
        );
        let pipeline = PatchPipeline::new(
            resolver,
            fast_downloader(),
            applier,
            paths.patch_cache_root(),
            paths.staging_root(),
        );
        let verifier = IntegrityVerifier::new(ManifestStore::new(paths.manifests_dir()));
        let service = InstallService::new(
            paths.clone(),
            LayoutConfig::default(),
            VerifyConfig::default(),
            pipeline,
            verifier,
            domain_patcher,
        );
        Harness {
            _dir: dir,
            paths,
            service,
        }
    }

    fn auto() -> InstallRequest {
        InstallRequest {
            branch: "release".to_string(),
            build: BuildSelector::Auto,
        }
    }

    #[tokio::test]
    async fn fresh_auto_install_writes_sentinel() {
        let applier = LayoutApplier::new(Vec::new());
        let h = harness(vec![step(0, 3), step(1, 2), step(2, 3)], applier.clone(), None);

        let outcome = h
            .service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("install");

        assert_eq!(outcome.version, 3);
        assert!(outcome.updated);
        assert!(!outcome.reinstalled);
        assert_eq!(applier.applied(), vec![(0, 3)]);
        let dir = h.paths.install_dir("release", "auto");
        assert_eq!(read_version_sentinel(&dir), Some(3));
        assert!(check_installed(&h.service.layout_for(&dir)));
        assert!(outcome.verification.is_none());
    }

    #[tokio::test]
    async fn up_to_date_install_is_left_alone() {
        let applier = LayoutApplier::new(Vec::new());
        let h = harness(vec![step(1, 2), step(2, 3)], applier.clone(), None);
        let dir = h.paths.install_dir("release", "auto");
        write_layout(&dir, 3);
        std::fs::write(dir.join(VERSION_SENTINEL), "3").expect("sentinel");

        let outcome = h
            .service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("install");

        assert!(!outcome.updated);
        assert!(applier.applied().is_empty());
    }

    #[tokio::test]
    async fn failed_update_falls_back_to_clean_install() {
        let applier = LayoutApplier::new(vec![1]);
        let h = harness(vec![step(0, 3), step(1, 2), step(2, 3)], applier.clone(), None);
        let dir = h.paths.install_dir("release", "auto");
        write_layout(&dir, 1);
        std::fs::write(dir.join(VERSION_SENTINEL), "1").expect("sentinel");
        std::fs::write(dir.join("stale.dat"), b"junk").expect("stale");

        let outcome = h
            .service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("reinstall");

        assert!(outcome.reinstalled);
        assert_eq!(outcome.previous_version, 1);
        assert_eq!(applier.applied(), vec![(0, 3)]);
        assert!(!dir.join("stale.dat").exists());
        assert_eq!(read_version_sentinel(&dir), Some(3));
    }

    #[tokio::test]
    async fn both_failures_are_reported() {
        let applier = LayoutApplier::new(vec![0, 1]);
        let h = harness(vec![step(0, 3), step(1, 2), step(2, 3)], applier.clone(), None);
        let dir = h.paths.install_dir("release", "auto");
        write_layout(&dir, 1);
        std::fs::write(dir.join(VERSION_SENTINEL), "1").expect("sentinel");

        let err = h
            .service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect_err("both fail");

        match err {
            LauncherError::ReinstallFailed { original, retry } => {
                assert!(matches!(*original, LauncherError::PatchApply { from: 1, .. }));
                assert!(matches!(*retry, LauncherError::PatchApply { from: 0, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fixed_build_stops_at_requested_version() {
        let applier = LayoutApplier::new(Vec::new());
        let h = harness(vec![step(0, 1), step(1, 2), step(2, 3)], applier.clone(), None);
        let request = InstallRequest {
            branch: "release".to_string(),
            build: BuildSelector::Fixed(2),
        };

        let outcome = h
            .service
            .ensure_installed(&request, &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("install");

        assert_eq!(outcome.install_dir, h.paths.install_dir("release", "2"));
        assert_eq!(applier.applied(), vec![(0, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn unpublished_fixed_build_is_rejected() {
        let applier = LayoutApplier::new(Vec::new());
        let h = harness(vec![step(0, 1)], applier.clone(), None);
        let request = InstallRequest {
            branch: "release".to_string(),
            build: BuildSelector::Fixed(9),
        };

        let err = h
            .service
            .ensure_installed(&request, &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect_err("unpublished");
        assert!(matches!(err, LauncherError::NotFound(_)));
        assert!(applier.applied().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_installs_of_one_target_serialize() {
        let applier = LayoutApplier::new(Vec::new());
        let h = harness(vec![step(0, 3), step(1, 3)], applier.clone(), None);
        let cancel = CancellationToken::new();
        let progress = ProgressReporter::noop();
        let request = auto();

        let (first, second) = tokio::join!(
            h.service.ensure_installed(&request, &progress, &cancel),
            h.service.ensure_installed(&request, &progress, &cancel),
        );

        let updated = [first.expect("first"), second.expect("second")]
            .iter()
            .filter(|outcome| outcome.updated)
            .count();
        assert_eq!(updated, 1);
        assert_eq!(applier.applied(), vec![(0, 3)]);
    }

    #[tokio::test]
    async fn verifies_when_manifest_exists_and_patches_domain() {
        let applier = LayoutApplier::new(Vec::new());
        let patcher = DomainPatcher::new("hytale.com", "abc.ws").expect("patcher");
        let h = harness(vec![step(0, 3), step(1, 3)], applier, Some(patcher));
        let reference = tempfile::tempdir().expect("reference");
        write_layout(reference.path(), 3);
        ManifestStore::new(h.paths.manifests_dir())
            .generate_and_save(reference.path(), "3", &[], None)
            .expect("manifest");

        let outcome = h
            .service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("install");

        let domain = outcome.domain_patch.expect("domain patch ran");
        assert_eq!(domain.client, TargetOutcome::Patched { replacements: 1 });
        // Server fixture is not a zip archive.
        assert!(matches!(domain.server, TargetOutcome::Failed { .. }));
        // The rewritten client differs from the manifest but is not reported.
        let report = outcome.verification.expect("verified");
        assert_eq!(report.overall_status, VerificationStatus::Ok);
        assert_eq!(report.issues().count(), 0);
    }

    #[tokio::test]
    async fn install_syncs_runtime_and_launch_requires_it() {
        let applier = LayoutApplier::new(Vec::new());
        let Harness { _dir, paths, service } = harness(vec![step(0, 3), step(1, 3)], applier, None);
        let archive = runtime_zip();
        let cache = paths.runtime_cache_dir();
        std::fs::create_dir_all(&cache).expect("cache");
        std::fs::write(cache.join("jdk.zip"), &archive).expect("cached archive");
        let source = Arc::new(FakeRuntimeSource::new(
            "21",
            "http://127.0.0.1:9/jdk.zip",
            &sha256_bytes(&archive),
        ));
        let service = service.with_runtime(runtime_service(source, &cache));

        let outcome = service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("install");

        let runtime = outcome.runtime.expect("runtime synced");
        assert!(runtime.installed);
        assert_eq!(runtime.version, "21");
        let layout = service.layout_for(&outcome.install_dir);
        assert_eq!(runtime.path, layout.runtime);
        assert!(check_runtime(&layout));

        let launcher = CapturingLauncher {
            plans: Mutex::new(Vec::new()),
        };
        let plan = service
            .launch(&auto(), &FixedSession, &launcher)
            .await
            .expect("launch");
        assert_eq!(plan.runtime_path, layout.runtime);

        std::fs::remove_file(&layout.runtime).expect("remove runtime");
        let err = service
            .launch(&auto(), &FixedSession, &launcher)
            .await
            .expect_err("runtime missing");
        assert!(matches!(err, LauncherError::NotFound(_)));
    }

    struct FixedSession;

    #[async_trait]
    impl SessionProvider for FixedSession {
        async fn play_session(&self) -> Result<PlaySession> {
            Ok(PlaySession {
                player_name: "player".to_string(),
                session_token: "token".to_string(),
                identity_token: None,
            })
        }
    }

    struct CapturingLauncher {
        plans: Mutex<Vec<LaunchPlan>>,
    }

    #[async_trait]
    impl ProcessLauncher for CapturingLauncher {
        async fn launch(&self, plan: &LaunchPlan, session: &PlaySession) -> Result<()> {
            assert_eq!(session.player_name, "player");
            self.plans.lock().expect("plans").push(plan.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn launch_requires_an_install() {
        let applier = LayoutApplier::new(Vec::new());
        let h = harness(vec![step(0, 3), step(1, 3)], applier, None);
        let launcher = CapturingLauncher {
            plans: Mutex::new(Vec::new()),
        };

        let err = h
            .service
            .launch(&auto(), &FixedSession, &launcher)
            .await
            .expect_err("nothing installed");
        assert!(matches!(err, LauncherError::NotFound(_)));

        h.service
            .ensure_installed(&auto(), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .expect("install");
        let plan = h
            .service
            .launch(&auto(), &FixedSession, &launcher)
            .await
            .expect("launch");

        assert_eq!(plan.version, 3);
        assert_eq!(plan.client_path, h.service.layout_for(&plan.game_dir).client);
        assert_eq!(launcher.plans.lock().expect("plans").len(), 1);
    }
}
