//! Game distribution sync: version discovery, incremental patching, integrity
//! verification with backups, and binary domain rewriting.

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

use std::path::Path;
use std::sync::Arc;

use crate::config::LauncherConfig;
use crate::errors::Result;
use crate::services::{
    DomainPatcher, Downloader, ExternalDiffApplier, HttpPatchStepSource,
    HttpRuntimeManifestSource, InstallService, IntegrityVerifier, ManifestStore, PatchPipeline,
    PatchResolver, RetryPolicy, RuntimeService, ToolService, VersionCache,
};
use crate::utils::paths::{resolve_root_dir, LauncherPaths};
use crate::utils::platform::Platform;

/// Every service, built once from one config and shared by reference.
#[derive(Clone)]
pub struct AppState {
    pub config: LauncherConfig,
    pub paths: LauncherPaths,
    pub platform: Platform,
    pub versions: Arc<VersionCache>,
    pub resolver: PatchResolver,
    pub downloader: Downloader,
    pub manifests: ManifestStore,
    pub verifier: IntegrityVerifier,
    pub tools: ToolService,
    pub installs: Arc<InstallService>,
}

impl AppState {
    /// Resolves the data root, loads its config and wires the services.
    pub fn load(root: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let paths = LauncherPaths::new(resolve_root_dir(root));
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.config_file());
        let config = LauncherConfig::load_or_default(&config_path)?;
        Self::build(paths, config)
    }

    pub fn build(paths: LauncherPaths, config: LauncherConfig) -> Result<Self> {
        let platform = Platform::current();
        let versions = Arc::new(VersionCache::default());
        let source = Arc::new(HttpPatchStepSource::from_config(&config.api));
        let resolver = PatchResolver::new(source, Arc::clone(&versions), platform.clone());
        let downloader = Downloader::new(RetryPolicy::from_config(&config.download));
        let manifests = ManifestStore::new(paths.manifests_dir());
        let verifier = IntegrityVerifier::new(manifests.clone());
        let tools = ToolService::new(
            paths.tools_dir(),
            config.patch_tool.clone(),
            platform.clone(),
            downloader.clone(),
        );

        let applier = Arc::new(ExternalDiffApplier::from_config(
            tools.tool_path(),
            &config.patch_tool,
        ));
        let pipeline = PatchPipeline::new(
            resolver.clone(),
            downloader.clone(),
            applier,
            paths.patch_cache_root(),
            paths.staging_root(),
        );

        let domain_patcher = if config.domain_patch.enabled {
            match DomainPatcher::from_config(&config.domain_patch) {
                Ok(patcher) => Some(patcher),
                Err(err) => {
                    tracing::error!(error = %err, "domain patch config is invalid, patching disabled");
                    None
                }
            }
        } else {
            None
        };

        let mut installs = InstallService::new(
            paths.clone(),
            config.layout.clone(),
            config.verify.clone(),
            pipeline,
            verifier.clone(),
            domain_patcher,
        );
        if config.runtime.managed {
            let source = Arc::new(HttpRuntimeManifestSource::from_config(
                &config.runtime,
                &config.api,
            ));
            installs = installs.with_runtime(RuntimeService::new(
                source,
                downloader.clone(),
                platform.clone(),
                paths.runtime_cache_dir(),
            ));
        }
        let installs = Arc::new(installs);

        tracing::debug!(root = %paths.root().display(), platform = %platform, "services ready");
        Ok(Self {
            config,
            paths,
            platform,
            versions,
            resolver,
            downloader,
            manifests,
            verifier,
            tools,
            installs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::load(Some(dir.path()), None).expect("state");

        assert!(dir.path().join(config::CONFIG_FILE_NAME).is_file());
        assert_eq!(state.manifests.dir(), state.paths.manifests_dir());
        assert!(state.tools.tool_path().starts_with(state.paths.tools_dir()));
    }

    #[test]
    fn target_domain_alone_enables_domain_patching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = LauncherPaths::new(dir.path().to_path_buf());
        let mut config = LauncherConfig::load_or_default(&paths.config_file()).expect("config");
        config.apply_overrides(|key: &str| {
            (key == "LAUNCHER_TARGET_DOMAIN").then(|| "example.io".to_string())
        });

        let state = AppState::build(paths, config).expect("state");
        assert!(state.installs.domain_patching_enabled());
    }

    #[test]
    fn invalid_domain_config_disables_patching_instead_of_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = LauncherConfig::default();
        config.domain_patch.enabled = true;
        config.domain_patch.target_domain = "bad domain".to_string();

        let state = AppState::build(LauncherPaths::new(dir.path().to_path_buf()), config)
            .expect("other services still build");
        assert!(!state.installs.domain_patching_enabled());
    }
}
