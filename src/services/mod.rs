pub mod api_client;
pub mod backup_manager;
pub mod coalescer;
pub mod domain_patcher;
pub mod downloader;
pub mod install_service;
pub mod integrity;
pub mod manifest_service;
pub mod patch_applier;
pub mod patch_resolver;
pub mod progress;
pub mod runtime_service;
pub mod tool_service;
pub mod version_cache;

pub use api_client::ApiClient;
pub use backup_manager::BackupManager;
pub use domain_patcher::{DomainPatchReport, DomainPatcher, PatchEncoding, TargetOutcome};
pub use downloader::{Downloader, RetryPolicy};
pub use install_service::{InstallOutcome, InstallService, ProcessLauncher, SessionProvider};
pub use integrity::{IntegrityVerifier, Report, VerificationStatus, VerifyOptions};
pub use manifest_service::{Manifest, ManifestStore};
pub use patch_applier::{DiffApplier, ExternalDiffApplier, PatchPipeline};
pub use patch_resolver::{HttpPatchStepSource, PatchResolver, PatchStepSource};
pub use progress::{ProgressEvent, ProgressReporter, ProgressStage};
pub use runtime_service::{
    HttpRuntimeManifestSource, RuntimeManifest, RuntimeManifestSource, RuntimeOutcome,
    RuntimeService,
};
pub use tool_service::ToolService;
pub use version_cache::{VersionCache, VersionKey};
