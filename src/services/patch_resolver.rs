use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ApiConfig;
use crate::errors::{LauncherError, Result};
use crate::models::{PatchQuery, PatchStep, PatchStepsResponse};
use crate::services::api_client::ApiClient;
use crate::services::version_cache::{VersionCache, VersionKey};
use crate::utils::platform::Platform;

/// Where the ordered step list for a branch comes from.
#[async_trait]
pub trait PatchStepSource: Send + Sync {
    /// Steps starting at `query.version`, in application order.
    async fn fetch_steps(&self, query: &PatchQuery) -> Result<Vec<PatchStep>>;

    /// Whether the artifact for `query.version` is published.
    async fn version_available(&self, query: &PatchQuery) -> Result<bool>;
}

#[derive(Clone)]
pub struct HttpPatchStepSource {
    api: ApiClient,
    steps_path: String,
    patch_url_template: String,
}

impl HttpPatchStepSource {
    pub fn new(api: ApiClient, steps_path: String, patch_url_template: String) -> Self {
        Self {
            api,
            steps_path,
            patch_url_template,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        let api = ApiClient::new(
            config.base_url.clone(),
            std::time::Duration::from_secs(config.timeout_secs.max(1)),
        );
        Self::new(
            api,
            config.patch_steps_path.clone(),
            config.patch_url_template.clone(),
        )
    }

    pub fn artifact_url(&self, query: &PatchQuery) -> String {
        self.patch_url_template
            .replace("{os}", &query.os)
            .replace("{arch}", &query.arch)
            .replace("{branch}", &query.branch)
            .replace("{version}", &query.version)
    }
}

#[async_trait]
impl PatchStepSource for HttpPatchStepSource {
    async fn fetch_steps(&self, query: &PatchQuery) -> Result<Vec<PatchStep>> {
        let response: PatchStepsResponse = self.api.get_with_body(&self.steps_path, query).await?;
        Ok(response.steps)
    }

    async fn version_available(&self, query: &PatchQuery) -> Result<bool> {
        let url = self.artifact_url(query);
        match self.api.head_ok(&url).await {
            Ok(found) => Ok(found),
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "version probe failed");
                Ok(false)
            }
        }
    }
}

/// Keeps the steps whose `from` is still below `target`. A zero target keeps everything.
pub fn select_steps(steps: &[PatchStep], target: u32) -> Vec<PatchStep> {
    steps
        .iter()
        .take_while(|step| target == 0 || step.from < target)
        .cloned()
        .collect()
}

/// Every version named by the chain, ascending.
pub fn versions_in(steps: &[PatchStep]) -> Vec<u32> {
    steps
        .iter()
        .flat_map(|step| [step.from, step.to])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Clone)]
pub struct PatchResolver {
    source: Arc<dyn PatchStepSource>,
    cache: Arc<VersionCache>,
    platform: Platform,
}

impl PatchResolver {
    pub fn new(source: Arc<dyn PatchStepSource>, cache: Arc<VersionCache>, platform: Platform) -> Self {
        Self {
            source,
            cache,
            platform,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn cache(&self) -> &VersionCache {
        &self.cache
    }

    fn query(&self, branch: &str, version: u32) -> PatchQuery {
        PatchQuery {
            os: self.platform.os.clone(),
            arch: self.platform.api_arch().to_string(),
            branch: branch.to_string(),
            version: version.to_string(),
        }
    }

    fn key(&self, branch: &str) -> VersionKey {
        VersionKey::new(&self.platform.os, &self.platform.arch, branch)
    }

    /// The `to` of the last step when asking from version 1.
    pub async fn find_latest_version(&self, branch: &str) -> Result<u32> {
        let key = self.key(branch).to_string();
        let source = Arc::clone(&self.source);
        let query = self.query(branch, 1);
        let platform = self.platform.clone();
        self.cache
            .latest
            .get_or_fetch(&key, move || async move {
                let steps = fetch_non_empty(source.as_ref(), &query, &platform).await?;
                let latest = steps.last().map(|step| step.to).unwrap_or_default();
                tracing::info!(branch = %query.branch, latest, "resolved latest version");
                Ok(latest)
            })
            .await
    }

    pub async fn list_all_versions(&self, branch: &str) -> Result<Vec<u32>> {
        let key = self.key(branch).to_string();
        let source = Arc::clone(&self.source);
        let query = self.query(branch, 1);
        let platform = self.platform.clone();
        self.cache
            .all
            .get_or_fetch(&key, move || async move {
                let steps = fetch_non_empty(source.as_ref(), &query, &platform).await?;
                Ok(versions_in(&steps))
            })
            .await
    }

    pub async fn verify_version_exists(&self, branch: &str, version: u32) -> Result<()> {
        let key = self.key(branch).with_version(version).to_string();
        let source = Arc::clone(&self.source);
        let query = self.query(branch, version);
        let exists = self
            .cache
            .exists
            .get_or_fetch(&key, move || async move { source.version_available(&query).await })
            .await?;
        if exists {
            Ok(())
        } else {
            Err(LauncherError::NotFound(format!("version {version} not found")))
        }
    }

    /// Fresh step list starting at `current`. Never cached: the chain drives mutation.
    pub async fn fetch_chain(&self, branch: &str, current: u32) -> Result<Vec<PatchStep>> {
        let steps = self.source.fetch_steps(&self.query(branch, current)).await?;
        if steps.is_empty() {
            tracing::warn!(branch, current, "no patch steps available");
            return Err(LauncherError::NotFound(format!(
                "no patch steps available for {branch} from version {current}"
            )));
        }
        tracing::info!(branch, current, count = steps.len(), "found patch steps");
        for (index, step) in steps.iter().enumerate() {
            tracing::debug!(index, from = step.from, to = step.to, "patch step");
        }
        Ok(steps)
    }
}

async fn fetch_non_empty(
    source: &dyn PatchStepSource,
    query: &PatchQuery,
    platform: &Platform,
) -> Result<Vec<PatchStep>> {
    let steps = source.fetch_steps(query).await?;
    if steps.is_empty() {
        return Err(LauncherError::NotFound(format!(
            "no patches available for {platform}"
        )));
    }
    Ok(steps)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn step(from: u32, to: u32) -> PatchStep {
        PatchStep {
            from,
            to,
            diff_url: format!("https://cdn.test/{from}_{to}.pwr"),
            diff_head_url: String::new(),
            signature_url: format!("https://cdn.test/{from}_{to}.sig"),
        }
    }

    /// Serves a fixed lineage and records every query it sees.
    pub(crate) struct FakeSource {
        pub steps: Vec<PatchStep>,
        pub published: Vec<u32>,
        pub fetches: AtomicUsize,
        pub probes: AtomicUsize,
        pub queries: Mutex<Vec<PatchQuery>>,
        pub fail: bool,
    }

    impl FakeSource {
        pub(crate) fn new(steps: Vec<PatchStep>) -> Self {
            Self {
                steps,
                published: Vec::new(),
                fetches: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PatchStepSource for FakeSource {
        async fn fetch_steps(&self, query: &PatchQuery) -> Result<Vec<PatchStep>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().expect("queries").push(query.clone());
            if self.fail {
                return Err(LauncherError::http(503, "unavailable"));
            }
            // Walk the lineage the way the service does: each step starts where the last ended.
            let mut version: u32 = query.version.parse().unwrap_or(0);
            let mut chain = Vec::new();
            while let Some(next) = self.steps.iter().find(|step| step.from == version) {
                chain.push(next.clone());
                version = next.to;
            }
            Ok(chain)
        }

        async fn version_available(&self, query: &PatchQuery) -> Result<bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let version: u32 = query.version.parse().unwrap_or(0);
            Ok(self.published.contains(&version))
        }
    }

    fn resolver(source: Arc<FakeSource>, platform: Platform) -> PatchResolver {
        PatchResolver::new(source, Arc::new(VersionCache::default()), platform)
    }

    #[test]
    fn select_stops_at_target() {
        let steps = vec![step(1, 2), step(2, 3), step(3, 5)];
        let selected = select_steps(&steps, 3);
        assert_eq!(selected, vec![step(1, 2), step(2, 3)]);
        assert_eq!(select_steps(&steps, 0).len(), 3);
        assert!(select_steps(&steps, 1).is_empty());
    }

    #[test]
    fn versions_are_deduplicated_and_sorted() {
        let steps = vec![step(3, 5), step(1, 2), step(2, 3)];
        assert_eq!(versions_in(&steps), vec![1, 2, 3, 5]);
    }

    #[tokio::test]
    async fn latest_is_last_to_and_cached() {
        let source = Arc::new(FakeSource::new(vec![step(1, 2), step(2, 3), step(3, 5)]));
        let resolver = resolver(Arc::clone(&source), Platform::from_rust("linux", "x86_64"));

        assert_eq!(resolver.find_latest_version("release").await.expect("latest"), 5);
        assert_eq!(resolver.find_latest_version("release").await.expect("latest"), 5);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            resolver.list_all_versions("release").await.expect("all"),
            vec![1, 2, 3, 5]
        );
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queries_use_api_arch_and_start_from_one() {
        let source = Arc::new(FakeSource::new(vec![step(1, 2)]));
        let resolver = resolver(Arc::clone(&source), Platform::from_rust("macos", "x86_64"));

        resolver.find_latest_version("beta").await.expect("latest");

        let queries = source.queries.lock().expect("queries");
        assert_eq!(queries[0].os, "darwin");
        assert_eq!(queries[0].arch, "arm64");
        assert_eq!(queries[0].branch, "beta");
        assert_eq!(queries[0].version, "1");
    }

    #[tokio::test]
    async fn empty_chain_is_not_found() {
        let source = Arc::new(FakeSource::new(Vec::new()));
        let resolver = resolver(source, Platform::from_rust("linux", "x86_64"));

        let err = resolver.find_latest_version("release").await.expect_err("empty");
        assert!(err.to_string().contains("no patches available for linux/amd64"));
    }

    #[tokio::test]
    async fn failures_are_cached_too() {
        let mut fake = FakeSource::new(vec![step(1, 2)]);
        fake.fail = true;
        let source = Arc::new(fake);
        let resolver = resolver(Arc::clone(&source), Platform::from_rust("linux", "x86_64"));

        assert!(resolver.find_latest_version("release").await.is_err());
        assert!(resolver.find_latest_version("release").await.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        resolver.cache().clear();
        assert!(resolver.find_latest_version("release").await.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn version_probe_is_cached_per_version() {
        let mut fake = FakeSource::new(Vec::new());
        fake.published = vec![4];
        let source = Arc::new(fake);
        let resolver = resolver(Arc::clone(&source), Platform::from_rust("linux", "x86_64"));

        resolver.verify_version_exists("release", 4).await.expect("published");
        resolver.verify_version_exists("release", 4).await.expect("published");
        let err = resolver
            .verify_version_exists("release", 9)
            .await
            .expect_err("missing");

        assert_eq!(err.to_string(), "Not found: version 9 not found");
        assert_eq!(source.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chain_is_fetched_fresh_from_current() {
        let source = Arc::new(FakeSource::new(vec![step(0, 1), step(1, 2), step(2, 3)]));
        let resolver = resolver(Arc::clone(&source), Platform::from_rust("linux", "x86_64"));

        let chain = resolver.fetch_chain("release", 1).await.expect("chain");
        resolver.fetch_chain("release", 1).await.expect("chain");

        assert_eq!(chain, vec![step(1, 2), step(2, 3)]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert!(resolver.fetch_chain("release", 3).await.is_err());
    }

    #[test]
    fn artifact_url_expands_placeholders() {
        let source = HttpPatchStepSource::new(
            ApiClient::new("https://api.test".to_string(), std::time::Duration::from_secs(1)),
            "v1/pwr".to_string(),
            "https://cdn.test/{os}/{arch}/{branch}/0/{version}.pwr".to_string(),
        );
        let query = PatchQuery {
            os: "windows".to_string(),
            arch: "amd64".to_string(),
            branch: "release".to_string(),
            version: "7".to_string(),
        };
        assert_eq!(
            source.artifact_url(&query),
            "https://cdn.test/windows/amd64/release/0/7.pwr"
        );
    }
}
