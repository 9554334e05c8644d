//! Version and catalog resolution for installable units.
//!
//! Resolution order:
//!
//! 1. an explicit concrete version from the caller
//! 2. the override table (`E2E_OVERRIDE_VERSIONS`)
//! 3. the highest stable semver release from the [`ReleaseSource`],
//!    probing the repository name with and without an `-app` suffix
//!
//! Whatever the source, a commit-pinned version (`vX.Y.Z-<sha>`) moves the
//! unit to the `-test` variant of its catalog.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clustertest_common::retry::{retry_with_backoff_if, RetryConfig};
use clustertest_common::{Error, Result};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::{needs_resolution, test_catalog, Application};

const APP_SUFFIX: &str = "-app";
const SHA_LEN: usize = 40;

/// HTTP statuses from the release source worth retrying
const TRANSIENT_RELEASE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Unit name to version overrides, parsed once and shared read-only
#[derive(Debug, Clone, Default)]
pub struct VersionOverrides {
    versions: Arc<HashMap<String, String>>,
}

impl VersionOverrides {
    /// Parse a comma-separated `unit=version` list.
    ///
    /// Keys are trimmed and lowercased; entries without `=` or with an
    /// empty side are ignored.
    pub fn parse(raw: &str) -> Self {
        let versions = raw
            .split(',')
            .filter_map(|pair| {
                let (unit, version) = pair.split_once('=')?;
                let unit = unit.trim().to_lowercase();
                let version = version.trim();
                if unit.is_empty() || version.is_empty() {
                    return None;
                }
                Some((unit, version.to_string()))
            })
            .collect();
        Self {
            versions: Arc::new(versions),
        }
    }

    /// Override for a unit, matched case-insensitively
    pub fn get(&self, unit: &str) -> Option<&str> {
        self.versions
            .get(&unit.trim().to_lowercase())
            .map(String::as_str)
    }

    /// Number of overrides
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True when no overrides are configured
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// A resolved version and the catalog it implies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    /// Concrete version tag
    pub version: String,
    /// Catalog to switch to, set for commit-pinned builds
    pub catalog_override: Option<String>,
}

impl ResolvedVersion {
    /// Derive the catalog override for `version` starting from `base_catalog`
    pub fn new(version: impl Into<String>, base_catalog: &str) -> Self {
        let version = version.into();
        let catalog_override = is_sha_version(&version).then(|| test_catalog(base_catalog));
        Self {
            version,
            catalog_override,
        }
    }

    /// Catalog after applying the override to `base_catalog`
    pub fn catalog<'a>(&'a self, base_catalog: &'a str) -> &'a str {
        self.catalog_override.as_deref().unwrap_or(base_catalog)
    }
}

/// True for `vMAJOR.MINOR.PATCH-<40 word characters>` commit-pinned builds
pub fn is_sha_version(version: &str) -> bool {
    let v = version.strip_prefix('v').unwrap_or(version);
    let Some((core, suffix)) = v.split_once('-') else {
        return false;
    };
    let numeric_core = core.split('.').count() == 3
        && core
            .split('.')
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    numeric_core
        && suffix.len() >= SHA_LEN
        && suffix
            .chars()
            .take(SHA_LEN)
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The highest stable semver tag, ignoring non-semver and pre-release tags
pub fn latest_stable(tags: &[String]) -> Option<&str> {
    tags.iter()
        .filter_map(|tag| {
            let version = semver::Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()?;
            version.pre.is_empty().then_some((version, tag.as_str()))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, tag)| tag)
}

/// Repository names to probe for a unit: the name itself, then the name
/// with the `-app` suffix toggled
pub fn name_variants(name: &str) -> [String; 2] {
    let toggled = match name.strip_suffix(APP_SUFFIX) {
        Some(base) => base.to_string(),
        None => format!("{}{}", name, APP_SUFFIX),
    };
    [name.to_string(), toggled]
}

/// Error from a [`ReleaseSource`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ReleaseError {
    /// HTTP status, when the source answered
    pub status: Option<u16>,
    /// Description
    pub message: String,
}

impl ReleaseError {
    /// An error with an HTTP status
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// An error without an HTTP status
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// True for rate limiting and server-side failures
    pub fn is_transient(&self) -> bool {
        self.status
            .is_some_and(|s| TRANSIENT_RELEASE_STATUSES.contains(&s))
    }
}

/// Source of published releases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Tags of all non-draft, non-prerelease releases of a repository
    async fn list_stable_releases(&self, repo: &str) -> std::result::Result<Vec<String>, ReleaseError>;
}

/// Resolves versions and catalogs for installable units
#[derive(Clone)]
pub struct VersionResolver {
    overrides: VersionOverrides,
    source: Arc<dyn ReleaseSource>,
    retry: RetryConfig,
}

impl VersionResolver {
    /// Create a resolver over an override table and a release source
    pub fn new(overrides: VersionOverrides, source: Arc<dyn ReleaseSource>) -> Self {
        Self {
            overrides,
            source,
            retry: RetryConfig::release_lookup(),
        }
    }

    /// Replace the retry policy for release lookups
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The override table
    pub fn overrides(&self) -> &VersionOverrides {
        &self.overrides
    }

    /// Resolve the version of `unit`.
    ///
    /// `explicit` wins when it is concrete; `""` and `"latest"` fall through
    /// to the override table and then to the release source.
    pub async fn resolve(
        &self,
        unit: &str,
        repo_hint: Option<&str>,
        explicit: &str,
        base_catalog: &str,
    ) -> Result<ResolvedVersion> {
        let version = if !needs_resolution(explicit) {
            debug!(unit = %unit, version = %explicit, "Using explicit version");
            explicit.to_string()
        } else if let Some(version) = self.overrides.get(unit) {
            info!(unit = %unit, version = %version, "Using overridden version");
            version.to_string()
        } else {
            let version = self.latest_release(unit, repo_hint).await?;
            info!(unit = %unit, version = %version, "Resolved latest release");
            version
        };

        Ok(ResolvedVersion::new(version, base_catalog))
    }

    /// Resolve an application in place
    pub async fn resolve_application(&self, app: &mut Application) -> Result<()> {
        let resolved = self
            .resolve(
                &app.app_name,
                app.repo_name.as_deref(),
                &app.version,
                &app.catalog,
            )
            .await?;
        app.apply_resolution(resolved);
        Ok(())
    }

    /// Highest stable release of `unit`, probing both repository name
    /// variants. Transient failures retry the whole probe with backoff; any
    /// other failure moves on to the next variant.
    pub async fn latest_release(&self, unit: &str, repo_hint: Option<&str>) -> Result<String> {
        let variants = name_variants(repo_hint.unwrap_or(unit));
        let operation_name = format!("latest release of {}", unit);

        let outcome = retry_with_backoff_if(
            &self.retry,
            &operation_name,
            |e: &ReleaseError| e.is_transient(),
            || self.probe_variants(&variants),
        )
        .await;

        outcome.map_err(|e| Error::resolution(unit, e.message))
    }

    async fn probe_variants(&self, variants: &[String]) -> std::result::Result<String, ReleaseError> {
        let mut last_err = ReleaseError::other("no release found");
        for repo in variants {
            match self.source.list_stable_releases(repo).await {
                Ok(tags) => match latest_stable(&tags) {
                    Some(tag) => return Ok(tag.to_string()),
                    None => {
                        debug!(repo = %repo, "No stable semver release");
                        last_err = ReleaseError::other(format!("no stable releases found for {}", repo));
                    }
                },
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    debug!(repo = %repo, error = %e, "Release lookup failed, trying next name");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::time::Duration;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn resolver(source: MockReleaseSource, overrides: &str) -> VersionResolver {
        VersionResolver::new(VersionOverrides::parse(overrides), Arc::new(source)).with_retry(
            RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: 0.1,
                max_elapsed: Some(Duration::from_millis(50)),
            },
        )
    }

    #[test]
    fn test_overrides_parse() {
        let overrides = VersionOverrides::parse(" Cluster-AWS = v9.9.9 ,broken,=v1,default-apps-aws=v0.1.0,");
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides.get("cluster-aws"), Some("v9.9.9"));
        assert_eq!(overrides.get("CLUSTER-AWS"), Some("v9.9.9"));
        assert_eq!(overrides.get("default-apps-aws"), Some("v0.1.0"));
        assert!(VersionOverrides::parse("").is_empty());
    }

    #[test]
    fn test_is_sha_version() {
        assert!(is_sha_version(&format!("v1.2.3-{}", SHA)));
        assert!(is_sha_version(&format!("1.2.3-{}", SHA)));
        assert!(!is_sha_version("v1.2.3"));
        assert!(!is_sha_version("v1.2.3-rc1"));
        assert!(!is_sha_version(&format!("v1.2-{}", SHA)));
        assert!(!is_sha_version(&format!("v1.2.3-{}", &SHA[..39])));
    }

    #[test]
    fn test_latest_stable_orders_by_semver() {
        // an older major's patch release published last must not win
        let list = tags(&["v6.4.1", "v6.4.0", "v5.4.0", "not-a-version", "v7.0.0-alpha.1"]);
        assert_eq!(latest_stable(&list), Some("v6.4.1"));
        assert_eq!(latest_stable(&tags(&["v1.0.0-rc1"])), None);
    }

    #[test]
    fn test_name_variants() {
        assert_eq!(name_variants("cluster-aws"), ["cluster-aws".to_string(), "cluster-aws-app".to_string()]);
        assert_eq!(name_variants("hello-world-app"), ["hello-world-app".to_string(), "hello-world".to_string()]);
    }

    #[tokio::test]
    async fn test_override_skips_release_source() {
        let mut source = MockReleaseSource::new();
        source.expect_list_stable_releases().never();
        let resolver = resolver(source, "cluster-aws=v9.9.9");

        let resolved = resolver.resolve("cluster-aws", None, "", "cluster").await.unwrap();
        assert_eq!(resolved.version, "v9.9.9");
        assert_eq!(resolved.catalog("cluster"), "cluster");
    }

    #[tokio::test]
    async fn test_explicit_version_beats_override() {
        let mut source = MockReleaseSource::new();
        source.expect_list_stable_releases().never();
        let resolver = resolver(source, "cluster-aws=v9.9.9");

        let resolved = resolver.resolve("cluster-aws", None, "v1.0.0", "cluster").await.unwrap();
        assert_eq!(resolved.version, "v1.0.0");
    }

    #[tokio::test]
    async fn test_explicit_sha_version_switches_catalog() {
        let mut source = MockReleaseSource::new();
        source.expect_list_stable_releases().never();
        let resolver = resolver(source, "");
        let version = format!("v1.2.3-{}", SHA);

        let resolved = resolver.resolve("cluster-aws", None, &version, "cluster").await.unwrap();
        assert_eq!(resolved.catalog("cluster"), "cluster-test");
    }

    #[tokio::test]
    async fn test_latest_skips_prereleases() {
        let mut source = MockReleaseSource::new();
        source
            .expect_list_stable_releases()
            .with(eq("cluster-aws"))
            .times(1)
            .returning(|_| Ok(tags(&["v2.0.0", "v1.9.9", "v2.1.0-rc1"])));
        let resolver = resolver(source, "");

        let mut app = Application::new("t-1", "cluster-aws");
        resolver.resolve_application(&mut app).await.unwrap();
        assert_eq!(app.version, "v2.0.0");
        assert_eq!(app.catalog, "cluster");
    }

    #[tokio::test]
    async fn test_not_found_falls_through_to_suffix_variant() {
        let mut source = MockReleaseSource::new();
        source
            .expect_list_stable_releases()
            .with(eq("hello-world"))
            .times(1)
            .returning(|_| Err(ReleaseError::status(404, "Not Found")));
        source
            .expect_list_stable_releases()
            .with(eq("hello-world-app"))
            .times(1)
            .returning(|_| Ok(tags(&["v0.3.0"])));
        let resolver = resolver(source, "");

        let version = resolver.latest_release("hello-world", None).await.unwrap();
        assert_eq!(version, "v0.3.0");
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut source = MockReleaseSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_list_stable_releases()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(ReleaseError::status(503, "Service Unavailable")));
        source
            .expect_list_stable_releases()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(tags(&["v1.0.0"])));
        let resolver = resolver(source, "");

        let version = resolver.latest_release("cluster-aws", None).await.unwrap();
        assert_eq!(version, "v1.0.0");
    }

    #[tokio::test]
    async fn test_permanent_failure_names_unit() {
        let mut source = MockReleaseSource::new();
        source
            .expect_list_stable_releases()
            .times(2)
            .returning(|_| Err(ReleaseError::status(404, "Not Found")));
        let resolver = resolver(source, "");

        let err = resolver.latest_release("cluster-nope", None).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { ref unit, .. } if unit == "cluster-nope"));
        assert!(err.to_string().starts_with("unable to get latest release of cluster-nope"));
    }

    #[tokio::test]
    async fn test_repo_hint_is_probed_first() {
        let mut source = MockReleaseSource::new();
        source
            .expect_list_stable_releases()
            .with(eq("cluster-aws-repo"))
            .times(1)
            .returning(|_| Ok(tags(&["v3.0.0"])));
        let resolver = resolver(source, "");

        let resolved = resolver
            .resolve("cluster-aws", Some("cluster-aws-repo"), "latest", "cluster")
            .await
            .unwrap();
        assert_eq!(resolved.version, "v3.0.0");
    }
}
