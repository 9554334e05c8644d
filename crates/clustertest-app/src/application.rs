//! Installable units.
//!
//! An [`Application`] describes one versioned, cataloged package and its
//! values. The version may start out as `""` or `"latest"`; it must be
//! resolved with [`crate::version::VersionResolver`] before rendering.

use std::collections::BTreeMap;
use std::path::Path;

use clustertest_common::{Error, Result, DEFAULT_APP_NAMESPACE};
use serde::Serialize;

use crate::organization::Organization;
use crate::version::{is_sha_version, ResolvedVersion};

/// Catalog used when none is given
pub const DEFAULT_CATALOG: &str = "cluster";

/// Version sentinel asking for the latest stable release
pub const LATEST_VERSION: &str = "latest";

const TEST_CATALOG_SUFFIX: &str = "-test";

/// Catalog holding commit-pinned builds of units from `catalog`
pub fn test_catalog(catalog: &str) -> String {
    if catalog.ends_with(TEST_CATALOG_SUFFIX) {
        catalog.to_string()
    } else {
        format!("{}{}", catalog, TEST_CATALOG_SUFFIX)
    }
}

/// Additional config sources merged into a unit's values
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraConfig {
    /// `configMap` or `secret`
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Merge priority; higher wins
    pub priority: i32,
}

/// Variables available to values templates
#[derive(Debug, Clone, Serialize)]
pub struct TemplateValues {
    /// Workload cluster name
    pub cluster_name: String,
    /// Namespace the cluster resources live in
    pub namespace: String,
    /// Organization name
    pub organization: String,
    /// Free-form extra variables
    pub extra_values: BTreeMap<String, String>,
}

impl Default for TemplateValues {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            namespace: DEFAULT_APP_NAMESPACE.to_string(),
            organization: "giantswarm".to_string(),
            extra_values: BTreeMap::new(),
        }
    }
}

/// Render a values template.
///
/// Without template values the input is returned unchanged.
pub fn render_values(template: &str, values: Option<&TemplateValues>) -> Result<String> {
    let Some(values) = values else {
        return Ok(template.to_string());
    };
    let mut env = minijinja::Environment::new();
    env.set_keep_trailing_newline(true);
    env.render_str(template, values)
        .map_err(|e| Error::validation_field("values", format!("failed to render values: {}", e)))
}

/// One installable unit
#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    /// Name of this installation, also the App object name
    pub install_name: String,
    /// Name of the package in its catalog
    pub app_name: String,
    /// Source repository name, when it differs from `app_name`
    pub repo_name: Option<String>,
    /// Version; `""` or `"latest"` until resolved
    pub version: String,
    /// Catalog to install from
    pub catalog: String,
    catalog_pinned: bool,
    /// Rendered values YAML
    pub values: String,
    /// Namespace the App object lives in
    pub namespace: String,
    /// Install into the cluster running the app operator
    pub in_cluster: bool,
    /// Kubeconfig context of the target cluster when not in-cluster
    pub cluster_context: Option<String>,
    /// Owning organization
    pub organization: Option<Organization>,
    /// Labels on the App object
    pub app_labels: BTreeMap<String, String>,
    /// Labels on the values ConfigMap
    pub config_map_labels: BTreeMap<String, String>,
    /// Secret holding additional user config
    pub user_config_secret: Option<String>,
    /// ConfigMap in the unit's namespace used as the App's base config
    pub config_map: Option<String>,
    /// Additional config sources
    pub extra_configs: Vec<ExtraConfig>,
}

impl Application {
    /// A unit installing `app_name` as `install_name` with default settings
    pub fn new(install_name: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            install_name: install_name.into(),
            app_name: app_name.into(),
            repo_name: None,
            version: String::new(),
            catalog: DEFAULT_CATALOG.to_string(),
            catalog_pinned: false,
            values: "\n".to_string(),
            namespace: DEFAULT_APP_NAMESPACE.to_string(),
            in_cluster: true,
            cluster_context: None,
            organization: None,
            app_labels: BTreeMap::new(),
            config_map_labels: BTreeMap::new(),
            user_config_secret: None,
            config_map: None,
            extra_configs: Vec::new(),
        }
    }

    /// Set the version; `""` and `"latest"` defer to the resolver
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self.apply_sha_catalog();
        self
    }

    /// Set the catalog. An explicit catalog is never replaced by derivation.
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = catalog.into();
        self.catalog_pinned = true;
        self
    }

    /// Set the source repository name used for release lookups
    pub fn with_repo_name(mut self, repo: impl Into<String>) -> Self {
        self.repo_name = Some(repo.into());
        self
    }

    /// Set values from a template
    pub fn with_values(mut self, values: &str, template: Option<&TemplateValues>) -> Result<Self> {
        self.values = render_values(values, template)?;
        Ok(self)
    }

    /// Set values from a template file
    pub fn with_values_file(self, path: &Path, template: Option<&TemplateValues>) -> Result<Self> {
        let values = std::fs::read_to_string(path).map_err(|e| {
            Error::validation_field(
                "values",
                format!("failed to read values file {}: {}", path.display(), e),
            )
        })?;
        self.with_values(&values, template)
    }

    /// Set the namespace of the App object
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Place the unit in an organization's namespace
    pub fn with_organization(mut self, organization: Organization) -> Self {
        self.namespace = organization.namespace();
        self.organization = Some(organization);
        self
    }

    /// Install into the app operator's own cluster or a remote one
    pub fn with_in_cluster(mut self, in_cluster: bool) -> Self {
        self.in_cluster = in_cluster;
        self
    }

    /// Name the kubeconfig context of the remote target cluster
    pub fn with_cluster_context(mut self, context: impl Into<String>) -> Self {
        self.cluster_context = Some(context.into());
        self
    }

    /// Add labels to the App object
    pub fn with_app_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.app_labels.extend(labels);
        self
    }

    /// Add labels to the values ConfigMap
    pub fn with_config_map_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.config_map_labels.extend(labels);
        self
    }

    /// Reference a Secret with additional user config
    pub fn with_user_config_secret(mut self, name: impl Into<String>) -> Self {
        self.user_config_secret = Some(name.into());
        self
    }

    /// Use a ConfigMap in the unit's namespace as the App's base config
    pub fn with_config_map(mut self, name: impl Into<String>) -> Self {
        self.config_map = Some(name.into());
        self
    }

    /// Add extra config sources
    pub fn with_extra_configs(mut self, configs: Vec<ExtraConfig>) -> Self {
        self.extra_configs.extend(configs);
        self
    }

    /// Name of the values ConfigMap
    pub fn values_config_map_name(&self) -> String {
        format!("{}-userconfig", self.install_name)
    }

    /// True once the version is a concrete tag
    pub fn is_resolved(&self) -> bool {
        !needs_resolution(&self.version)
    }

    /// Whether the catalog was set explicitly
    pub fn catalog_pinned(&self) -> bool {
        self.catalog_pinned
    }

    /// Record a resolved version, switching to the test catalog for
    /// commit-pinned builds unless the catalog was set explicitly
    pub fn apply_resolution(&mut self, resolved: ResolvedVersion) {
        self.version = resolved.version;
        if let (false, Some(catalog)) = (self.catalog_pinned, resolved.catalog_override) {
            self.catalog = catalog;
        }
    }

    fn apply_sha_catalog(&mut self) {
        if !self.catalog_pinned && is_sha_version(&self.version) {
            self.catalog = test_catalog(&self.catalog);
        }
    }

    /// Check invariants that must hold before rendering
    pub fn validate(&self) -> Result<()> {
        if self.install_name.is_empty() {
            return Err(Error::validation_field("install_name", "must not be empty"));
        }
        if !self.in_cluster && self.cluster_context.as_deref().unwrap_or("").is_empty() {
            return Err(Error::validation_field(
                "cluster_context",
                format!(
                    "{} installs outside the management cluster but names no cluster context",
                    self.install_name
                ),
            ));
        }
        Ok(())
    }
}

/// True for the version sentinels that the resolver must replace
pub fn needs_resolution(version: &str) -> bool {
    version.is_empty() || version == LATEST_VERSION
}
