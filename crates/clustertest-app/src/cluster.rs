//! Workload cluster definitions: a cluster unit, an optional default-apps
//! unit, the owning organization and an optional release.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clustertest_common::yaml::merge_yaml_documents;
use clustertest_common::{
    Error, Result, APP_OPERATOR_VERSION_LABEL, CLUSTER_LABEL, DELETE_ANNOTATION, MANAGED_BY_LABEL,
    UNIQUE_APP_OPERATOR_VERSION,
};
use kube::api::DynamicObject;
use tracing::info;

use crate::application::{Application, ExtraConfig, TemplateValues};
use crate::organization::Organization;
use crate::version::VersionResolver;

/// Infrastructure providers with a cluster unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// AWS (CAPA)
    Aws,
    /// AWS EKS
    Eks,
    /// Google Cloud
    Gcp,
    /// Azure (CAPZ)
    Azure,
    /// VMware Cloud Director
    CloudDirector,
    /// OpenStack
    OpenStack,
    /// vSphere
    VSphere,
}

impl Provider {
    /// All providers
    pub const ALL: [Provider; 7] = [
        Provider::Aws,
        Provider::Eks,
        Provider::Gcp,
        Provider::Azure,
        Provider::CloudDirector,
        Provider::OpenStack,
        Provider::VSphere,
    ];

    /// Provider name as used in unit names
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Eks => "eks",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::CloudDirector => "cloud-director",
            Provider::OpenStack => "openstack",
            Provider::VSphere => "vsphere",
        }
    }

    /// Name of the cluster unit, e.g. `cluster-aws`
    pub fn cluster_app_name(&self) -> String {
        format!("cluster-{}", self.as_str())
    }

    /// Name of the default-apps unit, e.g. `default-apps-aws`
    pub fn default_apps_app_name(&self) -> String {
        format!("default-apps-{}", self.as_str())
    }

    /// Provider of a cluster unit name
    pub fn from_cluster_app(app_name: &str) -> Option<Self> {
        let name = app_name.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.cluster_app_name() == name)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| Error::validation_field("provider", format!("unknown provider {:?}", s)))
    }
}

/// Whether a cluster needs a companion default-apps unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultAppsPolicy {
    /// Always deploy the default-apps unit
    Always,
    /// Never deploy the default-apps unit
    Never,
    /// Cluster units at or above the threshold bundle their default apps;
    /// units without a threshold always need the companion unit
    VersionThreshold(BTreeMap<String, semver::Version>),
}

impl Default for DefaultAppsPolicy {
    fn default() -> Self {
        Self::VersionThreshold(BTreeMap::from([
            ("cluster-aws".to_string(), semver::Version::new(0, 76, 0)),
            ("cluster-azure".to_string(), semver::Version::new(0, 14, 0)),
            ("cluster-vsphere".to_string(), semver::Version::new(0, 61, 0)),
        ]))
    }
}

impl DefaultAppsPolicy {
    /// Decide for a resolved cluster unit
    pub fn needs_default_apps(&self, cluster_app: &Application) -> Result<bool> {
        match self {
            DefaultAppsPolicy::Always => Ok(true),
            DefaultAppsPolicy::Never => Ok(false),
            DefaultAppsPolicy::VersionThreshold(thresholds) => {
                let Some(threshold) = thresholds.get(&cluster_app.app_name) else {
                    return Ok(true);
                };
                let version = release_core(&cluster_app.version).ok_or_else(|| {
                    Error::validation_field(
                        "version",
                        format!(
                            "cannot compare {} version {:?} with {}",
                            cluster_app.app_name, cluster_app.version, threshold
                        ),
                    )
                })?;
                Ok(version < *threshold)
            }
        }
    }
}

/// MAJOR.MINOR.PATCH of a version tag, ignoring `v` and any suffix
fn release_core(version: &str) -> Option<semver::Version> {
    let v = version.strip_prefix('v').unwrap_or(version);
    let core = v.split(|c| c == '-' || c == '+').next()?;
    semver::Version::parse(core).ok()
}

/// A pre-rendered Release object the cluster is pinned to
#[derive(Debug, Clone)]
pub struct ReleaseRef {
    /// The Release object
    pub object: DynamicObject,
    /// Release version, merged into the cluster values
    pub version: String,
}

impl ReleaseRef {
    /// Wrap a Release object
    pub fn new(object: DynamicObject, version: impl Into<String>) -> Self {
        Self {
            object,
            version: version.into(),
        }
    }
}

/// Everything needed to create one workload cluster
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    /// Cluster name
    pub name: String,
    /// Infrastructure provider
    pub provider: Provider,
    /// The cluster unit
    pub cluster_app: Application,
    /// The companion default-apps unit
    pub default_apps_app: Application,
    /// Owning organization
    pub organization: Organization,
    /// Release the cluster is pinned to
    pub release: Option<ReleaseRef>,
    /// Default-apps decision
    pub default_apps_policy: DefaultAppsPolicy,
}

impl ClusterSpec {
    /// A cluster in a new random organization with unresolved units
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        let name = name.into();
        let organization = Organization::random();
        let cluster_app = Application::new(&name, provider.cluster_app_name())
            .with_organization(organization.clone());
        let default_apps_app = Application::new(
            format!("{}-default-apps", name),
            provider.default_apps_app_name(),
        )
        .with_organization(organization.clone());

        Self {
            name,
            provider,
            cluster_app,
            default_apps_app,
            organization,
            release: None,
            default_apps_policy: DefaultAppsPolicy::default(),
        }
    }

    /// Move the cluster into another organization
    pub fn with_org(mut self, organization: Organization) -> Self {
        self.cluster_app = self.cluster_app.with_organization(organization.clone());
        self.default_apps_app = self.default_apps_app.with_organization(organization.clone());
        self.organization = organization;
        self
    }

    /// Set unit versions; `""` and `"latest"` defer to the resolver
    pub fn with_app_versions(mut self, cluster: &str, default_apps: &str) -> Self {
        self.cluster_app = self.cluster_app.with_version(cluster);
        self.default_apps_app = self.default_apps_app.with_version(default_apps);
        self
    }

    /// Set unit values from templates.
    ///
    /// The cluster name, namespace and organization of `template` are
    /// overwritten with this cluster's.
    pub fn with_app_values(
        mut self,
        cluster_values: &str,
        default_apps_values: &str,
        template: TemplateValues,
    ) -> Result<Self> {
        let template = self.template_values(template);
        self.cluster_app = self.cluster_app.with_values(cluster_values, Some(&template))?;
        self.default_apps_app = self
            .default_apps_app
            .with_values(default_apps_values, Some(&template))?;
        Ok(self)
    }

    /// Reference a Secret with additional cluster unit config
    pub fn with_user_config_secret(mut self, name: impl Into<String>) -> Self {
        self.cluster_app = self.cluster_app.with_user_config_secret(name);
        self
    }

    /// Add extra config sources to the cluster unit
    pub fn with_extra_configs(mut self, configs: Vec<ExtraConfig>) -> Self {
        self.cluster_app = self.cluster_app.with_extra_configs(configs);
        self
    }

    /// Pin the cluster to a release
    pub fn with_release(mut self, release: ReleaseRef) -> Self {
        self.release = Some(release);
        self
    }

    /// Replace the default-apps decision
    pub fn with_default_apps_policy(mut self, policy: DefaultAppsPolicy) -> Self {
        self.default_apps_policy = policy;
        self
    }

    /// Namespace holding the cluster resources
    pub fn namespace(&self) -> String {
        self.organization.namespace()
    }

    fn template_values(&self, mut template: TemplateValues) -> TemplateValues {
        template.cluster_name = self.name.clone();
        template.namespace = self.namespace();
        template.organization = self.organization.name().to_string();
        template
    }

    /// Resolve the cluster unit, decide on default-apps and label everything.
    pub async fn build(
        self,
        resolver: &VersionResolver,
        base_labels: &BTreeMap<String, String>,
    ) -> Result<BuiltCluster> {
        let cluster_label = BTreeMap::from([(CLUSTER_LABEL.to_string(), self.name.clone())]);
        let operator_label = BTreeMap::from([(
            APP_OPERATOR_VERSION_LABEL.to_string(),
            UNIQUE_APP_OPERATOR_VERSION.to_string(),
        )]);

        let mut cluster_app = self
            .cluster_app
            .with_app_labels(merge_labels(base_labels, &operator_label))
            .with_config_map_labels(merge_labels(base_labels, &cluster_label));
        resolver.resolve_application(&mut cluster_app).await?;

        let mut release = None;
        if let Some(release_ref) = self.release {
            let release_values = format!(
                "global:\n  release:\n    version: \"{}\"\n",
                release_ref.version
            );
            cluster_app.values =
                merge_yaml_documents([cluster_app.values.as_str(), release_values.as_str()])
                    .map_err(|e| Error::serialization(format!("merging release values: {}", e)))?;
            release = Some(label_release(release_ref.object, &self.name, base_labels));
        }

        let mut units = vec![cluster_app];

        if self.default_apps_policy.needs_default_apps(&units[0])? {
            info!(cluster = %self.name, "Cluster unit still requires a default-apps unit");
            let mut app_labels = merge_labels(base_labels, &operator_label);
            app_labels.extend(cluster_label.clone());
            app_labels.insert(MANAGED_BY_LABEL.to_string(), "cluster".to_string());
            let default_apps = self
                .default_apps_app
                .with_app_labels(app_labels)
                .with_config_map_labels(merge_labels(base_labels, &cluster_label))
                .with_config_map(format!("{}-cluster-values", self.name));
            units.push(default_apps);
        }

        Ok(BuiltCluster {
            name: self.name,
            provider: self.provider,
            organization: self.organization,
            units,
            release,
        })
    }
}

fn merge_labels(
    base: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = base.clone();
    labels.extend(extra.clone());
    labels
}

fn label_release(
    mut object: DynamicObject,
    cluster: &str,
    base_labels: &BTreeMap<String, String>,
) -> DynamicObject {
    let labels = object.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(base_labels.clone());
    labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
    object
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DELETE_ANNOTATION.to_string(), "true".to_string());
    object
}

/// A cluster ready for the orchestrator
#[derive(Debug, Clone)]
pub struct BuiltCluster {
    /// Cluster name
    pub name: String,
    /// Infrastructure provider
    pub provider: Provider,
    /// Owning organization
    pub organization: Organization,
    /// Units in deployment order; the cluster unit comes first
    pub units: Vec<Application>,
    /// Labeled Release object, applied before the units
    pub release: Option<DynamicObject>,
}

impl BuiltCluster {
    /// Namespace holding the cluster resources
    pub fn namespace(&self) -> String {
        self.organization.namespace()
    }
}
