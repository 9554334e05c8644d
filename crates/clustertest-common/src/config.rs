//! Harness configuration read from the environment.
//!
//! The environment is read once, here. Everything below the framework gets
//! plain structs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::wait::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::{Error, Result};

/// Path to the management cluster kubeconfig
pub const ENV_KUBECONFIG: &str = "E2E_KUBECONFIG";
/// Context to use within the management cluster kubeconfig
pub const ENV_KUBECONTEXT: &str = "E2E_KUBECONTEXT";
/// Name of an existing workload cluster to attach to
pub const ENV_WC_NAME: &str = "E2E_WC_NAME";
/// Namespace of an existing workload cluster to attach to
pub const ENV_WC_NAMESPACE: &str = "E2E_WC_NAMESPACE";
/// Skip workload cluster teardown when set
pub const ENV_WC_KEEP: &str = "E2E_WC_KEEP";
/// Comma-separated `unit=version` overrides
pub const ENV_OVERRIDE_VERSIONS: &str = "E2E_OVERRIDE_VERSIONS";
/// Release version under test
pub const ENV_RELEASE_VERSION: &str = "E2E_RELEASE_VERSION";
/// Commit of the release under test
pub const ENV_RELEASE_COMMIT: &str = "E2E_RELEASE_COMMIT";
/// Release to create before upgrading to the release under test
pub const ENV_RELEASE_PRE_UPGRADE: &str = "E2E_RELEASE_PRE_UPGRADE";
/// Bootstrap credential is already scoped (bastion identity)
pub const ENV_USE_TELEPORT_KUBECONFIG: &str = "E2E_USE_TELEPORT_KUBECONFIG";
/// Poll timeout override, humantime format
pub const ENV_POLL_TIMEOUT: &str = "E2E_POLL_TIMEOUT";
/// Poll interval override, humantime format
pub const ENV_POLL_INTERVAL: &str = "E2E_POLL_INTERVAL";
/// GitHub token for release lookups
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
/// File containing a GitHub token for release lookups
pub const ENV_GITHUB_TOKEN_FILE: &str = "GITHUB_TOKEN_FILE";

/// CI environment variables copied onto created objects as labels
const BASE_LABEL_SOURCES: &[(&str, &str)] = &[
    ("TEKTON_PIPELINE_RUN", "cicd.giantswarm.io/pipelinerun"),
    ("TEKTON_TASK_RUN", "cicd.giantswarm.io/taskrun"),
    ("CICD_PR_NUMBER", "cicd.giantswarm.io/pr"),
    ("CICD_TRIGGER_USER", "cicd.giantswarm.io/triggered-by"),
    ("CICD_REPO", "cicd.giantswarm.io/repo"),
];

/// An existing workload cluster to attach to instead of creating one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingCluster {
    /// Cluster name
    pub name: String,
    /// Namespace holding the cluster resources, `org-<organization>`
    pub namespace: String,
}

/// Release selection for the run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseSelection {
    /// Release version under test
    pub version: Option<String>,
    /// Commit of the release under test
    pub commit: Option<String>,
    /// Release to start from in upgrade tests
    pub pre_upgrade: Option<String>,
}

/// Default timeout and interval for polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDefaults {
    /// Overall timeout
    pub timeout: Duration,
    /// Delay between attempts
    pub interval: Duration,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Everything the harness takes from its environment
#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    /// Management cluster kubeconfig
    pub kubeconfig: Option<PathBuf>,
    /// Context within the kubeconfig
    pub kube_context: Option<String>,
    /// Attach to this cluster instead of creating one
    pub existing_cluster: Option<ExistingCluster>,
    /// Skip teardown of workload clusters
    pub keep_workload_cluster: bool,
    /// Raw `unit=version` override list
    pub version_overrides: String,
    /// Release selection
    pub release: ReleaseSelection,
    /// The bootstrap credential is already scoped; skip credential exchange
    pub scoped_credentials: bool,
    /// Token for release lookups
    pub github_token: Option<String>,
    /// Poll defaults
    pub poll: PollDefaults,
    /// Labels added to every created object
    pub base_labels: BTreeMap<String, String>,
}

impl HarnessConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through a lookup function
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let existing_cluster = match (get(ENV_WC_NAME), get(ENV_WC_NAMESPACE)) {
            (Some(name), Some(namespace)) => Some(ExistingCluster { name, namespace }),
            (None, None) => None,
            _ => {
                return Err(Error::validation_field(
                    ENV_WC_NAME,
                    format!("{} and {} must be set together", ENV_WC_NAME, ENV_WC_NAMESPACE),
                ))
            }
        };

        let github_token = match get(ENV_GITHUB_TOKEN) {
            Some(token) => Some(token),
            None => match get(ENV_GITHUB_TOKEN_FILE) {
                Some(path) => Some(read_token_file(&path)?),
                None => None,
            },
        };

        let mut poll = PollDefaults::default();
        if let Some(raw) = get(ENV_POLL_TIMEOUT) {
            poll.timeout = parse_duration(ENV_POLL_TIMEOUT, &raw)?;
        }
        if let Some(raw) = get(ENV_POLL_INTERVAL) {
            poll.interval = parse_duration(ENV_POLL_INTERVAL, &raw)?;
        }

        let base_labels = BASE_LABEL_SOURCES
            .iter()
            .filter_map(|(env, label)| get(*env).map(|v| (label.to_string(), v)))
            .collect();

        Ok(Self {
            kubeconfig: get(ENV_KUBECONFIG).map(PathBuf::from),
            kube_context: get(ENV_KUBECONTEXT),
            existing_cluster,
            keep_workload_cluster: get(ENV_WC_KEEP).is_some(),
            version_overrides: get(ENV_OVERRIDE_VERSIONS).unwrap_or_default(),
            release: ReleaseSelection {
                version: get(ENV_RELEASE_VERSION),
                commit: get(ENV_RELEASE_COMMIT),
                pre_upgrade: get(ENV_RELEASE_PRE_UPGRADE),
            },
            scoped_credentials: get(ENV_USE_TELEPORT_KUBECONFIG).is_some(),
            github_token,
            poll,
            base_labels,
        })
    }
}

fn read_token_file(path: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            Error::validation_field(
                ENV_GITHUB_TOKEN_FILE,
                format!("failed to read {}: {}", path, e),
            )
        })
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::validation_field(key, format!("invalid duration {:?}: {}", raw, e)))
}
