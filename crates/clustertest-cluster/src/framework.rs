//! Entry point for e2e test suites.

use std::sync::Arc;

use clustertest_app::github::DEFAULT_OWNER;
use clustertest_app::{
    ClusterSpec, GitHubReleaseSource, ReleaseSource, VersionOverrides, VersionResolver,
};
use clustertest_common::config::{HarnessConfig, PollDefaults, ENV_KUBECONFIG};
use clustertest_common::kube_utils::{client_from_path, KubeObjectStore};
use clustertest_common::{Error, ObjectStore, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::credentials::{ClusterConnector, KubeConnector};
use crate::lifecycle::{
    ClusterLifecycleRecord, DeleteOutcome, LifecycleConfig, LifecycleOrchestrator,
    NAMESPACE_POLL_INTERVAL,
};

/// Management cluster access plus every workload cluster created or loaded
/// through it
pub struct Framework {
    mc: Arc<dyn ObjectStore>,
    orchestrator: LifecycleOrchestrator,
    config: HarnessConfig,
    records: DashMap<String, ClusterLifecycleRecord>,
}

impl Framework {
    /// Build a framework over an existing management cluster store
    pub fn new(
        mc: Arc<dyn ObjectStore>,
        connector: Arc<dyn ClusterConnector>,
        releases: Arc<dyn ReleaseSource>,
        config: HarnessConfig,
    ) -> Self {
        let resolver = VersionResolver::new(VersionOverrides::parse(&config.version_overrides), releases);
        let lifecycle = LifecycleConfig {
            base_labels: config.base_labels.clone(),
            keep_workload_cluster: config.keep_workload_cluster,
            scoped_credentials: config.scoped_credentials,
            namespace_wait: PollDefaults {
                timeout: config.poll.timeout,
                interval: NAMESPACE_POLL_INTERVAL,
            },
            reachability: config.poll,
            deletion: config.poll,
            ..LifecycleConfig::default()
        };
        Self {
            orchestrator: LifecycleOrchestrator::new(mc.clone(), resolver, connector, lifecycle),
            mc,
            config,
            records: DashMap::new(),
        }
    }

    /// Build a framework from the process environment.
    ///
    /// Requires `E2E_KUBECONFIG`; releases are looked up on GitHub.
    pub async fn from_env() -> Result<Self> {
        let config = HarnessConfig::from_env()?;
        let path = config.kubeconfig.clone().ok_or_else(|| {
            Error::validation_field("kubeconfig", format!("{} must be set", ENV_KUBECONFIG))
        })?;
        let client = client_from_path(&path, config.kube_context.as_deref()).await?;
        let releases = GitHubReleaseSource::new(DEFAULT_OWNER, config.github_token.clone())
            .map_err(|e| Error::internal_with_context("from_env", e.to_string()))?;
        info!(kubeconfig = %path.display(), "Connected to management cluster");

        Ok(Self::new(
            Arc::new(KubeObjectStore::new(client)),
            Arc::new(KubeConnector),
            Arc::new(releases),
            config,
        ))
    }

    /// Management cluster store
    pub fn mc(&self) -> Arc<dyn ObjectStore> {
        self.mc.clone()
    }

    /// Store of a registered workload cluster
    pub fn wc(&self, cluster: &str) -> Result<Arc<dyn ObjectStore>> {
        self.orchestrator.registry().store(cluster).ok_or_else(|| {
            Error::validation_field("cluster", format!("no client registered for cluster {}", cluster))
        })
    }

    /// Harness configuration
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The lifecycle orchestrator
    pub fn orchestrator(&self) -> &LifecycleOrchestrator {
        &self.orchestrator
    }

    /// Record of a cluster created or loaded by this framework
    pub fn record(&self, cluster: &str) -> Option<ClusterLifecycleRecord> {
        self.records.get(cluster).map(|r| r.value().clone())
    }

    /// Resolve, apply and wait for a cluster
    pub async fn apply_cluster(
        &self,
        spec: ClusterSpec,
        cancel: CancellationToken,
    ) -> Result<ClusterLifecycleRecord> {
        let built = spec
            .build(self.orchestrator.resolver(), &self.config.base_labels)
            .await
            .map_err(|e| Error::step("build cluster", e))?;
        let record = self.orchestrator.create(built, cancel).await?;
        self.records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Tear a cluster down
    pub async fn delete_cluster(
        &self,
        record: &ClusterLifecycleRecord,
        cancel: CancellationToken,
    ) -> Result<DeleteOutcome> {
        let outcome = self.orchestrator.delete(record, cancel).await?;
        if let DeleteOutcome::Deleted { .. } = outcome {
            self.records.remove(&record.name);
        }
        Ok(outcome)
    }

    /// Attach to the cluster named by `E2E_WC_NAME` / `E2E_WC_NAMESPACE`.
    ///
    /// Returns `None` when no existing cluster is configured.
    pub async fn load_cluster(&self, cancel: CancellationToken) -> Result<Option<ClusterLifecycleRecord>> {
        let Some(existing) = &self.config.existing_cluster else {
            return Ok(None);
        };
        let record = self.orchestrator.attach(existing, cancel).await?;
        self.records.insert(record.name.clone(), record.clone());
        Ok(Some(record))
    }
}
