//! Shared setup for the real-cluster tests

use std::path::PathBuf;
use std::sync::Arc;

use clustertest::common::config::ENV_KUBECONFIG;
use clustertest::common::kube_utils::{client_from_path, KubeObjectStore};
use clustertest::common::telemetry::{init_logging, LoggingConfig, TelemetryError};
use clustertest::common::ObjectStore;

/// Install a subscriber once; later calls are no-ops
pub fn init_test_logging() {
    match init_logging(&LoggingConfig::default()) {
        Ok(()) | Err(TelemetryError::SubscriberInit(_)) => {}
        Err(e) => panic!("failed to configure test logging: {e}"),
    }
}

/// Store for the cluster named by `E2E_KUBECONFIG`
pub async fn store_from_env() -> Arc<dyn ObjectStore> {
    init_test_logging();
    let path = std::env::var(ENV_KUBECONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|_| panic!("{} must point at a kubeconfig", ENV_KUBECONFIG));
    let client = client_from_path(&path, None)
        .await
        .expect("failed to build client");
    Arc::new(KubeObjectStore::new(client))
}

/// Unique lowercase name for objects created by one test
pub fn unique_name(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .subsec_nanos();
    format!("{}-{}", prefix, nanos)
}
