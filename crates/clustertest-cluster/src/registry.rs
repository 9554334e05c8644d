//! Cluster name to live client mapping.

use std::sync::Arc;

use clustertest_common::ObjectStore;
use dashmap::DashMap;
use tracing::debug;

use crate::credentials::WorkloadClient;

/// Live clients of reachable workload clusters, keyed by cluster name.
///
/// Shared between the orchestrator, which inserts and removes entries, and
/// tests, which look clients up by name.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clients: DashMap<String, WorkloadClient>,
}

impl ClusterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, replacing any previous one for the same cluster
    pub fn insert(&self, client: WorkloadClient) {
        debug!(cluster = %client.cluster, "Registering workload cluster client");
        self.clients.insert(client.cluster.clone(), client);
    }

    /// Client of `cluster`
    pub fn get(&self, cluster: &str) -> Option<WorkloadClient> {
        self.clients.get(cluster).map(|entry| entry.value().clone())
    }

    /// Store of `cluster`
    pub fn store(&self, cluster: &str) -> Option<Arc<dyn ObjectStore>> {
        self.clients.get(cluster).map(|entry| entry.store.clone())
    }

    /// Forget `cluster`, returning its client
    pub fn remove(&self, cluster: &str) -> Option<WorkloadClient> {
        self.clients.remove(cluster).map(|(_, client)| client)
    }

    /// Registered cluster names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered clusters
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no cluster is registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn client(name: &str) -> WorkloadClient {
        WorkloadClient {
            cluster: name.to_string(),
            kubeconfig: String::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = ClusterRegistry::new();
        assert!(registry.is_empty());

        registry.insert(client("b"));
        registry.insert(client("a"));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.store("a").is_some());

        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.cluster, "a");
        assert!(registry.get("a").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reinsert_replaces() {
        let registry = ClusterRegistry::new();
        registry.insert(client("a"));
        let mut replacement = client("a");
        replacement.kubeconfig = "scoped".to_string();
        registry.insert(replacement);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().kubeconfig, "scoped");
    }
}
