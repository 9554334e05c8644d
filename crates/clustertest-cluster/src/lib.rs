//! Cluster lifecycle for clustertest.
//!
//! Conditions to poll on, workload cluster credentials, and the
//! orchestrator that creates and tears down clusters on a management
//! cluster.

#![deny(missing_docs)]

pub mod apply;
pub mod conditions;
pub mod credentials;
pub mod framework;
pub mod lifecycle;
pub mod registry;

#[cfg(test)]
mod testing;

pub use credentials::{
    ClusterConnector, KubeConnector, ScopedIdentityProvisioner, ServiceAccountProvisioner,
    WorkloadClient,
};
pub use framework::Framework;
pub use lifecycle::{
    ClusterLifecycleRecord, CreatePhase, DeleteOutcome, DeletePhase, LifecycleConfig,
    LifecycleOrchestrator,
};
pub use registry::ClusterRegistry;
