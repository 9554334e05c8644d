//! Common building blocks for clustertest: errors, the object store seam,
//! the polling engine and retry helpers.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod wait;
pub mod yaml;

pub use error::Error;
pub use store::{ErrorKind, ObjectRef, ObjectStore, Selector, StoreError};
pub use wait::{poll, PollOptions, WaitCondition};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation marking an object as created by this test run and safe to delete
pub const DELETE_ANNOTATION: &str = "e2e-test-cleanup";

/// Label key linking an object to the workload cluster it belongs to
pub const CLUSTER_LABEL: &str = "giantswarm.io/cluster";

/// Label key naming the organization that owns a cluster
pub const ORGANIZATION_LABEL: &str = "giantswarm.io/organization";

/// Label key naming the component that manages an object
pub const MANAGED_BY_LABEL: &str = "giantswarm.io/managed-by";

/// Label key pinning the app-operator instance that reconciles an App
pub const APP_OPERATOR_VERSION_LABEL: &str = "app-operator.giantswarm.io/version";

/// App-operator version that routes an App to the management cluster's
/// unique app-operator instance
pub const UNIQUE_APP_OPERATOR_VERSION: &str = "0.0.0";

/// Namespace that holds installable units not scoped to an organization
pub const DEFAULT_APP_NAMESPACE: &str = "org-giantswarm";

/// Prefix prepended to an organization name to form its namespace
pub const ORG_NAMESPACE_PREFIX: &str = "org-";
