//! End-to-end tests against real clusters
//!
//! These tests need a reachable Kubernetes API. They are ignored by default
//! and can be run with:
//!
//! ```bash
//! E2E_KUBECONFIG=~/.kube/config cargo test --test kind -- --ignored
//! ```
//!
//! `object_store` only needs any cluster (kind is enough). `workload_cluster`
//! provisions a real workload cluster from a management cluster and takes
//! tens of minutes.

mod kind_tests;
