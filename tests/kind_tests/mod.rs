//! Integration tests for clustertest
//!
//! - `object_store`: the kube-backed store and the conditions built on it,
//!   exercised against whatever cluster `E2E_KUBECONFIG` points at
//!
//! - `workload_cluster`: the full create / reach / delete story through
//!   [`clustertest::Framework`]

mod helpers;
mod object_store;
mod workload_cluster;
