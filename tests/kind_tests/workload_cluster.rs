//! The full workload cluster story
//!
//! Needs a management cluster able to provision clusters for the provider
//! in `E2E_PROVIDER` (default `aws`). Honors every `E2E_*` variable the
//! framework reads, including `E2E_WC_KEEP` to leave the cluster behind.

use std::str::FromStr;

use clustertest::app::{ClusterSpec, Provider};
use clustertest::cluster::conditions::{app_ref, nodes_ready_at_least, node_selector};
use clustertest::cluster::DeleteOutcome;
use clustertest::common::{poll, ObjectStore, PollOptions};
use clustertest::Framework;
use tokio_util::sync::CancellationToken;

use super::helpers::{init_test_logging, unique_name};

#[tokio::test]
#[ignore]
async fn story_create_reach_and_delete_workload_cluster() {
    init_test_logging();
    let framework = Framework::from_env().await.expect("framework from environment");
    let cancel = CancellationToken::new();

    let record = match framework.load_cluster(cancel.clone()).await.unwrap() {
        Some(record) => record,
        None => {
            let provider = std::env::var("E2E_PROVIDER").unwrap_or_else(|_| "aws".to_string());
            let provider = Provider::from_str(&provider).expect("known provider");
            let spec = ClusterSpec::new(unique_name("t"), provider);
            framework.apply_cluster(spec, cancel.clone()).await.unwrap()
        }
    };

    let wc = framework.wc(&record.name).unwrap();
    poll(
        &nodes_ready_at_least(wc, node_selector(), 1),
        &PollOptions::default().with_cancellation(cancel.clone()),
    )
    .await
    .unwrap();

    let cluster_app = framework
        .mc()
        .get(&app_ref(&record.name, &record.namespace()))
        .await
        .unwrap();
    assert!(cluster_app.metadata.labels.is_some());

    if !record.organization.deletion_safe() {
        return;
    }
    let outcome = framework.delete_cluster(&record, cancel).await.unwrap();
    if !framework.config().keep_workload_cluster {
        assert!(matches!(outcome, DeleteOutcome::Deleted { .. }));
    }
}
