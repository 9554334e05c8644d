//! Stories about the kube-backed object store
//!
//! Each test creates its objects in `default` under a unique name and
//! cleans them up.

use std::time::Duration;

use clustertest::cluster::apply::create_or_update;
use clustertest::cluster::conditions::{resource_exists, resource_gone};
use clustertest::common::kube_utils::dynamic_object;
use clustertest::common::store::delete_if_exists;
use clustertest::common::{poll, ErrorKind, ObjectRef, ObjectStore, PollOptions, Selector};
use serde_json::json;

use super::helpers::{store_from_env, unique_name};

fn options() -> PollOptions {
    PollOptions::new(Duration::from_secs(60), Duration::from_secs(1))
}

#[tokio::test]
#[ignore]
async fn story_config_map_apply_is_idempotent() {
    let store = store_from_env().await;
    let name = unique_name("clustertest-cm");
    let mut cm = dynamic_object("v1", "ConfigMap", &name, Some("default"));
    cm.metadata.labels = Some([("clustertest.io/test".to_string(), name.clone())].into());
    cm.data = json!({ "data": { "values": "a: 1\n" } });

    let first = create_or_update(store.as_ref(), &cm).await.unwrap();
    cm.data = json!({ "data": { "values": "a: 2\n" } });
    let second = create_or_update(store.as_ref(), &cm).await.unwrap();

    assert_eq!(first.metadata.uid, second.metadata.uid);
    assert_eq!(second.data["data"]["values"], "a: 2\n");

    let listed = store
        .list(
            &Selector::new("v1", "ConfigMap")
                .in_namespace("default")
                .with_labels(format!("clustertest.io/test={}", name)),
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let target = ObjectRef::config_map("default", &name);
    assert!(delete_if_exists(store.as_ref(), &target).await.unwrap());
    poll(&resource_gone(store.clone(), target.clone()), &options())
        .await
        .unwrap();
    assert!(!delete_if_exists(store.as_ref(), &target).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn story_errors_are_classified() {
    let store = store_from_env().await;
    let missing = ObjectRef::config_map("default", unique_name("clustertest-missing"));

    let err = store.get(&missing).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.code, Some(404));

    let name = unique_name("clustertest-dup");
    let cm = dynamic_object("v1", "ConfigMap", &name, Some("default"));
    store.create(&cm).await.unwrap();
    let err = store.create(&cm).await.unwrap_err();
    assert!(err.is_already_exists());

    delete_if_exists(store.as_ref(), &ObjectRef::config_map("default", &name))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn story_default_namespace_exists() {
    let store = store_from_env().await;
    poll(
        &resource_exists(store, ObjectRef::namespace("default")),
        &options(),
    )
    .await
    .unwrap();
}
