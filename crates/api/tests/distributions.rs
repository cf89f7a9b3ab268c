mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use serde_json::json;
use tessera_api::{IntegrationError, IntegrationFactory, APPLICATION_KIND, APPLICATION_VERSION};
use tessera_core::{ApplyDistributionSpec, ClusterTarget, NamespacedName};
use tessera_store::{ObjectKey, ObjectStore, ResourceType};

fn request(targets: Vec<ClusterTarget>) -> ApplyDistributionSpec {
    ApplyDistributionSpec { integrations: vec![NamespacedName::new("ns", "a")], targets }
}

fn app_key(ns: &str, name: &str) -> ObjectKey {
    ObjectKey::new(&ResourceType::new(APPLICATION_VERSION, APPLICATION_KIND), ns, name)
}

#[tokio::test]
async fn apply_then_list_reconstructs_the_request() {
    let (f, _store, _) = factory();
    f.apply_distribution("ns", "d1", &request(vec![ClusterTarget::new("c1", "t1")])).await.unwrap();
    let listed = f.list_distributions("ns").await.unwrap();
    assert_eq!(listed.len(), 1);
    let d = &listed[0];
    assert_eq!(d.name, "d1");
    assert_eq!(d.namespace, "ns");
    assert_eq!(d.targets, vec![ClusterTarget::new("c1", "t1")]);
    assert_eq!(d.integrations, vec![NamespacedName::new("ns", "a")]);
    assert_eq!(d.application, NamespacedName::new("ns", "d1"));
    assert!(d.created_time.is_some());
    assert!(f.list_distributions("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_requests_write_nothing() {
    let store = Arc::new(FaultyStore::default());
    let (f, _) = factory_over(store.clone());
    let err = f.apply_distribution("ns", "d1", &request(vec![])).await.unwrap_err();
    assert!(matches!(err, IntegrationError::EmptyRequest));
    let no_refs = ApplyDistributionSpec { integrations: vec![], targets: vec![ClusterTarget::new("c1", "t1")] };
    let err = f.apply_distribution("ns", "d1", &no_refs).await.unwrap_err();
    assert!(matches!(err, IntegrationError::EmptyRequest));
    assert_eq!(store.applies.load(Ordering::SeqCst), 0);
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn reapply_is_idempotent() {
    let (f, store, _) = factory();
    let req = request(vec![ClusterTarget::new("c1", "t1")]);
    f.apply_distribution("ns", "d1", &req).await.unwrap();
    let first = store.get(&app_key("ns", "d1")).await.unwrap();
    f.apply_distribution("ns", "d1", &req).await.unwrap();
    let second = store.get(&app_key("ns", "d1")).await.unwrap();
    assert_eq!(store.len().await, 1);
    assert_eq!(first.metadata.uid, second.metadata.uid);
    assert_eq!(first.data["spec"], second.data["spec"]);
}

#[tokio::test]
async fn duplicate_targets_get_one_policy() {
    let (f, store, _) = factory();
    let req = request(vec![ClusterTarget::new("c1", "t1"), ClusterTarget::new("c2", "t1"), ClusterTarget::new("c1", "t1")]);
    f.apply_distribution("ns", "d1", &req).await.unwrap();
    let app = store.get(&app_key("ns", "d1")).await.unwrap();
    let names: Vec<_> = app.data["spec"]["policies"].as_array().unwrap().iter().map(|p| p["name"].clone()).collect();
    assert_eq!(names, vec![json!("c1-t1"), json!("c2-t1"), json!("share-integration")]);
    // The request annotation is kept verbatim.
    let listed = f.list_distributions("ns").await.unwrap();
    assert_eq!(listed[0].targets.len(), 3);
}

#[tokio::test]
async fn delete_removes_only_the_composed_unit() {
    let (f, store, _) = factory();
    install(&f, "", "", meta("ns", "a", json!({"k": "v"}))).await;
    f.apply_distribution("ns", "d1", &request(vec![ClusterTarget::new("c1", "t1")])).await.unwrap();
    f.delete_distribution("ns", "d1").await.unwrap();
    assert!(f.list_distributions("ns").await.unwrap().is_empty());
    assert!(store.get(&app_key("ns", "d1")).await.unwrap_err().is_not_found());
    assert!(f.get_integration("ns", "a").await.is_ok());
    assert!(f.delete_distribution("ns", "d1").await.unwrap_err().is_not_found());
}
