mod common;

use std::collections::BTreeMap;

use common::*;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tessera_api::IntegrationFactory;
use tessera_core::{keys, Scope};
use tessera_store::{to_dynamic, ApplyOptions, ObjectStore};

#[tokio::test]
async fn apply_then_load_round_trips_every_field() {
    let (f, _store, _) = factory();
    let parsed = register(&f, "ns", DB).await;
    let loaded = f.load_template("ns", "db").await.unwrap();
    assert_eq!(loaded.id.name, "db");
    assert_eq!(loaded.id.namespace, "ns");
    assert_eq!(loaded.alias, parsed.alias);
    assert_eq!(loaded.description, parsed.description);
    assert_eq!(loaded.scope, parsed.scope);
    assert_eq!(loaded.sensitive, parsed.sensitive);
    assert_eq!(loaded.body, parsed.body);
    assert_eq!(loaded.schema, parsed.schema);
    assert_eq!(loaded.writer, parsed.writer);
    assert!(loaded.create_time.is_some());
}

#[tokio::test]
async fn re_registration_replaces_the_body() {
    let (f, store, _) = factory();
    register(&f, "ns", DB).await;
    let changed = DB.replace("database credentials", "rotated");
    register(&f, "ns", &changed).await;
    let loaded = f.load_template("ns", "db").await.unwrap();
    assert_eq!(loaded.description, "rotated");
    assert_eq!(loaded.body.as_str(), changed);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn list_filters_by_scope() {
    let (f, _store, _) = factory();
    register(&f, "ns", DB).await;
    register(&f, "ns", CACHE).await;
    let all = f.list_templates("ns", None).await.unwrap();
    assert_eq!(all.len(), 2);
    let system = f.list_templates("ns", Some(Scope::System)).await.unwrap();
    let names: Vec<_> = system.iter().map(|t| t.id.name.as_str()).collect();
    assert_eq!(names, vec!["cache"]);
    let namespaced = f.list_templates("ns", Some(Scope::Namespace)).await.unwrap();
    assert_eq!(namespaced.len(), 1);
    assert_eq!(namespaced[0].id.name, "db");
    assert!(f.list_templates("other", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_skips_unparsable_records() {
    let (f, store, _) = factory();
    register(&f, "ns", DB).await;
    let broken = ConfigMap {
        metadata: ObjectMeta {
            name: Some("integration-template-broken".into()),
            namespace: Some("ns".into()),
            labels: Some(BTreeMap::from([(keys::LABEL_CATALOG.to_string(), keys::CATALOG_INTEGRATION.to_string())])),
            annotations: Some(BTreeMap::new()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(keys::TEMPLATE_DATA_SCHEMA.to_string(), "a: [".to_string())])),
        ..Default::default()
    };
    store.apply(&to_dynamic(&broken).unwrap(), ApplyOptions::default()).await.unwrap();
    let listed = f.list_templates("ns", None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.name, "db");
    assert!(f.load_template("ns", "broken").await.is_err());
}

#[tokio::test]
async fn delete_removes_the_record_only_once() {
    let (f, _store, _) = factory();
    register(&f, "ns", DB).await;
    f.delete_template("ns", "db").await.unwrap();
    let load_err = f.load_template("ns", "db").await.unwrap_err();
    assert!(load_err.is_not_found());
    let delete_err = f.delete_template("ns", "db").await.unwrap_err();
    assert!(delete_err.is_not_found());
    assert_eq!(delete_err.to_string(), "the integration template ns/db not found");
    assert_eq!(delete_err.to_string(), load_err.to_string());
}

#[tokio::test]
async fn deleting_a_template_keeps_rendered_integrations() {
    let (f, _store, _) = factory();
    register(&f, "ns", DB).await;
    install(&f, "db", "ns", meta("ns", "orders-db", serde_json::json!({"pwd": "x"}))).await;
    f.delete_template("ns", "db").await.unwrap();
    assert_eq!(f.read_integration("ns", "orders-db").await.unwrap(), props(serde_json::json!({"pwd": "x"})));
}
