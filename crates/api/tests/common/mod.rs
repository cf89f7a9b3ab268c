#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::core::DynamicObject;
use tessera_api::{Factory, FactoryConfig, IntegrationFactory, Metadata};
use tessera_core::{NamespacedName, Properties};
use tessera_script::YamlScript;
use tessera_store::{ApplyOptions, LabelSelector, MemoryStore, ObjectKey, ObjectStore, ResourceType, StoreError, StoreResult};
use tessera_writer::{WriterError, WriterItem, WriterSink};

pub const DB: &str = r#"
metadata:
  name: db
  alias: Database
  description: database credentials
  scope: Namespace
  sensitive: false
template:
  parameter:
    pwd: null
  output:
    type: Opaque
    stringData:
      password: ${parameter.pwd}
"#;

pub const SECRET_TMPL: &str = r#"
metadata:
  name: secret-tmpl
  scope: Namespace
  sensitive: true
template:
  parameter:
    token: null
  output:
    stringData:
      token: ${parameter.token}
"#;

pub const CACHE: &str = r#"
metadata:
  name: cache
  scope: System
template:
  parameter:
    host: null
  output:
    stringData:
      host: ${parameter.host}
  outputs:
    config:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: ${context.name}-config
      data:
        host: ${parameter.host}
    endpoint:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: ${context.name}-endpoint
      data:
        url: "redis://${parameter.host}"
"#;

pub const APP_CONFIG: &str = r#"
metadata:
  name: app-config
template:
  parameter:
    host: null
  output:
    stringData:
      host: ${parameter.host}
  writers:
    app:
      format: properties
      server:
        name: nacos
      content:
        db:
          host: ${parameter.host}
"#;

pub const TWO_WRITERS: &str = r#"
metadata:
  name: two-writers
template:
  parameter:
    host: null
  output:
    stringData:
      host: ${parameter.host}
  writers:
    alpha:
      format: json
      content:
        host: ${parameter.host}
    beta:
      format: yaml
      content:
        host: ${parameter.host}
"#;

pub fn props(v: serde_json::Value) -> Properties { v.as_object().cloned().unwrap_or_default() }

pub fn meta(ns: &str, name: &str, properties: serde_json::Value) -> Metadata {
    Metadata { id: NamespacedName::new(ns, name), alias: format!("{} alias", name), description: String::new(), properties: props(properties) }
}

/// Sink remembering what it was asked to write.
#[derive(Default)]
pub struct Recorder {
    pub items: Mutex<Vec<(WriterItem, Option<Properties>)>>,
}

#[async_trait::async_trait]
impl WriterSink for Recorder {
    async fn write(&self, item: &WriterItem, server: Option<&Properties>) -> Result<(), WriterError> {
        self.items.lock().unwrap().push((item.clone(), server.cloned()));
        Ok(())
    }
}

/// Sink refusing every item, remembering the order it was asked in.
#[derive(Default)]
pub struct RejectingSink {
    pub attempts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl WriterSink for RejectingSink {
    async fn write(&self, item: &WriterItem, _server: Option<&Properties>) -> Result<(), WriterError> {
        self.attempts.lock().unwrap().push(item.target.clone());
        Err(WriterError::Sink { target: item.target.clone(), reason: format!("{} unreachable", item.target) })
    }
}

/// Memory store that can be told to fail or stall for one kind.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_apply_kind: Option<&'static str>,
    pub fail_delete_kind: Option<&'static str>,
    pub stall: Option<Duration>,
    pub applies: AtomicUsize,
}

impl FaultyStore {
    fn kind_of(obj: &DynamicObject) -> String { obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default() }
}

#[async_trait::async_trait]
impl ObjectStore for FaultyStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        if let Some(d) = self.stall { tokio::time::sleep(d).await; }
        self.inner.get(key).await
    }

    async fn list(&self, rt: &ResourceType, namespace: &str, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        self.inner.list(rt, namespace, selector).await
    }

    async fn apply(&self, obj: &DynamicObject, opts: ApplyOptions) -> StoreResult<DynamicObject> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if self.fail_apply_kind == Some(Self::kind_of(obj).as_str()) {
            return Err(StoreError::Backend("admission denied".into()));
        }
        self.inner.apply(obj, opts).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        if self.fail_delete_kind == Some(key.kind.as_str()) {
            return Err(StoreError::Backend("forbidden".into()));
        }
        self.inner.delete(key).await
    }
}

pub fn config() -> FactoryConfig { FactoryConfig { control_namespace: "ctl".into(), ..Default::default() } }

pub fn factory_over(store: Arc<dyn ObjectStore>) -> (Factory, Arc<Recorder>) {
    let sink = Arc::new(Recorder::default());
    (Factory::new(store, Arc::new(YamlScript), sink.clone(), config()), sink)
}

pub fn factory() -> (Factory, Arc<MemoryStore>, Arc<Recorder>) {
    let store = Arc::new(MemoryStore::new());
    let (f, sink) = factory_over(store.clone());
    (f, store, sink)
}

/// Parse and store a template body under `ns`.
pub async fn register(f: &Factory, ns: &str, body: &str) -> tessera_api::Template {
    let t = f.parse_template("", body).unwrap();
    f.apply_template(ns, &t).await.unwrap();
    t
}

/// Render and store an integration of template `tmpl` (empty = raw).
pub async fn install(f: &Factory, tmpl: &str, tmpl_ns: &str, m: Metadata) -> tessera_api::Integration {
    let i = f.parse_integration(&NamespacedName::new(tmpl_ns, tmpl), m).await.unwrap();
    f.apply_integration(&i).await.unwrap();
    i
}
