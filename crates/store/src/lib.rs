//! Tessera store: the object store contract consumed by the factory, label
//! selectors, typed conversions and an in-RAM implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use tokio::sync::RwLock;
use tracing::debug;

pub use tessera_apply::ApplyOptions;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { StoreError::Invalid(e.to_string()) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// apiVersion + kind of a stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }
    pub fn secret() -> Self { Self::new("v1", "Secret") }
    pub fn config_map() -> Self { Self::new("v1", "ConfigMap") }
}

/// Full address of one stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(rt: &ResourceType, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { api_version: rt.api_version.clone(), kind: rt.kind.clone(), namespace: namespace.into(), name: name.into() }
    }

    pub fn resource_type(&self) -> ResourceType { ResourceType::new(self.api_version.clone(), self.kind.clone()) }

    pub fn of(obj: &DynamicObject) -> StoreResult<Self> {
        let types = obj.types.as_ref().ok_or_else(|| StoreError::Invalid("object missing apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().filter(|n| !n.is_empty()).ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name,
        })
    }
}

impl From<&ObjectReference> for ObjectKey {
    fn from(r: &ObjectReference) -> Self {
        Self {
            api_version: r.api_version.clone().unwrap_or_default(),
            kind: r.kind.clone().unwrap_or_default(),
            namespace: r.namespace.clone().unwrap_or_default(),
            name: r.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { write!(f, "{} {}", self.kind, self.name) } else { write!(f, "{} {}/{}", self.kind, self.namespace, self.name) }
    }
}

/// Equality-based label selector (`a=b,c=d`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: SmallVec<[(String, String); 4]>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.reqs.push((key.into(), value.into()));
        self
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        let mut sel = Self::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.contains("!=") {
                return Err(StoreError::Invalid(format!("unsupported selector requirement: {}", part)));
            }
            let (k, v) = part
                .split_once("==")
                .or_else(|| part.split_once('='))
                .ok_or_else(|| StoreError::Invalid(format!("invalid selector requirement: {}", part)))?;
            let k = k.trim();
            if k.is_empty() { return Err(StoreError::Invalid(format!("empty label key in: {}", part))); }
            sel = sel.eq(k, v.trim());
        }
        Ok(sel)
    }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.reqs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(","))
    }
}

/// Namespaced record store. `apply` is create-or-update and returns what was stored.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject>;

    /// List records of one type; an empty namespace lists across namespaces.
    async fn list(&self, rt: &ResourceType, namespace: &str, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>>;

    async fn apply(&self, obj: &DynamicObject, opts: ApplyOptions) -> StoreResult<DynamicObject>;

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
}

/// Convert a typed object (e.g. a `Secret`) into a `DynamicObject`.
pub fn to_dynamic<K: Serialize>(obj: &K) -> StoreResult<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a `DynamicObject` back into a typed object.
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> StoreResult<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

// ----------------- In-memory implementation -----------------

/// In-RAM store keyed by full object address.
///
/// Mirrors the API server where it matters to callers: uid, creationTimestamp and
/// resourceVersion are server-assigned, identity survives updates, and Secret
/// `stringData` is folded into `data`. Owner references are recorded but never
/// garbage-collected.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<FxHashMap<ObjectKey, Json>>,
    rv: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn len(&self) -> usize { self.objects.read().await.len() }

    pub async fn is_empty(&self) -> bool { self.objects.read().await.is_empty() }

    fn fold_string_data(payload: Json) -> StoreResult<Json> {
        let mut secret: Secret = serde_json::from_value(payload)?;
        if let Some(sd) = secret.string_data.take() {
            let data = secret.data.get_or_insert_with(BTreeMap::new);
            for (k, v) in sd {
                data.insert(k, k8s_openapi::ByteString(v.into_bytes()));
            }
        }
        Ok(serde_json::to_value(&secret)?)
    }
}

fn labels_of(v: &Json) -> BTreeMap<String, String> {
    v.pointer("/metadata/labels")
        .and_then(|l| l.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let guard = self.objects.read().await;
        let v = guard.get(key).ok_or_else(|| StoreError::NotFound { kind: key.kind.clone(), name: key.name.clone() })?;
        Ok(serde_json::from_value(v.clone())?)
    }

    async fn list(&self, rt: &ResourceType, namespace: &str, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        let guard = self.objects.read().await;
        let mut hits: Vec<(&ObjectKey, &Json)> = guard
            .iter()
            .filter(|(k, _)| k.api_version == rt.api_version && k.kind == rt.kind)
            .filter(|(k, _)| namespace.is_empty() || k.namespace == namespace)
            .filter(|(_, v)| selector.matches(&labels_of(v)))
            .collect();
        hits.sort_by(|a, b| (&a.0.namespace, &a.0.name).cmp(&(&b.0.namespace, &b.0.name)));
        hits.into_iter().map(|(_, v)| Ok(serde_json::from_value(v.clone())?)).collect()
    }

    async fn apply(&self, obj: &DynamicObject, opts: ApplyOptions) -> StoreResult<DynamicObject> {
        let desired = serde_json::to_value(obj)?;
        let (target, mut payload) = tessera_apply::prepare(&desired, opts).map_err(|e| StoreError::Invalid(e.to_string()))?;
        if target.api_version == "v1" && target.kind == "Secret" {
            payload = Self::fold_string_data(payload)?;
        }
        let key = ObjectKey {
            api_version: target.api_version.clone(),
            kind: target.kind.clone(),
            namespace: target.namespace.clone().unwrap_or_default(),
            name: target.name.clone(),
        };
        let rv = self.rv.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.objects.write().await;
        let (uid, created, kept_last_applied) = match guard.get(&key) {
            Some(live) => {
                let summary = tessera_apply::diff_summary(&payload, &tessera_apply::strip_noisy(live.clone()));
                debug!(key = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "memory store: update");
                let last = live.pointer(&format!("/metadata/annotations/{}", tessera_core::keys::ANNOTATION_LAST_APPLIED.replace('/', "~1"))).cloned();
                (live.pointer("/metadata/uid").cloned(), live.pointer("/metadata/creationTimestamp").cloned(), last)
            }
            None => {
                debug!(key = %key, "memory store: create");
                (None, None, None)
            }
        };
        let meta = payload
            .as_object_mut()
            .and_then(|o| o.entry("metadata").or_insert(Json::Object(Default::default())).as_object_mut())
            .ok_or_else(|| StoreError::Invalid("metadata must be a mapping".into()))?;
        meta.insert("uid".into(), uid.unwrap_or_else(|| Json::String(uuid::Uuid::new_v4().to_string())));
        meta.insert(
            "creationTimestamp".into(),
            created.unwrap_or_else(|| Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))),
        );
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
        if opts.disable_update_annotation {
            if let Some(last) = kept_last_applied {
                let anns = meta.entry("annotations").or_insert(Json::Object(Default::default()));
                if let Some(anns) = anns.as_object_mut() { anns.insert(tessera_core::keys::ANNOTATION_LAST_APPLIED.into(), last); }
            }
        }
        guard.insert(key, payload.clone());
        Ok(serde_json::from_value(payload)?)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut guard = self.objects.write().await;
        match guard.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound { kind: key.kind.clone(), name: key.name.clone() }),
        }
    }
}
