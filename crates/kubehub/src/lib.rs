//! Tessera kubehub: `ObjectStore` over a live cluster (discovery + server-side apply)

#![forbid(unsafe_code)]

use std::time::Instant;

use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tessera_core::keys;
use tessera_store::{ApplyOptions, LabelSelector, ObjectKey, ObjectStore, ResourceType, StoreError, StoreResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn field_manager() -> String {
    std::env::var("TESSERA_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "tessera".to_string())
}

/// `v1` + `Secret` -> core group GVK; `core.oam.dev/v1beta1` + `Application` -> grouped GVK.
pub fn gvk_of(rt: &ResourceType) -> GroupVersionKind {
    let (group, version) = tessera_apply::split_api_version(&rt.api_version);
    GroupVersionKind { group, version, kind: rt.kind.clone() }
}

fn map_kube_err(key_kind: &str, name: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound { kind: key_kind.to_string(), name: name.to_string() },
        other => StoreError::Backend(other.to_string()),
    }
}

/// Cluster-backed store. Resolved `ApiResource`s are cached per type.
pub struct KubeStore {
    client: Client,
    field_manager: String,
    resources: Mutex<FxHashMap<ResourceType, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: field_manager(), resources: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> StoreResult<Self> {
        let client = Client::try_default().await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self::new(client))
    }

    async fn find_api_resource(&self, rt: &ResourceType) -> StoreResult<(ApiResource, bool)> {
        if let Some(hit) = self.resources.lock().await.get(rt) {
            return Ok(hit.clone());
        }
        let gvk = gvk_of(rt);
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(|e| StoreError::Backend(e.to_string()))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(api_version = %rt.api_version, kind = %rt.kind, namespaced, took_ms = %t0.elapsed().as_millis(), "kube store: resource resolved");
                    self.resources.lock().await.insert(rt.clone(), (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(StoreError::Backend(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api_for(&self, rt: &ResourceType, namespace: &str) -> StoreResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(rt).await?;
        Ok(if namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

fn last_applied_of(obj: &DynamicObject) -> Option<String> {
    obj.metadata.annotations.as_ref().and_then(|a| a.get(keys::ANNOTATION_LAST_APPLIED)).cloned()
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let api = self.api_for(&key.resource_type(), &key.namespace).await?;
        api.get(&key.name).await.map_err(|e| map_kube_err(&key.kind, &key.name, e))
    }

    async fn list(&self, rt: &ResourceType, namespace: &str, selector: &LabelSelector) -> StoreResult<Vec<DynamicObject>> {
        let t0 = Instant::now();
        let api = self.api_for(rt, namespace).await?;
        let sel = selector.to_string();
        let lp = if sel.is_empty() { ListParams::default() } else { ListParams::default().labels(&sel) };
        let list = api.list(&lp).await.map_err(|e| map_kube_err(&rt.kind, "", e))?;
        debug!(kind = %rt.kind, ns = %namespace, selector = %sel, items = list.items.len(), took_ms = %t0.elapsed().as_millis(), "kube store: list ok");
        Ok(list.items)
    }

    async fn apply(&self, obj: &DynamicObject, opts: ApplyOptions) -> StoreResult<DynamicObject> {
        let t0 = Instant::now();
        let desired = serde_json::to_value(obj).map_err(StoreError::from)?;
        let (target, mut payload) = tessera_apply::prepare(&desired, opts).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let rt = ResourceType::new(target.api_version.clone(), target.kind.clone());
        let ns = target.namespace.clone().unwrap_or_default();
        let api = self.api_for(&rt, &ns).await?;
        // Fields omitted from an apply are released by this manager; carry the old snapshot over.
        if opts.disable_update_annotation {
            let live = api.get_opt(&target.name).await.map_err(|e| map_kube_err(&target.kind, &target.name, e))?;
            if let Some(last) = live.as_ref().and_then(last_applied_of) {
                if let Some(meta) = payload.get_mut("metadata").and_then(Json::as_object_mut) {
                    let anns = meta.entry("annotations").or_insert(Json::Object(Default::default()));
                    if let Some(anns) = anns.as_object_mut() { anns.insert(keys::ANNOTATION_LAST_APPLIED.into(), Json::String(last)); }
                }
            }
        }
        let pp = PatchParams::apply(&self.field_manager).force();
        match api.patch(&target.name, &pp, &Patch::Apply(&payload)).await {
            Ok(o) => {
                counter!("kube_store_apply_ok", 1u64);
                info!(kind = %target.kind, ns = %ns, name = %target.name, took_ms = %t0.elapsed().as_millis(), "kube store: apply ok");
                Ok(o)
            }
            Err(e) => {
                counter!("kube_store_apply_err", 1u64);
                warn!(kind = %target.kind, ns = %ns, name = %target.name, error = %e, "kube store: apply failed");
                Err(map_kube_err(&target.kind, &target.name, e))
            }
        }
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let api = self.api_for(&key.resource_type(), &key.namespace).await?;
        api.delete(&key.name, &DeleteParams::default()).await.map_err(|e| map_kube_err(&key.kind, &key.name, e))?;
        info!(key = %key, "kube store: delete ok");
        Ok(())
    }
}
