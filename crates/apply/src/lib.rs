//! Tessera apply: shape desired objects into apply payloads + minimal diffs.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tessera_core::keys;

fn max_object_nodes() -> usize {
    std::env::var("TESSERA_MAX_OBJECT_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Keep a running counter and bail early when exceeding max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Options of a single apply call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Do not refresh the last-applied annotation on the stored object.
    pub disable_update_annotation: bool,
}

impl ApplyOptions {
    pub fn disable_update_annotation() -> Self { Self { disable_update_annotation: true } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Identity fields every applied object must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

pub fn target_of(json: &Json) -> Result<Target> {
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing apiVersion"))?.to_string();
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing kind"))?.to_string();
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name")).and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("object missing metadata.name"))?
        .to_string();
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
    Ok(Target { api_version, kind, name, namespace })
}

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn is_secret(t: &Target) -> bool { t.api_version == "v1" && t.kind == "Secret" }

/// Turn a desired object into the payload sent to the store.
///
/// Server-populated fields are dropped. Unless disabled, the compact desired
/// state is recorded under the last-applied annotation (never for Secrets).
pub fn prepare(desired: &Json, opts: ApplyOptions) -> Result<(Target, Json)> {
    if json_node_budget_exceeded(desired, max_object_nodes()) {
        return Err(anyhow!("object too complex (>{} nodes)", max_object_nodes()));
    }
    let target = target_of(desired)?;
    let mut payload = strip_noisy(desired.clone());
    if let Some(anns) = payload.pointer_mut("/metadata/annotations").and_then(|a| a.as_object_mut()) {
        anns.remove(keys::ANNOTATION_LAST_APPLIED);
    }
    if !opts.disable_update_annotation && !is_secret(&target) {
        let snapshot = serde_json::to_string(&payload)?;
        let meta = payload
            .as_object_mut()
            .ok_or_else(|| anyhow!("object must be a mapping"))?
            .entry("metadata")
            .or_insert(Json::Object(serde_json::Map::new()));
        let anns = meta
            .as_object_mut()
            .ok_or_else(|| anyhow!("metadata must be a mapping"))?
            .entry("annotations")
            .or_insert(Json::Object(serde_json::Map::new()));
        if let Some(anns) = anns.as_object_mut() {
            anns.insert(keys::ANNOTATION_LAST_APPLIED.into(), Json::String(snapshot));
        }
    }
    Ok((target, payload))
}

pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "u",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert_eq!(meta.len(), 2);
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = json!({
            "a": 2,                  // scalar update
            "b": { "x": 1, "y": 2 }, // object add
            "c": [1, 9],             // array element update + removal
            "d": true                // key add
        });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn prepare_requires_identity() {
        let e1 = prepare(&json!({"kind": "Foo", "metadata": {"name": "x"}}), ApplyOptions::default()).unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = prepare(&json!({"apiVersion": "v1", "metadata": {"name": "x"}}), ApplyOptions::default()).unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = prepare(&json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}}), ApplyOptions::default()).unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn prepare_records_last_applied_except_when_disabled_or_secret() {
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "resourceVersion": "7"}, "data": {"k": "v"}});
        let (t, out) = prepare(&cm, ApplyOptions::default()).unwrap();
        assert_eq!(t.name, "x");
        let snap = out["metadata"]["annotations"][keys::ANNOTATION_LAST_APPLIED].as_str().unwrap();
        let snap: Json = serde_json::from_str(snap).unwrap();
        assert_eq!(snap["data"], json!({"k": "v"}));
        assert!(snap["metadata"].get("resourceVersion").is_none());

        let (_, out) = prepare(&cm, ApplyOptions::disable_update_annotation()).unwrap();
        assert!(out["metadata"].get("annotations").is_none());

        let secret = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s"}, "data": {"k": "dg=="}});
        let (_, out) = prepare(&secret, ApplyOptions::default()).unwrap();
        assert!(out["metadata"].get("annotations").is_none());
    }

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(split_api_version("core.oam.dev/v1beta1"), ("core.oam.dev".to_string(), "v1beta1".to_string()));
    }
}
