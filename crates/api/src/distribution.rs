use chrono::{DateTime, Utc};
use kube::core::DynamicObject;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tessera_core::{keys, ApplyDistributionSpec, ClusterTarget, NamespacedName};
use tracing::{debug, warn};

use crate::{IntegrationError, IntegrationResult};

pub const APPLICATION_VERSION: &str = "core.oam.dev/v1beta1";
pub const APPLICATION_KIND: &str = "Application";

const TOPOLOGY_POLICY: &str = "topology";
const SHARED_RESOURCE_POLICY: &str = "shared-resource";
const SHARE_POLICY_NAME: &str = "share-integration";
const REF_OBJECTS_COMPONENT: &str = "ref-objects";

/// A placement of integrations onto cluster targets, read back from its composed unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    pub integrations: Vec<NamespacedName>,
    pub targets: Vec<ClusterTarget>,
    pub application: NamespacedName,
    #[serde(default)]
    pub status: Json,
}

fn topology_policies(targets: &[ClusterTarget]) -> Vec<Json> {
    let mut seen = FxHashSet::default();
    let mut out = Vec::with_capacity(targets.len());
    for t in targets {
        let name = t.policy_name();
        if !seen.insert(name.clone()) {
            debug!(policy = %name, "distribution: duplicate target collapsed");
            continue;
        }
        out.push(json!({
            "name": name,
            "type": TOPOLOGY_POLICY,
            "properties": { "clusters": [t.cluster_name], "namespace": t.namespace },
        }));
    }
    out
}

/// Compose the Application carrying a distribution.
///
/// One topology policy per distinct target, one shared-resource policy over the
/// component named `name`, and one ref-objects component listing the integration
/// secrets. The request itself is kept verbatim in an annotation.
pub fn compose_application(namespace: &str, name: &str, spec: &ApplyDistributionSpec) -> IntegrationResult<DynamicObject> {
    if spec.targets.is_empty() || spec.integrations.is_empty() {
        return Err(IntegrationError::EmptyRequest);
    }
    let mut policies = topology_policies(&spec.targets);
    policies.push(json!({
        "name": SHARE_POLICY_NAME,
        "type": SHARED_RESOURCE_POLICY,
        "properties": { "rules": [ { "selector": { "componentNames": [name] } } ] },
    }));
    let objects: Vec<Json> = spec
        .integrations
        .iter()
        .map(|i| json!({ "name": i.name, "namespace": i.namespace, "resource": "secret" }))
        .collect();
    let request = serde_json::to_string(spec).map_err(|e| IntegrationError::Invalid(e.to_string()))?;
    let app = json!({
        "apiVersion": APPLICATION_VERSION,
        "kind": APPLICATION_KIND,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {
                (keys::LABEL_SOURCE_OF_TRUTH): keys::FROM_INNER,
                (keys::LABEL_CATALOG): keys::CATALOG_DISTRIBUTION,
            },
            "annotations": { (keys::ANNOTATION_DISTRIBUTION_SPEC): request },
        },
        "spec": {
            "components": [ { "name": name, "type": REF_OBJECTS_COMPONENT, "properties": { "objects": objects } } ],
            "policies": policies,
        },
    });
    serde_json::from_value(app).map_err(|e| IntegrationError::Invalid(e.to_string()))
}

/// Rebuild a distribution from its Application. An unreadable request annotation
/// yields empty integrations/targets.
pub fn distribution_from_object(obj: &DynamicObject) -> Distribution {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let request = obj.metadata.annotations.as_ref().and_then(|a| a.get(keys::ANNOTATION_DISTRIBUTION_SPEC));
    let spec = match request.map(|r| serde_json::from_str::<ApplyDistributionSpec>(r)) {
        Some(Ok(spec)) => spec,
        Some(Err(e)) => {
            warn!(ns = %namespace, name = %name, error = %e, "distribution: unreadable request annotation");
            ApplyDistributionSpec::default()
        }
        None => ApplyDistributionSpec::default(),
    };
    Distribution {
        application: NamespacedName::new(namespace.clone(), name.clone()),
        created_time: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
        integrations: spec.integrations,
        targets: spec.targets,
        status: obj.data.get("status").cloned().unwrap_or(Json::Null),
        name,
        namespace,
    }
}
