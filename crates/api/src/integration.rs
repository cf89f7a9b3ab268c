use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use k8s_openapi::ByteString;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tessera_core::{bool_annotation, keys, NamespacedName, Properties, RenderContext};
use tessera_script::{ScriptEvaluator, OUTPUTS_PATH, OUTPUT_PATH};
use tessera_writer::WriterPayload;
use tracing::warn;

use crate::{IntegrationError, IntegrationResult, Template};

/// Caller-supplied render input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(flatten)]
    pub id: NamespacedName,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Properties,
}

/// A rendered template instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Integration {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub template: Template,
    /// Primary artifact.
    pub secret: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_payload: Option<WriterPayload>,
    /// Auxiliary objects keyed by their output name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, DynamicObject>,
}

impl Integration {
    pub fn is_sensitive(&self) -> bool { is_sensitive(&self.secret) }

    /// Auxiliary object references recorded in the primary artifact.
    pub fn references(&self) -> IntegrationResult<Vec<ObjectReference>> { object_references(&self.secret) }
}

pub(crate) fn is_sensitive(secret: &Secret) -> bool {
    secret.metadata.annotations.as_ref().and_then(|a| a.get(keys::ANNOTATION_SENSITIVE)).map(|s| s == "true").unwrap_or(false)
}

/// Decode the reference list stored under the objects-reference key; empty when absent.
pub fn object_references(secret: &Secret) -> IntegrationResult<Vec<ObjectReference>> {
    match secret.data.as_ref().and_then(|d| d.get(keys::OBJECTS_REFERENCE)) {
        Some(raw) if !raw.0.is_empty() => serde_json::from_slice(&raw.0)
            .map_err(|e| IntegrationError::Invalid(format!("fail to parse the object references: {}", e))),
        _ => Ok(Vec::new()),
    }
}

fn secret_from_output(value: Json) -> IntegrationResult<Secret> {
    let Json::Object(mut obj) = value else {
        return Err(IntegrationError::Invalid("the output format must be secret".into()));
    };
    let api_version = obj.entry("apiVersion").or_insert_with(|| Json::String("v1".into())).clone();
    let kind = obj.entry("kind").or_insert_with(|| Json::String("Secret".into())).clone();
    if api_version != "v1" || kind != "Secret" {
        return Err(IntegrationError::Invalid("the output format must be secret".into()));
    }
    serde_json::from_value(Json::Object(obj)).map_err(|e| IntegrationError::Invalid(format!("the output format must be secret: {}", e)))
}

fn auxiliary_object(key: &str, value: Json, default_ns: &str) -> IntegrationResult<DynamicObject> {
    let mut value = value;
    if let Some(obj) = value.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            let has_ns = meta.get("namespace").and_then(Json::as_str).map(|s| !s.is_empty()).unwrap_or(false);
            if !has_ns { meta.insert("namespace".into(), Json::String(default_ns.to_string())); }
        }
    }
    serde_json::from_value(value).map_err(|e| IntegrationError::Invalid(format!("the output {} is invalid: {}", key, e)))
}

fn reference_of(obj: &DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: obj.types.as_ref().map(|t| t.api_version.clone()),
        kind: obj.types.as_ref().map(|t| t.kind.clone()),
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone(),
        ..Default::default()
    }
}

/// Render an integration from an already-loaded template (or none, for a raw
/// integration). Pure: the caller does every store read.
///
/// A System-scope template forces `metadata.id.namespace` to `control_namespace`.
pub fn render_integration(
    evaluator: &dyn ScriptEvaluator,
    template: Option<Template>,
    mut metadata: Metadata,
    control_namespace: &str,
) -> IntegrationResult<Integration> {
    let mut integration = Integration::default();
    let mut secret = Secret::default();
    match template {
        Some(template) => {
            if template.scope == tessera_core::Scope::System {
                metadata.id.namespace = control_namespace.to_string();
            }
            let ctx = RenderContext { name: metadata.id.name.clone(), namespace: metadata.id.namespace.clone() };
            let output = evaluator
                .evaluate(&template.body, &ctx, &metadata.properties, OUTPUT_PATH)
                .map_err(|e| IntegrationError::Invalid(format!("fail to render the integration {}: {}", metadata.id, e)))?;
            if let Some(output) = output {
                secret = secret_from_output(output)?;
            }
            if secret.type_.as_deref().map(str::is_empty).unwrap_or(true) {
                secret.type_ = Some(format!("/{}", template.id.name));
            }
            let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.insert(keys::LABEL_CATALOG.into(), keys::CATALOG_INTEGRATION.into());
            labels.insert(keys::LABEL_TYPE.into(), template.id.name.clone());
            labels.insert(keys::LABEL_SCOPE.into(), template.scope.to_string());
            let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(keys::ANNOTATION_SENSITIVE.into(), bool_annotation(template.sensitive));
            annotations.insert(keys::ANNOTATION_TEMPLATE_NAMESPACE.into(), template.id.namespace.clone());

            integration.writer_payload = tessera_writer::render(evaluator, &template.writer, &template.body, &ctx, &metadata.properties)
                .map_err(|e| IntegrationError::Invalid(format!("fail to render the content for the expanded writer: {}", e)))?;

            let outputs = evaluator
                .evaluate(&template.body, &ctx, &metadata.properties, OUTPUTS_PATH)
                .map_err(|e| IntegrationError::Invalid(format!("fail to render the outputs of {}: {}", metadata.id, e)))?;
            match outputs {
                None => {}
                Some(Json::Object(objects)) => {
                    let mut refs = Vec::with_capacity(objects.len());
                    let mut sorted: Vec<(String, Json)> = objects.into_iter().collect();
                    sorted.sort_by(|a, b| a.0.cmp(&b.0));
                    for (key, value) in sorted {
                        if !value.is_object() {
                            warn!(integration = %metadata.id, output = %key, "integration: output is not an object; skipped");
                            continue;
                        }
                        let obj = auxiliary_object(&key, value, &metadata.id.namespace)?;
                        refs.push(reference_of(&obj));
                        integration.outputs.insert(key, obj);
                    }
                    let raw = serde_json::to_vec(&refs).map_err(|e| IntegrationError::Invalid(e.to_string()))?;
                    secret.data.get_or_insert_with(BTreeMap::new).insert(keys::OBJECTS_REFERENCE.into(), ByteString(raw));
                }
                Some(_) => return Err(IntegrationError::Invalid("the outputs is invalid: expect a mapping".into())),
            }
            integration.template = template;
        }
        None => {
            secret.metadata.labels = Some(BTreeMap::from([
                (keys::LABEL_CATALOG.to_string(), keys::CATALOG_INTEGRATION.to_string()),
                (keys::LABEL_TYPE.to_string(), String::new()),
            ]));
            secret.metadata.annotations = Some(BTreeMap::new());
        }
    }

    secret.metadata.namespace = Some(metadata.id.namespace.clone());
    if secret.metadata.name.as_deref().map(str::is_empty).unwrap_or(true) {
        secret.metadata.name = Some(metadata.id.name.clone());
    }
    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(keys::ANNOTATION_ALIAS.into(), metadata.alias.clone());
    annotations.insert(keys::ANNOTATION_DESCRIPTION.into(), metadata.description.clone());
    let raw = serde_json::to_vec(&metadata.properties).map_err(|e| IntegrationError::Invalid(e.to_string()))?;
    secret.data.get_or_insert_with(BTreeMap::new).insert(keys::INPUT_PROPERTIES.into(), ByteString(raw));

    integration.metadata = metadata;
    integration.secret = secret;
    Ok(integration)
}

/// Rebuild an integration from its stored primary artifact.
///
/// Sensitive artifacts come back with `data`/`stringData` cleared and no properties.
pub fn integration_from_secret(secret: Secret) -> IntegrationResult<Integration> {
    let Some(labels) = secret.metadata.labels.as_ref() else {
        return Err(IntegrationError::Invalid("this secret is not a valid integration secret".into()));
    };
    let mut integration = Integration {
        metadata: Metadata {
            id: NamespacedName::new(secret.metadata.namespace.clone().unwrap_or_default(), secret.metadata.name.clone().unwrap_or_default()),
            ..Default::default()
        },
        create_time: secret.metadata.creation_timestamp.as_ref().map(|t| t.0),
        template: Template { id: NamespacedName::new("", labels.get(keys::LABEL_TYPE).cloned().unwrap_or_default()), ..Default::default() },
        ..Default::default()
    };
    if let Some(scope) = labels.get(keys::LABEL_SCOPE) {
        integration.template.scope = scope.parse().unwrap_or_default();
    }
    if let Some(annotations) = secret.metadata.annotations.as_ref() {
        let get = |k: &str| annotations.get(k).cloned().unwrap_or_default();
        integration.metadata.alias = get(keys::ANNOTATION_ALIAS);
        integration.metadata.description = get(keys::ANNOTATION_DESCRIPTION);
        integration.template.id.namespace = get(keys::ANNOTATION_TEMPLATE_NAMESPACE);
        integration.template.sensitive = is_sensitive(&secret);
    }
    if integration.template.sensitive {
        let mut redacted = secret;
        redacted.data = None;
        redacted.string_data = None;
        integration.secret = redacted;
        return Ok(integration);
    }
    if let Some(raw) = secret.data.as_ref().and_then(|d| d.get(keys::INPUT_PROPERTIES)).filter(|r| !r.0.is_empty()) {
        integration.metadata.properties = serde_json::from_slice(&raw.0)
            .map_err(|e| IntegrationError::Invalid(format!("fail to parse the properties: {}", e)))?;
    }
    integration.secret = secret;
    Ok(integration)
}
