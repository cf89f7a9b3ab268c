use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tessera_core::{bool_annotation, keys, NamespacedName, Scope};
use tessera_script::{Script, ScriptEvaluator};
use tessera_writer::WriterConfig;
use tracing::{debug, warn};

use crate::{IntegrationError, IntegrationResult};

/// A registered template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Template {
    #[serde(flatten)]
    pub id: NamespacedName,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    pub body: Script,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Json>,
    #[serde(default)]
    pub writer: WriterConfig,
    /// Backing record, as built by parsing or as last read from the store.
    #[serde(skip)]
    pub record: Option<ConfigMap>,
}

pub fn template_record_name(name: &str) -> String { format!("{}{}", keys::TEMPLATE_RECORD_PREFIX, name) }

fn yaml_err(what: &str) -> impl Fn(serde_yaml::Error) -> IntegrationError + '_ {
    move |e| IntegrationError::Invalid(format!("fail to parse the {}: {}", what, e))
}

impl Template {
    /// Build the backing record (no namespace) from the template fields.
    pub fn to_record(&self) -> IntegrationResult<ConfigMap> {
        let mut data = BTreeMap::new();
        data.insert(keys::TEMPLATE_DATA_SCRIPT.to_string(), self.body.as_str().to_string());
        if let Some(schema) = &self.schema {
            let s = serde_yaml::to_string(schema).map_err(|e| IntegrationError::Invalid(format!("fail to encode the schema: {}", e)))?;
            data.insert(keys::TEMPLATE_DATA_SCHEMA.to_string(), s);
        }
        let writer = serde_yaml::to_string(&self.writer).map_err(|e| IntegrationError::Invalid(format!("fail to encode the expanded writer: {}", e)))?;
        data.insert(keys::TEMPLATE_DATA_WRITER.to_string(), writer);

        let labels = BTreeMap::from([
            (keys::LABEL_CATALOG.to_string(), keys::CATALOG_INTEGRATION.to_string()),
            (keys::LABEL_SCOPE.to_string(), self.scope.to_string()),
        ]);
        let annotations = BTreeMap::from([
            (keys::ANNOTATION_DESCRIPTION.to_string(), self.description.clone()),
            (keys::ANNOTATION_ALIAS.to_string(), self.alias.clone()),
            (keys::ANNOTATION_SENSITIVE.to_string(), bool_annotation(self.sensitive)),
        ]);
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(template_record_name(&self.id.name)),
                namespace: Some(self.id.namespace.clone()).filter(|ns| !ns.is_empty()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }

    /// Inverse of `to_record`. Absent schema/writer entries are allowed; invalid ones are not.
    pub fn from_record(cm: &ConfigMap) -> IntegrationResult<Self> {
        let (labels, annotations) = match (&cm.metadata.labels, &cm.metadata.annotations) {
            (Some(l), Some(a)) => (l, a),
            _ => return Err(IntegrationError::Invalid("this record is not a valid template".into())),
        };
        let record_name = cm.metadata.name.clone().unwrap_or_default();
        let name = record_name.strip_prefix(keys::TEMPLATE_RECORD_PREFIX).unwrap_or(&record_name).to_string();
        let scope = match labels.get(keys::LABEL_SCOPE).map(String::as_str) {
            None | Some("") => Scope::default(),
            Some(s) => s.parse().unwrap_or_else(|e| {
                warn!(template = %name, error = %e, "template: unknown scope; using Namespace");
                Scope::default()
            }),
        };
        let empty = BTreeMap::new();
        let data = cm.data.as_ref().unwrap_or(&empty);
        let entry = |k: &str| data.get(k).map(String::as_str).filter(|s| !s.is_empty());
        let schema = entry(keys::TEMPLATE_DATA_SCHEMA).map(serde_yaml::from_str::<Json>).transpose().map_err(yaml_err("schema"))?;
        let writer = entry(keys::TEMPLATE_DATA_WRITER)
            .map(serde_yaml::from_str::<WriterConfig>)
            .transpose()
            .map_err(yaml_err("expanded writer"))?
            .unwrap_or_default();
        Ok(Template {
            id: NamespacedName::new(cm.metadata.namespace.clone().unwrap_or_default(), name),
            alias: annotations.get(keys::ANNOTATION_ALIAS).cloned().unwrap_or_default(),
            description: annotations.get(keys::ANNOTATION_DESCRIPTION).cloned().unwrap_or_default(),
            scope,
            sensitive: annotations.get(keys::ANNOTATION_SENSITIVE).map(|s| s == "true").unwrap_or(false),
            create_time: cm.metadata.creation_timestamp.as_ref().map(|t| t.0),
            body: Script::new(data.get(keys::TEMPLATE_DATA_SCRIPT).cloned().unwrap_or_default()),
            schema,
            writer,
            record: Some(cm.clone()),
        })
    }
}

fn metadata_str(evaluator: &dyn ScriptEvaluator, body: &Script, field: &str) -> Option<String> {
    match evaluator.lookup(body, &["metadata", field]) {
        Ok(Some(Json::String(s))) => Some(s),
        Ok(Some(other)) => {
            warn!(field, value = %other, "template: metadata field is not a string; ignored");
            None
        }
        Ok(None) => {
            debug!(field, "template: metadata field not present");
            None
        }
        Err(e) => {
            warn!(field, error = %e, "template: fail to read metadata field");
            None
        }
    }
}

/// Parse a script body into a template and its backing record.
///
/// `metadata.name` is required unless `default_name` is given, which then wins.
/// Alias, description, scope and sensitivity are best-effort. The property schema
/// must be extractable.
pub fn parse_template(evaluator: &dyn ScriptEvaluator, default_name: &str, body: &str) -> IntegrationResult<Template> {
    let body = Script::new(body);
    let name = evaluator
        .lookup(&body, &["metadata", "name"])
        .map_err(|e| IntegrationError::Invalid(format!("the script is invalid: {}", e)))?;
    let name = match (default_name, name) {
        ("", Some(Json::String(n))) if !n.is_empty() => n,
        ("", _) => return Err(IntegrationError::Invalid("fail to get the name from the template metadata".into())),
        (d, _) => d.to_string(),
    };
    let schema = evaluator
        .property_schema(&body)
        .map_err(|e| IntegrationError::Invalid(format!("the properties of the script are invalid: {}", e)))?;
    let scope = match metadata_str(evaluator, &body, "scope") {
        None => Scope::default(),
        Some(s) => s.parse().unwrap_or_else(|e| {
            warn!(template = %name, error = %e, "template: unknown scope; using Namespace");
            Scope::default()
        }),
    };
    let sensitive = match evaluator.lookup(&body, &["metadata", "sensitive"]) {
        Ok(Some(Json::Bool(b))) => b,
        Ok(Some(other)) => {
            warn!(template = %name, value = %other, "template: sensitive is not a bool; using false");
            false
        }
        Ok(None) => {
            debug!(template = %name, "template: sensitive not present; using false");
            false
        }
        Err(e) => {
            warn!(template = %name, error = %e, "template: fail to read sensitive");
            false
        }
    };
    let template_value = match evaluator.lookup(&body, &["template"]) {
        Ok(v) => v,
        Err(e) => {
            warn!(template = %name, error = %e, "template: fail to look up the template block");
            None
        }
    };
    let mut template = Template {
        id: NamespacedName::new("", name),
        alias: metadata_str(evaluator, &body, "alias").unwrap_or_default(),
        description: metadata_str(evaluator, &body, "description").unwrap_or_default(),
        scope,
        sensitive,
        create_time: None,
        writer: tessera_writer::parse_config(template_value.as_ref()),
        body,
        schema,
        record: None,
    };
    template.record = Some(template.to_record()?);
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_script::YamlScript;

    const DB: &str = r#"
metadata:
  name: db
  alias: Database
  description: database credentials
  scope: Namespace
  sensitive: false
template:
  parameter:
    pwd: null
    port: 5432
  output:
    stringData:
      password: ${parameter.pwd}
  writers:
    nacos:
      format: properties
      content:
        password: ${parameter.pwd}
"#;

    #[test]
    fn parse_reads_metadata_schema_and_writer() {
        let t = parse_template(&YamlScript, "", DB).unwrap();
        assert_eq!(t.id.name, "db");
        assert_eq!(t.alias, "Database");
        assert_eq!(t.description, "database credentials");
        assert_eq!(t.scope, Scope::Namespace);
        assert!(!t.sensitive);
        assert_eq!(t.schema.as_ref().unwrap()["required"], serde_json::json!(["pwd"]));
        assert_eq!(t.writer.targets.len(), 1);
        let cm = t.record.as_ref().unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("integration-template-db"));
        let labels = cm.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[keys::LABEL_CATALOG], "integration");
        assert_eq!(labels[keys::LABEL_SCOPE], "Namespace");
        assert_eq!(cm.metadata.annotations.as_ref().unwrap()[keys::ANNOTATION_SENSITIVE], "false");
        assert_eq!(cm.data.as_ref().unwrap()[keys::TEMPLATE_DATA_SCRIPT], DB);
    }

    #[test]
    fn default_name_overrides_and_missing_name_fails() {
        assert_eq!(parse_template(&YamlScript, "other", DB).unwrap().id.name, "other");
        let err = parse_template(&YamlScript, "", "template:\n  output: {}\n").unwrap_err();
        assert!(matches!(err, IntegrationError::Invalid(_)), "{}", err);
        assert_eq!(parse_template(&YamlScript, "x", "template:\n  output: {}\n").unwrap().id.name, "x");
    }

    #[test]
    fn malformed_parameters_are_fatal_but_metadata_is_best_effort() {
        let err = parse_template(&YamlScript, "x", "template:\n  parameter: [1, 2]\n").unwrap_err();
        assert!(err.to_string().contains("properties"), "{}", err);
        let t = parse_template(&YamlScript, "x", "metadata:\n  scope: Cluster\n  sensitive: yes-please\n  alias: 3\n").unwrap();
        assert_eq!(t.scope, Scope::Namespace);
        assert!(!t.sensitive);
        assert_eq!(t.alias, "");
        assert!(t.schema.is_none());
        assert!(t.writer.is_empty());
    }

    #[test]
    fn absent_metadata_fields_fall_back_to_defaults() {
        let t = parse_template(&YamlScript, "x", "template:\n  output: {}\n").unwrap();
        assert_eq!(t.alias, "");
        assert_eq!(t.description, "");
        assert_eq!(t.scope, Scope::Namespace);
        assert!(!t.sensitive);
        assert!(t.writer.is_empty());
    }

    #[test]
    fn record_round_trip_keeps_every_field() {
        let t = parse_template(&YamlScript, "", DB).unwrap();
        let back = Template::from_record(t.record.as_ref().unwrap()).unwrap();
        assert_eq!(back.id, t.id);
        assert_eq!(back.alias, t.alias);
        assert_eq!(back.description, t.description);
        assert_eq!(back.scope, t.scope);
        assert_eq!(back.sensitive, t.sensitive);
        assert_eq!(back.body, t.body);
        assert_eq!(back.schema, t.schema);
        assert_eq!(back.writer, t.writer);
    }

    #[test]
    fn invalid_schema_entry_is_an_error() {
        let t = parse_template(&YamlScript, "", DB).unwrap();
        let mut cm = t.record.unwrap();
        cm.data.as_mut().unwrap().insert(keys::TEMPLATE_DATA_SCHEMA.into(), "a: [unterminated".into());
        let err = Template::from_record(&cm).unwrap_err();
        assert!(err.to_string().contains("fail to parse the schema"), "{}", err);
        cm.metadata.labels = None;
        assert!(Template::from_record(&cm).is_err());
    }
}
