//! Tessera core types: identities, scopes, render context and the reserved
//! label/annotation/payload keys shared by every crate.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Caller-supplied property map. Opaque to this layer beyond JSON/YAML round-tripping.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Identity key for templates, integrations and distributions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { write!(f, "{}", self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

/// Usage scope of a template.
///
/// - `System`: integrations are written into the control namespace.
/// - `Namespace`: integrations live in the namespace they were requested in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Scope {
    System,
    #[default]
    Namespace,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::System => "System",
            Scope::Namespace => "Namespace",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unknown scope {0:?} (expect System or Namespace)")]
pub struct UnknownScope(pub String);

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "System" => Ok(Scope::System),
            "Namespace" => Ok(Scope::Namespace),
            other => Err(UnknownScope(other.to_string())),
        }
    }
}

/// Values a template can reference as `context.*` while rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderContext {
    pub name: String,
    pub namespace: String,
}

impl RenderContext {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name, "namespace": self.namespace })
    }
}

/// One placement target of a distribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTarget {
    pub cluster_name: String,
    pub namespace: String,
}

impl ClusterTarget {
    pub fn new(cluster_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { cluster_name: cluster_name.into(), namespace: namespace.into() }
    }

    /// Policy name used for this target inside a composed application.
    pub fn policy_name(&self) -> String { format!("{}-{}", self.cluster_name, self.namespace) }
}

/// The request body of a distribution; stored verbatim on the composed unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyDistributionSpec {
    #[serde(default)]
    pub integrations: Vec<NamespacedName>,
    #[serde(default)]
    pub targets: Vec<ClusterTarget>,
}

/// Reserved keys. Scripts cannot override these on the primary artifact.
pub mod keys {
    /// Payload key holding the serialized input properties.
    pub const INPUT_PROPERTIES: &str = "input-properties";
    /// Payload key holding the serialized auxiliary object references.
    pub const OBJECTS_REFERENCE: &str = "objects-reference";

    pub const TEMPLATE_RECORD_PREFIX: &str = "integration-template-";
    pub const TEMPLATE_DATA_SCRIPT: &str = "template";
    pub const TEMPLATE_DATA_SCHEMA: &str = "schema";
    pub const TEMPLATE_DATA_WRITER: &str = "expanded-writer";

    pub const LABEL_CATALOG: &str = "tessera.dev/catalog";
    pub const LABEL_TYPE: &str = "tessera.dev/type";
    pub const LABEL_SCOPE: &str = "tessera.dev/scope";
    pub const LABEL_SOURCE_OF_TRUTH: &str = "tessera.dev/source-of-truth";

    pub const ANNOTATION_ALIAS: &str = "tessera.dev/alias";
    pub const ANNOTATION_DESCRIPTION: &str = "tessera.dev/description";
    pub const ANNOTATION_SENSITIVE: &str = "tessera.dev/sensitive";
    pub const ANNOTATION_TEMPLATE_NAMESPACE: &str = "tessera.dev/template-namespace";
    pub const ANNOTATION_DISTRIBUTION_SPEC: &str = "tessera.dev/distribution-spec";
    pub const ANNOTATION_LAST_APPLIED: &str = "tessera.dev/last-applied";

    pub const CATALOG_INTEGRATION: &str = "integration";
    pub const CATALOG_DISTRIBUTION: &str = "integration-distribution";
    pub const FROM_INNER: &str = "from-inner";
}

/// Render a boolean the way the sensitivity annotation stores it.
pub fn bool_annotation(v: bool) -> String { if v { "true".into() } else { "false".into() } }

pub mod prelude {
    pub use super::{keys, ApplyDistributionSpec, ClusterTarget, NamespacedName, Properties, RenderContext, Scope};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_known_values_only() {
        assert_eq!("System".parse::<Scope>().unwrap(), Scope::System);
        assert_eq!("Namespace".parse::<Scope>().unwrap(), Scope::Namespace);
        assert!("system".parse::<Scope>().is_err());
        assert_eq!(Scope::default(), Scope::Namespace);
    }

    #[test]
    fn target_policy_name_joins_cluster_and_namespace() {
        assert_eq!(ClusterTarget::new("c1", "t1").policy_name(), "c1-t1");
    }

    #[test]
    fn distribution_spec_json_shape() {
        let spec = ApplyDistributionSpec {
            integrations: vec![NamespacedName::new("ns", "a")],
            targets: vec![ClusterTarget::new("c1", "t1")],
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v, serde_json::json!({
            "integrations": [{"name": "a", "namespace": "ns"}],
            "targets": [{"clusterName": "c1", "namespace": "t1"}]
        }));
    }

    #[test]
    fn namespaced_name_display() {
        assert_eq!(NamespacedName::new("ns", "a").to_string(), "ns/a");
        assert_eq!(NamespacedName::new("", "a").to_string(), "a");
    }
}
