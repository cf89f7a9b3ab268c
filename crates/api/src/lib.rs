//! Tessera integration factory.
//!
//! Templates are parametrized scripts stored as records; integrations are templates
//! rendered with concrete properties into a primary Secret plus auxiliary objects;
//! distributions fan integrations out to cluster targets through one composed
//! Application. Frontends (CLI) depend on the `IntegrationFactory` trait only.

#![forbid(unsafe_code)]

use std::time::Duration;

use tessera_core::{ApplyDistributionSpec, NamespacedName, Properties, Scope};
use tessera_store::StoreError;
use tessera_writer::WriterError;

mod distribution;
mod factory;
mod integration;
mod template;

pub use distribution::{compose_application, distribution_from_object, Distribution, APPLICATION_KIND, APPLICATION_VERSION};
pub use factory::Factory;
pub use integration::{integration_from_secret, object_references, render_integration, Integration, Metadata};
pub use template::{parse_template, template_record_name, Template};

/// Errors surfaced by the factory. Match on variants, not on text.
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("the {kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("the integration is sensitive")]
    Sensitive,
    #[error("{0}")]
    Invalid(String),
    #[error("the integration or the target is empty")]
    EmptyRequest,
    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
    #[error("fail to write the expanded writer data: {0}")]
    Writer(#[from] WriterError),
    #[error("{context}: {source}")]
    Store { context: String, #[source] source: StoreError },
}

impl IntegrationError {
    pub fn is_not_found(&self) -> bool { matches!(self, IntegrationError::NotFound { .. }) }

    pub fn is_sensitive(&self) -> bool { matches!(self, IntegrationError::Sensitive) }

    /// Wrap a store failure; not-found and timeouts keep their own variants.
    pub fn store(context: impl Into<String>, e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, name } => IntegrationError::NotFound { kind: kind.to_lowercase(), name },
            StoreError::Timeout { op, secs } => IntegrationError::Timeout { op, secs },
            other => IntegrationError::Store { context: context.into(), source: other },
        }
    }

    pub(crate) fn not_found(kind: &str, name: impl ToString) -> Self {
        IntegrationError::NotFound { kind: kind.to_string(), name: name.to_string() }
    }
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default))
}

/// Runtime knobs of the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Namespace System-scope integrations are written into.
    pub control_namespace: String,
    /// Deadline of single-object store calls.
    pub get_timeout: Duration,
    /// Deadline of template listing.
    pub list_timeout: Duration,
    /// Deadline of integration and distribution listing.
    pub scan_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            control_namespace: "vela-system".into(),
            get_timeout: Duration::from_secs(10),
            list_timeout: Duration::from_secs(60),
            scan_timeout: Duration::from_secs(180),
        }
    }
}

impl FactoryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            control_namespace: std::env::var("TESSERA_CONTROL_NAMESPACE").ok().filter(|s| !s.is_empty()).unwrap_or(d.control_namespace),
            get_timeout: env_secs("TESSERA_GET_TIMEOUT_SECS", d.get_timeout.as_secs()),
            list_timeout: env_secs("TESSERA_LIST_TIMEOUT_SECS", d.list_timeout.as_secs()),
            scan_timeout: env_secs("TESSERA_SCAN_TIMEOUT_SECS", d.scan_timeout.as_secs()),
        }
    }
}

/// Full lifecycle surface of templates, integrations and distributions.
#[async_trait::async_trait]
pub trait IntegrationFactory: Send + Sync {
    /// Build a template (and its backing record) from a script body. No I/O.
    fn parse_template(&self, default_name: &str, body: &str) -> IntegrationResult<Template>;

    async fn load_template(&self, namespace: &str, name: &str) -> IntegrationResult<Template>;

    async fn apply_template(&self, namespace: &str, template: &Template) -> IntegrationResult<()>;

    async fn delete_template(&self, namespace: &str, name: &str) -> IntegrationResult<()>;

    /// `scope = None` lists every scope.
    async fn list_templates(&self, namespace: &str, scope: Option<Scope>) -> IntegrationResult<Vec<Template>>;

    /// Render an integration. Reads the referenced template; never writes.
    async fn parse_integration(&self, template: &NamespacedName, metadata: Metadata) -> IntegrationResult<Integration>;

    /// Persist the primary artifact, then every auxiliary object, then run the writers.
    /// Not transactional: a failure leaves earlier applies in place.
    async fn apply_integration(&self, integration: &Integration) -> IntegrationResult<()>;

    async fn read_integration(&self, namespace: &str, name: &str) -> IntegrationResult<Properties>;

    async fn get_integration(&self, namespace: &str, name: &str) -> IntegrationResult<Integration>;

    async fn list_integrations(&self, namespace: &str, template: Option<&str>, scope: Option<Scope>) -> IntegrationResult<Vec<Integration>>;

    async fn delete_integration(&self, namespace: &str, name: &str) -> IntegrationResult<()>;

    async fn apply_distribution(&self, namespace: &str, name: &str, spec: &ApplyDistributionSpec) -> IntegrationResult<()>;

    async fn list_distributions(&self, namespace: &str) -> IntegrationResult<Vec<Distribution>>;

    async fn delete_distribution(&self, namespace: &str, name: &str) -> IntegrationResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_not_found_and_timeout() {
        let e = IntegrationError::store("x", StoreError::NotFound { kind: "Secret".into(), name: "a".into() });
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "the secret a not found");
        let e = IntegrationError::store("list", StoreError::Timeout { op: "list", secs: 3 });
        assert!(matches!(e, IntegrationError::Timeout { secs: 3, .. }));
        let e = IntegrationError::store("fail to apply the secret", StoreError::Backend("boom".into()));
        assert_eq!(e.to_string(), "fail to apply the secret: store backend: boom");
    }

    #[test]
    fn stable_messages() {
        assert_eq!(IntegrationError::Sensitive.to_string(), "the integration is sensitive");
        assert_eq!(IntegrationError::EmptyRequest.to_string(), "the integration or the target is empty");
    }

    #[test]
    fn config_defaults() {
        let c = FactoryConfig::default();
        assert_eq!(c.control_namespace, "vela-system");
        assert_eq!(c.get_timeout, Duration::from_secs(10));
        assert_eq!(c.list_timeout, Duration::from_secs(60));
        assert_eq!(c.scan_timeout, Duration::from_secs(180));
    }
}
