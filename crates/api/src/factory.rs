use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use metrics::{counter, histogram};
use tessera_core::{keys, ApplyDistributionSpec, NamespacedName, Properties, Scope};
use tessera_script::ScriptEvaluator;
use tessera_store::{from_dynamic, to_dynamic, ApplyOptions, LabelSelector, ObjectKey, ObjectStore, ResourceType, StoreError, StoreResult};
use tessera_writer::{IntegrationReader, WriterSink};
use tracing::{info, warn};

use crate::distribution::{APPLICATION_KIND, APPLICATION_VERSION};
use crate::integration::is_sensitive;
use crate::{
    compose_application, distribution_from_object, integration_from_secret, parse_template, render_integration, template_record_name,
    Distribution, FactoryConfig, Integration, IntegrationError, IntegrationFactory, IntegrationResult, Metadata, Template,
};

async fn deadline<T>(op: &'static str, limit: Duration, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout { op, secs: limit.as_secs() }),
    }
}

fn application_type() -> ResourceType { ResourceType::new(APPLICATION_VERSION, APPLICATION_KIND) }

/// Factory over an object store, a script evaluator and a writer sink.
///
/// Every store call carries its own deadline; nothing is locked per identity, so
/// concurrent writers of the same name race at the store.
pub struct Factory {
    store: Arc<dyn ObjectStore>,
    evaluator: Arc<dyn ScriptEvaluator>,
    sink: Arc<dyn WriterSink>,
    config: FactoryConfig,
}

impl Factory {
    pub fn new(store: Arc<dyn ObjectStore>, evaluator: Arc<dyn ScriptEvaluator>, sink: Arc<dyn WriterSink>, config: FactoryConfig) -> Self {
        Self { store, evaluator, sink, config }
    }

    pub fn config(&self) -> &FactoryConfig { &self.config }

    async fn get_secret(&self, namespace: &str, name: &str) -> IntegrationResult<Secret> {
        let key = ObjectKey::new(&ResourceType::secret(), namespace, name);
        let obj = deadline("get", self.config.get_timeout, self.store.get(&key)).await.map_err(|e| match e {
            StoreError::NotFound { .. } => IntegrationError::not_found("integration", NamespacedName::new(namespace, name)),
            other => IntegrationError::store(format!("fail to get the integration {}", name), other),
        })?;
        from_dynamic(&obj).map_err(|e| IntegrationError::store(format!("fail to decode the integration {}", name), e))
    }

    async fn apply_object(&self, obj: &kube::core::DynamicObject, opts: ApplyOptions, what: &str) -> IntegrationResult<kube::core::DynamicObject> {
        let t0 = Instant::now();
        let res = deadline("apply", self.config.get_timeout, self.store.apply(obj, opts)).await;
        histogram!("store_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res.map_err(|e| IntegrationError::store(format!("fail to apply the {}", what), e))
    }
}

#[async_trait::async_trait]
impl IntegrationFactory for Factory {
    fn parse_template(&self, default_name: &str, body: &str) -> IntegrationResult<Template> {
        parse_template(self.evaluator.as_ref(), default_name, body)
    }

    async fn load_template(&self, namespace: &str, name: &str) -> IntegrationResult<Template> {
        let key = ObjectKey::new(&ResourceType::config_map(), namespace, template_record_name(name));
        let obj = deadline("get", self.config.get_timeout, self.store.get(&key)).await.map_err(|e| match e {
            StoreError::NotFound { .. } => IntegrationError::not_found("integration template", NamespacedName::new(namespace, name)),
            other => IntegrationError::store(format!("fail to load the integration template {}", name), other),
        })?;
        let cm: ConfigMap = from_dynamic(&obj).map_err(|e| IntegrationError::store("fail to decode the integration template", e))?;
        Template::from_record(&cm)
    }

    async fn apply_template(&self, namespace: &str, template: &Template) -> IntegrationResult<()> {
        let t0 = Instant::now();
        let mut record = match &template.record {
            Some(cm) => cm.clone(),
            None => template.to_record()?,
        };
        record.metadata.namespace = Some(namespace.to_string());
        let obj = to_dynamic(&record).map_err(|e| IntegrationError::store("fail to encode the integration template", e))?;
        self.apply_object(&obj, ApplyOptions::disable_update_annotation(), "integration template").await?;
        counter!("template_apply_ok", 1u64);
        info!(ns = %namespace, name = %template.id.name, took_ms = %t0.elapsed().as_millis(), "api: apply_template ok");
        Ok(())
    }

    async fn delete_template(&self, namespace: &str, name: &str) -> IntegrationResult<()> {
        let key = ObjectKey::new(&ResourceType::config_map(), namespace, template_record_name(name));
        deadline("delete", self.config.get_timeout, self.store.delete(&key)).await.map_err(|e| match e {
            StoreError::NotFound { .. } => IntegrationError::not_found("integration template", NamespacedName::new(namespace, name)),
            other => IntegrationError::store(format!("fail to delete the integration template {}", name), other),
        })?;
        info!(ns = %namespace, name = %name, "api: delete_template ok");
        Ok(())
    }

    async fn list_templates(&self, namespace: &str, scope: Option<Scope>) -> IntegrationResult<Vec<Template>> {
        let t0 = Instant::now();
        let sel = LabelSelector::new().eq(keys::LABEL_CATALOG, keys::CATALOG_INTEGRATION);
        let items = deadline("list", self.config.list_timeout, self.store.list(&ResourceType::config_map(), namespace, &sel))
            .await
            .map_err(|e| IntegrationError::store("fail to list the integration templates", e))?;
        let mut out = Vec::with_capacity(items.len());
        for item in items.iter() {
            let parsed = from_dynamic::<ConfigMap>(item).map_err(|e| IntegrationError::store("decode", e)).and_then(|cm| Template::from_record(&cm));
            match parsed {
                Ok(t) if scope.map(|s| s == t.scope).unwrap_or(true) => out.push(t),
                Ok(_) => {}
                Err(e) => warn!(name = ?item.metadata.name, error = %e, "api: skip unparsable template record"),
            }
        }
        info!(ns = %namespace, scope = ?scope, items = out.len(), took_ms = %t0.elapsed().as_millis(), "api: list_templates ok");
        Ok(out)
    }

    async fn parse_integration(&self, template: &NamespacedName, metadata: Metadata) -> IntegrationResult<Integration> {
        let loaded = if template.name.is_empty() { None } else { Some(self.load_template(&template.namespace, &template.name).await?) };
        render_integration(self.evaluator.as_ref(), loaded, metadata, &self.config.control_namespace)
    }

    async fn apply_integration(&self, integration: &Integration) -> IntegrationResult<()> {
        let t0 = Instant::now();
        let res: IntegrationResult<()> = async {
            let primary = to_dynamic(&integration.secret).map_err(|e| IntegrationError::store("fail to encode the secret", e))?;
            let stored = self.apply_object(&primary, ApplyOptions::default(), "secret").await?;
            let owner = OwnerReference {
                api_version: "v1".into(),
                kind: "Secret".into(),
                name: stored.metadata.name.clone().unwrap_or_default(),
                uid: stored.metadata.uid.clone().unwrap_or_default(),
                ..Default::default()
            };
            for (key, obj) in integration.outputs.iter() {
                let mut obj = obj.clone();
                obj.metadata.owner_references = Some(vec![owner.clone()]);
                self.apply_object(&obj, ApplyOptions::default(), &format!("object {}", key)).await?;
            }
            if let Some(payload) = &integration.writer_payload {
                let mut errs = tessera_writer::write(self.sink.as_ref(), payload, self).await;
                if !errs.is_empty() {
                    for e in errs.iter().skip(1) { warn!(error = %e, "api: additional writer error"); }
                    return Err(IntegrationError::Writer(errs.remove(0)));
                }
            }
            Ok(())
        }
        .await;
        match &res {
            Ok(()) => {
                counter!("integration_apply_ok", 1u64);
                info!(id = %integration.metadata.id, outputs = integration.outputs.len(), took_ms = %t0.elapsed().as_millis(), "api: apply_integration ok");
            }
            Err(e) => {
                counter!("integration_apply_err", 1u64);
                warn!(id = %integration.metadata.id, error = %e, "api: apply_integration failed");
            }
        }
        res
    }

    async fn read_integration(&self, namespace: &str, name: &str) -> IntegrationResult<Properties> {
        let secret = self.get_secret(namespace, name).await?;
        if is_sensitive(&secret) {
            counter!("integration_sensitive_denied", 1u64);
            return Err(IntegrationError::Sensitive);
        }
        match secret.data.as_ref().and_then(|d| d.get(keys::INPUT_PROPERTIES)).filter(|r| !r.0.is_empty()) {
            Some(raw) => serde_json::from_slice(&raw.0).map_err(|e| IntegrationError::Invalid(format!("fail to parse the properties of {}: {}", name, e))),
            None => Ok(Properties::new()),
        }
    }

    async fn get_integration(&self, namespace: &str, name: &str) -> IntegrationResult<Integration> {
        let secret = self.get_secret(namespace, name).await?;
        if is_sensitive(&secret) {
            counter!("integration_sensitive_denied", 1u64);
            return Err(IntegrationError::Sensitive);
        }
        integration_from_secret(secret)
    }

    async fn list_integrations(&self, namespace: &str, template: Option<&str>, scope: Option<Scope>) -> IntegrationResult<Vec<Integration>> {
        let t0 = Instant::now();
        let mut sel = LabelSelector::new().eq(keys::LABEL_CATALOG, keys::CATALOG_INTEGRATION);
        if let Some(t) = template.filter(|t| !t.is_empty()) { sel = sel.eq(keys::LABEL_TYPE, t); }
        if let Some(s) = scope { sel = sel.eq(keys::LABEL_SCOPE, s.as_str()); }
        let items = deadline("list", self.config.scan_timeout, self.store.list(&ResourceType::secret(), namespace, &sel))
            .await
            .map_err(|e| IntegrationError::store("fail to list the integrations", e))?;
        let mut out = Vec::with_capacity(items.len());
        for item in items.iter() {
            let parsed = from_dynamic::<Secret>(item).map_err(|e| IntegrationError::store("decode", e)).and_then(integration_from_secret);
            match parsed {
                Ok(i) => out.push(i),
                Err(e) => warn!(name = ?item.metadata.name, error = %e, "api: skip unparsable integration secret"),
            }
        }
        info!(ns = %namespace, selector = %sel, items = out.len(), took_ms = %t0.elapsed().as_millis(), "api: list_integrations ok");
        Ok(out)
    }

    async fn delete_integration(&self, namespace: &str, name: &str) -> IntegrationResult<()> {
        let secret = self.get_secret(namespace, name).await?;
        let catalog = secret.metadata.labels.as_ref().and_then(|l| l.get(keys::LABEL_CATALOG)).map(String::as_str);
        if catalog != Some(keys::CATALOG_INTEGRATION) {
            return Err(IntegrationError::Invalid(format!("found a secret {} but it is not an integration", name)));
        }
        let refs = crate::object_references(&secret)?;
        for r in refs.iter() {
            let key = ObjectKey::from(r);
            match deadline("delete", self.config.get_timeout, self.store.delete(&key)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => info!(key = %key, "api: referenced object already gone"),
                Err(e) => return Err(IntegrationError::store(format!("fail to clear the object {}", key.name), e)),
            }
        }
        let key = ObjectKey::new(&ResourceType::secret(), namespace, name);
        deadline("delete", self.config.get_timeout, self.store.delete(&key))
            .await
            .map_err(|e| IntegrationError::store(format!("fail to delete the integration {}", name), e))?;
        counter!("integration_delete_ok", 1u64);
        info!(ns = %namespace, name = %name, refs = refs.len(), "api: delete_integration ok");
        Ok(())
    }

    async fn apply_distribution(&self, namespace: &str, name: &str, spec: &ApplyDistributionSpec) -> IntegrationResult<()> {
        let t0 = Instant::now();
        let app = compose_application(namespace, name, spec)?;
        self.apply_object(&app, ApplyOptions::default(), "integration distribution").await?;
        counter!("distribution_apply_ok", 1u64);
        info!(ns = %namespace, name = %name, targets = spec.targets.len(), integrations = spec.integrations.len(), took_ms = %t0.elapsed().as_millis(), "api: apply_distribution ok");
        Ok(())
    }

    async fn list_distributions(&self, namespace: &str) -> IntegrationResult<Vec<Distribution>> {
        let sel = LabelSelector::new()
            .eq(keys::LABEL_SOURCE_OF_TRUTH, keys::FROM_INNER)
            .eq(keys::LABEL_CATALOG, keys::CATALOG_DISTRIBUTION);
        let items = deadline("list", self.config.scan_timeout, self.store.list(&application_type(), namespace, &sel))
            .await
            .map_err(|e| IntegrationError::store("fail to list the integration distributions", e))?;
        Ok(items.iter().map(distribution_from_object).collect())
    }

    async fn delete_distribution(&self, namespace: &str, name: &str) -> IntegrationResult<()> {
        let key = ObjectKey::new(&application_type(), namespace, name);
        deadline("delete", self.config.get_timeout, self.store.delete(&key)).await.map_err(|e| match e {
            StoreError::NotFound { .. } => IntegrationError::not_found("integration distribution", NamespacedName::new(namespace, name)),
            other => IntegrationError::store(format!("fail to delete the integration distribution {}", name), other),
        })?;
        info!(ns = %namespace, name = %name, "api: delete_distribution ok");
        Ok(())
    }
}

/// Read-integration callback handed to writers; sensitivity is enforced by the factory.
#[async_trait::async_trait]
impl IntegrationReader for Factory {
    async fn read_integration(&self, namespace: &str, name: &str) -> anyhow::Result<Properties> {
        Ok(<Self as IntegrationFactory>::read_integration(self, namespace, name).await?)
    }
}
