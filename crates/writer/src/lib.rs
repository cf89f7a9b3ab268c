//! Tessera expanded writer: templates may declare `template.writers` targets whose
//! rendered content is delivered to systems outside the object store.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tessera_core::{NamespacedName, Properties, RenderContext};
use tessera_script::{Script, ScriptError, ScriptEvaluator};
use tracing::{debug, info, warn};

/// Encoding applied to a rendered writer content.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    #[default]
    Json,
    Yaml,
    Properties,
}

impl ContentFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContentFormat::Json => "json",
            ContentFormat::Yaml => "yaml",
            ContentFormat::Properties => "properties",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriterTarget {
    pub name: String,
    #[serde(default)]
    pub format: ContentFormat,
    /// Integration holding the connection properties of the external system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<NamespacedName>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriterConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<WriterTarget>,
}

impl WriterConfig {
    pub fn is_empty(&self) -> bool { self.targets.is_empty() }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriterItem {
    pub target: String,
    pub format: ContentFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<NamespacedName>,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriterPayload {
    pub items: Vec<WriterItem>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WriterError {
    #[error("fail to render the content of writer {target}: {source}")]
    Render { target: String, #[source] source: ScriptError },
    #[error("fail to encode the content of writer {target}: {reason}")]
    Encode { target: String, reason: String },
    #[error("fail to read the server {server} of writer {target}: {reason}")]
    Server { target: String, server: NamespacedName, reason: String },
    #[error("fail to write {target}: {reason}")]
    Sink { target: String, reason: String },
}

/// Read-integration callback handed to writers; must honor sensitivity.
#[async_trait::async_trait]
pub trait IntegrationReader: Send + Sync {
    async fn read_integration(&self, namespace: &str, name: &str) -> anyhow::Result<Properties>;
}

/// Delivery end of the writer pipeline.
#[async_trait::async_trait]
pub trait WriterSink: Send + Sync {
    async fn write(&self, item: &WriterItem, server: Option<&Properties>) -> Result<(), WriterError>;
}

/// Build the writer configuration from the `template` value of a script.
/// Malformed targets are skipped; absence yields an empty config.
pub fn parse_config(template: Option<&Json>) -> WriterConfig {
    let writers = match template.and_then(|t| t.get("writers")).and_then(|w| w.as_object()) {
        Some(w) => w,
        None => return WriterConfig::default(),
    };
    let mut targets = Vec::with_capacity(writers.len());
    for (name, spec) in writers.iter() {
        let format = match spec.get("format") {
            None => ContentFormat::default(),
            Some(f) => match serde_json::from_value::<ContentFormat>(f.clone()) {
                Ok(f) => f,
                Err(e) => { warn!(writer = %name, error = %e, "writer: unsupported format; skipping"); continue; }
            },
        };
        let server = match spec.get("server") {
            None | Some(Json::Null) => None,
            Some(s) => match serde_json::from_value::<NamespacedName>(s.clone()) {
                Ok(s) => Some(s),
                Err(e) => { warn!(writer = %name, error = %e, "writer: invalid server reference; skipping"); continue; }
            },
        };
        targets.push(WriterTarget { name: name.clone(), format, server });
    }
    WriterConfig { targets }
}

/// Render every configured target. Targets whose content is absent are skipped.
pub fn render(
    evaluator: &dyn ScriptEvaluator,
    config: &WriterConfig,
    script: &Script,
    context: &RenderContext,
    properties: &Properties,
) -> Result<Option<WriterPayload>, WriterError> {
    if config.is_empty() { return Ok(None); }
    let mut items = Vec::with_capacity(config.targets.len());
    for target in config.targets.iter() {
        let path = ["template", "writers", target.name.as_str(), "content"];
        let content = evaluator
            .evaluate(script, context, properties, &path)
            .map_err(|source| WriterError::Render { target: target.name.clone(), source })?;
        let Some(content) = content else {
            debug!(writer = %target.name, "writer: no content declared");
            continue;
        };
        let server = target.server.clone().map(|mut s| {
            if s.namespace.is_empty() { s.namespace = context.namespace.clone(); }
            s
        });
        items.push(WriterItem {
            target: target.name.clone(),
            format: target.format,
            server,
            content: encode(&target.name, target.format, &content)?,
        });
    }
    if items.is_empty() { Ok(None) } else { Ok(Some(WriterPayload { items })) }
}

fn encode(target: &str, format: ContentFormat, content: &Json) -> Result<String, WriterError> {
    let err = |reason: String| WriterError::Encode { target: target.to_string(), reason };
    match format {
        ContentFormat::Json => serde_json::to_string_pretty(content).map_err(|e| err(e.to_string())),
        ContentFormat::Yaml => serde_yaml::to_string(content).map_err(|e| err(e.to_string())),
        ContentFormat::Properties => {
            let Json::Object(_) = content else { return Err(err("properties content must be a mapping".into())) };
            let mut lines = Vec::new();
            flatten("", content, &mut lines);
            lines.sort();
            Ok(lines.join("\n") + "\n")
        }
    }
}

fn flatten(prefix: &str, v: &Json, out: &mut Vec<String>) {
    match v {
        Json::Object(map) => {
            for (k, vv) in map.iter() {
                let key = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
                flatten(&key, vv, out);
            }
        }
        Json::String(s) => out.push(format!("{}={}", prefix, s)),
        Json::Null => out.push(format!("{}=", prefix)),
        other => out.push(format!("{}={}", prefix, other)),
    }
}

/// Deliver every item; errors are collected, the caller decides which are fatal.
pub async fn write(sink: &dyn WriterSink, payload: &WriterPayload, reader: &dyn IntegrationReader) -> Vec<WriterError> {
    let mut errs = Vec::new();
    for item in payload.items.iter() {
        let server = match &item.server {
            Some(s) => match reader.read_integration(&s.namespace, &s.name).await {
                Ok(p) => Some(p),
                Err(e) => {
                    errs.push(WriterError::Server { target: item.target.clone(), server: s.clone(), reason: e.to_string() });
                    continue;
                }
            },
            None => None,
        };
        match sink.write(item, server.as_ref()).await {
            Ok(()) => { counter!("writer_write_ok", 1u64); }
            Err(e) => {
                counter!("writer_write_err", 1u64);
                errs.push(e);
            }
        }
    }
    errs
}

/// Sink that only reports what would be written.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl WriterSink for LogSink {
    async fn write(&self, item: &WriterItem, server: Option<&Properties>) -> Result<(), WriterError> {
        info!(writer = %item.target, format = ?item.format, bytes = item.content.len(), server = server.is_some(), "writer: payload rendered");
        Ok(())
    }
}

/// Sink writing one `<target>.<ext>` file per item under `dir`.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    pub fn path_for(&self, item: &WriterItem) -> PathBuf {
        self.dir.join(format!("{}.{}", item.target, item.format.extension()))
    }
}

#[async_trait::async_trait]
impl WriterSink for FileSink {
    async fn write(&self, item: &WriterItem, _server: Option<&Properties>) -> Result<(), WriterError> {
        let err = |e: std::io::Error| WriterError::Sink { target: item.target.clone(), reason: e.to_string() };
        tokio::fs::create_dir_all(&self.dir).await.map_err(err)?;
        let path = self.path_for(item);
        tokio::fs::write(&path, item.content.as_bytes()).await.map_err(err)?;
        info!(writer = %item.target, path = %path.display(), "writer: file written");
        Ok(())
    }
}
