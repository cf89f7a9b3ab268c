//! Tessera script: the template evaluation contract plus a YAML evaluator.
//!
//! Evaluators answer three questions about a template body: what value sits at a
//! path after binding a context and properties (`evaluate`), what value sits at a
//! path before any binding (`lookup`), and what property shape the template
//! declares (`property_schema`). "Field not found" is `Ok(None)`, never an error.

#![forbid(unsafe_code)]

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tessera_core::{Properties, RenderContext};
use tracing::debug;

/// Default path of the primary output inside a template.
pub const OUTPUT_PATH: &[&str] = &["template", "output"];
/// Path of the auxiliary outputs map inside a template.
pub const OUTPUTS_PATH: &[&str] = &["template", "outputs"];
/// Path of the declared parameters inside a template.
pub const PARAMETER_PATH: &[&str] = &["template", "parameter"];

/// Raw template body. Immutable once stored under an identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Script(String);

impl Script {
    pub fn new(body: impl Into<String>) -> Self { Self(body.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<String> for Script {
    fn from(s: String) -> Self { Self(s) }
}

impl From<&str> for Script {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("the script is invalid: {0}")]
    Syntax(String),
    #[error("reference {0} is not bound")]
    Unbound(String),
    #[error("{path}: expected {expected}")]
    Type { path: String, expected: &'static str },
}

/// `Ok(Some(v))` found, `Ok(None)` field not present, `Err` genuine failure.
pub type Eval<T> = Result<Option<T>, ScriptError>;

/// Template evaluation capability. Implementations must not perform I/O.
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate the value at `path` with `context` and `properties` bound.
    fn evaluate(&self, script: &Script, context: &RenderContext, properties: &Properties, path: &[&str]) -> Eval<Json>;

    /// Declared property shape as a JSON schema; `Ok(None)` when nothing is declared.
    fn property_schema(&self, script: &Script) -> Eval<Json>;

    /// Raw value at `path`, without binding anything.
    fn lookup(&self, script: &Script, path: &[&str]) -> Eval<Json>;
}

fn max_script_bytes() -> usize {
    std::env::var("TESSERA_MAX_SCRIPT_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}").expect("reference regex")
});

/// YAML template evaluator.
///
/// ```yaml
/// metadata:
///   name: db
///   scope: Namespace
/// template:
///   parameter:
///     pwd: null          # required
///     port: 5432         # defaulted
///   output:
///     type: Opaque
///     stringData:
///       password: ${parameter.pwd}
/// ```
///
/// A string that is exactly one `${...}` reference takes the referenced value
/// (and its type); otherwise references are interpolated as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlScript;

impl YamlScript {
    pub fn new() -> Self { Self }

    fn parse(script: &Script) -> Result<Json, ScriptError> {
        if script.len() > max_script_bytes() {
            return Err(ScriptError::Syntax(format!("script too large (>{} bytes)", max_script_bytes())));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(script.as_str()).map_err(|e| ScriptError::Syntax(e.to_string()))?;
        let json = serde_json::to_value(val).map_err(|e| ScriptError::Syntax(e.to_string()))?;
        match json {
            Json::Object(_) => Ok(json),
            Json::Null => Ok(Json::Object(Map::new())),
            _ => Err(ScriptError::Syntax("the top level must be a mapping".into())),
        }
    }
}

impl ScriptEvaluator for YamlScript {
    fn evaluate(&self, script: &Script, context: &RenderContext, properties: &Properties, path: &[&str]) -> Eval<Json> {
        let root = Self::parse(script)?;
        let target = match descend(&root, path) {
            Some(v) if !v.is_null() => v,
            _ => {
                debug!(path = %path.join("."), "script: evaluated path not present");
                return Ok(None);
            }
        };
        let mut parameter = match descend(&root, PARAMETER_PATH) {
            Some(Json::Object(defaults)) => Json::Object(defaults.clone()),
            _ => Json::Object(Map::new()),
        };
        merge(&mut parameter, &Json::Object(properties.clone()));
        let bindings = Bindings { parameter, context: context.to_value() };
        bindings.resolve(target).map(Some)
    }

    fn property_schema(&self, script: &Script) -> Eval<Json> {
        let root = Self::parse(script)?;
        match descend(&root, PARAMETER_PATH) {
            None | Some(Json::Null) => Ok(None),
            Some(v @ Json::Object(_)) => Ok(Some(schema_of(v))),
            Some(_) => Err(ScriptError::Type { path: PARAMETER_PATH.join("."), expected: "a mapping" }),
        }
    }

    fn lookup(&self, script: &Script, path: &[&str]) -> Eval<Json> {
        let root = Self::parse(script)?;
        let found = descend(&root, path).filter(|v| !v.is_null()).cloned();
        if found.is_none() {
            debug!(path = %path.join("."), "script: lookup path not present");
        }
        Ok(found)
    }
}

/// Follow object keys along `path`.
pub fn descend<'a>(root: &'a Json, path: &[&str]) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path {
        cur = cur.as_object()?.get(*seg)?;
    }
    Some(cur)
}

/// Deep-merge `over` into `base`; objects merge key-wise, everything else replaces.
fn merge(base: &mut Json, over: &Json) {
    match (base, over) {
        (Json::Object(b), Json::Object(o)) => {
            for (k, ov) in o.iter() {
                match b.get_mut(k) {
                    Some(bv) => merge(bv, ov),
                    None => { b.insert(k.clone(), ov.clone()); }
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

struct Bindings {
    parameter: Json,
    context: Json,
}

impl Bindings {
    fn reference(&self, expr: &str) -> Result<&Json, ScriptError> {
        let mut segs = expr.split('.');
        let root = match segs.next() {
            Some("parameter") => &self.parameter,
            Some("context") => &self.context,
            _ => return Err(ScriptError::Unbound(expr.to_string())),
        };
        let rest: Vec<&str> = segs.collect();
        match descend(root, &rest) {
            Some(v) if !v.is_null() => Ok(v),
            _ => Err(ScriptError::Unbound(expr.to_string())),
        }
    }

    fn resolve(&self, v: &Json) -> Result<Json, ScriptError> {
        match v {
            Json::String(s) => self.resolve_str(s),
            Json::Array(items) => items.iter().map(|i| self.resolve(i)).collect::<Result<Vec<_>, _>>().map(Json::Array),
            Json::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, vv) in map.iter() {
                    let key = match self.resolve_str(k)? {
                        Json::String(s) => s,
                        other => render_scalar(&other),
                    };
                    out.insert(key, self.resolve(vv)?);
                }
                Ok(Json::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, s: &str) -> Result<Json, ScriptError> {
        // Whole-string reference keeps the referenced type
        if let Some(caps) = REFERENCE.captures(s) {
            if let (Some(all), Some(expr)) = (caps.get(0), caps.get(1)) {
                if all.start() == 0 && all.end() == s.len() {
                    return self.reference(expr.as_str()).cloned();
                }
            }
        }
        let mut out = String::with_capacity(s.len());
        let mut last = 0usize;
        for caps in REFERENCE.captures_iter(s) {
            let (Some(all), Some(expr)) = (caps.get(0), caps.get(1)) else { continue };
            out.push_str(&s[last..all.start()]);
            out.push_str(&render_scalar(self.reference(expr.as_str())?));
            last = all.end();
        }
        out.push_str(&s[last..]);
        Ok(Json::String(out))
    }
}

fn render_scalar(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

fn schema_of(v: &Json) -> Json {
    match v {
        Json::Null => serde_json::json!({}),
        Json::Bool(b) => serde_json::json!({ "type": "boolean", "default": b }),
        Json::Number(n) => {
            let ty = if n.is_f64() { "number" } else { "integer" };
            serde_json::json!({ "type": ty, "default": n })
        }
        Json::String(s) => serde_json::json!({ "type": "string", "default": s }),
        Json::Array(items) => {
            let mut out = serde_json::json!({ "type": "array" });
            if let Some(first) = items.first() { out["items"] = schema_of(first); }
            out
        }
        Json::Object(map) => {
            let mut props = Map::new();
            let mut required = Vec::new();
            for (k, vv) in map.iter() {
                props.insert(k.clone(), schema_of(vv));
                if vv.is_null() { required.push(Json::String(k.clone())); }
            }
            let mut out = serde_json::json!({ "type": "object", "properties": props });
            if !required.is_empty() { out["required"] = Json::Array(required); }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DB: &str = r#"
metadata:
  name: db
  alias: Database
  scope: Namespace
  sensitive: false
template:
  parameter:
    pwd: null
    port: 5432
  output:
    type: Opaque
    stringData:
      password: ${parameter.pwd}
      url: "db://${context.name}.${context.namespace}:${parameter.port}"
      port: ${parameter.port}
"#;

    fn ctx() -> RenderContext { RenderContext { name: "a".into(), namespace: "ns".into() } }

    fn props(v: Json) -> Properties { v.as_object().cloned().unwrap_or_default() }

    #[test]
    fn evaluate_binds_properties_and_context() {
        let out = YamlScript.evaluate(&Script::from(DB), &ctx(), &props(json!({"pwd": "x"})), OUTPUT_PATH).unwrap().unwrap();
        assert_eq!(out["stringData"]["password"], json!("x"));
        assert_eq!(out["stringData"]["url"], json!("db://a.ns:5432"));
        // whole-string reference keeps the number
        assert_eq!(out["stringData"]["port"], json!(5432));
    }

    #[test]
    fn properties_override_parameter_defaults() {
        let out = YamlScript.evaluate(&Script::from(DB), &ctx(), &props(json!({"pwd": "x", "port": 1})), OUTPUT_PATH).unwrap().unwrap();
        assert_eq!(out["stringData"]["url"], json!("db://a.ns:1"));
    }

    #[test]
    fn missing_required_property_is_an_error() {
        let err = YamlScript.evaluate(&Script::from(DB), &ctx(), &Properties::new(), OUTPUT_PATH).unwrap_err();
        assert_eq!(err, ScriptError::Unbound("parameter.pwd".into()));
    }

    #[test]
    fn absent_path_is_not_present() {
        let out = YamlScript.evaluate(&Script::from(DB), &ctx(), &Properties::new(), OUTPUTS_PATH).unwrap();
        assert!(out.is_none());
        assert!(YamlScript.lookup(&Script::from(DB), &["metadata", "description"]).unwrap().is_none());
        assert_eq!(YamlScript.lookup(&Script::from(DB), &["metadata", "alias"]).unwrap(), Some(json!("Database")));
    }

    #[test]
    fn schema_marks_null_parameters_required() {
        let schema = YamlScript.property_schema(&Script::from(DB)).unwrap().unwrap();
        assert_eq!(schema["type"], json!("object"));
        assert_eq!(schema["required"], json!(["pwd"]));
        assert_eq!(schema["properties"]["port"], json!({"type": "integer", "default": 5432}));
    }

    #[test]
    fn schema_rejects_non_mapping_parameter() {
        let s = Script::from("template:\n  parameter: [1, 2]\n");
        assert!(matches!(YamlScript.property_schema(&s), Err(ScriptError::Type { .. })));
        assert!(YamlScript.property_schema(&Script::from("metadata: {}\n")).unwrap().is_none());
    }

    #[test]
    fn malformed_yaml_is_a_syntax_error() {
        let s = Script::from("metadata: [unclosed\n");
        assert!(matches!(YamlScript.lookup(&s, &["metadata"]), Err(ScriptError::Syntax(_))));
        assert!(matches!(YamlScript.lookup(&Script::from("- a\n- b\n"), &["x"]), Err(ScriptError::Syntax(_))));
    }

    #[test]
    fn unknown_reference_root_is_unbound() {
        let s = Script::from("template:\n  output:\n    a: ${secret.x}\n");
        let err = YamlScript.evaluate(&s, &ctx(), &Properties::new(), OUTPUT_PATH).unwrap_err();
        assert_eq!(err, ScriptError::Unbound("secret.x".into()));
    }
}
