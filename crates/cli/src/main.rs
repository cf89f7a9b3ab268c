use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tessera_api::{Factory, FactoryConfig, IntegrationFactory, Metadata};
use tessera_core::{ApplyDistributionSpec, ClusterTarget, NamespacedName, Properties, Scope};
use tessera_kubehub::KubeStore;
use tessera_script::YamlScript;
use tessera_writer::{FileSink, LogSink, WriterSink};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tesseractl", version, about = "Tessera CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to operate in
    #[arg(long = "ns", global = true, env = "TESSERA_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ScopeArg { System, Namespace }

impl From<ScopeArg> for Scope {
    fn from(s: ScopeArg) -> Self {
        match s {
            ScopeArg::System => Scope::System,
            ScopeArg::Namespace => Scope::Namespace,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage integration templates
    #[command(subcommand)]
    Template(TemplateCmd),
    /// Manage integrations
    #[command(subcommand)]
    Integration(IntegrationCmd),
    /// Manage integration distributions
    #[command(subcommand)]
    Dist(DistCmd),
}

#[derive(Subcommand, Debug)]
enum TemplateCmd {
    /// Register a template from a script file
    Apply {
        /// Script file ("-" for stdin)
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Name used when the script metadata carries none
        #[arg(long = "name", default_value = "")]
        name: String,
    },
    /// List templates
    Ls {
        #[arg(long = "scope", value_enum)]
        scope: Option<ScopeArg>,
    },
    /// Show one template
    Get { name: String },
    /// Delete a template
    Rm { name: String },
}

#[derive(Args, Debug)]
struct IntegrationInput {
    /// Integration name
    name: String,
    /// Template name; omit for a raw integration
    #[arg(short = 't', long = "template", default_value = "")]
    template: String,
    /// Namespace of the template (defaults to --ns)
    #[arg(long = "template-ns")]
    template_ns: Option<String>,
    /// Property as key=value; value is read as YAML, dotted keys nest
    #[arg(short = 'p', long = "prop")]
    props: Vec<String>,
    /// YAML or JSON file with properties, merged under --prop
    #[arg(long = "props-file")]
    props_file: Option<String>,
    #[arg(long = "alias", default_value = "")]
    alias: String,
    #[arg(long = "description", default_value = "")]
    description: String,
}

#[derive(Subcommand, Debug)]
enum IntegrationCmd {
    /// Render and store an integration
    Apply(IntegrationInput),
    /// Render an integration and print it without storing
    Render(IntegrationInput),
    /// Print the input properties of an integration
    Read { name: String },
    /// Show one integration
    Get { name: String },
    /// List integrations
    Ls {
        #[arg(short = 't', long = "template")]
        template: Option<String>,
        #[arg(long = "scope", value_enum)]
        scope: Option<ScopeArg>,
    },
    /// Delete an integration and the objects it owns
    Rm { name: String },
}

#[derive(Subcommand, Debug)]
enum DistCmd {
    /// Place integrations onto cluster targets
    Apply {
        name: String,
        /// Integration as name or ns/name (repeatable)
        #[arg(short = 'i', long = "integration", required = true)]
        integrations: Vec<String>,
        /// Target as cluster/namespace (repeatable)
        #[arg(long = "to", required = true)]
        targets: Vec<String>,
    },
    /// List distributions
    Ls,
    /// Delete a distribution
    Rm { name: String },
}

fn init_tracing() {
    let env = std::env::var("TESSERA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TESSERA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TESSERA_METRICS_ADDR; expected host:port");
        }
    }
}

fn writer_sink() -> Arc<dyn WriterSink> {
    match std::env::var("TESSERA_WRITER_DIR") {
        Ok(dir) if !dir.is_empty() => Arc::new(FileSink::new(dir)),
        _ => Arc::new(LogSink),
    }
}

/// `ns/name`, or a bare `name` in `default_ns`.
fn parse_ref(s: &str, default_ns: &str) -> Result<NamespacedName> {
    match s.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(NamespacedName::new(ns, name)),
        Some(_) => Err(anyhow!("invalid reference {:?}; expected name or ns/name", s)),
        None if !s.is_empty() => Ok(NamespacedName::new(default_ns, s)),
        None => Err(anyhow!("empty reference")),
    }
}

fn parse_target(s: &str) -> Result<ClusterTarget> {
    match s.split_once('/') {
        Some((cluster, ns)) if !cluster.is_empty() && !ns.is_empty() => Ok(ClusterTarget::new(cluster, ns)),
        _ => Err(anyhow!("invalid target {:?}; expected cluster/namespace", s)),
    }
}

fn insert_path(props: &mut Properties, key: &str, value: serde_json::Value) -> Result<()> {
    let mut parts = key.split('.').peekable();
    let mut cur = props;
    while let Some(part) = parts.next() {
        if part.is_empty() {
            return Err(anyhow!("invalid property key {:?}", key));
        }
        if parts.peek().is_none() {
            cur.insert(part.to_string(), value);
            return Ok(());
        }
        let slot = cur.entry(part.to_string()).or_insert_with(|| serde_json::Value::Object(Default::default()));
        cur = slot.as_object_mut().ok_or_else(|| anyhow!("property {:?} is not an object", part))?;
    }
    Ok(())
}

/// Fold `key=value` pairs over an optional base map.
fn parse_props(pairs: &[String], base: Option<Properties>) -> Result<Properties> {
    let mut props = base.unwrap_or_default();
    for pair in pairs {
        let (k, v) = pair.split_once('=').ok_or_else(|| anyhow!("invalid property {:?}; expected key=value", pair))?;
        let value: serde_json::Value = if v.is_empty() {
            serde_json::Value::String(String::new())
        } else {
            serde_yaml::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.to_string()))
        };
        insert_path(&mut props, k.trim(), value)?;
    }
    Ok(props)
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        return std::io::read_to_string(std::io::stdin()).context("read stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("read {}", path))
}

fn metadata_of(input: &IntegrationInput, ns: &str) -> Result<Metadata> {
    let base = match &input.props_file {
        Some(path) => {
            let raw = read_input(path)?;
            let v: serde_json::Value = serde_yaml::from_str(&raw).with_context(|| format!("parse {}", path))?;
            match v {
                serde_json::Value::Object(m) => Some(m),
                serde_json::Value::Null => None,
                _ => return Err(anyhow!("{} must hold a map of properties", path)),
            }
        }
        None => None,
    };
    Ok(Metadata {
        id: NamespacedName::new(ns, input.name.clone()),
        alias: input.alias.clone(),
        description: input.description.clone(),
        properties: parse_props(&input.props, base)?,
    })
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn render_age(created: Option<DateTime<Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_str();

    let t0 = Instant::now();
    let store = KubeStore::try_default().await.context("connect to the cluster")?;
    let factory = Factory::new(Arc::new(store), Arc::new(YamlScript), writer_sink(), FactoryConfig::from_env());
    info!(ns = %ns, control_ns = %factory.config().control_namespace, took_ms = %t0.elapsed().as_millis(), "factory ready");

    match cli.command {
        Commands::Template(cmd) => match cmd {
            TemplateCmd::Apply { file, name } => {
                let body = read_input(&file)?;
                let t = factory.parse_template(&name, &body)?;
                factory.apply_template(ns, &t).await?;
                println!("template {}/{} applied", ns, t.id.name);
            }
            TemplateCmd::Ls { scope } => {
                let items = factory.list_templates(ns, scope.map(Scope::from)).await?;
                match cli.output {
                    Output::Human => {
                        println!("{:<24} {:<10} {:<9} {:<6} DESCRIPTION", "NAME", "SCOPE", "SENSITIVE", "AGE");
                        for t in items {
                            println!("{:<24} {:<10} {:<9} {:<6} {}", t.id.name, t.scope, t.sensitive, render_age(t.create_time), t.description);
                        }
                    }
                    Output::Json => print_json(&items)?,
                }
            }
            TemplateCmd::Get { name } => {
                let t = factory.load_template(ns, &name).await?;
                match cli.output {
                    Output::Human => {
                        println!("name: {}\nscope: {}\nsensitive: {}\nalias: {}\ndescription: {}", t.id, t.scope, t.sensitive, t.alias, t.description);
                        if !t.writer.targets.is_empty() {
                            let names: Vec<_> = t.writer.targets.iter().map(|w| w.name.as_str()).collect();
                            println!("writers: {}", names.join(", "));
                        }
                        println!("---\n{}", t.body.as_str().trim_end());
                    }
                    Output::Json => print_json(&t)?,
                }
            }
            TemplateCmd::Rm { name } => {
                factory.delete_template(ns, &name).await?;
                println!("template {}/{} deleted", ns, name);
            }
        },
        Commands::Integration(cmd) => match cmd {
            IntegrationCmd::Apply(input) => {
                let tmpl = NamespacedName::new(input.template_ns.clone().unwrap_or_else(|| ns.to_string()), input.template.clone());
                let i = factory.parse_integration(&tmpl, metadata_of(&input, ns)?).await?;
                factory.apply_integration(&i).await?;
                println!("integration {} applied", i.metadata.id);
            }
            IntegrationCmd::Render(input) => {
                let tmpl = NamespacedName::new(input.template_ns.clone().unwrap_or_else(|| ns.to_string()), input.template.clone());
                let i = factory.parse_integration(&tmpl, metadata_of(&input, ns)?).await?;
                match cli.output {
                    Output::Human => {
                        println!("{}", serde_yaml::to_string(&i.secret)?);
                        for obj in i.outputs.values() {
                            println!("---\n{}", serde_yaml::to_string(obj)?);
                        }
                    }
                    Output::Json => print_json(&i)?,
                }
            }
            IntegrationCmd::Read { name } => {
                let props = factory.read_integration(ns, &name).await?;
                match cli.output {
                    Output::Human => print!("{}", serde_yaml::to_string(&props)?),
                    Output::Json => print_json(&props)?,
                }
            }
            IntegrationCmd::Get { name } => {
                let i = factory.get_integration(ns, &name).await?;
                match cli.output {
                    Output::Human => {
                        let template = if i.template.id.name.is_empty() { "-" } else { i.template.id.name.as_str() };
                        println!("name: {}\ntemplate: {}\nalias: {}\ndescription: {}", i.metadata.id, template, i.metadata.alias, i.metadata.description);
                        for r in i.references()? {
                            println!("owns: {} {}/{}", r.kind.unwrap_or_default(), r.namespace.unwrap_or_default(), r.name.unwrap_or_default());
                        }
                    }
                    Output::Json => print_json(&i)?,
                }
            }
            IntegrationCmd::Ls { template, scope } => {
                let items = factory.list_integrations(ns, template.as_deref(), scope.map(Scope::from)).await?;
                match cli.output {
                    Output::Human => {
                        println!("{:<11} {:<24} {:<20} {:<9} AGE", "NAMESPACE", "NAME", "TEMPLATE", "SENSITIVE");
                        for i in items {
                            let template = if i.template.id.name.is_empty() { "-" } else { i.template.id.name.as_str() };
                            println!("{:<11} {:<24} {:<20} {:<9} {}", i.metadata.id.namespace, i.metadata.id.name, template, i.is_sensitive(), render_age(i.create_time));
                        }
                    }
                    Output::Json => print_json(&items)?,
                }
            }
            IntegrationCmd::Rm { name } => {
                factory.delete_integration(ns, &name).await?;
                println!("integration {}/{} deleted", ns, name);
            }
        },
        Commands::Dist(cmd) => match cmd {
            DistCmd::Apply { name, integrations, targets } => {
                let spec = ApplyDistributionSpec {
                    integrations: integrations.iter().map(|s| parse_ref(s, ns)).collect::<Result<_>>()?,
                    targets: targets.iter().map(|s| parse_target(s)).collect::<Result<_>>()?,
                };
                factory.apply_distribution(ns, &name, &spec).await?;
                println!("distribution {}/{} applied", ns, name);
            }
            DistCmd::Ls => {
                let items = factory.list_distributions(ns).await?;
                match cli.output {
                    Output::Human => {
                        println!("{:<24} {:<32} {:<32} AGE", "NAME", "INTEGRATIONS", "TARGETS");
                        for d in items {
                            let refs: Vec<_> = d.integrations.iter().map(|r| r.to_string()).collect();
                            let targets: Vec<_> = d.targets.iter().map(|t| format!("{}/{}", t.cluster_name, t.namespace)).collect();
                            println!("{:<24} {:<32} {:<32} {}", d.name, refs.join(","), targets.join(","), render_age(d.created_time));
                        }
                    }
                    Output::Json => print_json(&items)?,
                }
            }
            DistCmd::Rm { name } => {
                factory.delete_distribution(ns, &name).await?;
                println!("distribution {}/{} deleted", ns, name);
            }
        },
    }

    Ok(())
}
