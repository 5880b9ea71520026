use std::io::Read;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use selectl_apply::{
    parse_resource_refs, resolve_manifest, resolve_named, run_batch, Applied, ApplyOptions,
    ObjectSink, RunMode, Target,
};
use selectl_core::{parse_selector, LABEL_VALUE_MAX_LEN};

fn long_about() -> String {
    format!(
        "Replace the label selector on a resource. Any selector the resource \
carried before the invocation is discarded, not merged.\n\n\
Selector keys and values must start and end with a letter or number and may \
contain hyphens, dots and underscores in between ({LABEL_VALUE_MAX_LEN} \
characters at most). When --resource-version is given, the update only \
succeeds if it still matches the live object. Selectors can currently only \
be set on Service objects."
    )
}

#[derive(Parser, Debug)]
#[command(
    name = "selectl",
    version,
    about = "Set the label selector on a resource",
    long_about = long_about()
)]
struct Cli {
    /// Resources (KIND NAME or KIND/NAME) followed by exactly one selector
    /// expression, e.g. `service my-svc 'env=qa'`
    #[arg(value_name = "ARGS", required = true)]
    args: Vec<String>,

    /// Manifest file(s) holding the target objects ('-' reads stdin)
    #[arg(short = 'f', long = "filename", value_name = "FILE")]
    filenames: Vec<String>,

    /// Never contact the api-server; mutate the manifest objects in memory
    #[arg(long = "local", action = ArgAction::SetTrue)]
    local: bool,

    /// Fetch and compute, print the result, but do not persist it
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Select every object of the given resource types in the namespace
    #[arg(long = "all", action = ArgAction::SetTrue)]
    all: bool,

    /// Record the invocation in the change-cause annotation after applying
    #[arg(long = "record", action = ArgAction::SetTrue)]
    record: bool,

    /// Only update if this is the current resource-version of the object
    /// (single resource only)
    #[arg(long = "resource-version", value_name = "VERSION")]
    resource_version: Option<String>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns")]
    namespace: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
    Name,
}

fn init_tracing() {
    let env = std::env::var("SELECTL_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SELECTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SELECTL_METRICS_ADDR; expected host:port");
        }
    }
}

/// The trailing positional is always the selector expression; everything
/// before it names resources.
fn split_args(args: &[String]) -> Result<(&[String], &str)> {
    match args.split_last() {
        Some((expr, rest)) => Ok((rest, expr.as_str())),
        None => bail!("one selector is required"),
    }
}

fn load_manifests(filenames: &[String]) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for f in filenames {
        let text = if f == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading manifest from stdin")?;
            buf
        } else {
            std::fs::read_to_string(f).with_context(|| format!("reading manifest {f}"))?
        };
        docs.extend(parse_manifest_docs(&text)?);
    }
    Ok(docs)
}

/// Decode a (possibly multi-document) YAML stream into JSON values.
fn parse_manifest_docs(text: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let v = serde_yaml::Value::deserialize(doc).context("parsing manifest YAML")?;
        if v.is_null() {
            continue;
        }
        docs.push(serde_json::to_value(v).context("converting manifest to JSON")?);
    }
    Ok(docs)
}

struct FormatSink {
    output: Output,
    dry_run: bool,
}

impl ObjectSink for FormatSink {
    fn emit(&mut self, target: &Target, applied: &Applied) -> Result<()> {
        match self.output {
            Output::Human => {
                let suffix = if self.dry_run { " (dry run)" } else { "" };
                println!(
                    "{}/{} selector updated{}",
                    target.kind.to_ascii_lowercase(),
                    target.name,
                    suffix
                );
            }
            Output::Json => println!("{}", serde_json::to_string_pretty(&applied.object)?),
            Output::Yaml => print!("---\n{}", serde_yaml::to_string(&applied.object)?),
            Output::Name => {
                println!("{}/{}", target.kind.to_ascii_lowercase(), target.name)
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let (resource_args, expr) = split_args(&cli.args)?;
    let selector = parse_selector(expr)?;
    let refs = parse_resource_refs(resource_args, cli.all)?;

    if cli.local && !refs.is_empty() {
        bail!("cannot specify resources by name when running locally; use -f with --local");
    }
    if refs.is_empty() && cli.filenames.is_empty() {
        bail!("one or more resources must be specified as KIND NAME or KIND/NAME, or via -f");
    }
    if cli.resource_version.is_some() && (refs.len() > 1 || cli.all) {
        bail!("--resource-version may only be used with a single resource");
    }

    let mode = if cli.local {
        RunMode::Local
    } else if cli.dry_run {
        RunMode::Preview
    } else {
        RunMode::Apply
    };
    let opts = ApplyOptions {
        mode,
        record: cli.record,
        resource_version: cli.resource_version.clone(),
        change_cause: std::env::args().collect::<Vec<_>>().join(" "),
    };

    let docs = load_manifests(&cli.filenames)?;
    let targets: Vec<Target> = if cli.local {
        docs.into_iter().map(|d| Target::local(d, cli.namespace.as_deref())).collect()
    } else {
        let (client, default_ns) = selectl_kubehub::client_with_default_ns().await?;
        let ns = cli.namespace.clone().unwrap_or(default_ns);
        info!(ns = %ns, resources = refs.len(), manifests = docs.len(), "resolving targets");
        let mut targets = resolve_named(client.clone(), &refs, &ns).await?;
        targets.extend(resolve_manifest(client, docs, cli.namespace.as_deref(), &ns).await?);
        targets
    };

    let mut sink = FormatSink { output: cli.output, dry_run: cli.dry_run };
    let outcome = run_batch(&targets, &selector, &opts, &mut sink).await?;

    for r in &outcome.results {
        for w in &r.warnings {
            eprintln!("warning: {w}");
        }
        if let Some(e) = &r.error {
            eprintln!("error: {}/{}: {:#}", r.kind.to_ascii_lowercase(), r.name, e);
        }
    }
    if outcome.failed() > 0 {
        bail!("{} of {} selector updates failed", outcome.failed(), outcome.results.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_about_names_the_value_length_limit() {
        assert!(long_about().contains(&LABEL_VALUE_MAX_LEN.to_string()));
    }

    #[test]
    fn split_args_takes_trailing_expression() {
        let args: Vec<String> =
            ["service", "my-svc", "env=qa"].iter().map(|s| s.to_string()).collect();
        let (resources, expr) = split_args(&args).expect("split");
        assert_eq!(resources, &args[..2]);
        assert_eq!(expr, "env=qa");
    }

    #[test]
    fn split_args_expression_only() {
        let args = vec!["env=qa".to_string()];
        let (resources, expr) = split_args(&args).expect("split");
        assert!(resources.is_empty());
        assert_eq!(expr, "env=qa");
    }

    #[test]
    fn split_args_empty_is_an_error() {
        assert!(split_args(&[]).is_err());
    }

    #[test]
    fn manifest_stream_decodes_multiple_documents() {
        let text = "apiVersion: v1\nkind: Service\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: b\n";
        let docs = parse_manifest_docs(text).expect("parse");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["metadata"]["name"], "a");
        assert_eq!(docs[1]["metadata"]["name"], "b");
    }

    #[test]
    fn manifest_stream_skips_empty_documents() {
        let text = "---\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: only\n";
        let docs = parse_manifest_docs(text).expect("parse");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn manifest_stream_rejects_bad_yaml() {
        assert!(parse_manifest_docs("foo: [unclosed").is_err());
    }
}
