//! selectl apply – patch calculation, per-object apply coordination and the
//! sequential batch driver.

#![forbid(unsafe_code)]

pub mod patch;

use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use selectl_core::set_object_selector;

const CHANGE_CAUSE_ANNOTATION: &str = "kubernetes.io/change-cause";

/// How far the workflow is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Never contact the server; operate on the supplied objects only.
    Local,
    /// Fetch live state and compute, but do not persist.
    Preview,
    /// Persist the computed patch against the live object.
    Apply,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub mode: RunMode,
    /// Stamp the change-cause annotation after a successful apply.
    pub record: bool,
    /// Optimistic-concurrency precondition for the primary patch only; the
    /// change-cause follow-up never carries it.
    pub resource_version: Option<String>,
    /// Invocation line recorded by the change-cause follow-up.
    pub change_cause: String,
}

/// One resolved object to visit, with its remote handle when applicable.
pub struct Target {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub object: Value,
    pub remote: Option<Api<DynamicObject>>,
}

impl Target {
    /// Local-only target built from a decoded manifest document.
    pub fn local(doc: Value, ns_override: Option<&str>) -> Self {
        let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
        let meta = doc.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let namespace = ns_override
            .map(str::to_string)
            .or_else(|| {
                meta.and_then(|m| m.get("namespace"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        Target { kind, name, namespace, object: doc, remote: None }
    }
}

/// Mutated (and possibly persisted) object handed to the output sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Applied {
    pub object: Value,
    pub new_rv: Option<String>,
    pub warnings: Vec<String>,
    pub persisted: bool,
}

/// Output sink: invoked exactly once per successfully-processed object.
pub trait ObjectSink {
    fn emit(&mut self, target: &Target, applied: &Applied) -> Result<()>;
}

/// Run the patch pipeline for one target: compute the minimal patch, then
/// either surface the mutated object (local/preview) or send the patch with a
/// strategic merge verb and refresh from the server's response.
pub async fn set_selector(
    target: &Target,
    selector: &LabelSelector,
    opts: &ApplyOptions,
) -> Result<Applied> {
    let t0 = std::time::Instant::now();
    counter!("selector_attempts", 1u64);

    let computed = patch::compute_patch(&target.object, |o| set_object_selector(o, selector))?;

    if opts.mode != RunMode::Apply {
        counter!("selector_local_ok", 1u64);
        return Ok(Applied { object: computed.object, new_rv: None, warnings: vec![], persisted: false });
    }

    let api = target
        .remote
        .as_ref()
        .ok_or_else(|| anyhow!("no remote handle for {}/{}", target.kind, target.name))?;

    let mut patch_doc: Value =
        serde_json::from_slice(&computed.patch).context("reparsing patch document")?;
    if let Some(rv) = opts.resource_version.as_deref() {
        set_resource_version(&mut patch_doc, rv);
    }

    let pp = PatchParams::default();
    let patched = match api.patch(&target.name, &pp, &Patch::Strategic(&patch_doc)).await {
        Ok(o) => o,
        Err(e) => {
            counter!("selector_apply_err", 1u64);
            return Err(anyhow!("patching {}/{} failed: {}", target.kind, target.name, e));
        }
    };

    let mut warnings = Vec::new();
    let mut refreshed = patched;
    if opts.record || has_change_cause(&refreshed) {
        // Best-effort follow-up: the primary mutation is durable at this
        // point, so a failure here downgrades to a warning.
        match record_change_cause(api, &target.name, &opts.change_cause).await {
            Ok(obj) => refreshed = obj,
            Err(e) => {
                warn!(kind = %target.kind, name = %target.name, error = %e, "change cause not recorded");
                warnings.push(format!(
                    "changes to {}/{} can't be recorded: {}",
                    target.kind, target.name, e
                ));
            }
        }
    }

    let new_rv = refreshed.metadata.resource_version.clone();
    let object = serde_json::to_value(&refreshed).context("serializing refreshed object")?;
    histogram!("selector_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("selector_apply_ok", 1u64);
    Ok(Applied { object, new_rv, warnings, persisted: true })
}

fn set_resource_version(patch_doc: &mut Value, rv: &str) {
    if let Some(root) = patch_doc.as_object_mut() {
        let meta = root
            .entry("metadata".to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
        }
    }
}

fn has_change_cause(obj: &DynamicObject) -> bool {
    obj.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(CHANGE_CAUSE_ANNOTATION))
        .unwrap_or(false)
}

/// Fetch, stamp the change-cause annotation, and replace. Runs after the
/// primary patch succeeded and never rolls it back.
async fn record_change_cause(
    api: &Api<DynamicObject>,
    name: &str,
    cause: &str,
) -> Result<DynamicObject> {
    let mut latest = api.get(name).await?;
    latest
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CHANGE_CAUSE_ANNOTATION.to_string(), cause.to_string());
    let replaced = api.replace(name, &PostParams::default(), &latest).await?;
    Ok(replaced)
}

/// Explicit resource reference from the invocation arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: String,
    /// None selects every object of the kind (the `--all` form).
    pub name: Option<String>,
}

/// Turn resource arguments into refs. Tokens are either `KIND/NAME`, or a
/// bare type followed by one or more names; with `all` set, only bare types
/// are accepted and each selects every object of that type.
pub fn parse_resource_refs(args: &[String], all: bool) -> Result<Vec<ResourceRef>> {
    let mut refs = Vec::new();
    let mut current_kind: Option<String> = None;
    let mut names_seen = false;
    for arg in args {
        if let Some((kind, name)) = arg.split_once('/') {
            if all {
                bail!("--all selects every object of a type; drop the name in {arg:?}");
            }
            if kind.is_empty() || name.is_empty() {
                bail!("invalid resource {arg:?}; expected KIND/NAME");
            }
            refs.push(ResourceRef { kind: kind.to_string(), name: Some(name.to_string()) });
        } else if all {
            refs.push(ResourceRef { kind: arg.clone(), name: None });
        } else {
            match current_kind.as_ref() {
                None => current_kind = Some(arg.clone()),
                Some(kind) => {
                    names_seen = true;
                    refs.push(ResourceRef { kind: kind.clone(), name: Some(arg.clone()) });
                }
            }
        }
    }
    if current_kind.is_some() && !names_seen {
        bail!("resource name required (as KIND NAME or KIND/NAME), or pass --all");
    }
    Ok(refs)
}

/// Resolve explicit refs against the live cluster, fetching the latest copy
/// of each named object (or listing the kind for `--all` refs).
pub async fn resolve_named(
    client: Client,
    refs: &[ResourceRef],
    namespace: &str,
) -> Result<Vec<Target>> {
    let mut out = Vec::new();
    for r in refs {
        let (ar, namespaced) = selectl_kubehub::resolve_kind(client.clone(), &r.kind)
            .await
            .with_context(|| match r.name {
                Some(_) => format!("resolving resource type {:?}", r.kind),
                None => format!("resolving resource type {:?} (--all takes types, not names)", r.kind),
            })?;
        let api = selectl_kubehub::dynamic_api(client.clone(), &ar, namespaced, Some(namespace))?;
        match r.name.as_deref() {
            Some(name) => {
                let obj = api
                    .get(name)
                    .await
                    .with_context(|| format!("fetching {}/{}", ar.kind, name))?;
                out.push(remote_target(&ar.kind, namespaced, namespace, obj, api.clone())?);
            }
            None => {
                let list = api.list(&ListParams::default()).await?;
                info!(kind = %ar.kind, count = list.items.len(), "selected all objects of type");
                for obj in list.items {
                    out.push(remote_target(&ar.kind, namespaced, namespace, obj, api.clone())?);
                }
            }
        }
    }
    Ok(out)
}

/// Resolve manifest documents against the live cluster by their identity.
pub async fn resolve_manifest(
    client: Client,
    docs: Vec<Value>,
    ns_override: Option<&str>,
    default_ns: &str,
) -> Result<Vec<Target>> {
    let mut out = Vec::new();
    for doc in docs {
        let gvk = selectl_kubehub::gvk_of(&doc)?;
        let name = doc
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("manifest missing metadata.name"))?
            .to_string();
        let ns = ns_override
            .map(str::to_string)
            .or_else(|| {
                doc.get("metadata")
                    .and_then(|m| m.get("namespace"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| default_ns.to_string());
        let (ar, namespaced) = selectl_kubehub::find_api_resource(client.clone(), &gvk).await?;
        let api = selectl_kubehub::dynamic_api(client.clone(), &ar, namespaced, Some(&ns))?;
        let obj = api
            .get(&name)
            .await
            .with_context(|| format!("fetching {}/{}", ar.kind, name))?;
        out.push(remote_target(&ar.kind, namespaced, &ns, obj, api)?);
    }
    Ok(out)
}

fn remote_target(
    kind: &str,
    namespaced: bool,
    ns: &str,
    obj: DynamicObject,
    api: Api<DynamicObject>,
) -> Result<Target> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("fetched object missing metadata.name"))?;
    let namespace = obj
        .metadata
        .namespace
        .clone()
        .or_else(|| namespaced.then(|| ns.to_string()));
    let object = serde_json::to_value(&obj).context("serializing fetched object")?;
    Ok(Target { kind: kind.to_string(), name, namespace, object, remote: Some(api) })
}

/// Per-object outcome collected by the batch driver.
#[derive(Debug)]
pub struct VisitResult {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub error: Option<anyhow::Error>,
    pub warnings: Vec<String>,
}

/// Ordered per-object outcomes for one invocation.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<VisitResult>,
}

impl BatchOutcome {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }
}

/// Visit each target independently and sequentially. A failed visit is
/// recorded and the driver moves on; sibling objects are never affected.
pub async fn run_batch(
    targets: &[Target],
    selector: &LabelSelector,
    opts: &ApplyOptions,
    sink: &mut dyn ObjectSink,
) -> Result<BatchOutcome> {
    if targets.is_empty() {
        bail!("one or more resources must be specified as KIND NAME or KIND/NAME");
    }
    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        let outcome = match set_selector(target, selector, opts).await {
            Ok(applied) => {
                let warnings = applied.warnings.clone();
                let error = sink.emit(target, &applied).err();
                VisitResult {
                    kind: target.kind.clone(),
                    name: target.name.clone(),
                    namespace: target.namespace.clone(),
                    error,
                    warnings,
                }
            }
            Err(e) => {
                warn!(kind = %target.kind, name = %target.name, error = %e, "selector update failed");
                VisitResult {
                    kind: target.kind.clone(),
                    name: target.name.clone(),
                    namespace: target.namespace.clone(),
                    error: Some(e),
                    warnings: vec![],
                }
            }
        };
        results.push(outcome);
    }
    Ok(BatchOutcome { results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_refs_slash_form() {
        let refs = parse_resource_refs(&["service/my-svc".to_string()], false).expect("refs");
        assert_eq!(
            refs,
            vec![ResourceRef { kind: "service".to_string(), name: Some("my-svc".to_string()) }]
        );
    }

    #[test]
    fn parse_refs_pair_form_with_multiple_names() {
        let args: Vec<String> =
            ["service", "frontend", "backend"].iter().map(|s| s.to_string()).collect();
        let refs = parse_resource_refs(&args, false).expect("refs");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name.as_deref(), Some("frontend"));
        assert_eq!(refs[1].name.as_deref(), Some("backend"));
        assert!(refs.iter().all(|r| r.kind == "service"));
    }

    #[test]
    fn parse_refs_bare_type_requires_all() {
        let args = vec!["service".to_string()];
        assert!(parse_resource_refs(&args, false).is_err());
        let refs = parse_resource_refs(&args, true).expect("refs");
        assert_eq!(refs, vec![ResourceRef { kind: "service".to_string(), name: None }]);
    }

    #[test]
    fn parse_refs_all_rejects_named_resources() {
        let err = parse_resource_refs(&["service/my-svc".to_string()], true).unwrap_err();
        assert!(err.to_string().contains("--all"), "got: {err}");
    }

    #[test]
    fn parse_refs_rejects_malformed_slash() {
        assert!(parse_resource_refs(&["service/".to_string()], false).is_err());
        assert!(parse_resource_refs(&["/name".to_string()], false).is_err());
    }

    #[test]
    fn local_target_picks_up_identity() {
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "my-svc", "namespace": "staging"}
        });
        let t = Target::local(doc, None);
        assert_eq!(t.kind, "Service");
        assert_eq!(t.name, "my-svc");
        assert_eq!(t.namespace.as_deref(), Some("staging"));
        assert!(t.remote.is_none());
    }

    #[test]
    fn local_target_namespace_override_wins() {
        let doc = json!({"kind": "Service", "metadata": {"name": "s", "namespace": "a"}});
        let t = Target::local(doc, Some("b"));
        assert_eq!(t.namespace.as_deref(), Some("b"));
    }

    #[test]
    fn resource_version_injected_into_patch_metadata() {
        let mut doc = json!({"spec": {"selector": {"env": "qa"}}});
        set_resource_version(&mut doc, "42");
        assert_eq!(doc["metadata"]["resourceVersion"], json!("42"));
    }
}
