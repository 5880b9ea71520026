//! selectl kubehub – client bootstrap, discovery and dynamic Api wiring.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use tracing::debug;

/// Build a client from the ambient kubeconfig/in-cluster environment and
/// report the context's default namespace alongside it.
pub async fn client_with_default_ns() -> Result<(Client, String)> {
    let config = Config::infer().await?;
    let default_ns = config.default_namespace.clone();
    let client = Client::try_from(config)?;
    Ok((client, default_ns))
}

/// Look up the ApiResource for an exact group/version/kind.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Resolve a user-supplied type token ("service", "services", "Service") to
/// the recommended ApiResource for that kind.
pub async fn resolve_kind(client: Client, kind: &str) -> Result<(ApiResource, bool)> {
    let wanted = kind.to_ascii_lowercase();
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.kind.to_ascii_lowercase() == wanted || ar.plural == wanted {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(kind = %ar.kind, group = %ar.group, version = %ar.version, "resolved type token");
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("the server does not have a resource type {kind:?}"))
}

/// Build a dynamic Api scoped to the namespace when the kind requires one.
pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Result<Api<DynamicObject>> {
    if namespaced {
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(client, ns, ar)),
            None => Err(anyhow!("namespace required for namespaced kind {}", ar.kind)),
        }
    } else {
        Ok(Api::all_with(client, ar))
    }
}

/// Extract the group/version/kind tags from a decoded manifest document.
pub fn gvk_of(doc: &serde_json::Value) -> Result<GroupVersionKind> {
    let api_version = doc
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest missing apiVersion"))?;
    let kind = doc
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest missing kind"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok(GroupVersionKind { group, version, kind: kind.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_of_core_group() {
        let gvk = gvk_of(&json!({"apiVersion": "v1", "kind": "Service"})).expect("gvk");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Service");
    }

    #[test]
    fn gvk_of_named_group() {
        let gvk = gvk_of(&json!({"apiVersion": "apps/v1", "kind": "Deployment"})).expect("gvk");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn gvk_of_missing_fields() {
        assert!(gvk_of(&json!({"kind": "Service"})).is_err());
        assert!(gvk_of(&json!({"apiVersion": "v1"})).is_err());
    }
}
