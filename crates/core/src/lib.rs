//! selectl core types – selector grammar and object mutation.

#![forbid(unsafe_code)]

mod selector;

pub use selector::{parse_selector, LABEL_VALUE_MAX_LEN};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use serde_json::{Map, Value};
use thiserror::Error;

/// Typed failures for selector parsing and object mutation.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("unable to parse selector {expr:?}: {reason}")]
    Parse { expr: String, reason: String },
    #[error("match expressions [{}] are not supported for this operation", .0.join(", "))]
    UnsupportedExpressions(Vec<String>),
    #[error("setting a selector is only supported for Service objects (got {0:?})")]
    UnsupportedKind(String),
}

/// Replace the selector of a decoded object, returning the new value.
///
/// Accepts only pure equality selectors; any `match_expressions` entry is
/// rejected regardless of the object's kind. The prior selector is discarded
/// in its entirety, even when the new one is a subset.
pub fn set_object_selector(obj: &Value, selector: &LabelSelector) -> Result<Value, SelectorError> {
    if let Some(exprs) = selector.match_expressions.as_ref().filter(|e| !e.is_empty()) {
        let rendered = exprs.iter().map(render_requirement).collect();
        return Err(SelectorError::UnsupportedExpressions(rendered));
    }
    let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "Service" => Ok(with_selector(obj, selector)),
        other => Err(SelectorError::UnsupportedKind(other.to_string())),
    }
}

fn with_selector(obj: &Value, selector: &LabelSelector) -> Value {
    let mut labels = Map::new();
    if let Some(ml) = selector.match_labels.as_ref() {
        for (k, v) in ml {
            labels.insert(k.clone(), Value::String(v.clone()));
        }
    }
    let mut out = obj.clone();
    if let Some(root) = out.as_object_mut() {
        let spec = root
            .entry("spec".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match spec.as_object_mut() {
            Some(s) => {
                s.insert("selector".to_string(), Value::Object(labels));
            }
            None => {
                let mut s = Map::new();
                s.insert("selector".to_string(), Value::Object(labels));
                *spec = Value::Object(s);
            }
        }
    }
    out
}

fn render_requirement(r: &LabelSelectorRequirement) -> String {
    match (r.operator.as_str(), r.values.as_deref()) {
        ("In", Some(vs)) => format!("{} in ({})", r.key, vs.join(",")),
        ("NotIn", Some(vs)) => format!("{} notin ({})", r.key, vs.join(",")),
        ("Exists", _) => r.key.clone(),
        ("DoesNotExist", _) => format!("!{}", r.key),
        _ => format!("{} {}", r.key, r.operator),
    }
}
