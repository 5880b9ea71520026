//! General-purpose selector expression grammar.
//!
//! Accepts the full comma-separated term grammar, including set-based forms
//! (`in`, `notin`, bare-key existence, `!key`). The mutator is what rejects
//! non-equality forms; the parser itself does not pre-filter.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::SelectorError;

/// Maximum length for a label value and the name part of a label key.
pub const LABEL_VALUE_MAX_LEN: usize = 63;

const KEY_PREFIX_MAX_LEN: usize = 253;

/// Parse a free-text selector expression into a structured selector.
///
/// Equality terms (`k=v`, `k==v`) land in `match_labels`; everything else
/// becomes a `match_expressions` requirement.
pub fn parse_selector(expr: &str) -> Result<LabelSelector, SelectorError> {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    let mut exprs: Vec<LabelSelectorRequirement> = Vec::new();

    for term in split_terms(expr) {
        let term = term.trim();
        if term.is_empty() {
            if expr.trim().is_empty() {
                continue;
            }
            return Err(parse_err(expr, "empty selector term"));
        }
        match parse_term(term, expr)? {
            Term::Equality(key, value) => {
                labels.insert(key, value);
            }
            Term::Requirement(req) => exprs.push(req),
        }
    }

    Ok(LabelSelector {
        match_labels: if labels.is_empty() { None } else { Some(labels) },
        match_expressions: if exprs.is_empty() { None } else { Some(exprs) },
    })
}

enum Term {
    Equality(String, String),
    Requirement(LabelSelectorRequirement),
}

/// Split on commas outside of parentheses so `in (a,b)` value sets survive.
fn split_terms(expr: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&expr[start..]);
    terms
}

fn parse_term(term: &str, expr: &str) -> Result<Term, SelectorError> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        validate_key(key, expr)?;
        return Ok(Term::Requirement(requirement(key, "DoesNotExist", None)));
    }
    if let Some((key, value)) = term.split_once("!=") {
        let (key, value) = (key.trim(), value.trim());
        validate_key(key, expr)?;
        validate_value(value, expr)?;
        return Ok(Term::Requirement(requirement(
            key,
            "NotIn",
            Some(vec![value.to_string()]),
        )));
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let (key, value) = (key.trim(), value.trim());
        validate_key(key, expr)?;
        validate_value(value, expr)?;
        return Ok(Term::Equality(key.to_string(), value.to_string()));
    }
    if let Some(idx) = term.find(char::is_whitespace) {
        let key = term[..idx].trim();
        validate_key(key, expr)?;
        let rest = term[idx..].trim_start();
        let (operator, rest) = if let Some(r) = rest.strip_prefix("notin") {
            ("NotIn", r)
        } else if let Some(r) = rest.strip_prefix("in") {
            ("In", r)
        } else {
            return Err(parse_err(expr, format!("unrecognized term {term:?}")));
        };
        let inner = rest
            .trim_start()
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| {
                parse_err(expr, format!("expected parenthesized value set in {term:?}"))
            })?;
        let mut values = Vec::new();
        for v in inner.split(',') {
            let v = v.trim();
            validate_value(v, expr)?;
            values.push(v.to_string());
        }
        return Ok(Term::Requirement(requirement(key, operator, Some(values))));
    }
    // bare key: existence check
    validate_key(term, expr)?;
    Ok(Term::Requirement(requirement(term, "Exists", None)))
}

fn requirement(key: &str, operator: &str, values: Option<Vec<String>>) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values,
    }
}

/// Label keys are qualified names: an optional DNS-subdomain prefix followed
/// by `/` and a name segment of at most 63 characters.
fn validate_key(key: &str, expr: &str) -> Result<(), SelectorError> {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if name.contains('/') {
        return Err(parse_err(expr, format!("key {key:?} has more than one '/'")));
    }
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > KEY_PREFIX_MAX_LEN {
            return Err(parse_err(expr, format!("key prefix {prefix:?} length out of range")));
        }
        let subdomain_ok = prefix.split('.').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && part.starts_with(|c: char| c.is_ascii_alphanumeric())
                && part.ends_with(|c: char| c.is_ascii_alphanumeric())
        });
        if !subdomain_ok {
            return Err(parse_err(expr, format!("key prefix {prefix:?} is not a DNS subdomain")));
        }
    }
    check_name_segment(name, "key", expr)
}

/// Label values share the key-name charset but may be empty.
fn validate_value(value: &str, expr: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    check_name_segment(value, "value", expr)
}

fn check_name_segment(s: &str, what: &str, expr: &str) -> Result<(), SelectorError> {
    if s.is_empty() {
        return Err(parse_err(expr, format!("empty {what}")));
    }
    if s.len() > LABEL_VALUE_MAX_LEN {
        return Err(parse_err(
            expr,
            format!("{what} {s:?} exceeds {LABEL_VALUE_MAX_LEN} characters"),
        ));
    }
    let charset_ok = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    let ends_ok = s.starts_with(|c: char| c.is_ascii_alphanumeric())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !charset_ok || !ends_ok {
        return Err(parse_err(
            expr,
            format!("{what} {s:?} must be alphanumeric with '-', '_' or '.' inside"),
        ));
    }
    Ok(())
}

fn parse_err(expr: &str, reason: impl Into<String>) -> SelectorError {
    SelectorError::Parse {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}
