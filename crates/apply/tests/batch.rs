#![forbid(unsafe_code)]

use anyhow::Result;
use selectl_apply::{run_batch, Applied, ApplyOptions, ObjectSink, RunMode, Target};
use selectl_core::parse_selector;
use serde_json::{json, Value};

struct CollectSink {
    emitted: Vec<(String, Value)>,
}

impl CollectSink {
    fn new() -> Self {
        CollectSink { emitted: Vec::new() }
    }
}

impl ObjectSink for CollectSink {
    fn emit(&mut self, target: &Target, applied: &Applied) -> Result<()> {
        self.emitted
            .push((format!("{}/{}", target.kind, target.name), applied.object.clone()));
        Ok(())
    }
}

fn local_opts() -> ApplyOptions {
    ApplyOptions {
        mode: RunMode::Local,
        record: false,
        resource_version: None,
        change_cause: String::new(),
    }
}

fn service(name: &str, selector: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"selector": selector, "ports": [{"port": 80}]}
    })
}

#[tokio::test]
async fn local_mode_replaces_selector_without_remote_calls() {
    let targets = vec![Target::local(service("my-svc", json!({"env": "prod"})), None)];
    let selector = parse_selector("env=qa").expect("parse");
    let mut sink = CollectSink::new();

    let outcome = run_batch(&targets, &selector, &local_opts(), &mut sink)
        .await
        .expect("batch");

    assert_eq!(outcome.failed(), 0);
    assert_eq!(sink.emitted.len(), 1);
    let (key, obj) = &sink.emitted[0];
    assert_eq!(key, "Service/my-svc");
    assert_eq!(obj["spec"]["selector"], json!({"env": "qa"}));
    // nothing was persisted, so no resource-version token appeared
    assert!(obj["metadata"].get("resourceVersion").is_none());
}

#[tokio::test]
async fn mid_batch_failure_does_not_affect_siblings() {
    let targets = vec![
        Target::local(service("first", json!({"env": "prod"})), None),
        // a workload kind with no selector field: terminal for this object only
        Target::local(
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "bad"}}),
            None,
        ),
        Target::local(service("last", json!({"env": "prod"})), None),
    ];
    let selector = parse_selector("env=qa").expect("parse");
    let mut sink = CollectSink::new();

    let outcome = run_batch(&targets, &selector, &local_opts(), &mut sink)
        .await
        .expect("batch");

    assert_eq!(outcome.results.len(), 3);
    assert_eq!(outcome.failed(), 1);
    assert!(outcome.results[0].error.is_none());
    assert!(outcome.results[1].error.is_some());
    assert!(outcome.results[2].error.is_none());
    let msg = outcome.results[1].error.as_ref().unwrap().to_string();
    assert!(msg.contains("ConfigMap"), "error should name the kind: {msg}");

    // the sink saw exactly the successes, in order
    let keys: Vec<_> = sink.emitted.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["Service/first", "Service/last"]);
    for (_, obj) in &sink.emitted {
        assert_eq!(obj["spec"]["selector"], json!({"env": "qa"}));
    }
}

#[tokio::test]
async fn set_based_expression_fails_the_object() {
    let targets = vec![Target::local(service("my-svc", json!({"env": "prod"})), None)];
    // grammar-valid, but not an equality selector
    let selector = parse_selector("env in (qa, prod)").expect("parse");
    let mut sink = CollectSink::new();

    let outcome = run_batch(&targets, &selector, &local_opts(), &mut sink)
        .await
        .expect("batch");

    assert_eq!(outcome.failed(), 1);
    assert!(sink.emitted.is_empty());
    let msg = outcome.results[0].error.as_ref().unwrap().to_string();
    assert!(msg.contains("match expressions"), "got: {msg}");
}

#[tokio::test]
async fn empty_target_set_is_a_configuration_error() {
    let selector = parse_selector("env=qa").expect("parse");
    let mut sink = CollectSink::new();
    let err = run_batch(&[], &selector, &local_opts(), &mut sink)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("one or more resources"));
    assert!(sink.emitted.is_empty());
}

#[tokio::test]
async fn total_replacement_discards_prior_keys() {
    let targets = vec![Target::local(service("my-svc", json!({"a": "1", "keep": "me"})), None)];
    let selector = parse_selector("b=2").expect("parse");
    let mut sink = CollectSink::new();

    let outcome = run_batch(&targets, &selector, &local_opts(), &mut sink)
        .await
        .expect("batch");

    assert_eq!(outcome.failed(), 0);
    let (_, obj) = &sink.emitted[0];
    assert_eq!(obj["spec"]["selector"], json!({"b": "2"}));
}
