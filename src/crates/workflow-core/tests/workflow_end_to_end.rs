//! End-to-end scenarios run through the public `Engine` API, covering paths
//! the in-module unit tests can't: a real array-literal fan-out, inline
//! before/after sub-resources, header/param filters denying a resource, and
//! full API-response assembly wired up through a workflow.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use workflow_core::context::ExecutionContext;
use workflow_core::error::{EngineError, Result};
use workflow_core::evaluator::{Environment, Evaluator};
use workflow_core::registry::ExecutorRegistry;
use workflow_core::request::RequestSnapshot;
use workflow_core::store::{InMemorySessionStore, InMemoryStore};
use workflow_core::workflow::{
    ApiResponseSpec, Expression, OnErrorAction, OnErrorPolicy, PrimaryConfig, Resource, RunBlock,
    Workflow, WorkflowSettings,
};
use workflow_core::Engine;

/// An evaluator that actually parses JSON literals (arrays, objects,
/// numbers, bools) in addition to variable lookups, so iteration tests can
/// exercise real multi-element fan-out instead of a single scalar.
struct JsonEvaluator;

impl Evaluator for JsonEvaluator {
    fn evaluate(&self, expr: &Expression, env: &Environment) -> std::result::Result<Value, String> {
        let raw = expr.raw().trim();
        let raw = raw.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")).unwrap_or(raw).trim();

        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            if !matches!(value, Value::String(_)) {
                return Ok(value);
            }
        }
        if raw == "fail" {
            return Err("forced failure".to_string());
        }
        if let Some(path) = raw.strip_prefix("llm.response(").and_then(|s| s.strip_suffix(')')) {
            let id = path.trim_matches(|c| c == '"' || c == '\'');
            return Ok(env
                .accessors
                .get("llm")
                .map(|o| o.call("response", &[Value::String(id.to_string())]))
                .unwrap_or(Value::Null));
        }
        if let Some(v) = env.vars.get(raw) {
            return Ok(v.clone());
        }
        Ok(Value::String(raw.to_string()))
    }
}

struct ItemEcho;

#[async_trait]
impl workflow_core::registry::ResourceExecutor for ItemEcho {
    async fn execute(&self, ctx: &ExecutionContext, _config: &Value) -> Result<Value> {
        ctx.item(None)
    }
}

struct Echo(Value);

#[async_trait]
impl workflow_core::registry::ResourceExecutor for Echo {
    async fn execute(&self, _ctx: &ExecutionContext, _config: &Value) -> Result<Value> {
        Ok(self.0.clone())
    }
}

struct AlwaysFails;

#[async_trait]
impl workflow_core::registry::ResourceExecutor for AlwaysFails {
    async fn execute(&self, _ctx: &ExecutionContext, _config: &Value) -> Result<Value> {
        Err(EngineError::Execution(workflow_core::error::AppError::new("BOOM", "it broke")))
    }
}

fn test_engine(registry: ExecutorRegistry) -> Engine {
    Engine::new(
        Arc::new(JsonEvaluator),
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemorySessionStore::new(Duration::from_secs(60))),
        PathBuf::from("."),
    )
    .with_registry(registry)
}

#[tokio::test]
async fn array_literal_items_fan_out_into_one_result_per_element() {
    let mut registry = ExecutorRegistry::new();
    registry.register("exec", Arc::new(ItemEcho));
    let engine = test_engine(registry);

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![Resource {
            action_id: "loop".to_string(),
            name: "loop".to_string(),
            requires: vec![],
            run: RunBlock {
                primary: Some(PrimaryConfig::Exec(json!("noop"))),
                items: vec![Expression::new("[10,20,30]")],
                ..Default::default()
            },
        }],
        target_action_id: "loop".to_string(),
    };

    let outcome = engine.execute(&workflow, None).await.unwrap();
    assert_eq!(outcome.output, json!([10, 20, 30]));
}

#[tokio::test]
async fn inline_before_and_after_run_around_the_primary_phase() {
    let mut registry = ExecutorRegistry::new();
    registry.register("python", Arc::new(Echo(json!("setup"))));
    registry.register("exec", Arc::new(Echo(json!("primary-output"))));
    registry.register("http", Arc::new(Echo(json!("cleanup"))));
    let engine = test_engine(registry);

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![Resource {
            action_id: "staged".to_string(),
            name: "staged".to_string(),
            requires: vec![],
            run: RunBlock {
                before: vec![PrimaryConfig::Python(json!("setup"))],
                primary: Some(PrimaryConfig::Exec(json!("run"))),
                after: vec![PrimaryConfig::HttpClient(json!("cleanup"))],
                ..Default::default()
            },
        }],
        target_action_id: "staged".to_string(),
    };

    let outcome = engine.execute(&workflow, None).await.unwrap();
    // The primary's own output wins even though before/after phases ran too.
    assert_eq!(outcome.output, json!("primary-output"));
}

#[tokio::test]
async fn inline_before_failure_is_reported_with_its_index() {
    let mut registry = ExecutorRegistry::new();
    registry.register("python", Arc::new(AlwaysFails));
    registry.register("exec", Arc::new(Echo(json!("unreachable"))));
    let engine = test_engine(registry);

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![Resource {
            action_id: "staged".to_string(),
            name: "staged".to_string(),
            requires: vec![],
            run: RunBlock {
                before: vec![PrimaryConfig::Python(json!("setup"))],
                primary: Some(PrimaryConfig::Exec(json!("run"))),
                ..Default::default()
            },
        }],
        target_action_id: "staged".to_string(),
    };

    let error = engine.execute(&workflow, None).await.unwrap_err();
    match error {
        EngineError::InlineSubResource { phase, index, .. } => {
            assert_eq!(phase, "before");
            assert_eq!(index, 0);
        }
        other => panic!("expected InlineSubResource, got {other:?}"),
    }
}

#[tokio::test]
async fn header_filter_denies_a_restricted_resource() {
    let request = RequestSnapshot {
        method: "GET".to_string(),
        path: "/hooks/run".to_string(),
        headers: [("X-Api-Key".to_string(), "secret".to_string())].into_iter().collect(),
        query: Default::default(),
        body: Value::Null,
        ip: String::new(),
        id: "req-1".to_string(),
        session_id: None,
        files: vec![],
    };

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![Resource {
            action_id: "gated".to_string(),
            name: "gated".to_string(),
            requires: vec![],
            run: RunBlock {
                primary: Some(PrimaryConfig::Exec(json!("run"))),
                allowed_headers: vec!["X-Other-Header".to_string()],
                ..Default::default()
            },
        }],
        target_action_id: "gated".to_string(),
    };

    // The resource itself never reads a header, so the filter allow-list is
    // inert unless something asks for a header — exercise it through a
    // primary that performs the lookup via the unified API instead.
    struct HeaderReadingExecutor;
    #[async_trait]
    impl workflow_core::registry::ResourceExecutor for HeaderReadingExecutor {
        async fn execute(&self, ctx: &ExecutionContext, _config: &Value) -> Result<Value> {
            ctx.input("X-Api-Key", Some("header"))
        }
    }
    let mut registry = ExecutorRegistry::new();
    registry.register("exec", Arc::new(HeaderReadingExecutor));
    let engine = test_engine(registry);

    let error = engine.execute(&workflow, Some(request)).await.unwrap_err();
    assert!(matches!(error, EngineError::FilterDenied { domain: "header", .. }));
}

#[tokio::test]
async fn api_response_wraps_primary_output_with_meta() {
    let mut registry = ExecutorRegistry::new();
    registry.register("chat", Arc::new(Echo(json!({"response": "hi", "model": "gpt-4", "backend": "openai"}))));
    let engine = test_engine(registry);

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![Resource {
            action_id: "answer".to_string(),
            name: "answer".to_string(),
            requires: vec![],
            run: RunBlock {
                primary: Some(PrimaryConfig::Chat(json!({"prompt": "hi"}))),
                api_response: Some(ApiResponseSpec {
                    response: json!({"text": "hi"}),
                    success: Value::Bool(true),
                    meta: None,
                }),
                ..Default::default()
            },
        }],
        target_action_id: "answer".to_string(),
    };

    // The target's output is unwrapped to `data` on return (downstream HTTP
    // callers re-wrap it with `success`/`_meta`); only the `data` payload
    // and the side-channel LLM metadata extraction are observable here.
    let outcome = engine.execute(&workflow, None).await.unwrap();
    assert_eq!(outcome.output["text"], Value::String("hi".to_string()));
}

#[tokio::test]
async fn api_response_envelope_is_visible_to_a_dependent_resource() {
    struct EnvelopeReadingExecutor;
    #[async_trait]
    impl workflow_core::registry::ResourceExecutor for EnvelopeReadingExecutor {
        async fn execute(&self, ctx: &ExecutionContext, _config: &Value) -> Result<Value> {
            // Re-shape the fetched envelope so the final-target unwrap (which
            // only fires on a top-level `{success, data}` shape) doesn't
            // strip it a second time here, masking what `relay` actually saw.
            let envelope = ctx.get("answer", None).await?;
            Ok(json!({
                "saw_success": envelope["success"],
                "saw_text": envelope["data"]["text"],
            }))
        }
    }
    let mut registry = ExecutorRegistry::new();
    registry.register("chat", Arc::new(Echo(json!({"response": "hi"}))));
    registry.register("exec", Arc::new(EnvelopeReadingExecutor));
    let engine = test_engine(registry);

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![
            Resource {
                action_id: "answer".to_string(),
                name: "answer".to_string(),
                requires: vec![],
                run: RunBlock {
                    primary: Some(PrimaryConfig::Chat(json!({"prompt": "hi"}))),
                    api_response: Some(ApiResponseSpec {
                        response: json!({"text": "ok"}),
                        success: Value::Bool(true),
                        meta: None,
                    }),
                    ..Default::default()
                },
            },
            Resource {
                action_id: "relay".to_string(),
                name: "relay".to_string(),
                requires: vec!["answer".to_string()],
                run: RunBlock {
                    primary: Some(PrimaryConfig::Exec(json!("relay"))),
                    ..Default::default()
                },
            },
        ],
        target_action_id: "relay".to_string(),
    };

    // `relay` reads the full `{success, data}` envelope `answer` recorded in
    // the outputs map, proving dependents see it unstripped.
    let outcome = engine.execute(&workflow, None).await.unwrap();
    assert_eq!(outcome.output["saw_success"], Value::Bool(true));
    assert_eq!(outcome.output["saw_text"], Value::String("ok".to_string()));
}

#[tokio::test]
async fn on_error_when_guard_skips_handling_for_non_matching_errors() {
    let mut registry = ExecutorRegistry::new();
    registry.register("exec", Arc::new(AlwaysFails));
    let engine = test_engine(registry);

    let workflow = Workflow {
        id: "wf".to_string(),
        settings: WorkflowSettings::default(),
        resources: vec![Resource {
            action_id: "flaky".to_string(),
            name: "flaky".to_string(),
            requires: vec![],
            run: RunBlock {
                primary: Some(PrimaryConfig::Exec(json!("run"))),
                on_error: Some(OnErrorPolicy {
                    when: vec![Expression::new("false")],
                    action: OnErrorAction::Continue,
                    max_retries: 0,
                    retry_delay: Expression::new("0s"),
                    fallback: Some(json!("fallback")),
                    expr: vec![],
                }),
                ..Default::default()
            },
        }],
        target_action_id: "flaky".to_string(),
    };

    let error = engine.execute(&workflow, None).await.unwrap_err();
    assert!(matches!(error, EngineError::Execution(_)));
}
