//! API-response assembly: recursive expression evaluation over a response
//! template, plus meta merging with the context's LLM metadata.

use crate::context::LlmMetadata;
use crate::error::Result;
use crate::evaluator::{evaluate, is_truthy, Environment, Evaluator};
use crate::workflow::{ApiResponseMeta, ApiResponseSpec, Expression};
use serde_json::{Map, Value};

/// Walks `value`, evaluating every string leaf as an expression. Mappings and
/// sequences are rebuilt element-wise; other scalars pass through untouched.
pub fn evaluate_recursive(
    evaluator: &dyn Evaluator,
    value: &Value,
    env: &Environment,
) -> Result<Value> {
    match value {
        Value::String(s) => evaluate(evaluator, &Expression::new(s.clone()), env),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_recursive(evaluator, item, env)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), evaluate_recursive(evaluator, val, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Assembles the final `{success, data, _meta?}` response object.
pub fn assemble(
    evaluator: &dyn Evaluator,
    spec: &ApiResponseSpec,
    env: &Environment,
    llm_metadata: Option<LlmMetadata>,
) -> Result<Value> {
    let data = evaluate_recursive(evaluator, &spec.response, env)?;
    let success = is_truthy(&evaluate_recursive(evaluator, &spec.success, env)?);

    let mut meta = Map::new();
    if let Some(meta_spec) = &spec.meta {
        populate_explicit_meta(evaluator, meta_spec, env, &mut meta)?;
    }
    if let Some(llm) = llm_metadata {
        if !meta.contains_key("model") && !llm.model.is_empty() {
            meta.insert("model".to_string(), Value::String(llm.model));
        }
        if !meta.contains_key("backend") && !llm.backend.is_empty() {
            meta.insert("backend".to_string(), Value::String(llm.backend));
        }
    }

    let mut result = Map::new();
    result.insert("success".to_string(), Value::Bool(success));
    result.insert("data".to_string(), data);
    if !meta.is_empty() {
        result.insert("_meta".to_string(), Value::Object(meta));
    }
    Ok(Value::Object(result))
}

fn populate_explicit_meta(
    evaluator: &dyn Evaluator,
    meta_spec: &ApiResponseMeta,
    env: &Environment,
    meta: &mut Map<String, Value>,
) -> Result<()> {
    if let Some(headers) = &meta_spec.headers {
        let evaluated = evaluate_recursive(evaluator, headers, env)?;
        let stringified = match evaluated {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::String(scalar_to_string(&v))))
                    .collect(),
            ),
            other => other,
        };
        meta.insert("headers".to_string(), stringified);
    }
    if let Some(model_expr) = &meta_spec.model {
        let value = evaluate(evaluator, model_expr, env)?;
        if !scalar_to_string(&value).is_empty() {
            meta.insert("model".to_string(), value);
        }
    }
    if let Some(backend_expr) = &meta_spec.backend {
        let value = evaluate(evaluator, backend_expr, env)?;
        if !scalar_to_string(&value).is_empty() {
            meta.insert("backend".to_string(), value);
        }
    }
    Ok(())
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
