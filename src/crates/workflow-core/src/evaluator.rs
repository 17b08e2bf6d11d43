//! The expression evaluator contract (external collaborator) and the
//! environment the engine builds for it before every call.
//!
//! The evaluator itself — parsing `"{{ ... }}"` and `"name"`/`"fn()"` source
//! into a value — is out of scope for this crate. What belongs here is the
//! shape of the environment: a record of function values bound to the
//! execution context (Unified API exposed as callables rather than methods
//! so the evaluator never depends on the context type), plus the
//! materialized request/input/item variables.

use crate::error::Result;
use crate::workflow::Expression;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A function-valued accessor, so the environment can carry `llm.response(id)`,
/// `params(name)`, `item.values(id)` etc. without the evaluator depending on
/// [`crate::context::ExecutionContext`] directly.
pub type Accessor = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// One resource-type accessor object (`llm`, `python`, `exec`, `http`):
/// a bag of named functions over a single resource's output.
#[derive(Clone, Default)]
pub struct AccessorObject {
    pub functions: HashMap<String, Accessor>,
}

impl AccessorObject {
    pub fn call(&self, fn_name: &str, args: &[Value]) -> Value {
        match self.functions.get(fn_name) {
            Some(f) => f(args),
            None => Value::Null,
        }
    }
}

/// The environment an [`Evaluator`] resolves an [`Expression`] against.
/// Built fresh before every evaluator call.
#[derive(Clone, Default)]
pub struct Environment {
    /// Materialized plain values: `request`, `input`, `item`,
    /// `inputTranscript`, `inputMedia`, `ttsOutput`, and — only inside
    /// `OnError.When`/`OnError.Expr` — `error`.
    pub vars: HashMap<String, Value>,
    /// Function-valued accessor objects: `llm`, `python`, `exec`, `http`,
    /// plus request shims (`data`, `params`, `header`) and `item.values`.
    pub accessors: HashMap<String, AccessorObject>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn with_accessor(mut self, name: impl Into<String>, object: AccessorObject) -> Self {
        self.accessors.insert(name.into(), object);
        self
    }
}

/// The external expression evaluator contract.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &Expression, env: &Environment) -> std::result::Result<Value, String>;
}

/// Evaluates `expr` and wraps a failure as [`crate::error::EngineError::Evaluation`],
/// carrying the raw source string for diagnostics.
pub fn evaluate(
    evaluator: &dyn Evaluator,
    expr: &Expression,
    env: &Environment,
) -> Result<Value> {
    evaluator
        .evaluate(expr, env)
        .map_err(|cause| crate::error::EngineError::Evaluation {
            expr: expr.raw().to_string(),
            cause,
        })
}

/// Evaluates `expr` as a boolean condition; a parse/type failure yields
/// `false` rather than propagating, since `SkipCondition`/`When` usages
/// need a best-effort boolean and an unparseable condition should not
/// abort the resource.
pub fn evaluate_bool(evaluator: &dyn Evaluator, expr: &Expression, env: &Environment) -> bool {
    match evaluate(evaluator, expr, env) {
        Ok(value) => is_truthy(&value),
        Err(_) => false,
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
