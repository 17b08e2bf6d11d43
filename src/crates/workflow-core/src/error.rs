//! Error types for graph construction, gating and execution.
//!
//! All errors implement `std::error::Error` via [`thiserror`]. Graph errors are
//! fatal for the whole run; gating and dispatch errors are fatal for the
//! resource that raised them unless an `OnError` policy is attached.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Per-field detail attached to a [`EngineError::Validation`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub kind: String,
    pub message: String,
    pub value: Option<Value>,
}

/// A domain error surfaced by a resource executor, carrying a stable code,
/// an HTTP-shaped status and structured details. Mirrors what executors wrap
/// arbitrary failures in before handing them back across the executor
/// boundary (see `ExecutorUnavailable` / `AllRetriesFailed` below).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    pub action_id: Option<String>,
    pub status_code: Option<u16>,
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            action_id: None,
            status_code: None,
            details: None,
        }
    }

    pub fn with_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

/// The full error taxonomy exposed by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // --- Graph errors ---
    #[error("duplicate action id: {0}")]
    DuplicateAction(String),

    #[error("resource '{resource}' requires unknown action '{dependency}'")]
    UnknownDependency { resource: String, dependency: String },

    #[error("dependency cycle detected involving '{0}'")]
    DependencyCycle(String),

    #[error("unknown target action: {0}")]
    UnknownTarget(String),

    // --- Dispatch errors ---
    #[error("no executor registered for resource type '{0}'")]
    ExecutorUnavailable(String),

    #[error("resource '{0}' has no recognizable primary type and ran no phases")]
    UnknownResourceType(String),

    #[error("invalid request type for resource '{0}': {1}")]
    InvalidRequestType(String, String),

    // --- Evaluation errors ---
    #[error("failed to evaluate expression '{expr}': {cause}")]
    Evaluation { expr: String, cause: String },

    // --- Gating errors ---
    #[error("validation failed for resource '{resource}'")]
    Validation {
        resource: String,
        fields: Vec<FieldError>,
    },

    #[error("preflight check failed: {message}")]
    Preflight { code: String, message: String },

    #[error("'{name}' is not in the allowed {domain} list")]
    FilterDenied { domain: &'static str, name: String },

    #[error("request does not match resource restrictions")]
    RestrictionMismatch,

    // --- Execution errors ---
    #[error("{0}")]
    Execution(#[from] AppError),

    #[error("resource '{resource}' failed after {attempts} attempts: {cause}")]
    AllRetriesFailed {
        resource: String,
        attempts: u32,
        cause: String,
    },

    #[error("inline sub-resource {phase}[{index}] failed: {source}")]
    InlineSubResource {
        phase: &'static str,
        index: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("panic during workflow execution: {0}")]
    Panic(String),

    #[error("unknown scope '{0}' for context write")]
    UnknownScope(String),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Builds the `error` object injected into the evaluation environment
    /// while an `OnError` policy is deciding whether to handle a failure.
    pub fn as_env_object(&self) -> HashMap<String, Value> {
        let mut env = HashMap::new();
        env.insert("message".to_string(), Value::String(self.to_string()));
        env.insert("type".to_string(), Value::String(self.kind()));
        if let EngineError::Execution(app) = self {
            env.insert("code".to_string(), Value::String(app.code.clone()));
            if let Some(status) = app.status_code {
                env.insert("statusCode".to_string(), Value::from(status));
            }
            if let Some(details) = &app.details {
                env.insert("details".to_string(), details.clone());
            }
        }
        env
    }

    fn kind(&self) -> String {
        match self {
            EngineError::DuplicateAction(_) => "DuplicateAction",
            EngineError::UnknownDependency { .. } => "UnknownDependency",
            EngineError::DependencyCycle(_) => "DependencyCycle",
            EngineError::UnknownTarget(_) => "UnknownTarget",
            EngineError::ExecutorUnavailable(_) => "ExecutorUnavailable",
            EngineError::UnknownResourceType(_) => "UnknownResourceType",
            EngineError::InvalidRequestType(..) => "InvalidRequestType",
            EngineError::Evaluation { .. } => "Evaluation",
            EngineError::Validation { .. } => "ValidationError",
            EngineError::Preflight { .. } => "PreflightError",
            EngineError::FilterDenied { .. } => "FilterDenied",
            EngineError::RestrictionMismatch => "RestrictionMismatch",
            EngineError::Execution(_) => "ExecutionFailed",
            EngineError::AllRetriesFailed { .. } => "AllRetriesFailed",
            EngineError::InlineSubResource { .. } => "InlineSubResource",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Panic(_) => "Panic",
            EngineError::UnknownScope(_) => "UnknownScope",
            EngineError::Other(_) => "Other",
        }
        .to_string()
    }
}
