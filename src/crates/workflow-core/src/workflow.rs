//! The workflow data model: workflow settings, resources, `Run` blocks,
//! `OnError` policy and the `Expression` wrapper. Immutable once constructed;
//! the engine never mutates a [`Workflow`] during a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A raw expression source string in one of two surface forms:
/// `direct` (`"name"` or `"fn()"`) or `interpolated` (`"{{ ... }}"`).
/// Parsing and evaluation are owned by the external expression evaluator;
/// this type is just the typed wrapper the engine threads through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression(pub String);

impl Expression {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn form(&self) -> ExpressionForm {
        let trimmed = self.0.trim();
        if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
            ExpressionForm::Interpolated
        } else {
            ExpressionForm::Direct
        }
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Expression {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpressionForm {
    Direct,
    Interpolated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub resources: Vec<Resource>,
    pub target_action_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub input: InputSettings,
    /// Opaque agent-level settings (model defaults, temperature, ...),
    /// consumed only by the external Chat executor.
    #[serde(default)]
    pub agent: HashMap<String, Value>,
    /// Named SQL connection metadata; the core never opens a
    /// connection, it only threads this through to `info("sqlConnections")`.
    #[serde(default)]
    pub sql_connections: HashMap<String, Value>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub ttl_seconds: Option<u64>,
    pub store_path: Option<String>,
    pub store_type: Option<String>,
    /// Explicit session id configured on the workflow, used when the
    /// request carries none (request-supplied id > explicit id >
    /// auto-generated).
    pub explicit_session_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InputSettings {
    /// Non-empty when the workflow expects audio/video/telephony capture
    /// instead of a plain API request. The input processor
    /// itself is external; the engine only checks whether this is empty.
    #[serde(default)]
    pub non_api_sources: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub action_id: String,
    pub name: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub run: RunBlock,
}

/// Exactly one primary type may be set on a resource or inline sub-resource.
/// The embedded [`Value`] is handed to the registered executor unparsed —
/// the concrete config shape for each type is owned by that executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "camelCase")]
pub enum PrimaryConfig {
    Chat(Value),
    #[serde(rename = "httpClient")]
    HttpClient(Value),
    Sql(Value),
    Python(Value),
    Exec(Value),
    Tts(Value),
}

impl PrimaryConfig {
    pub fn type_tag(&self) -> &'static str {
        match self {
            PrimaryConfig::Chat(_) => "chat",
            PrimaryConfig::HttpClient(_) => "http",
            PrimaryConfig::Sql(_) => "sql",
            PrimaryConfig::Python(_) => "python",
            PrimaryConfig::Exec(_) => "exec",
            PrimaryConfig::Tts(_) => "tts",
        }
    }

    pub fn config(&self) -> &Value {
        match self {
            PrimaryConfig::Chat(v)
            | PrimaryConfig::HttpClient(v)
            | PrimaryConfig::Sql(v)
            | PrimaryConfig::Python(v)
            | PrimaryConfig::Exec(v)
            | PrimaryConfig::Tts(v) => v,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunBlock {
    pub primary: Option<PrimaryConfig>,
    #[serde(default)]
    pub items: Vec<Expression>,
    #[serde(default)]
    pub expr_before: Vec<Expression>,
    #[serde(default)]
    pub expr: Vec<Expression>,
    #[serde(default)]
    pub expr_after: Vec<Expression>,
    #[serde(default)]
    pub before: Vec<PrimaryConfig>,
    #[serde(default)]
    pub after: Vec<PrimaryConfig>,
    #[serde(default)]
    pub skip_condition: Vec<Expression>,
    #[serde(default)]
    pub restrict_to_http_methods: Vec<String>,
    #[serde(default)]
    pub restrict_to_routes: Vec<String>,
    pub validation: Option<ValidationSpec>,
    pub preflight_check: Option<PreflightSpec>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allowed_params: Vec<String>,
    pub on_error: Option<OnErrorPolicy>,
    pub api_response: Option<ApiResponseSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Opaque rule set handed to the external request validator.
    #[serde(default)]
    pub rules: Value,
    #[serde(default)]
    pub custom_rules: Vec<Expression>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreflightSpec {
    pub checks: Vec<Expression>,
    #[serde(default = "default_preflight_code")]
    pub error_code: String,
    pub error_message: Expression,
}

fn default_preflight_code() -> String {
    "PREFLIGHT_FAILED".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnErrorPolicy {
    #[serde(default)]
    pub when: Vec<Expression>,
    #[serde(default)]
    pub action: OnErrorAction,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Expression,
    pub fallback: Option<Value>,
    #[serde(default)]
    pub expr: Vec<Expression>,
}

fn default_retry_delay() -> Expression {
    Expression::new("0s")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnErrorAction {
    Retry,
    Continue,
    #[default]
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiResponseSpec {
    pub response: Value,
    pub success: Value,
    #[serde(default)]
    pub meta: Option<ApiResponseMeta>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApiResponseMeta {
    pub headers: Option<Value>,
    pub model: Option<Expression>,
    pub backend: Option<Expression>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_form_detects_interpolation() {
        assert_eq!(Expression::new("name").form(), ExpressionForm::Direct);
        assert_eq!(Expression::new("fn()").form(), ExpressionForm::Direct);
        assert_eq!(Expression::new("{{ 1 + 1 }}").form(), ExpressionForm::Interpolated);
    }
}
