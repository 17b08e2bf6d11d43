//! External validator contracts: the request validator and the
//! custom-rule validator. Both are implemented outside this crate; the
//! engine only needs their call shape and the shared multi-error type.

use crate::error::FieldError;
use crate::evaluator::{Environment, Evaluator};
use crate::request::RequestSnapshot;
use crate::workflow::Expression;
use serde_json::Value;

/// `validate(requestData, rules) -> error`. A `None` return means the
/// request satisfied every rule.
pub trait Validator: Send + Sync {
    fn validate(&self, request: &RequestSnapshot, rules: &Value) -> Option<Vec<FieldError>>;
}

/// `validateCustomRules(rules, evaluator, env) -> error`: each custom
/// rule is an expression evaluated against the environment; a falsy result
/// is a failure named after the rule's source.
pub trait CustomRuleValidator: Send + Sync {
    fn validate(
        &self,
        rules: &[Expression],
        evaluator: &dyn Evaluator,
        env: &Environment,
    ) -> Option<Vec<FieldError>>;
}

/// Default custom-rule validator: evaluates each rule as a boolean
/// expression and reports every falsy one, in declaration order.
pub struct ExpressionCustomRuleValidator;

impl CustomRuleValidator for ExpressionCustomRuleValidator {
    fn validate(
        &self,
        rules: &[Expression],
        evaluator: &dyn Evaluator,
        env: &Environment,
    ) -> Option<Vec<FieldError>> {
        let mut failures = Vec::new();
        for rule in rules {
            if !crate::evaluator::evaluate_bool(evaluator, rule, env) {
                failures.push(FieldError {
                    field: rule.raw().to_string(),
                    kind: "customRule".to_string(),
                    message: format!("custom rule failed: {}", rule.raw()),
                    value: None,
                });
            }
        }
        if failures.is_empty() {
            None
        } else {
            Some(failures)
        }
    }
}
