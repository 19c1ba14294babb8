//! Condition and filter rules.
//!
//! Rules are JEXL expressions evaluated against the context data, e.g.
//! `cmc.approved == true` or `orders|length > 2`. An empty rule always holds.

use serde_json::{json, Value};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("rule '{rule}' failed: {reason}")]
pub struct RuleError {
    pub rule: String,
    pub reason: String,
}

static EVALUATOR: OnceLock<jexl_eval::Evaluator<'static>> = OnceLock::new();

/// Shared evaluator with the `length` transform registered
fn evaluator() -> &'static jexl_eval::Evaluator<'static> {
    EVALUATOR.get_or_init(|| {
        jexl_eval::Evaluator::new().with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
    })
}

/// Evaluate `rule` against `data`, coercing the result with JavaScript-like truthiness.
pub fn evaluate(rule: &str, data: &Value) -> Result<bool, RuleError> {
    if rule.trim().is_empty() {
        return Ok(true);
    }
    let empty = json!({});
    let context = if data.is_object() { data } else { &empty };

    let result = evaluator()
        .eval_in_context(rule, context)
        .map_err(|e| RuleError {
            rule: rule.to_string(),
            reason: e.to_string(),
        })?;
    Ok(truthy(&result))
}

/// `None` and blank rules always hold.
pub fn holds(rule: Option<&str>, data: &Value) -> Result<bool, RuleError> {
    match rule {
        Some(rule) => evaluate(rule, data),
        None => Ok(true),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
