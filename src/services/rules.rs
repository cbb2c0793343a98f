//! Condition evaluation for tenant-defined anomaly rules.
//!
//! Pure functions: rules are evaluated against a JSON view of the canonical
//! transaction so that any dot-path a tenant writes can be resolved. Nothing
//! here returns an error; a malformed condition simply does not match.

use std::fmt;

use bigdecimal::ToPrimitive;
use regex::RegexBuilder;
use serde::Serialize;
use serde_json::Value;

use crate::domain::{AnomalyRule, ConditionOperator, RuleCondition, Transaction};

/// JSON view of a transaction as seen by rule conditions.
/// Monetary fields are exposed as numbers so that strict equality against a
/// numeric rule value behaves as tenants expect.
pub fn transaction_document(tx: &Transaction) -> Value {
    let mut doc = serde_json::to_value(tx).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut doc {
        let amount = tx
            .amount
            .to_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        map.insert("amount".to_string(), amount);
    }
    doc
}

/// True when every condition of the rule holds for the transaction.
pub fn evaluate(rule: &AnomalyRule, tx: &Transaction) -> bool {
    evaluate_document(rule, &transaction_document(tx))
}

pub fn evaluate_document(rule: &AnomalyRule, doc: &Value) -> bool {
    rule.conditions
        .iter()
        .all(|condition| evaluate_condition(condition, doc))
}

pub fn evaluate_condition(condition: &RuleCondition, doc: &Value) -> bool {
    let field = resolve_field(doc, &condition.field);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Eq => strict_eq(field, Some(expected)),
        ConditionOperator::Neq => !strict_eq(field, Some(expected)),
        ConditionOperator::Gt => compare(field, expected, |a, b| a > b),
        ConditionOperator::Gte => compare(field, expected, |a, b| a >= b),
        ConditionOperator::Lt => compare(field, expected, |a, b| a < b),
        ConditionOperator::Lte => compare(field, expected, |a, b| a <= b),
        ConditionOperator::Contains => contains_ci(field, expected),
        ConditionOperator::NotContains => !contains_ci(field, expected),
        ConditionOperator::In => match expected {
            Value::Array(items) => items.iter().any(|item| strict_eq(field, Some(item))),
            _ => false,
        },
        ConditionOperator::NotIn => match expected {
            Value::Array(items) => !items.iter().any(|item| strict_eq(field, Some(item))),
            _ => false,
        },
        ConditionOperator::Regex => {
            let pattern = js_string(Some(expected));
            match RegexBuilder::new(&pattern).case_insensitive(true).build() {
                Ok(re) => re.is_match(&js_string(field)),
                Err(_) => false,
            }
        }
        ConditionOperator::Between => match expected {
            Value::Array(bounds) if bounds.len() == 2 => {
                match (
                    to_number(field),
                    to_number(Some(&bounds[0])),
                    to_number(Some(&bounds[1])),
                ) {
                    (Some(v), Some(low), Some(high)) => v >= low && v <= high,
                    _ => false,
                }
            }
            _ => false,
        },
        ConditionOperator::Unknown => false,
    }
}

/// Walks a dot-path. `None` means the path is undefined; a null or missing
/// intermediate stops the walk.
pub fn resolve_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn strict_eq(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(field: Option<&Value>, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (to_number(field), to_number(Some(expected))) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn contains_ci(field: Option<&Value>, expected: &Value) -> bool {
    js_string(field)
        .to_lowercase()
        .contains(&js_string(Some(expected)).to_lowercase())
}

/// Loose numeric coercion. `None` stands for "not a number".
fn to_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok().filter(|n| !n.is_nan())
            }
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        Value::Array(items) if items.is_empty() => Some(0.0),
        Value::Array(items) if items.len() == 1 => to_number(Some(&items[0])),
        _ => None,
    }
}

/// Loose stringification used by `contains` and `regex`.
fn js_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{}", f as i128),
            Some(f) => f.to_string(),
            None => n.to_string(),
        },
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_string(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleIssue {
    pub condition: Option<usize>,
    pub message: String,
}

impl fmt::Display for RuleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.condition {
            Some(index) => write!(f, "condition #{}: {}", index + 1, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Advisory checks for rule authoring and preview tooling. The evaluator
/// itself accepts every rule.
pub fn validate_rule(rule: &AnomalyRule) -> Vec<RuleIssue> {
    let mut issues = Vec::new();

    if rule.conditions.is_empty() {
        issues.push(RuleIssue {
            condition: None,
            message: "rule has no conditions and matches every transaction".to_string(),
        });
    }

    for (index, condition) in rule.conditions.iter().enumerate() {
        let mut push = |message: String| {
            issues.push(RuleIssue {
                condition: Some(index),
                message,
            })
        };

        if condition.field.trim().is_empty() {
            push("field path is empty".to_string());
        }

        match condition.operator {
            ConditionOperator::Unknown => {
                push("unknown operator, condition never matches".to_string())
            }
            ConditionOperator::In | ConditionOperator::NotIn => {
                if !condition.value.is_array() {
                    push("in/not_in expects an array value".to_string());
                }
            }
            ConditionOperator::Between => match &condition.value {
                Value::Array(bounds) if bounds.len() == 2 => {}
                _ => push("between expects a [low, high] array".to_string()),
            },
            ConditionOperator::Regex => {
                let pattern = js_string(Some(&condition.value));
                if let Err(e) = RegexBuilder::new(&pattern).case_insensitive(true).build() {
                    push(format!("invalid regex: {}", e));
                }
            }
            ConditionOperator::Gt
            | ConditionOperator::Gte
            | ConditionOperator::Lt
            | ConditionOperator::Lte => {
                if to_number(Some(&condition.value)).is_none() {
                    push("comparison value is not numeric".to_string());
                }
            }
            ConditionOperator::Eq
            | ConditionOperator::Neq
            | ConditionOperator::Contains
            | ConditionOperator::NotContains => {}
        }
    }

    issues
}
