//! Switch rule evaluation
//!
//! A switch node carries an ordered rule list; the first rule whose
//! `(field, operator, value)` triple matches emits its `id` as the route.
//! Numeric operators parse both operands as numbers, datetime operators
//! parse ISO-8601; a parse mismatch makes the rule not match rather than
//! erroring. With no matching rule the route is `__other__` when fallback is
//! enabled, otherwise the empty string (pruning every conditional branch).

use crate::graph::FALLBACK_ROUTE;
use crate::state::ExecutionState;
use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Comparison operator of a switch rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    // Universal
    Exists,
    IsEmpty,
    // String
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    MatchesRegex,
    NotMatchesRegex,
    // Numeric
    Gt,
    Lt,
    Gte,
    Lte,
    // Datetime (ISO-8601 operands)
    After,
    Before,
    OnOrAfter,
    OnOrBefore,
    // Boolean
    IsTrue,
    IsFalse,
    // Array length
    LengthEq,
    LengthGt,
    LengthLt,
    LengthGte,
    LengthLte,
}

/// One entry in a switch node's ordered rule list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRule {
    /// Emitted as the route when this rule matches first
    pub id: String,

    /// Dotted path resolved against the execution state
    pub field: String,

    pub operator: RuleOperator,

    /// Right-hand operand; unused by unary operators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Evaluate rules top-to-bottom; returns the emitted route string
pub fn evaluate_rules(
    rules: &[SwitchRule],
    enable_fallback: bool,
    state: &ExecutionState,
) -> String {
    for rule in rules {
        let field = state.lookup(&rule.field);
        if rule_matches(rule, field.as_ref()) {
            debug!(rule_id = %rule.id, field = %rule.field, "switch rule matched");
            return rule.id.clone();
        }
    }
    if enable_fallback {
        FALLBACK_ROUTE.to_string()
    } else {
        String::new()
    }
}

fn rule_matches(rule: &SwitchRule, field: Option<&Value>) -> bool {
    use RuleOperator::*;

    match rule.operator {
        Exists => return field.map(|v| !v.is_null()).unwrap_or(false),
        IsEmpty => return is_empty(field),
        _ => {}
    }

    // Everything below needs a present field.
    let Some(field) = field else {
        return false;
    };

    match rule.operator {
        Equals => string_cmp(field, &rule.value, |a, b| a == b),
        NotEquals => string_cmp(field, &rule.value, |a, b| a != b),
        Contains => string_cmp(field, &rule.value, |a, b| a.contains(b)),
        NotContains => string_cmp(field, &rule.value, |a, b| !a.contains(b)),
        StartsWith => string_cmp(field, &rule.value, |a, b| a.starts_with(b)),
        NotStartsWith => string_cmp(field, &rule.value, |a, b| !a.starts_with(b)),
        EndsWith => string_cmp(field, &rule.value, |a, b| a.ends_with(b)),
        NotEndsWith => string_cmp(field, &rule.value, |a, b| !a.ends_with(b)),
        MatchesRegex => regex_match(field, &rule.value).unwrap_or(false),
        NotMatchesRegex => regex_match(field, &rule.value).map(|m| !m).unwrap_or(false),
        Gt => numeric_cmp(field, &rule.value, |a, b| a > b),
        Lt => numeric_cmp(field, &rule.value, |a, b| a < b),
        Gte => numeric_cmp(field, &rule.value, |a, b| a >= b),
        Lte => numeric_cmp(field, &rule.value, |a, b| a <= b),
        After => datetime_cmp(field, &rule.value, |a, b| a > b),
        Before => datetime_cmp(field, &rule.value, |a, b| a < b),
        OnOrAfter => datetime_cmp(field, &rule.value, |a, b| a >= b),
        OnOrBefore => datetime_cmp(field, &rule.value, |a, b| a <= b),
        IsTrue => field.as_bool() == Some(true),
        IsFalse => field.as_bool() == Some(false),
        LengthEq => length_cmp(field, &rule.value, |a, b| a == b),
        LengthGt => length_cmp(field, &rule.value, |a, b| a > b),
        LengthLt => length_cmp(field, &rule.value, |a, b| a < b),
        LengthGte => length_cmp(field, &rule.value, |a, b| a >= b),
        LengthLte => length_cmp(field, &rule.value, |a, b| a <= b),
        Exists | IsEmpty => unreachable!("handled above"),
    }
}

fn is_empty(field: Option<&Value>) -> bool {
    match field {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Scalar-to-string coercion; objects and arrays never match string operators
fn as_match_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_cmp(field: &Value, value: &Option<Value>, cmp: impl Fn(&str, &str) -> bool) -> bool {
    let (Some(lhs), Some(rhs)) = (
        as_match_string(field),
        value.as_ref().and_then(as_match_string),
    ) else {
        return false;
    };
    cmp(&lhs, &rhs)
}

fn regex_match(field: &Value, value: &Option<Value>) -> Option<bool> {
    let lhs = as_match_string(field)?;
    let pattern = value.as_ref().and_then(|v| v.as_str())?;
    let regex = Regex::new(pattern).ok()?;
    Some(regex.is_match(&lhs))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_cmp(field: &Value, value: &Option<Value>, cmp: impl Fn(f64, f64) -> bool) -> bool {
    let (Some(lhs), Some(rhs)) = (as_number(field), value.as_ref().and_then(as_number)) else {
        return false;
    };
    cmp(lhs, rhs)
}

fn as_datetime(value: &Value) -> Option<DateTime<chrono::FixedOffset>> {
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text).ok()
}

fn datetime_cmp(
    field: &Value,
    value: &Option<Value>,
    cmp: impl Fn(DateTime<chrono::FixedOffset>, DateTime<chrono::FixedOffset>) -> bool,
) -> bool {
    let (Some(lhs), Some(rhs)) = (as_datetime(field), value.as_ref().and_then(as_datetime))
    else {
        return false;
    };
    cmp(lhs, rhs)
}

fn length_cmp(field: &Value, value: &Option<Value>, cmp: impl Fn(f64, f64) -> bool) -> bool {
    let Value::Array(items) = field else {
        return false;
    };
    let Some(rhs) = value.as_ref().and_then(as_number) else {
        return false;
    };
    cmp(items.len() as f64, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ExecutionState {
        ExecutionState::seeded(json!({
            "text": "hello world",
            "count": "42",
            "flag": true,
            "items": [1, 2, 3],
            "when": "2026-03-01T12:00:00Z"
        }))
    }

    fn rule(id: &str, field: &str, operator: RuleOperator, value: Option<Value>) -> SwitchRule {
        SwitchRule {
            id: id.to_string(),
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            rule("a", "trigger.text", RuleOperator::Contains, Some(json!("world"))),
            rule("b", "trigger.text", RuleOperator::Contains, Some(json!("hello"))),
        ];
        assert_eq!(evaluate_rules(&rules, false, &state()), "a");
    }

    #[test]
    fn test_no_match_with_fallback() {
        let rules = vec![rule(
            "a",
            "trigger.text",
            RuleOperator::Equals,
            Some(json!("nope")),
        )];
        assert_eq!(evaluate_rules(&rules, true, &state()), FALLBACK_ROUTE);
        assert_eq!(evaluate_rules(&rules, false, &state()), "");
    }

    #[test]
    fn test_empty_rules() {
        assert_eq!(evaluate_rules(&[], false, &state()), "");
        assert_eq!(evaluate_rules(&[], true, &state()), FALLBACK_ROUTE);
    }

    #[test]
    fn test_numeric_parses_strings() {
        let rules = vec![rule("big", "trigger.count", RuleOperator::Gt, Some(json!(40)))];
        assert_eq!(evaluate_rules(&rules, false, &state()), "big");
    }

    #[test]
    fn test_numeric_parse_mismatch_is_no_match() {
        let rules = vec![rule("x", "trigger.text", RuleOperator::Gt, Some(json!(1)))];
        assert_eq!(evaluate_rules(&rules, false, &state()), "");
    }

    #[test]
    fn test_datetime_comparison() {
        let rules = vec![rule(
            "future",
            "trigger.when",
            RuleOperator::After,
            Some(json!("2026-01-01T00:00:00Z")),
        )];
        assert_eq!(evaluate_rules(&rules, false, &state()), "future");
    }

    #[test]
    fn test_boolean_operators() {
        let rules = vec![rule("on", "trigger.flag", RuleOperator::IsTrue, None)];
        assert_eq!(evaluate_rules(&rules, false, &state()), "on");
        let rules = vec![rule("off", "trigger.flag", RuleOperator::IsFalse, None)];
        assert_eq!(evaluate_rules(&rules, false, &state()), "");
    }

    #[test]
    fn test_length_operators() {
        let rules = vec![rule(
            "three",
            "trigger.items",
            RuleOperator::LengthEq,
            Some(json!(3)),
        )];
        assert_eq!(evaluate_rules(&rules, false, &state()), "three");
    }

    #[test]
    fn test_exists_and_is_empty() {
        let rules = vec![rule("has", "trigger.text", RuleOperator::Exists, None)];
        assert_eq!(evaluate_rules(&rules, false, &state()), "has");
        let rules = vec![rule("empty", "trigger.ghost", RuleOperator::IsEmpty, None)];
        assert_eq!(evaluate_rules(&rules, false, &state()), "empty");
    }

    #[test]
    fn test_regex_operator() {
        let rules = vec![rule(
            "match",
            "trigger.text",
            RuleOperator::MatchesRegex,
            Some(json!("^hello\\s")),
        )];
        assert_eq!(evaluate_rules(&rules, false, &state()), "match");
    }

    #[test]
    fn test_rules_deserialize_from_config() {
        let rules: Vec<SwitchRule> = serde_json::from_value(json!([
            {"id": "a", "field": "trigger.text", "operator": "equals", "value": "x"},
            {"id": "b", "field": "trigger.n", "operator": "length_gte", "value": 2}
        ]))
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].operator, RuleOperator::LengthGte);
    }
}
