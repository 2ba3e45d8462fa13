//! Expression resolution for templated strings
//!
//! Renders `{{ path }}` substitutions and `{% if %}` blocks against a
//! read-only [`ExecutionState`] view. Path lookup supports dotted access and
//! list indexing (see [`ExecutionState::lookup`]); a `|` pipeline applies the
//! fixed filter set `upper`, `lower`, `default`, `selectattr`, `map`,
//! `first`, `tojson`.
//!
//! Resolution is side-effect-free and happens immediately before a node
//! runs, never at compile time. Unresolvable paths render to the empty
//! string unless a `default` filter intervenes; under strict rendering they
//! raise [`CoreError::Template`] instead.

use crate::error::{CoreError, Result};
use crate::state::ExecutionState;
use serde_json::Value;
use tracing::warn;

/// Render a template leniently; resolution failures log and render empty
pub fn render(template: &str, state: &ExecutionState) -> String {
    match render_inner(template, state, false) {
        Ok(rendered) => rendered,
        Err(err) => {
            // Lenient mode never fails the caller; the raw text is better
            // than nothing.
            warn!(error = %err, "template resolution failed, using raw text");
            template.to_string()
        }
    }
}

/// Render a template strictly; unresolvable paths are an error
pub fn try_render(template: &str, state: &ExecutionState) -> Result<String> {
    render_inner(template, state, true)
}

fn render_inner(template: &str, state: &ExecutionState, strict: bool) -> Result<String> {
    let without_blocks = render_blocks(template, state, strict)?;
    substitute(&without_blocks, state, strict)
}

/// Locate the next `{% ... %}` tag, returning (start, end, trimmed content)
fn find_tag(input: &str) -> Option<(usize, usize, &str)> {
    let start = input.find("{%")?;
    let close = input[start..].find("%}")? + start + 2;
    let content = input[start + 2..close - 2].trim();
    Some((start, close, content))
}

/// Expand `{% if %}` blocks; any other tag renders to the empty string
fn render_blocks(input: &str, state: &ExecutionState, strict: bool) -> Result<String> {
    let mut out = String::new();
    let mut rest = input;

    while let Some((start, end, tag)) = find_tag(rest) {
        out.push_str(&rest[..start]);
        if let Some(condition) = tag.strip_prefix("if ") {
            let (body, after) = split_if_block(&rest[end..])?;
            let (then_part, else_part) = split_else(body);
            let chosen = if eval_condition(condition, state) {
                then_part
            } else {
                else_part
            };
            out.push_str(&render_blocks(chosen, state, strict)?);
            rest = after;
        } else {
            // Unknown or stray tag: drop it.
            rest = &rest[end..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Split an if-block body from the text following its matching endif
fn split_if_block(input: &str) -> Result<(&str, &str)> {
    let mut depth = 0usize;
    let mut rest = input;
    let mut consumed = 0usize;

    while let Some((start, end, tag)) = find_tag(rest) {
        if tag.starts_with("if ") {
            depth += 1;
        } else if tag == "endif" {
            if depth == 0 {
                return Ok((&input[..consumed + start], &input[consumed + end..]));
            }
            depth -= 1;
        }
        consumed += end;
        rest = &input[consumed..];
    }
    Err(CoreError::Template("unterminated {% if %} block".to_string()))
}

/// Split an if-body at its top-level `{% else %}`, if any
fn split_else(body: &str) -> (&str, &str) {
    let mut depth = 0usize;
    let mut rest = body;
    let mut consumed = 0usize;

    while let Some((start, end, tag)) = find_tag(rest) {
        if tag.starts_with("if ") {
            depth += 1;
        } else if tag == "endif" && depth > 0 {
            depth -= 1;
        } else if tag == "else" && depth == 0 {
            return (&body[..consumed + start], &body[consumed + end..]);
        }
        consumed += end;
        rest = &body[consumed..];
    }
    (body, "")
}

fn eval_condition(condition: &str, state: &ExecutionState) -> bool {
    let condition = condition.trim();
    if let Some(inner) = condition.strip_prefix("not ") {
        return !truthy(&state.lookup(inner.trim()).unwrap_or(Value::Null));
    }
    truthy(&state.lookup(condition).unwrap_or(Value::Null))
}

/// Jinja-style truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Substitute every `{{ expr }}` occurrence
fn substitute(input: &str, state: &ExecutionState, strict: bool) -> Result<String> {
    let mut out = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        let Some(close_rel) = rest[start..].find("}}") else {
            break;
        };
        let close = start + close_rel;
        out.push_str(&rest[..start]);
        let expr = rest[start + 2..close].trim();
        out.push_str(&eval_expression(expr, state, strict)?);
        rest = &rest[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_expression(expr: &str, state: &ExecutionState, strict: bool) -> Result<String> {
    let stages = split_pipeline(expr);
    let Some((head, filters)) = stages.split_first() else {
        return Ok(String::new());
    };

    let mut value = state.lookup(head.trim()).unwrap_or(Value::Null);
    if strict
        && value.is_null()
        && !filters.iter().any(|f| f.trim().starts_with("default"))
    {
        return Err(CoreError::Template(format!(
            "path '{}' did not resolve",
            head.trim()
        )));
    }

    for filter in filters {
        value = apply_filter(filter.trim(), value)?;
    }
    Ok(value_to_string(&value))
}

/// Split on `|` at the top level, respecting quotes and parentheses
fn split_pipeline(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut parens = 0usize;

    for ch in expr.chars() {
        match ch {
            '\'' | '"' => {
                match in_quote {
                    Some(q) if q == ch => in_quote = None,
                    None => in_quote = Some(ch),
                    _ => {}
                }
                current.push(ch);
            }
            '(' if in_quote.is_none() => {
                parens += 1;
                current.push(ch);
            }
            ')' if in_quote.is_none() => {
                parens = parens.saturating_sub(1);
                current.push(ch);
            }
            '|' if in_quote.is_none() && parens == 0 => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Parse `name` or `name(arg, ...)` into the name and literal args
fn parse_filter(filter: &str) -> (String, Vec<Value>) {
    match filter.find('(') {
        Some(open) => {
            let name = filter[..open].trim().to_string();
            let inner = filter[open + 1..].trim_end_matches(')');
            let args = split_args(inner)
                .into_iter()
                .map(|arg| parse_literal(&arg))
                .collect();
            (name, args)
        }
        None => (filter.trim().to_string(), Vec::new()),
    }
}

fn split_args(inner: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;

    for ch in inner.chars() {
        match ch {
            '\'' | '"' => {
                match in_quote {
                    Some(q) if q == ch => in_quote = None,
                    None => in_quote = Some(ch),
                    _ => {}
                }
                current.push(ch);
            }
            ',' if in_quote.is_none() => {
                args.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn parse_literal(arg: &str) -> Value {
    let trimmed = arg.trim();
    if (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
        || (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
    {
        return Value::String(trimmed[1..trimmed.len() - 1].to_string());
    }
    if trimmed == "true" {
        return Value::Bool(true);
    }
    if trimmed == "false" {
        return Value::Bool(false);
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(trimmed.to_string())
}

fn apply_filter(filter: &str, value: Value) -> Result<Value> {
    let (name, args) = parse_filter(filter);
    let result = match name.as_str() {
        "upper" => Value::String(value_to_string(&value).to_uppercase()),
        "lower" => Value::String(value_to_string(&value).to_lowercase()),
        "default" => {
            let fallback = args.into_iter().next().unwrap_or(Value::Null);
            let empty = value.is_null()
                || matches!(&value, Value::String(s) if s.is_empty());
            if empty {
                fallback
            } else {
                value
            }
        }
        "first" => match value {
            Value::Array(items) => items.into_iter().next().unwrap_or(Value::Null),
            other => other,
        },
        "tojson" => Value::String(serde_json::to_string(&value)?),
        "map" => {
            let attr = args
                .first()
                .and_then(|a| a.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| item.get(&attr).cloned().unwrap_or(Value::Null))
                        .collect(),
                ),
                _ => Value::Null,
            }
        }
        "selectattr" => {
            let attr = args
                .first()
                .and_then(|a| a.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            let expected = args.get(1).cloned();
            match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .filter(|item| {
                            let field = item.get(&attr).cloned().unwrap_or(Value::Null);
                            match &expected {
                                Some(want) => &field == want,
                                None => truthy(&field),
                            }
                        })
                        .collect(),
                ),
                _ => Value::Null,
            }
        }
        other => {
            return Err(CoreError::Template(format!("unknown filter '{other}'")));
        }
    };
    Ok(result)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
