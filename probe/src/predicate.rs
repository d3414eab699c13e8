//! Predicate evaluation for uptime-api services.
//!
//! Grammar: `<path>` alone (truthy test) or `<path> <op> <literal>` with
//! `==`, `!=`, `>`, `>=`, `<`, `<=`. Paths are dot-separated object keys
//! with optional `[index]` array steps, e.g. `data.checks[0].state`.
//! Literals are JSON: quoted strings, numbers, `true`, `false`, `null`.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("empty predicate")]
    Empty,
    #[error("malformed literal: {0}")]
    BadLiteral(String),
    #[error("malformed path segment: {0}")]
    BadPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

fn split_operator(predicate: &str) -> Option<(&str, Op, &str)> {
    // Two-character operators first so ">=" is not read as ">" + "=".
    for (token, op) in [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
    ] {
        if let Some(idx) = predicate.find(token) {
            let (path, rest) = predicate.split_at(idx);
            return Some((path.trim(), op, rest[token.len()..].trim()));
        }
    }
    None
}

fn walk<'a>(body: &'a Value, path: &str) -> Result<Option<&'a Value>, PredicateError> {
    let mut current = body;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(PredicateError::BadPath(path.to_string()));
        }
        let (key, indices) = match segment.split_once('[') {
            Some((key, rest)) => (key, Some(rest)),
            None => (segment, None),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        if let Some(indices) = indices {
            for part in indices.split('[') {
                let idx: usize = part
                    .trim_end_matches(']')
                    .parse()
                    .map_err(|_| PredicateError::BadPath(segment.to_string()))?;
                match current.get(idx) {
                    Some(next) => current = next,
                    None => return Ok(None),
                }
            }
        }
    }
    Ok(Some(current))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: Op, right: &Value) -> bool {
    match op {
        Op::Eq => left == right,
        Op::Ne => left != right,
        Op::Gt | Op::Ge | Op::Lt | Op::Le => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return false;
            };
            match op {
                Op::Gt => l > r,
                Op::Ge => l >= r,
                Op::Lt => l < r,
                Op::Le => l <= r,
                _ => unreachable!(),
            }
        }
    }
}

pub fn evaluate_predicate(predicate: &str, body: &Value) -> Result<bool, PredicateError> {
    let predicate = predicate.trim();
    if predicate.is_empty() {
        return Err(PredicateError::Empty);
    }

    match split_operator(predicate) {
        Some((path, op, literal)) => {
            let expected: Value = serde_json::from_str(literal)
                .map_err(|_| PredicateError::BadLiteral(literal.to_string()))?;
            match walk(body, path)? {
                Some(actual) => Ok(compare(actual, op, &expected)),
                None => Ok(false),
            }
        }
        None => Ok(walk(body, predicate)?.map(truthy).unwrap_or(false)),
    }
}
