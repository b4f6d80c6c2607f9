//! Deterministic transition conditions over dynamic variables.
//!
//! Grammar: clauses joined by `&&` and `||` (`&&` binds tighter). A clause is
//! `name OP value` with OP one of `== != >= <= > <` (a single `=` is accepted
//! as `==`), a bare `name` (truthiness), `!name`, or `exists(name)`. The value
//! is a literal (number, boolean, `null`, quoted or bare string) or the name of
//! another variable. Comparisons are numeric when both sides are numbers and
//! textual otherwise.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

// Longest operators first so `>=` is not read as `>`.
const OPERATORS: [(&str, Operator); 7] = [
    ("==", Operator::Eq),
    ("!=", Operator::Ne),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
    ("=", Operator::Eq),
];

#[derive(Clone, Debug, PartialEq)]
enum Clause {
    Truthy { name: String, negated: bool },
    Exists(String),
    Compare { name: String, operator: Operator, operand: String },
}

/// A parsed equation: a disjunction of conjunctions of clauses.
#[derive(Clone, Debug, PartialEq)]
pub struct Equation {
    any_of: Vec<Vec<Clause>>,
}

impl Equation {
    /// Parse an expression. Fails on empty clauses, unterminated strings and
    /// malformed variable names.
    pub fn parse(expression: &str) -> DomainResult<Self> {
        let invalid = |reason: String| DomainError::InvalidEquation {
            expression: expression.to_string(),
            reason,
        };

        if expression.trim().is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let mut any_of = Vec::new();
        for disjunct in split_outside_quotes(expression, "||").map_err(&invalid)? {
            let mut all_of = Vec::new();
            for raw in split_outside_quotes(disjunct, "&&").map_err(&invalid)? {
                let raw = raw.trim();
                if raw.is_empty() {
                    return Err(invalid("empty clause".to_string()));
                }
                all_of.push(parse_clause(raw).map_err(&invalid)?);
            }
            any_of.push(all_of);
        }
        Ok(Self { any_of })
    }

    /// True if any `||` branch has every clause holding. A missing variable is
    /// falsy and only satisfies `!=`.
    pub fn evaluate(&self, variables: &HashMap<String, Value>) -> bool {
        self.any_of
            .iter()
            .any(|all_of| all_of.iter().all(|clause| clause_holds(clause, variables)))
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(expression: &str, variables: &HashMap<String, Value>) -> DomainResult<bool> {
    Ok(Equation::parse(expression)?.evaluate(variables))
}

fn split_outside_quotes<'a>(text: &'a str, separator: &str) -> Result<Vec<&'a str>, String> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut iter = text.char_indices();

    while let Some((idx, ch)) = iter.next() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if text[idx..].starts_with(separator) => {
                parts.push(&text[start..idx]);
                start = idx + separator.len();
                for _ in 1..separator.len() {
                    iter.next();
                }
            }
            None => {}
        }
    }

    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn parse_clause(raw: &str) -> Result<Clause, String> {
    if let Some(inner) = raw
        .strip_prefix("exists(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let name = inner.trim();
        check_name(name)?;
        return Ok(Clause::Exists(name.to_string()));
    }

    if let Some((idx, op_text, operator)) = find_operator(raw) {
        let name = raw[..idx].trim();
        let operand = raw[idx + op_text.len()..].trim();
        check_name(name)?;
        if operand.is_empty() {
            return Err(format!("clause '{raw}' has no right-hand value"));
        }
        return Ok(Clause::Compare {
            name: name.to_string(),
            operator,
            operand: operand.to_string(),
        });
    }

    let (name, negated) = match raw.strip_prefix('!') {
        Some(rest) => (rest.trim(), true),
        None => (raw, false),
    };
    check_name(name)?;
    Ok(Clause::Truthy {
        name: name.to_string(),
        negated,
    })
}

/// Leftmost operator occurrence outside quotes.
fn find_operator(raw: &str) -> Option<(usize, &'static str, Operator)> {
    let mut quote: Option<char> = None;
    for (idx, ch) in raw.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None => {
                for (text, operator) in OPERATORS {
                    if raw[idx..].starts_with(text) {
                        return Some((idx, text, operator));
                    }
                }
            }
        }
    }
    None
}

fn check_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        Some(_) => return Err(format!("'{name}' is not a variable name")),
        None => return Err("clause has an empty variable name".to_string()),
    }
    if chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.') {
        Ok(())
    } else {
        Err(format!("'{name}' is not a variable name"))
    }
}

fn clause_holds(clause: &Clause, variables: &HashMap<String, Value>) -> bool {
    match clause {
        Clause::Exists(name) => variables.get(name).is_some_and(|v| !v.is_null()),
        Clause::Truthy { name, negated } => is_truthy(variables.get(name)) != *negated,
        Clause::Compare { name, operator, operand } => {
            let right = resolve_operand(operand, variables);
            let Some(left) = variables.get(name) else {
                return *operator == Operator::Ne;
            };
            let ordering = compare(left, &right);
            match operator {
                Operator::Eq => ordering == Some(Ordering::Equal),
                Operator::Ne => ordering != Some(Ordering::Equal),
                Operator::Gt => ordering == Some(Ordering::Greater),
                Operator::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                Operator::Lt => ordering == Some(Ordering::Less),
                Operator::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            }
        }
    }
}

fn resolve_operand(raw: &str, variables: &HashMap<String, Value>) -> Value {
    for quote in ['"', '\''] {
        if let Some(inner) = raw.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return Value::String(inner.to_string());
        }
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(integer) = raw.parse::<i64>() {
        return Value::Number(integer.into());
    }
    if let Some(number) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Value::Number(number);
    }
    if let Some(value) = variables.get(raw) {
        return value.clone();
    }
    Value::String(raw.to_string())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r);
    }
    Some(as_text(left).cmp(&as_text(right)))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => {
            let s = s.trim();
            !(s.is_empty() || s.eq_ignore_ascii_case("false") || s == "0")
        }
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}
