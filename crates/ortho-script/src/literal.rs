//! Literal-only evaluation for experiment files and command-line values.

use crate::ast::{DictItem, Expr, UnaryOp};
use crate::error::ParseError;
use crate::parser::parse_expression;
use crate::value::Value;
use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LiteralError {
    #[error("syntax error on line {}: {}", .0.line, .0.message)]
    Parse(#[from] ParseError),
    #[error("not a literal: {0}")]
    NotLiteral(String),
    #[error("repeated keys in dictionary literal: {0}")]
    DuplicateKeys(String),
}

/// Evaluate `text` if it is a single literal expression. Dicts anywhere in the
/// expression must not repeat a key.
pub fn read_literal(text: &str) -> Result<Value, LiteralError> {
    let expr = parse_expression(text)?;
    let mut repeats = Vec::new();
    let value = literal_value(&expr, &mut repeats)?;
    if !repeats.is_empty() {
        return Err(LiteralError::DuplicateKeys(repeats.join(", ")));
    }
    Ok(value)
}

fn literal_value(expr: &Expr, repeats: &mut Vec<String>) -> Result<Value, LiteralError> {
    Ok(match expr {
        Expr::None => Value::None,
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Int(i) => Value::Int(*i),
        Expr::Float(f) => Value::Float(*f),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::List(items) => Value::list(
            items
                .iter()
                .map(|e| literal_value(e, repeats))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Tuple(items) => Value::tuple(
            items
                .iter()
                .map(|e| literal_value(e, repeats))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Dict(items) => Value::dict(literal_dict(items, repeats)?),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match literal_value(operand, repeats)? {
            Value::Int(i) => Value::Int(-i),
            Value::Float(f) => Value::Float(-f),
            _ => return Err(LiteralError::NotLiteral("unary minus on a non-number".into())),
        },
        Expr::Unary {
            op: UnaryOp::Pos,
            operand,
        } => match literal_value(operand, repeats)? {
            v @ (Value::Int(_) | Value::Float(_)) => v,
            _ => return Err(LiteralError::NotLiteral("unary plus on a non-number".into())),
        },
        other => return Err(LiteralError::NotLiteral(describe(other).to_string())),
    })
}

fn literal_dict(
    items: &[DictItem],
    repeats: &mut Vec<String>,
) -> Result<IndexMap<String, Value>, LiteralError> {
    let mut out = IndexMap::with_capacity(items.len());
    let mut first_line: IndexMap<String, usize> = IndexMap::new();
    let mut reported: IndexMap<String, Vec<usize>> = IndexMap::new();
    for item in items {
        let key = literal_value(&item.key, repeats)?
            .as_key()
            .map_err(|e| LiteralError::NotLiteral(e.message))?;
        match first_line.get(&key) {
            Some(first) => reported
                .entry(key.clone())
                .or_insert_with(|| vec![*first])
                .push(item.line),
            None => {
                first_line.insert(key.clone(), item.line);
            }
        }
        out.insert(key, literal_value(&item.value, repeats)?);
    }
    for (key, lines) in reported {
        let lines: Vec<String> = lines.iter().map(usize::to_string).collect();
        repeats.push(format!("'{}' (lines {})", key, lines.join(", ")));
    }
    Ok(out)
}

fn describe(expr: &Expr) -> &'static str {
    match expr {
        Expr::Name(_) => "name",
        Expr::Call { .. } => "function call",
        Expr::Attribute { .. } => "attribute access",
        Expr::Subscript { .. } | Expr::Slice { .. } => "subscript",
        Expr::ListComp { .. } => "comprehension",
        Expr::Binary { .. } => "arithmetic",
        Expr::Compare { .. } | Expr::BoolOp { .. } => "comparison",
        Expr::IfExp { .. } => "conditional expression",
        _ => "expression",
    }
}

/// Interpret a command-line value: booleans, `None`, integers, floats, then
/// literal syntax, and finally the raw string.
pub fn interpret_value(text: &str) -> Value {
    match text {
        "True" | "true" => return Value::Bool(true),
        "False" | "false" => return Value::Bool(false),
        "None" => return Value::None,
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        if f.is_finite() {
            return Value::Float(f);
        }
    }
    read_literal(text).unwrap_or_else(|_| Value::str(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_literals_in_order() {
        let v = read_literal("{'b': [1, -2.5, None], 'a': ('x', True)}").expect("literal");
        assert_eq!(v.repr(), "{'b': [1, -2.5, None], 'a': ('x', True)}");
    }

    #[test]
    fn repeated_keys_are_named_with_lines() {
        let text = "{\n  'one': {'script': 'a.py'},\n  'two': {},\n  'one': {},\n}\n";
        let err = read_literal(text).expect_err("duplicate");
        let msg = err.to_string();
        assert!(msg.contains("'one' (lines 2, 4)"), "{}", msg);
    }

    #[test]
    fn nested_repeats_are_reported_too() {
        let err = read_literal("{'e': {'k': 1, 'k': 2}}").expect_err("duplicate");
        assert!(matches!(err, LiteralError::DuplicateKeys(_)));
    }

    #[test]
    fn non_literals_are_refused() {
        assert!(matches!(
            read_literal("open('x')"),
            Err(LiteralError::NotLiteral(_))
        ));
        assert!(matches!(read_literal("1 +"), Err(LiteralError::Parse(_))));
    }

    #[test]
    fn interpret_value_prefers_scalars_then_literals() {
        assert_eq!(interpret_value("true"), Value::Bool(true));
        assert_eq!(interpret_value("None"), Value::None);
        assert_eq!(interpret_value("42"), Value::Int(42));
        assert_eq!(interpret_value("0.5"), Value::Float(0.5));
        assert_eq!(interpret_value("[1,2]").repr(), "[1, 2]");
        assert_eq!(interpret_value("md.mdp"), Value::str("md.mdp"));
        assert_eq!(interpret_value("inf"), Value::str("inf"));
    }
}
