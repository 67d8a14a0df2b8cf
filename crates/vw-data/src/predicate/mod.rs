//! Remove predicates
//!
//! A predicate selects the rows a `remove` (or the remove half of a changeset)
//! drops from a table. Host-supplied predicate strings are parsed into a small
//! expression tree and evaluated against each row; nothing is ever executed.

mod parser;

use serde_json::Value;
use std::fmt;

use crate::DataError;

/// Row selector for removals
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row (full table replace when paired with an insert)
    Everything,
    /// Matches rows structurally equal to one of these tuples
    Rows(Vec<Value>),
    /// Matches rows for which the expression is truthy
    Expr(Expr),
}

/// Parsed predicate expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Path into the row; an empty path is the row itself
    Field(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Binary operators understood by the expression language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Predicate {
    /// Parse a serialized predicate expression
    ///
    /// Accepts an optional leading `return` and trailing `;`, so function
    /// bodies written against the widget's `data_remove` argument keep working.
    pub fn parse(source: &str) -> Result<Self, DataError> {
        parser::parse(source).map(Predicate::Expr)
    }

    /// Whether the predicate selects this row
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Predicate::Everything => true,
            Predicate::Rows(rows) => rows.iter().any(|candidate| candidate == row),
            Predicate::Expr(expr) => truthy(&expr.eval(row)),
        }
    }
}

impl Expr {
    /// Evaluate against a row
    pub fn eval(&self, row: &Value) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Field(path) => path
                .iter()
                .try_fold(row, |current, key| current.get(key.as_str()))
                .cloned()
                .unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(row))),
            Expr::Neg(inner) => match numeric(&inner.eval(row)) {
                Some(n) => number(-n),
                None => Value::Null,
            },
            Expr::Binary { op, lhs, rhs } => {
                // Short-circuit like the host language does
                match op {
                    BinaryOp::Or => {
                        let left = lhs.eval(row);
                        if truthy(&left) {
                            left
                        } else {
                            rhs.eval(row)
                        }
                    }
                    BinaryOp::And => {
                        let left = lhs.eval(row);
                        if truthy(&left) {
                            rhs.eval(row)
                        } else {
                            left
                        }
                    }
                    other => binary(*other, &lhs.eval(row), &rhs.eval(row)),
                }
            }
        }
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(loosely_equal(left, right)),
        BinaryOp::Ne => Value::Bool(!loosely_equal(left, right)),
        BinaryOp::StrictEq => Value::Bool(strictly_equal(left, right)),
        BinaryOp::StrictNe => Value::Bool(!strictly_equal(left, right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => match (numeric(left), numeric(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Value::String(format!("{}{}", a, display(b))),
            (a, Value::String(b)) => Value::String(format!("{}{}", display(a), b)),
            _ => arithmetic(left, right, |a, b| a + b),
        },
        BinaryOp::Sub => arithmetic(left, right, |a, b| a - b),
        BinaryOp::Mul => arithmetic(left, right, |a, b| a * b),
        BinaryOp::Div => arithmetic(left, right, |a, b| a / b),
        BinaryOp::Rem => arithmetic(left, right, |a, b| a % b),
        BinaryOp::Or if truthy(left) => left.clone(),
        BinaryOp::Or => right.clone(),
        BinaryOp::And if truthy(left) => right.clone(),
        BinaryOp::And => left.clone(),
    }
}

fn arithmetic(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Value {
    match (numeric(left), numeric(right)) {
        (Some(a), Some(b)) => number(f(a, b)),
        _ => Value::Null,
    }
}

/// Non-finite results collapse to null, which is falsy
fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// `==`: booleans and numeric strings compare as numbers
///
/// Null only equals null. Arrays and objects compare structurally.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => left == right,
        _ => match (numeric(left), numeric(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// `===`: no coercion, but `1` and `1.0` are the same number
fn strictly_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Numeric value of a scalar
///
/// Null stands for a missing field and has none, so it never compares or
/// computes.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Some(0.0);
            }
            s.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness of an evaluated value
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::StrictEq => "===",
            BinaryOp::StrictNe => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        };
        f.write_str(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_everything_matches_any_row() {
        assert!(Predicate::Everything.matches(&json!({"x": 1})));
        assert!(Predicate::Everything.matches(&Value::Null));
    }

    #[test]
    fn test_structural_rows() {
        let predicate = Predicate::Rows(vec![json!({"x": 1, "y": 2})]);
        assert!(predicate.matches(&json!({"x": 1, "y": 2})));
        assert!(!predicate.matches(&json!({"x": 1, "y": 3})));
    }

    #[test]
    fn test_expression_against_datum() {
        let predicate = Predicate::parse("datum.x > 2 && datum.category == 'a'").unwrap();
        assert!(predicate.matches(&json!({"x": 3, "category": "a"})));
        assert!(!predicate.matches(&json!({"x": 3, "category": "b"})));
        assert!(!predicate.matches(&json!({"x": 1, "category": "a"})));
    }

    #[test]
    fn test_function_body_form() {
        let predicate = Predicate::parse("return data_remove.x % 2 == 0;").unwrap();
        assert!(predicate.matches(&json!({"x": 4})));
        assert!(!predicate.matches(&json!({"x": 5})));
    }

    #[test]
    fn test_missing_field_is_falsy() {
        let predicate = Predicate::parse("datum.missing").unwrap();
        assert!(!predicate.matches(&json!({"x": 1})));
    }

    #[test]
    fn test_string_concatenation_and_negation() {
        let predicate = Predicate::parse("datum.a + '-' + datum.b == 'x-1' && !(-datum.n > 0)").unwrap();
        assert!(predicate.matches(&json!({"a": "x", "b": 1, "n": 3})));
    }

    #[test]
    fn test_loose_equality_coerces_scalars() {
        let predicate = Predicate::parse("datum.x == 1").unwrap();
        assert!(predicate.matches(&json!({"x": "1"})));
        assert!(predicate.matches(&json!({"x": " 1.0 "})));
        assert!(predicate.matches(&json!({"x": true})));
        assert!(!predicate.matches(&json!({"x": "one"})));
        assert!(!predicate.matches(&json!({})));

        assert!(Predicate::parse("datum.flag == 0").unwrap().matches(&json!({"flag": false})));
        assert!(Predicate::parse("datum.label == ''").unwrap().matches(&json!({"label": ""})));
        assert!(!Predicate::parse("datum.x == null").unwrap().matches(&json!({"x": 0})));
        assert!(Predicate::parse("datum.x == null").unwrap().matches(&json!({"y": 0})));
    }

    #[test]
    fn test_strict_equality_does_not_coerce() {
        let predicate = Predicate::parse("datum.x === 1").unwrap();
        assert!(predicate.matches(&json!({"x": 1})));
        assert!(predicate.matches(&json!({"x": 1.0})));
        assert!(!predicate.matches(&json!({"x": "1"})));
        assert!(!predicate.matches(&json!({"x": true})));
        assert!(Predicate::parse("datum.x !== '1'").unwrap().matches(&json!({"x": 1})));
    }

    #[test]
    fn test_numeric_strings_compare_as_numbers() {
        let predicate = Predicate::parse("datum.x > 9").unwrap();
        assert!(predicate.matches(&json!({"x": "10"})));
        // Two strings still compare lexically
        assert!(!Predicate::parse("datum.x > '9'").unwrap().matches(&json!({"x": "10"})));
        assert!(!predicate.matches(&json!({"x": null})));
    }
}
