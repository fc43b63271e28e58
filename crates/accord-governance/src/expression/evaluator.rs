//! Evaluates conditions against an instance's attribute snapshot.
//!
//! A property with no value is treated as NULL: it equals only `NULL`, is
//! unequal to everything else, and never satisfies an ordering, `LIKE` or
//! `IN`.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value as JsonValue;
use thiserror::Error;

use super::ast::{Argument, Comparison, ComparisonOp, Expression, FunctionCall, Literal, Operand};
use super::functions::{FunctionContext, FunctionError, FunctionRegistry};

/// Compiled LIKE automaton cap.
const LIKE_SIZE_LIMIT: usize = 1 << 20;

/// Error during evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// A built-in failed.
    #[error(transparent)]
    Function(#[from] FunctionError),
    /// Operand and literal cannot be compared with the operator.
    #[error("Cannot apply '{operator}' to '{subject}': {left} vs {right}")]
    TypeMismatch {
        /// Property or function on the left.
        subject: String,
        /// Operator applied.
        operator: ComparisonOp,
        /// Type found on the left.
        left: String,
        /// Type of the literal.
        right: String,
    },
    /// A function used as a predicate did not return a boolean.
    #[error("{0}() does not return a boolean")]
    NotPredicate(String),
    /// LIKE pattern could not be compiled.
    #[error("Invalid LIKE pattern: {0}")]
    InvalidPattern(String),
}

/// Attribute snapshot plus function facts for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Values keyed by property (or context field) name.
    pub attributes: HashMap<String, JsonValue>,
    /// Facts consulted by built-in functions.
    pub functions: FunctionContext,
}

impl EvalContext {
    /// Empty context evaluated now.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set the function facts.
    #[must_use]
    pub fn with_functions(mut self, functions: FunctionContext) -> Self {
        self.functions = functions;
        self
    }

    /// Look up an attribute, exact name first, then case-insensitively.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&JsonValue> {
        self.attributes.get(name).or_else(|| {
            self.attributes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }
}

/// Pure evaluation of [`Expression`] trees.
pub struct Evaluator;

impl Evaluator {
    /// Evaluate `expr` to a boolean.
    pub fn evaluate(expr: &Expression, ctx: &EvalContext) -> Result<bool, EvalError> {
        match expr {
            Expression::Comparison(cmp) => Self::comparison(cmp, ctx),
            Expression::And(l, r) => Ok(Self::evaluate(l, ctx)? && Self::evaluate(r, ctx)?),
            Expression::Or(l, r) => Ok(Self::evaluate(l, ctx)? || Self::evaluate(r, ctx)?),
            Expression::Not(inner) => Ok(!Self::evaluate(inner, ctx)?),
            Expression::Group(inner) => Self::evaluate(inner, ctx),
            Expression::Call(call) => match Self::call(call, ctx)? {
                Literal::Boolean(b) => Ok(b),
                _ => Err(EvalError::NotPredicate(call.name.clone())),
            },
        }
    }

    fn call(call: &FunctionCall, ctx: &EvalContext) -> Result<Literal, EvalError> {
        let args: Vec<Literal> = call
            .arguments
            .iter()
            .map(|arg| match arg {
                Argument::Literal(lit) => lit.clone(),
                Argument::Property(name) => ctx
                    .attribute(name)
                    .map_or(Literal::Null, Literal::from_json),
            })
            .collect();
        Ok(FunctionRegistry::evaluate(&call.name, &args, &ctx.functions)?)
    }

    fn comparison(cmp: &Comparison, ctx: &EvalContext) -> Result<bool, EvalError> {
        let (subject, left) = match &cmp.left {
            Operand::Property(name) => (
                name.clone(),
                ctx.attribute(name).cloned().unwrap_or(JsonValue::Null),
            ),
            Operand::Call(call) => (call.name.clone(), Self::call(call, ctx)?.to_json()),
        };
        let op = cmp.operator;

        if left.is_null() || cmp.right == Literal::Null {
            let both_null = left.is_null() && cmp.right == Literal::Null;
            return Ok(match op {
                ComparisonOp::Equal => both_null,
                ComparisonOp::NotEqual => !both_null,
                _ => false,
            });
        }

        let mismatch = |left: &JsonValue| EvalError::TypeMismatch {
            subject: subject.clone(),
            operator: op,
            left: json_type_name(left).to_string(),
            right: cmp.right.type_name().to_string(),
        };

        match (op, &cmp.right) {
            (ComparisonOp::In, Literal::List(items)) => Ok(match &left {
                JsonValue::Array(values) => values
                    .iter()
                    .any(|v| items.iter().any(|item| loosely_equal(v, item))),
                scalar => items.iter().any(|item| loosely_equal(scalar, item)),
            }),
            (ComparisonOp::In, _) | (_, Literal::List(_)) => Err(mismatch(&left)),
            (ComparisonOp::Like, Literal::String(pattern)) => match &left {
                JsonValue::String(s) => like_match(s, pattern),
                other => Err(mismatch(other)),
            },
            (ComparisonOp::Like, _) => Err(mismatch(&left)),
            (ComparisonOp::Equal | ComparisonOp::NotEqual, right) => {
                let equal = match &left {
                    // A list attribute equals a scalar when it contains it.
                    JsonValue::Array(values) => values.iter().any(|v| loosely_equal(v, right)),
                    scalar => {
                        if !comparable(scalar, right) {
                            return Err(mismatch(scalar));
                        }
                        loosely_equal(scalar, right)
                    }
                };
                Ok(equal == (op == ComparisonOp::Equal))
            }
            (_, right) => {
                let ordering = order(&left, right).ok_or_else(|| mismatch(&left))?;
                Ok(match op {
                    ComparisonOp::LessThan => ordering == Ordering::Less,
                    ComparisonOp::GreaterThan => ordering == Ordering::Greater,
                    ComparisonOp::LessThanOrEqual => ordering != Ordering::Greater,
                    ComparisonOp::GreaterThanOrEqual => ordering != Ordering::Less,
                    _ => false,
                })
            }
        }
    }
}

fn comparable(left: &JsonValue, right: &Literal) -> bool {
    matches!(
        (left, right),
        (JsonValue::String(_), Literal::String(_))
            | (JsonValue::Number(_), Literal::Integer(_) | Literal::Float(_))
            | (JsonValue::Bool(_), Literal::Boolean(_))
    )
}

fn loosely_equal(left: &JsonValue, right: &Literal) -> bool {
    order(left, right) == Some(Ordering::Equal)
        || matches!((left, right), (JsonValue::Bool(a), Literal::Boolean(b)) if a == b)
}

/// Ordering between a context value and a literal of a compatible type.
fn order(left: &JsonValue, right: &Literal) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::String(a), Literal::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (JsonValue::Number(n), Literal::Integer(b)) => match n.as_i64() {
            Some(a) => Some(a.cmp(b)),
            #[allow(clippy::cast_precision_loss)]
            None => n.as_f64()?.partial_cmp(&(*b as f64)),
        },
        (JsonValue::Number(n), Literal::Float(b)) => n.as_f64()?.partial_cmp(b),
        _ => None,
    }
}

fn like_match(value: &str, pattern: &str) -> Result<bool, EvalError> {
    let mut regex = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    regex.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    regex::RegexBuilder::new(&regex)
        .dot_matches_new_line(true)
        .size_limit(LIKE_SIZE_LIMIT)
        .build()
        .map(|re| re.is_match(value))
        .map_err(|_| EvalError::InvalidPattern(pattern.to_string()))
}

fn json_type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::Parser;
    use chrono::{TimeZone, Utc};

    fn eval(condition: &str, ctx: &EvalContext) -> Result<bool, EvalError> {
        Evaluator::evaluate(&Parser::parse(condition).expect("parse failed"), ctx)
    }

    #[test]
    fn test_string_equality() {
        let ctx = EvalContext::new().with_attribute("Department", "IT");
        assert!(eval("Department == 'IT'", &ctx).unwrap());
        assert!(!eval("Department = 'HR'", &ctx).unwrap());
        assert!(eval("Department != 'HR'", &ctx).unwrap());
    }

    #[test]
    fn test_case_insensitive_property_lookup() {
        let ctx = EvalContext::new().with_attribute("Department", "IT");
        assert!(eval("department = 'IT'", &ctx).unwrap());
    }

    #[test]
    fn test_numeric_ordering() {
        let ctx = EvalContext::new()
            .with_attribute("Level", 5)
            .with_attribute("Salary", 1234.5);
        assert!(eval("Level >= 5 AND Level < 6", &ctx).unwrap());
        assert!(eval("Salary > 1000", &ctx).unwrap());
        assert!(eval("Salary <= 1234.5", &ctx).unwrap());
        assert!(!eval("Salary < 1000.0", &ctx).unwrap());
    }

    #[test]
    fn test_unset_property_is_null() {
        let ctx = EvalContext::new();
        assert!(!eval("Department = 'IT'", &ctx).unwrap());
        assert!(eval("Department != 'IT'", &ctx).unwrap());
        assert!(eval("Department = NULL", &ctx).unwrap());
        assert!(!eval("Level > 3", &ctx).unwrap());
        assert!(!eval("Department IN ('IT')", &ctx).unwrap());

        let ctx = EvalContext::new().with_attribute("Manager", "ada");
        assert!(eval("Manager != NULL", &ctx).unwrap());
    }

    #[test]
    fn test_like_and_in() {
        let ctx = EvalContext::new()
            .with_attribute("Email", "ada@example.com")
            .with_attribute("Status", "active");
        assert!(eval("Email LIKE '%@example.com'", &ctx).unwrap());
        assert!(eval("Email NOT LIKE 'bob%'", &ctx).unwrap());
        assert!(eval("Status IN ('active', 'pending')", &ctx).unwrap());
        assert!(eval("Status NOT IN ('terminated')", &ctx).unwrap());
    }

    #[test]
    fn test_list_attribute_membership() {
        let ctx = EvalContext::new().with_attribute("Groups", serde_json::json!(["ops", "dev"]));
        assert!(eval("Groups = 'dev'", &ctx).unwrap());
        assert!(!eval("Groups = 'finance'", &ctx).unwrap());
        assert!(eval("Groups IN ('finance', 'ops')", &ctx).unwrap());
    }

    #[test]
    fn test_functions() {
        let functions = FunctionContext::new()
            .at(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
            .with_roles(["ITStaff"])
            .with_changed(["Department"]);
        let ctx = EvalContext::new()
            .with_attribute("HireDate", "2024-05-01")
            .with_functions(functions);

        assert!(eval("has_role('ITStaff') AND changed('Department')", &ctx).unwrap());
        assert!(eval("days_since(HireDate) = 31", &ctx).unwrap());
        assert!(!eval("days_since(TerminationDate) > 0", &ctx).unwrap());
        assert!(eval("today() = '2024-06-01'", &ctx).unwrap());
    }

    #[test]
    fn test_errors() {
        let ctx = EvalContext::new()
            .with_attribute("Name", "Ada")
            .with_attribute("Level", 3);
        assert!(matches!(
            eval("Name > 10", &ctx),
            Err(EvalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            eval("Level LIKE '3%'", &ctx),
            Err(EvalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            eval("today()", &ctx),
            Err(EvalError::NotPredicate(_))
        ));
        assert!(matches!(
            eval("days_since('not a date') > 1", &ctx),
            Err(EvalError::Function(_))
        ));
    }
}
