//! Syntax tree for rule conditions.
//!
//! Conditions are stored on rules as this tree (it is serde-serialisable) and
//! rendered back to canonical text through [`std::fmt::Display`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", content = "args", rename_all = "snake_case")]
pub enum Expression {
    /// Compare a property or function result against a literal.
    Comparison(Comparison),
    /// Both sides hold.
    And(Box<Expression>, Box<Expression>),
    /// Either side holds.
    Or(Box<Expression>, Box<Expression>),
    /// Negation.
    Not(Box<Expression>),
    /// A boolean function call used as a predicate, e.g. `has_role('Admin')`.
    Call(FunctionCall),
    /// Parenthesized sub-expression.
    Group(Box<Expression>),
}

/// `left <op> right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Left-hand side.
    pub left: Operand,
    /// Operator.
    pub operator: ComparisonOp,
    /// Right-hand side literal (a list for `IN`).
    pub right: Literal,
}

/// Left-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Value of a named property (or context field such as `external_id`).
    Property(String),
    /// Result of a built-in function.
    Call(FunctionCall),
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `>`
    GreaterThan,
    /// `<=`
    LessThanOrEqual,
    /// `>=`
    GreaterThanOrEqual,
    /// SQL-style pattern match (`%` any run, `_` one character).
    Like,
    /// Membership in a literal list.
    In,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            ComparisonOp::Equal => "=",
            ComparisonOp::NotEqual => "!=",
            ComparisonOp::LessThan => "<",
            ComparisonOp::GreaterThan => ">",
            ComparisonOp::LessThanOrEqual => "<=",
            ComparisonOp::GreaterThanOrEqual => ">=",
            ComparisonOp::Like => "LIKE",
            ComparisonOp::In => "IN",
        };
        write!(f, "{op}")
    }
}

/// A literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    /// Text.
    String(String),
    /// Whole number.
    Integer(i64),
    /// Fractional number.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// Absence of a value.
    Null,
    /// Literal list, only valid on the right of `IN`.
    List(Vec<Literal>),
}

impl Literal {
    /// Type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::String(_) => "string",
            Literal::Integer(_) => "integer",
            Literal::Float(_) => "number",
            Literal::Boolean(_) => "boolean",
            Literal::Null => "null",
            Literal::List(_) => "list",
        }
    }

    /// Convert into the JSON shape used by evaluation contexts.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::String(s) => serde_json::Value::String(s.clone()),
            Literal::Integer(i) => serde_json::Value::from(*i),
            Literal::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Literal::Boolean(b) => serde_json::Value::Bool(*b),
            Literal::Null => serde_json::Value::Null,
            Literal::List(items) => {
                serde_json::Value::Array(items.iter().map(Literal::to_json).collect())
            }
        }
    }

    /// Convert a JSON context value into a literal.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Literal::Null,
            serde_json::Value::Bool(b) => Literal::Boolean(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Literal::Integer)
                .or_else(|| n.as_f64().map(Literal::Float))
                .unwrap_or(Literal::Null),
            serde_json::Value::String(s) => Literal::String(s.clone()),
            serde_json::Value::Array(items) => {
                Literal::List(items.iter().map(Literal::from_json).collect())
            }
            serde_json::Value::Object(_) => Literal::String(value.to_string()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Integer(i) => write!(f, "{i}"),
            Literal::Float(fl) => write!(f, "{fl:?}"),
            Literal::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Literal::Null => write!(f, "NULL"),
            Literal::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Argument of a function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    /// A literal.
    Literal(Literal),
    /// The current value of a property.
    Property(String),
}

/// A call to a built-in function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Function name, lowercase.
    pub name: String,
    /// Arguments in call order.
    pub arguments: Vec<Argument>,
}

impl FunctionCall {
    /// Create a new function call.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Vec<Argument>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            arguments,
        }
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match arg {
                Argument::Literal(lit) => write!(f, "{lit}")?,
                Argument::Property(name) => write_identifier(f, name)?,
            }
        }
        write!(f, ")")
    }
}

fn write_identifier(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let plain = name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        && name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && !matches!(
            name.to_ascii_uppercase().as_str(),
            "AND" | "OR" | "NOT" | "LIKE" | "IN" | "TRUE" | "FALSE" | "NULL"
        );
    if plain {
        write!(f, "{name}")
    } else {
        write!(f, "`{}`", name.replace('`', "``"))
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Comparison(cmp) => {
                match &cmp.left {
                    Operand::Property(name) => write_identifier(f, name)?,
                    Operand::Call(call) => write!(f, "{call}")?,
                }
                write!(f, " {} {}", cmp.operator, cmp.right)
            }
            Expression::And(l, r) => write!(f, "{l} AND {r}"),
            Expression::Or(l, r) => write!(f, "{l} OR {r}"),
            Expression::Not(inner) => write!(f, "NOT {inner}"),
            Expression::Call(call) => write!(f, "{call}"),
            Expression::Group(inner) => write!(f, "({inner})"),
        }
    }
}

impl Expression {
    /// Build a property comparison.
    #[must_use]
    pub fn compare(property: impl Into<String>, operator: ComparisonOp, right: Literal) -> Self {
        Expression::Comparison(Comparison {
            left: Operand::Property(property.into()),
            operator,
            right,
        })
    }

    /// Logical AND.
    #[must_use]
    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::And(Box::new(left), Box::new(right))
    }

    /// Logical OR.
    #[must_use]
    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::Or(Box::new(left), Box::new(right))
    }

    /// Logical NOT.
    #[must_use]
    pub fn not(inner: Expression) -> Self {
        Expression::Not(Box::new(inner))
    }

    /// Names of every property the condition reads, sorted and deduplicated.
    #[must_use]
    pub fn referenced_properties(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_properties(&mut names);
        names.sort();
        names.dedup();
        names
    }

    fn collect_properties(&self, names: &mut Vec<String>) {
        fn from_call(call: &FunctionCall, names: &mut Vec<String>) {
            for arg in &call.arguments {
                if let Argument::Property(name) = arg {
                    names.push(name.clone());
                }
            }
        }

        match self {
            Expression::Comparison(cmp) => match &cmp.left {
                Operand::Property(name) => names.push(name.clone()),
                Operand::Call(call) => from_call(call, names),
            },
            Expression::And(l, r) | Expression::Or(l, r) => {
                l.collect_properties(names);
                r.collect_properties(names);
            }
            Expression::Not(inner) | Expression::Group(inner) => inner.collect_properties(names),
            Expression::Call(call) => from_call(call, names),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_display_escapes_quotes() {
        assert_eq!(Literal::String("O'Brien".into()).to_string(), "'O''Brien'");
        assert_eq!(Literal::Float(2.0).to_string(), "2.0");
        assert_eq!(
            Literal::List(vec![Literal::Integer(1), Literal::Null]).to_string(),
            "(1, NULL)"
        );
    }

    #[test]
    fn test_expression_display() {
        let expr = Expression::and(
            Expression::compare("Department", ComparisonOp::Equal, Literal::String("IT".into())),
            Expression::not(Expression::Call(FunctionCall::new(
                "HAS_ROLE",
                vec![Argument::Literal(Literal::String("Admin".into()))],
            ))),
        );
        assert_eq!(
            expr.to_string(),
            "Department = 'IT' AND NOT has_role('Admin')"
        );

        let spaced = Expression::compare("Hire Date", ComparisonOp::Equal, Literal::Null);
        assert_eq!(spaced.to_string(), "`Hire Date` = NULL");
    }

    #[test]
    fn test_referenced_properties_include_call_arguments() {
        let expr = Expression::or(
            Expression::compare("b", ComparisonOp::Equal, Literal::Integer(1)),
            Expression::Comparison(Comparison {
                left: Operand::Call(FunctionCall::new(
                    "days_since",
                    vec![Argument::Property("HireDate".into())],
                )),
                operator: ComparisonOp::GreaterThan,
                right: Literal::Integer(30),
            }),
        );
        assert_eq!(expr.referenced_properties(), vec!["HireDate", "b"]);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!([1, 2.5, "x", null, true]);
        let lit = Literal::from_json(&json);
        assert_eq!(lit.to_json(), json);
    }
}
