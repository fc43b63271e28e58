//! Condition language for access rules.
//!
//! Rules carry a trigger condition written in a small SQL-like filter
//! language. Text is parsed once, when the rule is created or updated, into
//! an [`Expression`] tree that is stored on the rule and evaluated by a pure
//! interpreter against a snapshot of the instance's attributes.
//!
//! # Syntax
//!
//! - Comparisons: `=` (or `==`), `!=` (or `<>`), `<`, `>`, `<=`, `>=`,
//!   `LIKE` (`%` any run, `_` one character), `IN (...)`, with optional
//!   `NOT` before `LIKE`/`IN`.
//! - Logic: `AND`, `OR`, `NOT`, parentheses.
//! - Literals: `'text'` or `"text"`, integers, decimals, `TRUE`, `FALSE`,
//!   `NULL`. Property names containing spaces are written in backticks.
//! - Built-ins: `has_role('name')`, `changed('Property')`, `today()`,
//!   `now()`, `days_since(date)`, `days_until(date)`. Function arguments may
//!   name a property, e.g. `days_since(HireDate) > 90`.
//!
//! # Example
//!
//! ```rust
//! use accord_governance::expression::{EvalContext, Evaluator, FunctionContext, Parser};
//!
//! let condition = Parser::parse("Department == 'IT' AND NOT has_role('ITStaff')").unwrap();
//!
//! let ctx = EvalContext::new()
//!     .with_attribute("Department", "IT")
//!     .with_functions(FunctionContext::new().with_roles(["Contractor"]));
//!
//! assert!(Evaluator::evaluate(&condition, &ctx).unwrap());
//! ```

pub mod ast;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use ast::{Argument, Comparison, ComparisonOp, Expression, FunctionCall, Literal, Operand};
pub use evaluator::{EvalContext, EvalError, Evaluator};
pub use functions::{FunctionContext, FunctionError, FunctionRegistry};
pub use lexer::{Lexer, LexerError, Spanned, Token};
pub use parser::{ParseError, Parser};

/// Parse condition text. Blank text means "always matches" and yields `None`.
pub fn parse_condition(text: &str) -> Result<Option<Expression>, ParseError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    Parser::parse(text).map(Some)
}

/// Evaluate an optional condition; `None` always matches.
pub fn matches(condition: Option<&Expression>, ctx: &EvalContext) -> Result<bool, EvalError> {
    condition.map_or(Ok(true), |expr| Evaluator::evaluate(expr, ctx))
}
