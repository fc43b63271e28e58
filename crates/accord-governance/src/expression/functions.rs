//! Built-in functions available in rule conditions.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use super::ast::Literal;

const FUNCTIONS: [&str; 6] = ["has_role", "changed", "today", "now", "days_since", "days_until"];

/// Error during function evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FunctionError {
    /// No such built-in.
    #[error("Unknown function: {0}")]
    Unknown(String),
    /// Wrong number of arguments.
    #[error("{name}() takes {expected} argument(s), got {actual}")]
    Arity {
        /// Function name.
        name: &'static str,
        /// Arguments expected.
        expected: usize,
        /// Arguments supplied.
        actual: usize,
    },
    /// An argument had the wrong shape.
    #[error("{name}(): {message}")]
    InvalidArgument {
        /// Function name.
        name: &'static str,
        /// What was wrong.
        message: String,
    },
}

/// Facts about the evaluated instance that functions can consult.
///
/// `now` is fixed for the whole rule cycle so every rule in the cycle sees
/// the same clock.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    /// Evaluation instant.
    pub now: DateTime<Utc>,
    /// Lowercased display names and external ids of roles the instance holds.
    pub role_names: HashSet<String>,
    /// Lowercased names of properties changed by the triggering event.
    pub changed_properties: HashSet<String>,
}

impl Default for FunctionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionContext {
    /// Context evaluated at the current instant with no roles or changes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Utc::now(),
            role_names: HashSet::new(),
            changed_properties: HashSet::new(),
        }
    }

    /// Pin the evaluation instant.
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Add role names held by the instance.
    #[must_use]
    pub fn with_roles<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.role_names
            .extend(names.into_iter().map(|n| n.as_ref().to_lowercase()));
        self
    }

    /// Add property names changed by the triggering event.
    #[must_use]
    pub fn with_changed<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.changed_properties
            .extend(names.into_iter().map(|n| n.as_ref().to_lowercase()));
        self
    }
}

/// Dispatch table for built-in functions.
pub struct FunctionRegistry;

impl FunctionRegistry {
    /// Whether `name` is a built-in (case-insensitive).
    #[must_use]
    pub fn exists(name: &str) -> bool {
        FUNCTIONS.contains(&name.to_lowercase().as_str())
    }

    /// Names of all built-ins.
    #[must_use]
    pub fn supported_functions() -> &'static [&'static str] {
        &FUNCTIONS
    }

    /// Evaluate a built-in with already-resolved arguments.
    pub fn evaluate(
        name: &str,
        args: &[Literal],
        ctx: &FunctionContext,
    ) -> Result<Literal, FunctionError> {
        match name.to_lowercase().as_str() {
            "has_role" => {
                let role = single_text("has_role", args)?;
                Ok(Literal::Boolean(
                    role.is_some_and(|r| ctx.role_names.contains(&r.to_lowercase())),
                ))
            }
            "changed" => {
                let property = single_text("changed", args)?;
                Ok(Literal::Boolean(property.is_some_and(|p| {
                    ctx.changed_properties.contains(&p.to_lowercase())
                })))
            }
            "today" => {
                arity("today", args, 0)?;
                Ok(Literal::String(ctx.now.format("%Y-%m-%d").to_string()))
            }
            "now" => {
                arity("now", args, 0)?;
                Ok(Literal::String(ctx.now.to_rfc3339()))
            }
            "days_since" => Ok(single_date("days_since", args)?.map_or(Literal::Null, |d| {
                Literal::Integer((ctx.now.date_naive() - d).num_days())
            })),
            "days_until" => Ok(single_date("days_until", args)?.map_or(Literal::Null, |d| {
                Literal::Integer((d - ctx.now.date_naive()).num_days())
            })),
            _ => Err(FunctionError::Unknown(name.to_string())),
        }
    }
}

fn arity(name: &'static str, args: &[Literal], expected: usize) -> Result<(), FunctionError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(FunctionError::Arity {
            name,
            expected,
            actual: args.len(),
        })
    }
}

/// The single text argument; `None` when it is null (an unset property).
fn single_text<'a>(
    name: &'static str,
    args: &'a [Literal],
) -> Result<Option<&'a str>, FunctionError> {
    arity(name, args, 1)?;
    match &args[0] {
        Literal::String(s) => Ok(Some(s)),
        Literal::Null => Ok(None),
        other => Err(FunctionError::InvalidArgument {
            name,
            message: format!("expected a string, got {}", other.type_name()),
        }),
    }
}

/// The single date argument. Accepts `YYYY-MM-DD` or an RFC 3339 instant.
fn single_date(name: &'static str, args: &[Literal]) -> Result<Option<NaiveDate>, FunctionError> {
    let Some(text) = single_text(name, args)? else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc).date_naive()))
        .map(Some)
        .map_err(|_| FunctionError::InvalidArgument {
            name,
            message: format!("'{text}' is not a date (YYYY-MM-DD)"),
        })
}
