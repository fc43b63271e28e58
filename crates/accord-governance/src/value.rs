//! Typed attribute values for the schema-less attribute store.
//!
//! A [`PropertyDefinition`](crate::services::property_definition::PropertyDefinition)
//! declares a [`DataType`]; incoming raw JSON is coerced into the matching
//! [`AttributeValue`] variant and checked against the optional
//! [`ValidationRule`] before anything touches storage.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::GovernanceError;

/// RFC 5322 style email pattern.
static EMAIL_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)^[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?$"
    ).expect("EMAIL_REGEX is a valid regex pattern")
});

static PHONE_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^\+?[0-9 ().-]{5,20}$").expect("PHONE_REGEX is a valid regex pattern")
});

/// Maximum allowed email length (per RFC 5321).
const MAX_EMAIL_LENGTH: usize = 254;

/// Compiled automaton cap for user-supplied patterns.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

// ============================================================================
// Data types
// ============================================================================

/// Declared data type of a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Free text.
    #[default]
    String,
    /// Signed 64-bit integer.
    Integer,
    /// Exact decimal.
    Decimal,
    /// Boolean flag.
    Boolean,
    /// Instant in UTC.
    DateTime,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// Absolute http(s) URL.
    Url,
    /// List of strings.
    List,
    /// Arbitrary JSON document.
    Json,
}

impl DataType {
    /// All supported data types.
    pub const ALL: [DataType; 12] = [
        Self::String,
        Self::Integer,
        Self::Decimal,
        Self::Boolean,
        Self::DateTime,
        Self::Date,
        Self::Time,
        Self::Email,
        Self::Phone,
        Self::Url,
        Self::List,
        Self::Json,
    ];

    /// Whether values of this type are stored as text.
    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(self, Self::String | Self::Email | Self::Phone | Self::Url)
    }

    /// Whether values of this type are numeric.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::Date => "date",
            Self::Time => "time",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Url => "url",
            Self::List => "list",
            Self::Json => "json",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DataType {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|dt| dt.to_string() == s.trim().to_lowercase())
            .ok_or_else(|| {
                GovernanceError::Validation(format!(
                    "Unknown data type '{s}': expected one of {}",
                    Self::ALL
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

// ============================================================================
// Values
// ============================================================================

/// Canonical value of one attribute cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    /// Free text.
    String(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Exact decimal.
    Decimal(Decimal),
    /// Boolean flag.
    Boolean(bool),
    /// Instant in UTC.
    DateTime(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
    /// Time of day.
    Time(NaiveTime),
    /// Email address.
    Email(String),
    /// Phone number.
    Phone(String),
    /// Absolute http(s) URL.
    Url(String),
    /// List of strings.
    List(Vec<String>),
    /// Arbitrary JSON document.
    Json(JsonValue),
}

impl AttributeValue {
    /// The data type of this value.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::String(_) => DataType::String,
            Self::Integer(_) => DataType::Integer,
            Self::Decimal(_) => DataType::Decimal,
            Self::Boolean(_) => DataType::Boolean,
            Self::DateTime(_) => DataType::DateTime,
            Self::Date(_) => DataType::Date,
            Self::Time(_) => DataType::Time,
            Self::Email(_) => DataType::Email,
            Self::Phone(_) => DataType::Phone,
            Self::Url(_) => DataType::Url,
            Self::List(_) => DataType::List,
            Self::Json(_) => DataType::Json,
        }
    }

    /// Coerce a raw JSON value into the declared data type.
    ///
    /// Returns a human-readable reason on failure.
    pub fn coerce(data_type: DataType, raw: &JsonValue) -> Result<Self, String> {
        if raw.is_null() && data_type != DataType::Json {
            return Err("value is null".to_string());
        }
        match data_type {
            DataType::String => match raw {
                JsonValue::String(s) => Ok(Self::String(s.clone())),
                JsonValue::Number(n) => Ok(Self::String(n.to_string())),
                JsonValue::Bool(b) => Ok(Self::String(b.to_string())),
                other => Err(format!("expected string, got {}", json_type_name(other))),
            },
            DataType::Integer => coerce_integer(raw).map(Self::Integer),
            DataType::Decimal => coerce_decimal(raw).map(Self::Decimal),
            DataType::Boolean => coerce_boolean(raw).map(Self::Boolean),
            DataType::DateTime => coerce_datetime(raw).map(Self::DateTime),
            DataType::Date => {
                let s = expect_str(raw, "date (YYYY-MM-DD)")?;
                NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map(Self::Date)
                    .map_err(|_| format!("'{s}' is not a date (YYYY-MM-DD)"))
            }
            DataType::Time => {
                let s = expect_str(raw, "time (HH:MM[:SS])")?;
                let s = s.trim();
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                    .map(Self::Time)
                    .map_err(|_| format!("'{s}' is not a time (HH:MM[:SS])"))
            }
            DataType::Email => {
                let s = expect_str(raw, "email")?.trim();
                if s.len() <= MAX_EMAIL_LENGTH && EMAIL_REGEX.is_match(s) {
                    Ok(Self::Email(s.to_string()))
                } else {
                    Err(format!("'{s}' is not a valid email address"))
                }
            }
            DataType::Phone => {
                let s = expect_str(raw, "phone")?.trim();
                let digits = s.chars().filter(char::is_ascii_digit).count();
                if PHONE_REGEX.is_match(s) && digits >= 5 {
                    Ok(Self::Phone(s.to_string()))
                } else {
                    Err(format!("'{s}' is not a valid phone number"))
                }
            }
            DataType::Url => {
                let s = expect_str(raw, "url")?.trim();
                match url::Url::parse(s) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                        Ok(Self::Url(s.to_string()))
                    }
                    Ok(parsed) => Err(format!("unsupported url scheme '{}'", parsed.scheme())),
                    Err(e) => Err(format!("'{s}' is not a valid url: {e}")),
                }
            }
            DataType::List => coerce_list(raw).map(Self::List),
            DataType::Json => Ok(Self::Json(raw.clone())),
        }
    }

    /// Raw input form of the value.
    ///
    /// Coercing the result back with the same data type yields an equal
    /// value. Decimals render as their exact text.
    #[must_use]
    pub fn to_raw(&self) -> JsonValue {
        match self {
            Self::Decimal(d) => JsonValue::String(d.normalize().to_string()),
            other => other.to_json(),
        }
    }

    /// JSON rendering used in condition evaluation.
    ///
    /// Decimals become JSON numbers and lose digits past `f64` precision.
    /// Use [`to_raw`](Self::to_raw) to re-coerce a stored value.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::String(s) | Self::Email(s) | Self::Phone(s) | Self::Url(s) => {
                JsonValue::String(s.clone())
            }
            Self::Integer(i) => JsonValue::from(*i),
            Self::Decimal(d) => d
                .normalize()
                .to_string()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map_or_else(|| JsonValue::String(d.to_string()), JsonValue::Number),
            Self::Boolean(b) => JsonValue::Bool(*b),
            Self::DateTime(dt) => {
                JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Self::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => JsonValue::String(t.format("%H:%M:%S%.f").to_string()),
            Self::List(items) => JsonValue::Array(
                items.iter().cloned().map(JsonValue::String).collect(),
            ),
            Self::Json(v) => v.clone(),
        }
    }

    /// Human-facing formatted value stored alongside the canonical one.
    #[must_use]
    pub fn display_value(&self) -> String {
        match self {
            Self::String(s) | Self::Email(s) | Self::Phone(s) | Self::Url(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Decimal(d) => d.normalize().to_string(),
            Self::Boolean(true) => "Yes".to_string(),
            Self::Boolean(false) => "No".to_string(),
            Self::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Time(t) => t.format("%H:%M:%S").to_string(),
            Self::List(items) => items.join(", "),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Text used when matching against patterns and allowed-value lists.
    fn match_text(&self) -> Option<String> {
        match self {
            Self::String(s) | Self::Email(s) | Self::Phone(s) | Self::Url(s) => Some(s.clone()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Decimal(d) => Some(d.normalize().to_string()),
            Self::Boolean(b) => Some(b.to_string()),
            Self::Date(_) | Self::Time(_) | Self::DateTime(_) => {
                self.to_json().as_str().map(str::to_string)
            }
            Self::List(_) | Self::Json(_) => None,
        }
    }
}

fn expect_str<'a>(raw: &'a JsonValue, expected: &str) -> Result<&'a str, String> {
    raw.as_str()
        .ok_or_else(|| format!("expected {expected}, got {}", json_type_name(raw)))
}

fn coerce_integer(raw: &JsonValue) -> Result<i64, String> {
    match raw {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    #[allow(clippy::cast_possible_truncation)]
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(f as i64),
                    _ => Err(format!("{n} is not an integer")),
                }
            }
        }
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{s}' is not an integer")),
        other => Err(format!("expected integer, got {}", json_type_name(other))),
    }
}

fn coerce_decimal(raw: &JsonValue) -> Result<Decimal, String> {
    let text = match raw {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        other => return Err(format!("expected decimal, got {}", json_type_name(other))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| format!("'{text}' is not a decimal"))
}

fn coerce_boolean(raw: &JsonValue) -> Result<bool, String> {
    match raw {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{n} is not a boolean")),
        },
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(true),
            "false" | "no" | "n" | "0" => Ok(false),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        other => Err(format!("expected boolean, got {}", json_type_name(other))),
    }
}

fn coerce_datetime(raw: &JsonValue) -> Result<DateTime<Utc>, String> {
    let s = expect_str(raw, "datetime")?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("'{s}' is not a datetime (RFC 3339)"))
}

fn coerce_list(raw: &JsonValue) -> Result<Vec<String>, String> {
    match raw {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => Ok(s.clone()),
                JsonValue::Number(n) => Ok(n.to_string()),
                JsonValue::Bool(b) => Ok(b.to_string()),
                other => Err(format!(
                    "list items must be scalars, got {}",
                    json_type_name(other)
                )),
            })
            .collect(),
        JsonValue::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()),
        other => Err(format!("expected list, got {}", json_type_name(other))),
    }
}

fn json_type_name(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// ============================================================================
// Validation rules
// ============================================================================

/// Additional constraint attached to a property definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Regular expression the textual value must match.
    Pattern {
        /// The regex.
        pattern: String,
    },
    /// Inclusive numeric bounds.
    Range {
        /// Lower bound.
        min: Option<Decimal>,
        /// Upper bound.
        max: Option<Decimal>,
    },
    /// Inclusive character-count bounds (item count for lists).
    Length {
        /// Minimum length.
        min: Option<usize>,
        /// Maximum length.
        max: Option<usize>,
    },
    /// Closed set of permitted values.
    AllowedValues {
        /// Permitted values in textual form.
        values: Vec<String>,
    },
}

impl FromStr for ValidationRule {
    type Err = GovernanceError;

    /// Parse `range:MIN..MAX`, `length:MIN..MAX`, `in:a,b,c`, or a bare regex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: String| GovernanceError::Validation(msg);
        if let Some(bounds) = s.strip_prefix("range:") {
            let (min, max) = split_bounds(bounds).map_err(invalid)?;
            let parse = |b: Option<&str>| {
                b.map(|v| {
                    Decimal::from_str(v).map_err(|_| format!("'{v}' is not a numeric bound"))
                })
                .transpose()
            };
            return Ok(Self::Range {
                min: parse(min).map_err(invalid)?,
                max: parse(max).map_err(invalid)?,
            });
        }
        if let Some(bounds) = s.strip_prefix("length:") {
            let (min, max) = split_bounds(bounds).map_err(invalid)?;
            let parse = |b: Option<&str>| {
                b.map(|v| {
                    v.parse::<usize>()
                        .map_err(|_| format!("'{v}' is not a length bound"))
                })
                .transpose()
            };
            return Ok(Self::Length {
                min: parse(min).map_err(invalid)?,
                max: parse(max).map_err(invalid)?,
            });
        }
        if let Some(values) = s.strip_prefix("in:") {
            return Ok(Self::AllowedValues {
                values: values
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect(),
            });
        }
        Ok(Self::Pattern {
            pattern: s.to_string(),
        })
    }
}

fn split_bounds(bounds: &str) -> Result<(Option<&str>, Option<&str>), String> {
    let (min, max) = bounds
        .split_once("..")
        .ok_or_else(|| format!("'{bounds}' is not of the form MIN..MAX"))?;
    Ok((non_empty(min), non_empty(max)))
}

fn non_empty(bound: &str) -> Option<&str> {
    let bound = bound.trim();
    (!bound.is_empty()).then_some(bound)
}

impl ValidationRule {
    /// Check that the rule is well-formed and applicable to `data_type`.
    pub fn check_applicable(&self, data_type: DataType) -> Result<(), String> {
        match self {
            Self::Pattern { pattern } => {
                if !(data_type.is_textual() || data_type.is_numeric()) {
                    return Err(format!("pattern rules do not apply to {data_type} values"));
                }
                compile_pattern(pattern).map(|_| ())
            }
            Self::Range { min, max } => {
                if !data_type.is_numeric() {
                    return Err(format!("range rules do not apply to {data_type} values"));
                }
                match (min, max) {
                    (Some(lo), Some(hi)) if lo > hi => {
                        Err(format!("range minimum {lo} exceeds maximum {hi}"))
                    }
                    _ => Ok(()),
                }
            }
            Self::Length { min, max } => {
                if !(data_type.is_textual() || data_type == DataType::List) {
                    return Err(format!("length rules do not apply to {data_type} values"));
                }
                match (min, max) {
                    (Some(lo), Some(hi)) if lo > hi => {
                        Err(format!("length minimum {lo} exceeds maximum {hi}"))
                    }
                    _ => Ok(()),
                }
            }
            Self::AllowedValues { values } => {
                if data_type == DataType::Json {
                    return Err("allowed-value rules do not apply to json values".to_string());
                }
                if values.is_empty() {
                    return Err("allowed-value list is empty".to_string());
                }
                Ok(())
            }
        }
    }

    /// Check a coerced value against the rule.
    pub fn validate(&self, value: &AttributeValue) -> Result<(), String> {
        match self {
            Self::Pattern { pattern } => {
                let re = compile_pattern(pattern)?;
                match value.match_text() {
                    Some(text) if re.is_match(&text) => Ok(()),
                    Some(text) => Err(format!("'{text}' does not match pattern '{pattern}'")),
                    None => Err(format!("pattern rules do not apply to {} values", value.data_type())),
                }
            }
            Self::Range { min, max } => {
                let n = match value {
                    AttributeValue::Integer(i) => Decimal::from(*i),
                    AttributeValue::Decimal(d) => *d,
                    other => {
                        return Err(format!(
                            "range rules do not apply to {} values",
                            other.data_type()
                        ))
                    }
                };
                if let Some(lo) = min {
                    if n < *lo {
                        return Err(format!("{n} is less than minimum {lo}"));
                    }
                }
                if let Some(hi) = max {
                    if n > *hi {
                        return Err(format!("{n} exceeds maximum {hi}"));
                    }
                }
                Ok(())
            }
            Self::Length { min, max } => {
                let len = match value {
                    AttributeValue::List(items) => items.len(),
                    other => other
                        .match_text()
                        .map(|t| t.chars().count())
                        .ok_or_else(|| {
                            format!("length rules do not apply to {} values", other.data_type())
                        })?,
                };
                if let Some(lo) = min {
                    if len < *lo {
                        return Err(format!("length {len} is shorter than minimum {lo}"));
                    }
                }
                if let Some(hi) = max {
                    if len > *hi {
                        return Err(format!("length {len} exceeds maximum {hi}"));
                    }
                }
                Ok(())
            }
            Self::AllowedValues { values } => {
                let candidates = match value {
                    AttributeValue::List(items) => items.clone(),
                    other => vec![other.match_text().unwrap_or_default()],
                };
                match candidates.iter().find(|c| !values.contains(c)) {
                    None => Ok(()),
                    Some(bad) => Err(format!(
                        "'{bad}' is not in allowed values: [{}]",
                        values.join(", ")
                    )),
                }
            }
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<regex::Regex, String> {
    regex::RegexBuilder::new(pattern)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| format!("invalid pattern '{pattern}': {e}"))
}

/// Coerce `raw` into `data_type` and check it against `rule`.
pub fn parse_value(
    data_type: DataType,
    rule: Option<&ValidationRule>,
    raw: &JsonValue,
) -> Result<AttributeValue, String> {
    let value = AttributeValue::coerce(data_type, raw)?;
    if let Some(rule) = rule {
        rule.validate(&value)?;
    }
    Ok(value)
}
