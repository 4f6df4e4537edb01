//! Field definitions
//!
//! A [`FieldDefinition`] is validated on construction and stays valid: every
//! setter works on a copy, re-validates the whole definition (including the
//! parsed default value) and only then replaces `self`.

use super::date_format::DateFormat;
use super::expression::{Evaluate, Expression, FieldLookup};
use super::is_identifier;
use crate::error::{RowEncodingError, RowErrorKind, SchemaError};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const MAX_NAME_LENGTH: usize = 255;

/// Longest text value accepted before truncation or rejection, in characters
pub const MAX_TEXT_LENGTH: usize = 32_000;

pub const MAX_PRECISION: u32 = 18;

pub const DEFAULT_MULTI_VALUE_SEPARATOR: &str = ";";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FieldKind {
    #[default]
    Text,
    Numeric,
    Date,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "Text",
            FieldKind::Numeric => "Numeric",
            FieldKind::Date => "Date",
        }
    }
}

/// One encoded cell.
///
/// Numerics hold the value scaled by `10^scale`; dates hold epoch
/// milliseconds in UTC. `None` is a null cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    MultiText(Vec<String>),
    Numeric(Option<i64>),
    Date(Option<i64>),
}

#[derive(Clone)]
pub struct FieldDefinition {
    name: String,
    full_name: String,
    label: String,
    description: Option<String>,
    kind: FieldKind,
    precision: u32,
    scale: u32,
    format: Option<DateFormat>,
    default_value: Option<String>,
    parsed_default: Option<FieldValue>,
    multi_value_separator: Option<String>,
    can_truncate: bool,
    decimal_separator: char,
    is_unique_id: bool,
    is_skipped: bool,
    sort_index: u32,
    sort_ascending: bool,
    expression: Option<Arc<dyn Evaluate>>,
}

impl fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("precision", &self.precision)
            .field("scale", &self.scale)
            .field("format", &self.format.as_ref().map(DateFormat::pattern))
            .field("default_value", &self.default_value)
            .field("expression", &self.expression.as_ref().map(|e| e.source()))
            .finish_non_exhaustive()
    }
}

/// Clamp precision to 1..=18 and scale to 0..precision.
pub fn clamp_precision_scale(precision: i64, scale: i64) -> (u32, u32) {
    let precision = if (1..=MAX_PRECISION as i64).contains(&precision) {
        precision as u32
    } else {
        MAX_PRECISION
    };
    let scale = if scale <= 0 {
        0
    } else if scale >= precision as i64 {
        precision - 1
    } else {
        scale as u32
    };
    (precision, scale)
}

/// Why a decimal string could not be scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalError {
    Malformed,
    /// Well formed but too large to scale
    Overflow,
}

/// Parse a decimal string into an integer scaled by `10^scale`, rounding half
/// away from zero on extra fraction digits.
pub fn parse_scaled_decimal(raw: &str, separator: char, scale: u32) -> Result<i128, DecimalError> {
    let s = raw.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (int_part, frac_part) = digits.split_once(separator).unwrap_or((digits, ""));

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(DecimalError::Malformed);
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecimalError::Malformed);
    }

    let push = |value: i128, digit: u8| {
        value
            .checked_mul(10)
            .and_then(|v| v.checked_add(i128::from(digit)))
            .ok_or(DecimalError::Overflow)
    };
    let mut value: i128 = 0;
    for b in int_part.bytes() {
        value = push(value, b - b'0')?;
    }
    let frac = frac_part.as_bytes();
    for i in 0..scale as usize {
        value = push(value, frac.get(i).map_or(0, |b| b - b'0'))?;
    }
    if frac.get(scale as usize).is_some_and(|b| *b >= b'5') {
        value = value.checked_add(1).ok_or(DecimalError::Overflow)?;
    }

    Ok(if negative { -value } else { value })
}

pub fn format_scaled(value: i64, scale: u32) -> String {
    if scale == 0 {
        return value.to_string();
    }
    let divisor = 10u64.pow(scale);
    let abs = value.unsigned_abs();
    let sign = if value < 0 { "-" } else { "" };
    format!(
        "{sign}{}.{:0width$}",
        abs / divisor,
        abs % divisor,
        width = scale as usize
    )
}

impl FieldDefinition {
    fn base(name: &str, kind: FieldKind) -> Result<Self, SchemaError> {
        if !is_identifier(name, MAX_NAME_LENGTH) {
            return Err(SchemaError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            full_name: name.to_string(),
            label: name.to_string(),
            description: None,
            kind,
            precision: MAX_PRECISION,
            scale: 0,
            format: None,
            default_value: None,
            parsed_default: None,
            multi_value_separator: None,
            can_truncate: true,
            decimal_separator: '.',
            is_unique_id: false,
            is_skipped: false,
            sort_index: 0,
            sort_ascending: true,
            expression: None,
        })
    }

    pub fn text(name: &str) -> Result<Self, SchemaError> {
        Self::base(name, FieldKind::Text)
    }

    /// Numeric field; out-of-range precision and scale are clamped.
    pub fn numeric(name: &str, precision: i64, scale: i64) -> Result<Self, SchemaError> {
        let mut field = Self::base(name, FieldKind::Numeric)?;
        (field.precision, field.scale) = clamp_precision_scale(precision, scale);
        Ok(field)
    }

    pub fn date(name: &str, format: &str) -> Result<Self, SchemaError> {
        let mut field = Self::base(name, FieldKind::Date)?;
        field.format = Some(compile_format(name, format)?);
        Ok(field)
    }

    // -- accessors ---------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn multiplier(&self) -> i64 {
        10i64.pow(self.scale)
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_ref().map(DateFormat::pattern)
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn multi_value_separator(&self) -> Option<&str> {
        self.multi_value_separator.as_deref()
    }

    pub fn is_multi_value(&self) -> bool {
        self.multi_value_separator.is_some()
    }

    pub fn is_unique_id(&self) -> bool {
        self.is_unique_id
    }

    pub fn is_skipped(&self) -> bool {
        self.is_skipped
    }

    pub fn is_computed(&self) -> bool {
        self.expression.is_some()
    }

    pub fn expression(&self) -> Option<&Arc<dyn Evaluate>> {
        self.expression.as_ref()
    }

    /// `(sort_index, ascending)`; index 0 means unordered.
    pub fn sort(&self) -> (u32, bool) {
        (self.sort_index, self.sort_ascending)
    }

    pub fn decimal_separator(&self) -> char {
        self.decimal_separator
    }

    // -- validated setters -------------------------------------------------

    fn update(
        &mut self,
        change: impl FnOnce(&mut Self) -> Result<(), SchemaError>,
    ) -> Result<(), SchemaError> {
        let mut next = self.clone();
        change(&mut next)?;
        next.parsed_default = next.parse_default()?;
        *self = next;
        Ok(())
    }

    pub fn set_default_value(&mut self, value: Option<&str>) -> Result<(), SchemaError> {
        self.update(|f| {
            f.default_value = value.map(str::to_string);
            Ok(())
        })
    }

    /// Change the date pattern; the default value is re-parsed with it.
    pub fn set_format(&mut self, pattern: &str) -> Result<(), SchemaError> {
        if self.kind != FieldKind::Date {
            return Err(SchemaError::attribute(&self.name, "only date fields have a format"));
        }
        self.update(|f| {
            f.format = Some(compile_format(&f.name, pattern)?);
            Ok(())
        })
    }

    pub fn set_precision_scale(&mut self, precision: i64, scale: i64) -> Result<(), SchemaError> {
        self.update(|f| {
            (f.precision, f.scale) = clamp_precision_scale(precision, scale);
            Ok(())
        })
    }

    pub fn set_decimal_separator(&mut self, separator: char) -> Result<(), SchemaError> {
        if separator.is_ascii_digit() || separator == '-' || separator == '+' {
            return Err(SchemaError::attribute(
                &self.name,
                format!("'{separator}' cannot be a decimal separator"),
            ));
        }
        self.update(|f| {
            f.decimal_separator = separator;
            Ok(())
        })
    }

    /// Make the field multi-valued (`Some`) or single-valued (`None`).
    pub fn set_multi_value_separator(&mut self, separator: Option<&str>) -> Result<(), SchemaError> {
        if let Some(sep) = separator {
            if self.kind != FieldKind::Text {
                return Err(SchemaError::attribute(&self.name, "only text fields can be multi-valued"));
            }
            if sep.is_empty() {
                return Err(SchemaError::attribute(&self.name, "multi-value separator is empty"));
            }
        }
        self.update(|f| {
            f.multi_value_separator = separator.map(str::to_string);
            Ok(())
        })
    }

    /// Compile and attach a computed expression, or detach it with `None`.
    pub fn set_expression(&mut self, source: Option<&str>) -> Result<(), SchemaError> {
        let expression = match source {
            Some(src) => {
                let compiled = Expression::compile(src).map_err(|reason| {
                    SchemaError::InvalidExpression {
                        field: self.name.clone(),
                        reason,
                    }
                })?;
                Some(Arc::new(compiled) as Arc<dyn Evaluate>)
            },
            None => None,
        };
        self.update(|f| {
            f.expression = expression;
            Ok(())
        })
    }

    /// Attach an already built evaluator.
    pub fn set_evaluator(&mut self, evaluator: Arc<dyn Evaluate>) {
        self.expression = Some(evaluator);
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn set_full_name(&mut self, full_name: impl Into<String>) {
        self.full_name = full_name.into();
    }

    pub fn set_can_truncate(&mut self, can_truncate: bool) {
        self.can_truncate = can_truncate;
    }

    pub fn set_unique_id(&mut self, unique: bool) {
        self.is_unique_id = unique;
    }

    pub fn set_skipped(&mut self, skipped: bool) {
        self.is_skipped = skipped;
    }

    pub fn set_sort(&mut self, index: u32, ascending: bool) {
        self.sort_index = index;
        self.sort_ascending = ascending;
    }

    // -- consuming helpers for building definitions inline ------------------

    pub fn with_default(mut self, value: &str) -> Result<Self, SchemaError> {
        self.set_default_value(Some(value))?;
        Ok(self)
    }

    pub fn with_expression(mut self, source: &str) -> Result<Self, SchemaError> {
        self.set_expression(Some(source))?;
        Ok(self)
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.set_label(label);
        self
    }

    #[must_use]
    pub fn with_can_truncate(mut self, can_truncate: bool) -> Self {
        self.can_truncate = can_truncate;
        self
    }

    // -- encoding ----------------------------------------------------------

    fn parse_default(&self) -> Result<Option<FieldValue>, SchemaError> {
        let Some(ref value) = self.default_value else {
            return Ok(None);
        };
        let invalid = |reason: String| SchemaError::InvalidDefault {
            field: self.name.clone(),
            value: value.clone(),
            kind: self.kind.as_str().to_string(),
            reason,
        };
        let parsed = match self.kind {
            FieldKind::Text => self.encode_text(value).map_err(|e| invalid(e.reason))?,
            FieldKind::Numeric => FieldValue::Numeric(Some(
                self.parse_numeric(value).map_err(|e| invalid(e.reason))?,
            )),
            FieldKind::Date => FieldValue::Date(Some(
                self.parse_date(value).map_err(|e| invalid(e.reason))?,
            )),
        };
        Ok(Some(parsed))
    }

    fn row_error(&self, reason: impl Into<String>) -> RowEncodingError {
        RowEncodingError::new(&self.name, reason)
    }

    fn fit_text(&self, value: &str) -> Result<String, RowEncodingError> {
        let length = value.chars().count();
        if length <= MAX_TEXT_LENGTH {
            return Ok(value.to_string());
        }
        if self.can_truncate {
            Ok(value.chars().take(MAX_TEXT_LENGTH).collect())
        } else {
            Err(self.row_error(format!(
                "value is {length} characters, longer than the {MAX_TEXT_LENGTH} limit"
            )))
        }
    }

    fn encode_text(&self, value: &str) -> Result<FieldValue, RowEncodingError> {
        match self.multi_value_separator {
            Some(_) if value.is_empty() => Ok(FieldValue::MultiText(Vec::new())),
            Some(ref sep) => value
                .split(sep.as_str())
                .map(|v| self.fit_text(v))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::MultiText),
            None => self.fit_text(value).map(FieldValue::Text),
        }
    }

    fn parse_numeric(&self, raw: &str) -> Result<i64, RowEncodingError> {
        let too_large = || {
            self.row_error(format!(
                "value '{raw}' does not fit precision {} with scale {}",
                self.precision, self.scale
            ))
            .with_kind(RowErrorKind::OutOfRange)
        };
        let scaled = match parse_scaled_decimal(raw, self.decimal_separator, self.scale) {
            Ok(scaled) => scaled,
            Err(DecimalError::Overflow) => return Err(too_large()),
            Err(DecimalError::Malformed) => {
                return Err(self
                    .row_error(format!("value '{raw}' is not a valid number"))
                    .with_kind(RowErrorKind::Unparsable))
            },
        };
        if scaled.unsigned_abs() >= 10u128.pow(self.precision) {
            return Err(too_large());
        }
        i64::try_from(scaled).map_err(|_| too_large())
    }

    fn parse_date(&self, raw: &str) -> Result<i64, RowEncodingError> {
        let Some(ref format) = self.format else {
            return Err(self.row_error("date field has no format"));
        };
        format
            .parse(raw)
            .map(|d| d.timestamp_millis())
            .ok_or_else(|| {
                self.row_error(format!(
                    "value '{raw}' does not match date format '{}'",
                    format.pattern()
                ))
                .with_kind(RowErrorKind::Unparsable)
            })
    }

    /// Encode one raw cell.
    ///
    /// Empty cells take the default value, otherwise they are null (empty
    /// text for text fields). Unparsable numbers and dates also fall back to
    /// the default; without one they fail the row. A number that parses but
    /// does not fit the precision always fails the row.
    pub fn encode(&self, raw: &str) -> Result<FieldValue, RowEncodingError> {
        match self.kind {
            FieldKind::Text => {
                if raw.is_empty() {
                    if let Some(ref default) = self.parsed_default {
                        return Ok(default.clone());
                    }
                }
                self.encode_text(raw)
            },
            FieldKind::Numeric => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(self.parsed_default.clone().unwrap_or(FieldValue::Numeric(None)));
                }
                match self.parse_numeric(trimmed) {
                    Ok(v) => Ok(FieldValue::Numeric(Some(v))),
                    Err(e) if e.kind == RowErrorKind::Unparsable => self.parsed_default.clone().ok_or(e),
                    Err(e) => Err(e),
                }
            },
            FieldKind::Date => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(self.parsed_default.clone().unwrap_or(FieldValue::Date(None)));
                }
                match self.parse_date(trimmed) {
                    Ok(ms) => Ok(FieldValue::Date(Some(ms))),
                    Err(e) if e.kind == RowErrorKind::Unparsable => self.parsed_default.clone().ok_or(e),
                    Err(e) => Err(e),
                }
            },
        }
    }

    /// Evaluate the computed expression against `row` and encode the result.
    pub fn compute(&self, row: &dyn FieldLookup) -> Result<FieldValue, RowEncodingError> {
        let Some(ref expression) = self.expression else {
            return Err(self.row_error("field is not computed"));
        };
        let value = expression
            .evaluate(row)
            .map_err(|reason| self.row_error(format!("expression failed: {reason}")))?;
        self.encode(&value.render())
    }

    /// Text form of an encoded value, as it would appear in a delimited file.
    pub fn render(&self, value: &FieldValue) -> String {
        match value {
            FieldValue::Text(s) => s.clone(),
            FieldValue::MultiText(values) => {
                values.join(self.multi_value_separator().unwrap_or(DEFAULT_MULTI_VALUE_SEPARATOR))
            },
            FieldValue::Numeric(Some(v)) => format_scaled(*v, self.scale),
            FieldValue::Date(Some(ms)) => match (DateTime::from_timestamp_millis(*ms), &self.format) {
                (Some(dt), Some(format)) => format.format(&dt),
                (Some(dt), None) => dt.to_rfc3339(),
                (None, _) => String::new(),
            },
            FieldValue::Numeric(None) | FieldValue::Date(None) => String::new(),
        }
    }
}

fn compile_format(field: &str, pattern: &str) -> Result<DateFormat, SchemaError> {
    DateFormat::compile(pattern).map_err(|reason| SchemaError::InvalidDateFormat {
        field: field.to_string(),
        format: pattern.to_string(),
        reason,
    })
}

fn default_true() -> bool {
    true
}

/// Persisted description of one field.
///
/// This is the on-disk shape only; it becomes a [`FieldDefinition`] through
/// `TryFrom`, which runs every check a hand-built definition goes through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fully_qualified_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_unique_id: bool,
    #[serde(default)]
    pub is_multi_value: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_value_separator: Option<String>,
    #[serde(default = "default_true")]
    pub can_truncate_value: bool,
    #[serde(default)]
    pub is_skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_separator: Option<String>,
    #[serde(default)]
    pub sort_index: u32,
    #[serde(default = "default_true")]
    pub is_sort_ascending: bool,
    #[serde(default)]
    pub is_computed_field: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_field_expression: Option<String>,
}

impl TryFrom<FieldSpec> for FieldDefinition {
    type Error = SchemaError;

    fn try_from(spec: FieldSpec) -> Result<Self, Self::Error> {
        let mut field = match spec.kind {
            FieldKind::Text => FieldDefinition::text(&spec.name)?,
            FieldKind::Numeric => FieldDefinition::numeric(
                &spec.name,
                spec.precision.unwrap_or(i64::from(MAX_PRECISION)),
                spec.scale.unwrap_or(0),
            )?,
            FieldKind::Date => {
                let format = spec
                    .format
                    .as_deref()
                    .ok_or_else(|| SchemaError::MissingDateFormat { field: spec.name.clone() })?;
                FieldDefinition::date(&spec.name, format)?
            },
        };

        if let Some(full_name) = spec.fully_qualified_name {
            field.set_full_name(full_name);
        }
        if let Some(label) = spec.label {
            field.set_label(label);
        }
        field.description = spec.description;
        field.set_can_truncate(spec.can_truncate_value);
        field.set_unique_id(spec.is_unique_id);
        field.set_skipped(spec.is_skipped);
        field.set_sort(spec.sort_index, spec.is_sort_ascending);

        if let Some(sep) = spec.decimal_separator {
            let mut chars = sep.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => field.set_decimal_separator(c)?,
                _ => {
                    return Err(SchemaError::attribute(
                        &spec.name,
                        format!("decimal separator '{sep}' must be a single character"),
                    ))
                },
            }
        }

        let separator = match (spec.is_multi_value, spec.multi_value_separator) {
            (_, Some(sep)) => Some(sep),
            (true, None) => Some(DEFAULT_MULTI_VALUE_SEPARATOR.to_string()),
            (false, None) => None,
        };
        field.set_multi_value_separator(separator.as_deref())?;

        match (spec.is_computed_field, spec.computed_field_expression) {
            (_, Some(expr)) => field.set_expression(Some(&expr))?,
            (true, None) => {
                return Err(SchemaError::InvalidExpression {
                    field: spec.name,
                    reason: "computed field has no expression".to_string(),
                })
            },
            (false, None) => {},
        }

        field.set_default_value(spec.default_value.as_deref())?;
        Ok(field)
    }
}

impl From<&FieldDefinition> for FieldSpec {
    fn from(field: &FieldDefinition) -> Self {
        let numeric = field.kind == FieldKind::Numeric;
        FieldSpec {
            name: field.name.clone(),
            fully_qualified_name: Some(field.full_name.clone()),
            label: Some(field.label.clone()),
            description: field.description.clone(),
            kind: field.kind,
            precision: numeric.then_some(i64::from(field.precision)),
            scale: numeric.then_some(i64::from(field.scale)),
            format: field.format().map(str::to_string),
            default_value: field.default_value.clone(),
            is_unique_id: field.is_unique_id,
            is_multi_value: field.is_multi_value(),
            multi_value_separator: field.multi_value_separator.clone(),
            can_truncate_value: field.can_truncate,
            is_skipped: field.is_skipped,
            decimal_separator: (field.decimal_separator != '.')
                .then(|| field.decimal_separator.to_string()),
            sort_index: field.sort_index,
            is_sort_ascending: field.sort_ascending,
            is_computed_field: field.is_computed(),
            computed_field_expression: field.expression.as_ref().map(|e| e.source().to_string()),
        }
    }
}

impl Serialize for FieldDefinition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        FieldSpec::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldDefinition {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let spec = FieldSpec::deserialize(deserializer)?;
        FieldDefinition::try_from(spec).map_err(serde::de::Error::custom)
    }
}
