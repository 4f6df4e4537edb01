//! Dataset schema
//!
//! A [`DatasetSchema`] is the ordered list of output columns plus the
//! delimited-file settings it was described with. It is either derived from
//! a CSV header (every column Text) or loaded from the persisted JSON
//! description, and both paths run the same validation. The persisted bytes
//! double as the job header metadata.
//!
//! Input columns map positionally onto the fields that are not computed.
//! Skipped fields consume an input column but produce no output.

pub mod date_format;
pub mod expression;
pub mod field;

pub use date_format::DateFormat;
pub use expression::{Evaluate, ExprValue, Expression, FieldLookup};
pub use field::{FieldDefinition, FieldKind, FieldSpec, FieldValue};

use crate::error::{RowEncodingError, SchemaError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// True when `name` starts with a letter, holds only ASCII letters, digits
/// or `_`, and is at most `max_len` characters.
pub fn is_identifier(name: &str, max_len: usize) -> bool {
    !name.is_empty() && name.len() <= max_len && IDENTIFIER.is_match(name)
}

/// Turn an arbitrary header cell into a valid field name.
pub fn sanitize_name(raw: &str, position: usize) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while name.contains("__") {
        name = name.replace("__", "_");
    }
    let name = name.trim_matches('_');
    let mut name = match name.chars().next() {
        None => format!("Column{}", position + 1),
        Some(c) if c.is_ascii_alphabetic() => name.to_string(),
        Some(_) => format!("X{name}"),
    };
    name.truncate(field::MAX_NAME_LENGTH);
    name
}

/// Delimited-file settings stored alongside the fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFormat {
    #[serde(default = "default_charset")]
    pub charset_name: String,
    #[serde(default = "default_delimiter")]
    pub fields_delimited_by: String,
    #[serde(default = "default_quote")]
    pub fields_enclosed_by: String,
    #[serde(default = "default_lines_to_ignore")]
    pub number_of_lines_to_ignore: u32,
}

fn default_charset() -> String {
    "UTF-8".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_quote() -> String {
    "\"".to_string()
}

fn default_lines_to_ignore() -> u32 {
    1
}

impl Default for FileFormat {
    fn default() -> Self {
        Self {
            charset_name: default_charset(),
            fields_delimited_by: default_delimiter(),
            fields_enclosed_by: default_quote(),
            number_of_lines_to_ignore: default_lines_to_ignore(),
        }
    }
}

impl FileFormat {
    pub fn delimiter(&self) -> u8 {
        single_byte(&self.fields_delimited_by).unwrap_or(b',')
    }

    pub fn quote(&self) -> u8 {
        single_byte(&self.fields_enclosed_by).unwrap_or(b'"')
    }

    fn validate(&self) -> Result<(), SchemaError> {
        for (what, value) in [
            ("fieldsDelimitedBy", &self.fields_delimited_by),
            ("fieldsEnclosedBy", &self.fields_enclosed_by),
        ] {
            if single_byte(value).is_none() {
                return Err(SchemaError::attribute(
                    "fileFormat",
                    format!("{what} must be a single ASCII character, got '{value}'"),
                ));
            }
        }
        if self.number_of_lines_to_ignore != 1 {
            return Err(SchemaError::attribute(
                "fileFormat",
                "numberOfLinesToIgnore must be 1 (a single header row)",
            ));
        }
        Ok(())
    }
}

fn single_byte(s: &str) -> Option<u8> {
    match s.as_bytes() {
        [b] if b.is_ascii() => Some(*b),
        _ => None,
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaFile {
    #[serde(default)]
    file_format: FileFormat,
    objects: Vec<ObjectSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectSpec {
    #[serde(default = "default_connector")]
    connector: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fully_qualified_name: Option<String>,
    fields: Vec<FieldSpec>,
}

fn default_connector() -> String {
    "CSV".to_string()
}

/// Column the external sort orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    /// Index into the input row
    pub column: usize,
    pub ascending: bool,
}

#[derive(Debug, Clone)]
pub struct DatasetSchema {
    name: String,
    label: String,
    file_format: FileFormat,
    fields: Vec<FieldDefinition>,
}

impl DatasetSchema {
    /// Build a schema from already valid fields, checking the cross-field
    /// rules: at least one field, unique names, and computed expressions
    /// that only reference input fields.
    pub fn new(name: &str, fields: Vec<FieldDefinition>) -> Result<Self, SchemaError> {
        if !is_identifier(name, field::MAX_NAME_LENGTH) {
            return Err(SchemaError::InvalidName(name.to_string()));
        }
        if fields.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        for f in &fields {
            if !seen.insert(f.name().to_ascii_lowercase()) {
                return Err(SchemaError::DuplicateName(f.name().to_string()));
            }
        }

        let inputs: HashSet<&str> = fields
            .iter()
            .filter(|f| !f.is_computed())
            .map(FieldDefinition::name)
            .collect();
        for f in fields.iter().filter(|f| f.is_computed()) {
            let references = f.expression().map(|e| e.references()).unwrap_or_default();
            if let Some(missing) = references.iter().find(|r| !inputs.contains(r.as_str())) {
                return Err(SchemaError::UnknownReference {
                    field: f.name().to_string(),
                    reference: missing.clone(),
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            label: name.to_string(),
            file_format: FileFormat::default(),
            fields,
        })
    }

    /// One Text field per header cell. Names are sanitized and made unique;
    /// the raw cell becomes the label.
    pub fn derive_from_header(name: &str, header: &[String]) -> Result<Self, SchemaError> {
        if header.is_empty() {
            return Err(SchemaError::Header("header row is empty".to_string()));
        }

        let mut used: HashSet<String> = HashSet::new();
        let mut fields = Vec::with_capacity(header.len());
        for (i, cell) in header.iter().enumerate() {
            let cell = cell.trim_start_matches('\u{feff}').trim();
            let base = sanitize_name(cell, i);
            let mut candidate = base.clone();
            let mut suffix = 2;
            while !used.insert(candidate.to_ascii_lowercase()) {
                let tail = format!("_{suffix}");
                let mut stem = base.clone();
                stem.truncate(field::MAX_NAME_LENGTH - tail.len());
                candidate = format!("{stem}{tail}");
                suffix += 1;
            }
            let label = if cell.is_empty() { candidate.clone() } else { cell.to_string() };
            fields.push(FieldDefinition::text(&candidate)?.with_label(label));
        }

        Self::new(&sanitize_name(name, 0), fields)
    }

    /// Parse and re-validate a persisted description.
    pub fn load(bytes: &[u8]) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_json::from_slice(bytes)?;
        file.file_format.validate()?;

        let mut objects = file.objects.into_iter();
        let object = match (objects.next(), objects.next()) {
            (Some(object), None) => object,
            (None, _) => return Err(SchemaError::Empty),
            (Some(_), Some(_)) => {
                return Err(SchemaError::attribute(
                    "objects",
                    "exactly one object is supported per file",
                ))
            },
        };

        let fields = object
            .fields
            .into_iter()
            .map(FieldDefinition::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut schema = Self::new(&object.name, fields)?;
        schema.label = object.label.unwrap_or_else(|| object.name.clone());
        schema.file_format = file.file_format;
        Ok(schema)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        let file = SchemaFile {
            file_format: self.file_format.clone(),
            objects: vec![ObjectSpec {
                connector: default_connector(),
                name: self.name.clone(),
                label: Some(self.label.clone()),
                fully_qualified_name: Some(self.name.clone()),
                fields: self.fields.iter().map(FieldSpec::from).collect(),
            }],
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    #[must_use]
    pub fn with_file_format(mut self, file_format: FileFormat) -> Self {
        self.file_format = file_format;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_format(&self) -> &FileFormat {
        &self.file_format
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Fields that appear in the output, in output order.
    pub fn output_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| !f.is_skipped())
    }

    /// Number of cells expected in each input row.
    pub fn input_width(&self) -> usize {
        self.fields.iter().filter(|f| !f.is_computed()).count()
    }

    /// The sort column: the input field with the smallest non-zero sort
    /// index, or the first column ascending when none is set.
    pub fn sort_key(&self) -> SortKey {
        self.fields
            .iter()
            .filter(|f| !f.is_computed())
            .enumerate()
            .filter(|(_, f)| f.sort().0 > 0)
            .min_by_key(|(_, f)| f.sort().0)
            .map(|(column, f)| SortKey {
                column,
                ascending: f.sort().1,
            })
            .unwrap_or(SortKey {
                column: 0,
                ascending: true,
            })
    }

    /// Encode one decoded input row into output values.
    pub fn encode_row(&self, cells: &[String]) -> Result<Vec<FieldValue>, RowEncodingError> {
        let width = self.input_width();
        if cells.len() != width {
            return Err(RowEncodingError::new(
                "row",
                format!("expected {width} columns, found {}", cells.len()),
            ));
        }

        let mut inputs = cells.iter();
        let mut encoded: Vec<Option<FieldValue>> = Vec::with_capacity(self.fields.len());
        let mut view = RowView::default();

        for f in &self.fields {
            if f.is_computed() {
                encoded.push(None);
                continue;
            }
            let raw = inputs.next().map(String::as_str).unwrap_or_default();
            if f.is_skipped() {
                view.insert(f, raw, None);
                encoded.push(None);
                continue;
            }
            let value = f.encode(raw)?;
            view.insert(f, raw, Some(&value));
            encoded.push(Some(value));
        }

        let mut out = Vec::with_capacity(encoded.len());
        for (f, value) in self.fields.iter().zip(encoded) {
            if f.is_skipped() {
                continue;
            }
            match value {
                Some(v) => out.push(v),
                None => out.push(f.compute(&view)?),
            }
        }
        Ok(out)
    }
}

/// Typed view of the input cells for expression evaluation.
#[derive(Debug, Default)]
struct RowView {
    values: HashMap<String, ExprValue>,
}

impl RowView {
    fn insert(&mut self, field: &FieldDefinition, raw: &str, encoded: Option<&FieldValue>) {
        let value = match encoded {
            Some(FieldValue::Numeric(Some(v))) => {
                ExprValue::Number(*v as f64 / field.multiplier() as f64)
            },
            Some(FieldValue::Numeric(None)) | Some(FieldValue::Date(None)) => ExprValue::Null,
            Some(other) => ExprValue::Text(field.render(other)),
            None if raw.is_empty() => ExprValue::Null,
            None => ExprValue::Text(raw.to_string()),
        };
        let value = match value {
            ExprValue::Text(ref s) if s.is_empty() => ExprValue::Null,
            other => other,
        };
        self.values.insert(field.name().to_string(), value);
    }
}

impl FieldLookup for RowView {
    fn value_of(&self, field: &str) -> Option<ExprValue> {
        self.values.get(field).cloned()
    }
}
