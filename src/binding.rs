use crate::csv::{FieldParser, ParseError, RawRecord};
use crate::datatypes::FieldKind;
use crate::decode::Error as DecodeError;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::str;
use std::sync::Arc;
use thiserror::Error;

/// An invalid record shape, detected at bind time.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error("the record shape has no fields")]
    NoFields,
    #[error("field {0} specifies neither a column name nor a column index")]
    MissingLocator(usize),
    #[error("field {0} specifies both a column name and a column index")]
    AmbiguousLocator(usize),
    #[error("fields bound by name and fields bound by index are mixed")]
    MixedBindings,
    #[error("column name {0:?} is bound more than once")]
    DuplicateName(String),
    #[error("column index {0} is bound more than once")]
    DuplicateIndex(usize),
    #[error("{} did not appear in the header", .0.join(", "))]
    UnmatchedNames(Vec<String>),
}

/// A row that failed to decode.
#[derive(Clone, Debug, Error)]
pub enum RowError {
    #[error("cannot convert column {column}: {cause}")]
    Convert {
        column: usize,
        cause: Arc<ParseError>,
    },
    #[error("accessed index {index} though the size of the row is {width}")]
    OutOfRange { index: usize, width: usize },
}

/// Declares how one field of a record maps onto a CSV column.
///
/// Exactly one of `name` and `index` must be set.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FieldSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub kind: FieldKind,
}

impl FieldSpec {
    #[must_use]
    pub fn named<N: Into<String>>(name: N, kind: FieldKind) -> Self {
        Self {
            name: Some(name.into()),
            index: None,
            kind,
        }
    }

    #[must_use]
    pub fn indexed(index: usize, kind: FieldKind) -> Self {
        Self {
            name: None,
            index: Some(index),
            kind,
        }
    }
}

#[derive(Clone, Debug)]
enum Columns {
    Indexed(Vec<usize>),
    Named(Vec<String>),
}

/// An immutable field-to-column plan built from a validated shape.
///
/// Shapes whose fields are bound by name resolve their column positions
/// against the header row a [`Decoder`](crate::Decoder) consumes first.
#[derive(Clone, Debug)]
pub struct Binding {
    parsers: Vec<FieldParser>,
    columns: Columns,
}

impl Binding {
    /// Validates a shape and builds its binding, with the canonical
    /// converter for each field's kind.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the shape has no fields, a field
    /// specifies neither or both of name and index, name-bound and
    /// index-bound fields are mixed, or a column is bound twice.
    pub fn bind(fields: &[FieldSpec]) -> Result<Self, ConfigError> {
        let parsers = fields
            .iter()
            .map(|field| FieldParser::for_kind(field.kind))
            .collect();
        Self::with_parsers(fields, parsers)
    }

    pub(crate) fn with_parsers(
        fields: &[FieldSpec],
        parsers: Vec<FieldParser>,
    ) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::NoFields);
        }
        let mut names = Vec::new();
        let mut indexes = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            match (&field.name, field.index) {
                (Some(_), Some(_)) => return Err(ConfigError::AmbiguousLocator(i)),
                (None, None) => return Err(ConfigError::MissingLocator(i)),
                (Some(name), None) => {
                    if names.iter().any(|n| n == name) {
                        return Err(ConfigError::DuplicateName(name.clone()));
                    }
                    names.push(name.clone());
                }
                (None, Some(index)) => {
                    if indexes.contains(&index) {
                        return Err(ConfigError::DuplicateIndex(index));
                    }
                    indexes.push(index);
                }
            }
        }
        let columns = if names.is_empty() {
            Columns::Indexed(indexes)
        } else if indexes.is_empty() {
            Columns::Named(names)
        } else {
            return Err(ConfigError::MixedBindings);
        };
        Ok(Self { parsers, columns })
    }

    /// Returns whether the first input row must be consumed as a header.
    #[must_use]
    pub fn needs_header(&self) -> bool {
        matches!(self.columns, Columns::Named(_))
    }

    /// Returns the number of bound fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.parsers.len()
    }

    pub(crate) fn indexed_columns(&self) -> Option<Vec<usize>> {
        match &self.columns {
            Columns::Indexed(columns) => Some(columns.clone()),
            Columns::Named(_) => None,
        }
    }

    /// Matches each bound name against the header cells. The first
    /// occurrence of a name wins; header columns matching no bound name
    /// are ignored.
    pub(crate) fn resolve_header(&self, header: &RawRecord) -> Result<Vec<usize>, ConfigError> {
        let names = match &self.columns {
            Columns::Indexed(columns) => return Ok(columns.clone()),
            Columns::Named(names) => names,
        };
        let cells: Vec<Option<&str>> = (0..header.len())
            .map(|i| header.get(i).and_then(|cell| str::from_utf8(cell).ok()))
            .collect();
        let mut columns = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match cells.iter().position(|cell| *cell == Some(name.as_str())) {
                Some(i) => columns.push(i),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(columns)
        } else {
            Err(ConfigError::UnmatchedNames(missing))
        }
    }

    /// Decodes one tokenized row against an index-bound shape,
    /// independently of any session state.
    ///
    /// # Errors
    ///
    /// Returns an error if a cell fails to convert or a bound index lies
    /// beyond the row width. A name-bound shape resolves its columns
    /// against a header, which only a [`Decoder`](crate::Decoder)
    /// consumes; decoding a row against one directly reports every bound
    /// name as unmatched.
    pub fn decode_row(&self, row: &RawRecord) -> Result<Record, DecodeError> {
        match &self.columns {
            Columns::Indexed(columns) => self.decode_columns(columns, row).map_err(Into::into),
            Columns::Named(names) => Err(ConfigError::UnmatchedNames(names.clone()).into()),
        }
    }

    /// Applies each field's converter to its bound column. The first
    /// failure aborts the row; no partial record is produced.
    pub(crate) fn decode_columns(
        &self,
        columns: &[usize],
        row: &RawRecord,
    ) -> Result<Record, RowError> {
        let mut values = Vec::with_capacity(self.parsers.len());
        for (parser, &column) in self.parsers.iter().zip(columns) {
            let cell = row.get(column).ok_or(RowError::OutOfRange {
                index: column,
                width: row.len(),
            })?;
            let value = parser.parse(cell).map_err(|e| RowError::Convert {
                column,
                cause: Arc::new(e),
            })?;
            values.push(value);
        }
        Ok(Record::new(values))
    }
}

/// Assembles a record shape field by field.
#[derive(Debug, Default)]
pub struct ShapeBuilder {
    fields: Vec<FieldSpec>,
    parsers: Vec<FieldParser>,
}

impl ShapeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field bound to the header column `name`.
    #[must_use]
    pub fn named<N: Into<String>>(mut self, name: N, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec::named(name, kind));
        self.parsers.push(FieldParser::for_kind(kind));
        self
    }

    /// Adds a field bound to the zero-based column `index`.
    #[must_use]
    pub fn indexed(mut self, index: usize, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec::indexed(index, kind));
        self.parsers.push(FieldParser::for_kind(kind));
        self
    }

    /// Adds a name-bound field converted with `parser` instead of the
    /// canonical converter for its kind.
    #[must_use]
    pub fn named_with<N: Into<String>>(mut self, name: N, parser: FieldParser) -> Self {
        self.fields.push(FieldSpec::named(name, parser.kind()));
        self.parsers.push(parser);
        self
    }

    /// Adds an index-bound field converted with `parser`.
    #[must_use]
    pub fn indexed_with(mut self, index: usize, parser: FieldParser) -> Self {
        self.fields.push(FieldSpec::indexed(index, parser.kind()));
        self.parsers.push(parser);
        self
    }

    /// Validates the assembled shape and builds its binding.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Binding::bind`].
    pub fn bind(self) -> Result<Binding, ConfigError> {
        Binding::with_parsers(&self.fields, self.parsers)
    }
}
