use crate::datatypes::{FieldKind, Value};
use csv_core::ReadRecordResult;
use num_traits::Num;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::str::{self, FromStr};
use std::sync::Arc;
use thiserror::Error;

/// One tokenized CSV row: a flat byte buffer plus field-end offsets.
pub struct RawRecord {
    fields: Vec<u8>,
    ends: Vec<usize>,
}

impl RawRecord {
    #[must_use]
    pub fn from_data(data: &[&[u8]]) -> Vec<Self> {
        let mut reader = csv_core::Reader::new();
        data.iter()
            .filter_map(|d| Self::new(&mut reader, d))
            .collect()
    }

    /// # Panics
    ///
    /// Panics if `input.len() * 2` overflows `usize`.
    ///
    #[must_use]
    pub fn new(reader: &mut csv_core::Reader, input: &[u8]) -> Option<Self> {
        let mut fields = Vec::with_capacity(input.len());
        let mut ends = Vec::with_capacity(input.len());
        let mut cur = 0;
        let (mut outlen, mut endlen) = (0, 0);
        loop {
            let (res, nin, nout, nend) =
                reader.read_record(&input[cur..], &mut fields[outlen..], &mut ends[endlen..]);
            cur += nin;
            outlen += nout;
            endlen += nend;
            match res {
                ReadRecordResult::InputEmpty => continue,
                ReadRecordResult::OutputFull => {
                    fields.resize(std::cmp::max(4, fields.len().checked_mul(2).unwrap()), 0)
                }
                ReadRecordResult::OutputEndsFull => {
                    ends.resize(std::cmp::max(4, ends.len().checked_mul(2).unwrap()), 0)
                }
                ReadRecordResult::Record => {
                    unsafe {
                        fields.set_len(outlen);
                        ends.set_len(endlen);
                    }
                    return Some(Self { fields, ends });
                }
                ReadRecordResult::End => return None,
            }
        }
    }

    /// Reads one record from a buffered input. Returns `Ok(None)` when the
    /// input is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from `input` fails.
    ///
    /// # Panics
    ///
    /// Panics if line length in input * 2 overflows `usize`.
    ///
    pub fn from_buf(
        reader: &mut csv_core::Reader,
        input: &mut dyn BufRead,
    ) -> io::Result<Option<Self>> {
        let mut fields = Vec::with_capacity(1024);
        let mut ends = Vec::with_capacity(1024);
        let (mut outlen, mut endlen) = (0, 0);
        loop {
            let (res, nin, nout, nend) = {
                let buf = input.fill_buf()?;
                reader.read_record(buf, &mut fields[outlen..], &mut ends[endlen..])
            };
            input.consume(nin);
            outlen += nout;
            endlen += nend;
            match res {
                ReadRecordResult::InputEmpty => continue,
                ReadRecordResult::OutputFull => {
                    fields.resize(std::cmp::max(4, fields.len().checked_mul(2).unwrap()), 0)
                }
                ReadRecordResult::OutputEndsFull => {
                    ends.resize(std::cmp::max(4, ends.len().checked_mul(2).unwrap()), 0)
                }
                ReadRecordResult::Record => {
                    unsafe {
                        fields.set_len(outlen);
                        ends.set_len(endlen);
                    }
                    return Ok(Some(Self { fields, ends }));
                }
                ReadRecordResult::End => return Ok(None),
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> Option<&[u8]> {
        let end = match self.ends.get(i) {
            None => return None,
            Some(&end) => end,
        };
        let start = match i.checked_sub(1).and_then(|i| self.ends.get(i)) {
            None => 0,
            Some(&start) => start,
        };
        Some(&self.fields[start..end])
    }

    /// Returns the number of fields in the record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }
}

/// An error which can occur when converting a CSV cell into a typed value.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] str::Utf8Error),
    #[error("invalid integer: {0}")]
    Int(#[from] std::num::ParseIntError),
    #[error("invalid number: {0}")]
    Float(#[from] std::num::ParseFloatError),
    #[error("invalid boolean token {0:?}")]
    Bool(String),
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::format::ParseError),
}

pub type BoolParser = dyn Fn(&[u8]) -> Result<bool, ParseError> + Send + Sync;
pub type Int64Parser = dyn Fn(&[u8]) -> Result<i64, ParseError> + Send + Sync;
pub type UInt64Parser = dyn Fn(&[u8]) -> Result<u64, ParseError> + Send + Sync;
pub type Float64Parser = dyn Fn(&[u8]) -> Result<f64, ParseError> + Send + Sync;

/// A converter from a CSV cell to one supported field kind.
#[derive(Clone)]
pub enum FieldParser {
    Bool(Arc<BoolParser>),
    Int64(Arc<Int64Parser>),
    UInt64(Arc<UInt64Parser>),
    Float64(Arc<Float64Parser>),
    Utf8,
    Timestamp(Arc<Int64Parser>),
}

impl FieldParser {
    #[must_use]
    pub fn boolean() -> Self {
        Self::Bool(Arc::new(parse_bool))
    }

    #[must_use]
    pub fn int64() -> Self {
        Self::Int64(Arc::new(parse_int::<i64>))
    }

    #[must_use]
    pub fn uint64() -> Self {
        Self::UInt64(Arc::new(parse_int::<u64>))
    }

    #[must_use]
    pub fn float64() -> Self {
        Self::Float64(Arc::new(parse::<f64>))
    }

    #[must_use]
    pub fn timestamp() -> Self {
        Self::Timestamp(Arc::new(parse_timestamp))
    }

    #[must_use]
    pub fn int64_with_parser<P>(parser: P) -> Self
    where
        P: Fn(&[u8]) -> Result<i64, ParseError> + Send + Sync + 'static,
    {
        Self::Int64(Arc::new(parser))
    }

    #[must_use]
    pub fn uint64_with_parser<P>(parser: P) -> Self
    where
        P: Fn(&[u8]) -> Result<u64, ParseError> + Send + Sync + 'static,
    {
        Self::UInt64(Arc::new(parser))
    }

    #[must_use]
    pub fn float64_with_parser<P>(parser: P) -> Self
    where
        P: Fn(&[u8]) -> Result<f64, ParseError> + Send + Sync + 'static,
    {
        Self::Float64(Arc::new(parser))
    }

    #[must_use]
    pub fn timestamp_with_parser<P>(parser: P) -> Self
    where
        P: Fn(&[u8]) -> Result<i64, ParseError> + Send + Sync + 'static,
    {
        Self::Timestamp(Arc::new(parser))
    }

    pub(crate) fn for_kind(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Bool => Self::boolean(),
            FieldKind::Int64 => Self::int64(),
            FieldKind::UInt64 => Self::uint64(),
            FieldKind::Float64 => Self::float64(),
            FieldKind::Utf8 => Self::Utf8,
            FieldKind::Timestamp => Self::timestamp(),
        }
    }

    pub(crate) fn kind(&self) -> FieldKind {
        match self {
            Self::Bool(_) => FieldKind::Bool,
            Self::Int64(_) => FieldKind::Int64,
            Self::UInt64(_) => FieldKind::UInt64,
            Self::Float64(_) => FieldKind::Float64,
            Self::Utf8 => FieldKind::Utf8,
            Self::Timestamp(_) => FieldKind::Timestamp,
        }
    }

    pub(crate) fn parse(&self, cell: &[u8]) -> Result<Value, ParseError> {
        match self {
            Self::Bool(parse) => parse(cell).map(Value::Bool),
            Self::Int64(parse) | Self::Timestamp(parse) => parse(cell).map(Value::Int64),
            Self::UInt64(parse) => parse(cell).map(Value::UInt64),
            Self::Float64(parse) => parse(cell).map(Value::Float64),
            Self::Utf8 => Ok(Value::Utf8(str::from_utf8(cell)?.to_string())),
        }
    }
}

impl fmt::Debug for FieldParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(_) => write!(f, "Bool"),
            Self::Int64(_) => write!(f, "Int64"),
            Self::UInt64(_) => write!(f, "UInt64"),
            Self::Float64(_) => write!(f, "Float64"),
            Self::Utf8 => write!(f, "Utf8"),
            Self::Timestamp(_) => write!(f, "Timestamp"),
        }
    }
}

fn parse<T>(v: &[u8]) -> Result<T, ParseError>
where
    T: FromStr,
    <T as FromStr>::Err: Into<ParseError>,
{
    str::from_utf8(v)?.parse::<T>().map_err(Into::into)
}

/// Parses an integer with an optional sign and `0x`/`0o`/`0b` base prefix.
fn parse_int<T>(v: &[u8]) -> Result<T, ParseError>
where
    T: Num<FromStrRadixErr = std::num::ParseIntError>,
{
    let s = str::from_utf8(v)?;
    let (sign, magnitude) = match s.strip_prefix('-') {
        Some(m) => ("-", m),
        None => ("", s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if let Some(d) = magnitude
        .strip_prefix("0x")
        .or_else(|| magnitude.strip_prefix("0X"))
    {
        (16, d)
    } else if let Some(d) = magnitude
        .strip_prefix("0o")
        .or_else(|| magnitude.strip_prefix("0O"))
    {
        (8, d)
    } else if let Some(d) = magnitude
        .strip_prefix("0b")
        .or_else(|| magnitude.strip_prefix("0B"))
    {
        (2, d)
    } else {
        (10, magnitude)
    };
    if radix == 10 {
        T::from_str_radix(s, 10).map_err(Into::into)
    } else {
        T::from_str_radix(&format!("{}{}", sign, digits), radix).map_err(Into::into)
    }
}

fn parse_bool(v: &[u8]) -> Result<bool, ParseError> {
    match str::from_utf8(v)? {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        token => Err(ParseError::Bool(token.to_string())),
    }
}

/// Parses timestamp in RFC 3339 format into Unix seconds.
fn parse_timestamp(v: &[u8]) -> Result<i64, ParseError> {
    Ok(
        chrono::NaiveDateTime::parse_from_str(str::from_utf8(v)?, "%Y-%m-%dT%H:%M:%S%.f%:z")?
            .timestamp(),
    )
}

/// Infers the kind of a field in a CSV record.
fn infer_field_kind(field: &[u8]) -> FieldKind {
    if let Ok(s) = str::from_utf8(field) {
        if s.parse::<i64>().is_ok() {
            FieldKind::Int64
        } else if s.parse::<f64>().is_ok() {
            FieldKind::Float64
        } else if parse_bool(field).is_ok() {
            FieldKind::Bool
        } else {
            FieldKind::Utf8
        }
    } else {
        FieldKind::Utf8
    }
}

/// Infers the kind of each column by reading one record from `reader`.
///
/// The record is consumed.
///
/// # Errors
///
/// Returns an error if there is no data to read from `reader`, or if the
/// read itself fails.
pub fn infer_kinds<R: Read>(reader: &mut BufReader<R>) -> io::Result<Vec<FieldKind>> {
    let mut csv_reader = csv_core::Reader::new();
    let record = RawRecord::from_buf(&mut csv_reader, reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no data available"))?;
    Ok((0..record.len())
        .map(|i| record.get(i).map_or(FieldKind::Utf8, infer_field_kind))
        .collect())
}
