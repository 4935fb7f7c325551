use crate::binding::{Binding, ConfigError, RowError};
use crate::csv::RawRecord;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// An error which can terminate a decode session.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Row(#[from] RowError),
    #[error("read error: {0}")]
    Io(Arc<io::Error>),
    #[error("{0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync>),
}

/// Control decision returned by a [`Decoder::for_each`] callback.
#[derive(Debug)]
pub enum Flow {
    /// Keep decoding.
    Continue,
    /// End iteration cleanly, recording no error.
    Stop,
    /// End iteration; the cause becomes the session's terminal error.
    Fail(Box<dyn std::error::Error + Send + Sync>),
}

impl Flow {
    /// Shorthand for [`Flow::Fail`].
    pub fn fail<E>(cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Flow::Fail(cause.into())
    }
}

/// A byte source whose underlying resource can be released explicitly.
///
/// Dropping a reader cannot report a close failure, so a [`Decoder`] built
/// over an owned source calls [`close`](ReadClose::close) itself, exactly
/// once, when the session finishes.
pub trait ReadClose: Read {
    /// Releases the underlying resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be released.
    fn close(&mut self) -> io::Result<()>;
}

impl ReadClose for File {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: AsRef<[u8]>> ReadClose for io::Cursor<T> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct NoClose<R>(R);

impl<R: Read> Read for NoClose<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read> ReadClose for NoClose<R> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Configuration for the CSV tokenizer.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    delimiter: u8,
    comment: Option<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            delimiter: b',',
            comment: None,
        }
    }
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the field delimiter.
    #[must_use]
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Sets the comment character; lines starting with it are skipped.
    #[must_use]
    pub fn comment(mut self, comment: u8) -> Self {
        self.comment = Some(comment);
        self
    }

    fn build_core(&self) -> csv_core::Reader {
        let mut builder = csv_core::ReaderBuilder::new();
        builder.delimiter(self.delimiter);
        builder.comment(self.comment);
        builder.build()
    }
}

#[derive(Debug)]
enum Terminal {
    Eof,
    Failed(Error),
}

/// A decode session over one CSV input.
///
/// The session tracks the current line number and its terminal state: the
/// first failure stops all further decoding, and [`done`](Decoder::done)
/// reports it. Reaching the end of input is not a failure.
pub struct Decoder<'r> {
    binding: Binding,
    core: csv_core::Reader,
    input: BufReader<Box<dyn ReadClose + 'r>>,
    columns: Option<Vec<usize>>,
    lineno: u64,
    terminal: Option<Terminal>,
    closed: bool,
}

impl<'r> Decoder<'r> {
    /// Creates a decoder over a borrowed input; nothing is closed when the
    /// session finishes.
    pub fn new<R: Read + 'r>(binding: Binding, input: R) -> Self {
        Self::with_options(binding, input, Options::default())
    }

    pub fn with_options<R: Read + 'r>(binding: Binding, input: R, options: Options) -> Self {
        Self::build(binding, Box::new(NoClose(input)), &options, None)
    }

    /// Creates a decoder that owns its input and closes it exactly once
    /// when [`done`](Decoder::done) is first called.
    pub fn from_owned<R: ReadClose + 'r>(binding: Binding, input: R) -> Self {
        Self::from_owned_with_options(binding, input, Options::default())
    }

    pub fn from_owned_with_options<R: ReadClose + 'r>(
        binding: Binding,
        input: R,
        options: Options,
    ) -> Self {
        Self::build(binding, Box::new(input), &options, None)
    }

    /// Creates a decoder reading from the file at `path`.
    ///
    /// An open failure is recorded as the session's terminal error rather
    /// than returned; every operation then yields nothing and
    /// [`done`](Decoder::done) reports the failure.
    pub fn from_path<P: AsRef<Path>>(binding: Binding, path: P) -> Self {
        Self::from_path_with_options(binding, path, Options::default())
    }

    pub fn from_path_with_options<P: AsRef<Path>>(
        binding: Binding,
        path: P,
        options: Options,
    ) -> Self {
        match File::open(path) {
            Ok(file) => Self::from_owned_with_options(binding, file, options),
            Err(e) => Self::build(
                binding,
                Box::new(NoClose(io::empty())),
                &options,
                Some(Terminal::Failed(Error::Io(Arc::new(e)))),
            ),
        }
    }

    fn build(
        binding: Binding,
        input: Box<dyn ReadClose + 'r>,
        options: &Options,
        terminal: Option<Terminal>,
    ) -> Self {
        Self {
            binding,
            core: options.build_core(),
            input: BufReader::new(input),
            columns: None,
            lineno: 0,
            terminal,
            closed: false,
        }
    }

    /// Returns the number of lines consumed so far, including the header.
    #[must_use]
    pub fn line(&self) -> u64 {
        self.lineno
    }

    fn next_raw(&mut self) -> Option<RawRecord> {
        match RawRecord::from_buf(&mut self.core, &mut self.input) {
            Ok(Some(record)) => {
                self.lineno += 1;
                Some(record)
            }
            Ok(None) => {
                self.terminal = Some(Terminal::Eof);
                None
            }
            Err(e) => {
                self.terminal = Some(Terminal::Failed(Error::Io(Arc::new(e))));
                None
            }
        }
    }

    fn ensure_columns(&mut self) -> bool {
        if self.columns.is_some() {
            return true;
        }
        if let Some(columns) = self.binding.indexed_columns() {
            self.columns = Some(columns);
            return true;
        }
        let header = match self.next_raw() {
            Some(header) => header,
            None => return false,
        };
        match self.binding.resolve_header(&header) {
            Ok(columns) => {
                self.columns = Some(columns);
                true
            }
            Err(e) => {
                self.terminal = Some(Terminal::Failed(e.into()));
                false
            }
        }
    }

    /// Decodes the next row.
    ///
    /// Returns `None` at the end of input, once the session has finished,
    /// or when a failure has been recorded; [`done`](Decoder::done)
    /// distinguishes the cases.
    pub fn next_record(&mut self) -> Option<Record> {
        if self.closed || self.terminal.is_some() {
            return None;
        }
        if !self.ensure_columns() {
            return None;
        }
        let raw = self.next_raw()?;
        let columns = self.columns.as_deref()?;
        match self.binding.decode_columns(columns, &raw) {
            Ok(record) => Some(record),
            Err(e) => {
                self.terminal = Some(Terminal::Failed(Error::Row(e)));
                None
            }
        }
    }

    /// Decodes all remaining rows, stopping before the first failing row.
    pub fn read_all(&mut self) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record() {
            records.push(record);
        }
        records
    }

    /// Invokes `body` once per decoded record until the input ends, a
    /// failure is recorded, or `body` returns [`Flow::Stop`] or
    /// [`Flow::Fail`].
    pub fn for_each<F>(&mut self, mut body: F)
    where
        F: FnMut(Record) -> Flow,
    {
        while let Some(record) = self.next_record() {
            match body(record) {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::Fail(cause) => {
                    self.terminal = Some(Terminal::Failed(Error::Callback(Arc::from(cause))));
                    break;
                }
            }
        }
    }

    /// Finishes the session and reports its terminal status.
    ///
    /// The first call closes an owned input; a close failure is reported
    /// only if no decode failure was recorded before it. Subsequent calls
    /// return the same result.
    ///
    /// # Errors
    ///
    /// Returns the first error the session encountered, if any. Reaching
    /// the end of input is not an error.
    pub fn done(&mut self) -> Result<(), Error> {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.input.get_mut().close() {
                let failed = matches!(self.terminal, Some(Terminal::Failed(_)));
                if !failed {
                    self.terminal = Some(Terminal::Failed(Error::Io(Arc::new(e))));
                }
            }
        }
        match &self.terminal {
            Some(Terminal::Failed(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::FieldSpec;
    use crate::csv::FieldParser;
    use crate::datatypes::{FieldKind, Value};
    use crate::ShapeBuilder;
    use itertools::izip;
    use std::cell::Cell;
    use std::rc::Rc;

    fn three_field_binding() -> Binding {
        Binding::bind(&[
            FieldSpec::indexed(0, FieldKind::Int64),
            FieldSpec::indexed(1, FieldKind::Float64),
            FieldSpec::indexed(2, FieldKind::Utf8),
        ])
        .unwrap()
    }

    #[test]
    fn decode_with_index() {
        let mut decoder = Decoder::new(three_field_binding(), &b"10,1.2,alpha\n20,2.3,beta\n"[..]);
        let records = decoder.read_all();
        assert!(decoder.done().is_ok());
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].values(),
            &[
                Value::Int64(10),
                Value::Float64(1.2),
                Value::Utf8("alpha".to_string()),
            ]
        );
        assert_eq!(
            records[1].values(),
            &[
                Value::Int64(20),
                Value::Float64(2.3),
                Value::Utf8("beta".to_string()),
            ]
        );
    }

    #[test]
    fn decode_with_name() {
        let expected_ints = vec![10_i64, 20, 30];
        let expected_floats = vec![1.2_f64, 2.3, 3.4];
        let expected_strs = vec!["alpha", "beta", "gamma"];
        let mut data = b"str,unused,int,float\n".to_vec();
        for (i, f, s) in izip!(&expected_ints, &expected_floats, &expected_strs) {
            data.extend(format!("{},x,{},{}\n", s, i, f).into_bytes());
        }

        let binding = Binding::bind(&[
            FieldSpec::named("int", FieldKind::Int64),
            FieldSpec::named("float", FieldKind::Float64),
            FieldSpec::named("str", FieldKind::Utf8),
        ])
        .unwrap();
        let mut decoder = Decoder::new(binding, data.as_slice());
        let mut ints = Vec::new();
        let mut floats = Vec::new();
        let mut strs = Vec::new();
        decoder.for_each(|record| {
            ints.push(record[0].as_i64().unwrap());
            floats.push(record[1].as_f64().unwrap());
            strs.push(record[2].as_str().unwrap().to_string());
            Flow::Continue
        });
        assert!(decoder.done().is_ok());
        assert_eq!(ints, expected_ints);
        assert_eq!(floats, expected_floats);
        assert_eq!(strs, expected_strs);
    }

    #[test]
    fn index_out_of_range() {
        let binding = Binding::bind(&[
            FieldSpec::indexed(0, FieldKind::Int64),
            FieldSpec::indexed(2, FieldKind::Float64),
        ])
        .unwrap();
        let mut decoder = Decoder::new(binding, &b"10,1.2\n20,2.3\n"[..]);
        assert!(decoder.next_record().is_none());
        let err = decoder.done().unwrap_err();
        assert_eq!(
            err.to_string(),
            "accessed index 2 though the size of the row is 2"
        );
    }

    #[test]
    fn header_missing_names() {
        let binding = Binding::bind(&[
            FieldSpec::named("a", FieldKind::Int64),
            FieldSpec::named("c", FieldKind::Int64),
        ])
        .unwrap();
        let mut decoder = Decoder::new(binding, &b"a,b\n10,20\n"[..]);
        assert!(decoder.next_record().is_none());
        let err = decoder.done().unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::UnmatchedNames(_))));
        assert_eq!(err.to_string(), "c did not appear in the header");
    }

    #[test]
    fn empty_input_with_header_shape() {
        let binding = Binding::bind(&[FieldSpec::named("a", FieldKind::Int64)]).unwrap();
        let mut decoder = Decoder::new(binding, &b""[..]);
        assert!(decoder.next_record().is_none());
        assert!(decoder.done().is_ok());
    }

    #[test]
    fn callback_stop_is_not_an_error() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let mut decoder = Decoder::new(binding, &b"10\n20\n30\n"[..]);
        let mut seen = Vec::new();
        decoder.for_each(|record| {
            seen.push(record[0].as_i64().unwrap());
            Flow::Stop
        });
        assert!(decoder.done().is_ok());
        assert_eq!(seen, vec![10]);
    }

    #[test]
    fn callback_failure_becomes_terminal() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let mut decoder = Decoder::new(binding, &b"10\n20\n"[..]);
        let mut seen = Vec::new();
        decoder.for_each(|record| {
            seen.push(record[0].as_i64().unwrap());
            Flow::fail("broken pipeline")
        });
        assert_eq!(seen, vec![10]);
        let err = decoder.done().unwrap_err();
        assert!(matches!(err, Error::Callback(_)));
        assert_eq!(err.to_string(), "broken pipeline");
        // Finalizing again reports the same error.
        assert_eq!(decoder.done().unwrap_err().to_string(), "broken pipeline");
    }

    #[test]
    fn conversion_failure_stops_the_session() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let mut decoder = Decoder::new(binding, &b"10\nabc\n30\n"[..]);
        let records = decoder.read_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].values(), &[Value::Int64(10)]);
        assert_eq!(decoder.line(), 2);
        let err = decoder.done().unwrap_err();
        assert!(matches!(err, Error::Row(RowError::Convert { column: 0, .. })));
    }

    #[test]
    fn custom_delimiter_and_comment() {
        let binding = Binding::bind(&[
            FieldSpec::indexed(0, FieldKind::Int64),
            FieldSpec::indexed(1, FieldKind::Utf8),
        ])
        .unwrap();
        let options = Options::new().delimiter(b';').comment(b'#');
        let mut decoder = Decoder::with_options(binding, &b"# skipped\n10;ten\n"[..], options);
        let records = decoder.read_all();
        assert!(decoder.done().is_ok());
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].values(),
            &[Value::Int64(10), Value::Utf8("ten".to_string())]
        );
    }

    #[test]
    fn quoted_fields_decode() {
        let binding = Binding::bind(&[
            FieldSpec::indexed(0, FieldKind::Utf8),
            FieldSpec::indexed(1, FieldKind::Int64),
        ])
        .unwrap();
        let mut decoder = Decoder::new(binding, &b"\"a,b\",2\n"[..]);
        let records = decoder.read_all();
        assert!(decoder.done().is_ok());
        assert_eq!(
            records[0].values(),
            &[Value::Utf8("a,b".to_string()), Value::Int64(2)]
        );
    }

    #[test]
    fn custom_timestamp_parser() {
        let binding = ShapeBuilder::new()
            .indexed_with(
                0,
                FieldParser::timestamp_with_parser(|cell| {
                    let s = std::str::from_utf8(cell)?;
                    Ok(chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")?.timestamp())
                }),
            )
            .bind()
            .unwrap();
        let mut decoder = Decoder::new(binding, &b"1970-01-01 00:01:40\n"[..]);
        let records = decoder.read_all();
        assert!(decoder.done().is_ok());
        assert_eq!(records[0].values(), &[Value::Int64(100)]);
    }

    #[test]
    fn from_path_open_failure() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let mut decoder = Decoder::from_path(binding, "/nonexistent/easycsv/input.csv");
        assert!(decoder.next_record().is_none());
        assert!(matches!(decoder.done().unwrap_err(), Error::Io(_)));
    }

    struct FakeCloser {
        data: io::Cursor<Vec<u8>>,
        close_error: Option<io::Error>,
        closes: Rc<Cell<u32>>,
    }

    impl FakeCloser {
        fn new(data: &[u8], close_error: Option<io::Error>) -> (Self, Rc<Cell<u32>>) {
            let closes = Rc::new(Cell::new(0));
            (
                Self {
                    data: io::Cursor::new(data.to_vec()),
                    close_error,
                    closes: Rc::clone(&closes),
                },
                closes,
            )
        }
    }

    impl Read for FakeCloser {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl ReadClose for FakeCloser {
        fn close(&mut self) -> io::Result<()> {
            self.closes.set(self.closes.get() + 1);
            match self.close_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn owned_input_is_closed_once() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let (closer, closes) = FakeCloser::new(b"10\n", None);
        let mut decoder = Decoder::from_owned(binding, closer);
        assert_eq!(decoder.read_all().len(), 1);
        assert!(decoder.done().is_ok());
        assert!(decoder.done().is_ok());
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn close_error_is_reported() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let close_error = io::Error::new(io::ErrorKind::Other, "close error");
        let (closer, closes) = FakeCloser::new(b"", Some(close_error));
        let mut decoder = Decoder::from_owned(binding, closer);
        assert!(decoder.next_record().is_none());
        let err = decoder.done().unwrap_err();
        assert_eq!(err.to_string(), "read error: close error");
        // Idempotent: the recorded error does not change.
        assert_eq!(decoder.done().unwrap_err().to_string(), err.to_string());
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn close_error_does_not_overwrite_decode_error() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let close_error = io::Error::new(io::ErrorKind::Other, "close error");
        let (closer, closes) = FakeCloser::new(b"abc\n", Some(close_error));
        let mut decoder = Decoder::from_owned(binding, closer);
        assert!(decoder.next_record().is_none());
        let err = decoder.done().unwrap_err();
        assert!(matches!(err, Error::Row(RowError::Convert { .. })));
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn no_reads_after_done() {
        let binding = Binding::bind(&[FieldSpec::indexed(0, FieldKind::Int64)]).unwrap();
        let mut decoder = Decoder::new(binding, &b"10\n20\n"[..]);
        assert!(decoder.next_record().is_some());
        assert!(decoder.done().is_ok());
        assert!(decoder.next_record().is_none());
    }

    #[test]
    fn options_from_json() {
        let options: Options = serde_json::from_str(r#"{"delimiter": 59}"#).unwrap();
        let binding = Binding::bind(&[FieldSpec::indexed(1, FieldKind::Utf8)]).unwrap();
        let mut decoder = Decoder::with_options(binding, &b"1;one\n"[..], options);
        let records = decoder.read_all();
        assert!(decoder.done().is_ok());
        assert_eq!(records[0].values(), &[Value::Utf8("one".to_string())]);
    }
}
