//! An interface to CSV (comma-separated values).

pub(crate) mod reader;

pub use reader::infer_kinds;
pub use reader::FieldParser;
pub use reader::ParseError;
pub use reader::RawRecord;
pub use reader::{BoolParser, Float64Parser, Int64Parser, UInt64Parser};
