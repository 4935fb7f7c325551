mod binding;
pub mod csv;
mod datatypes;
mod decode;
pub mod record;

pub use csv_core;

pub use binding::{Binding, ConfigError, FieldSpec, RowError, ShapeBuilder};
pub use csv::{infer_kinds, FieldParser, ParseError, RawRecord};
pub use datatypes::{FieldKind, Value};
pub use decode::{Decoder, Error, Flow, Options, ReadClose};
pub use record::Record;
