//! Decoder for the Java Object Serialization Stream Protocol.
//!
//! The parser pulls big-endian primitives from a borrowed byte source and
//! produces a forest of [`Content`] values: strings, class descriptors,
//! arrays, enums and instances, with back-references resolved through a
//! per-session handle table. A transformer registry maps well-known
//! standard-library classes (collections, boxed primitives, `java.time`)
//! to native values.

pub mod content;
pub mod dump;
pub mod error;
pub mod handles;
pub mod mutf8;
pub mod parser;
pub mod reader;
pub mod tag;
pub mod time;
pub mod transform;

pub use crate::content::{
    ClassDesc, ClassDescKind, ClassDescRef, Content, ContentRef, FieldValue, Handle, Instance,
    JavaValue,
};
pub use crate::error::{ParseError, ParseResult};
pub use crate::handles::HandleTable;
pub use crate::parser::StreamParser;
pub use crate::reader::{Source, StreamReader};
pub use crate::tag::FieldType;
pub use crate::time::{JavaTime, TimeKind};
pub use crate::transform::{
    DefaultObjectTransformer, InstanceCarrier, ObjectTransformer, TransformerRegistry,
};

use slog::Logger;
use std::io::{Read, Seek};

/// Parses a complete stream with the default transformers.
pub fn load<R: Read + Seek>(src: &mut R) -> ParseResult<Vec<ContentRef>> {
    let mut parser = StreamParser::new(src, TransformerRegistry::default());
    parser.run()
}

/// Parses a complete stream with explicit transformers and logger.
pub fn load_with<R: Read + Seek>(
    src: &mut R,
    transformers: TransformerRegistry,
    log: Logger,
) -> ParseResult<Vec<ContentRef>> {
    let mut parser = StreamParser::with_logger(src, transformers, log);
    parser.run()
}
