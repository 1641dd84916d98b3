use crate::content::{ContentRef, Handle};
use std::error;
use std::fmt;
use std::io;

/// Everything that can go wrong while decoding a stream.
///
/// All variants unwind to the top-level `run` untouched, except
/// `ExceptionRead`: that one is an internal signal meaning "a decoded
/// exception object surfaced mid-read" and is intercepted by
/// `StreamParser::read_content`, which turns it back into ordinary content.
#[derive(Debug)]
pub enum ParseError {
    InvalidMagic(u16),
    InvalidVersion(u16),
    UnknownTag(u8),
    UnexpectedTag(u8),
    UnexpectedBlockData,
    InvalidFieldType(u8),
    InvalidFieldCount(i32),
    InvalidArraySize(i32),
    InvalidBlockDataSize(i32),
    InvalidStringLength(i64),
    InvalidArrayName(String),
    HandleCollision(Handle),
    UnknownHandle(Handle),
    ReferenceTypeMismatch(&'static str),
    FlagConflict(u8),
    CannotInterpretExternalizable(String),
    UnexpectedEndOfStream,
    DecodingError(String),
    ValidationFailed(String),
    Io(io::ErrorKind),
    ExceptionRead(ContentRef),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::InvalidMagic(magic) => write!(f, "invalid stream magic: 0x{:04x}", magic),
            ParseError::InvalidVersion(version) => write!(f, "invalid stream version: 0x{:04x}", version),
            ParseError::UnknownTag(tag) => write!(f, "unknown tag: 0x{:02x}", tag),
            ParseError::UnexpectedTag(tag) => write!(f, "unexpected tag: 0x{:02x}", tag),
            ParseError::UnexpectedBlockData => write!(f, "block data is not allowed here"),
            ParseError::InvalidFieldType(byte) => write!(f, "invalid field type character: 0x{:02x}", byte),
            ParseError::InvalidFieldCount(count) => write!(f, "invalid field count: {}", count),
            ParseError::InvalidArraySize(size) => write!(f, "invalid array size: {}", size),
            ParseError::InvalidBlockDataSize(size) => write!(f, "invalid block data size: {}", size),
            ParseError::InvalidStringLength(length) => write!(f, "invalid string length: {}", length),
            ParseError::InvalidArrayName(name) => write!(f, "invalid array class name: {:?}", name),
            ParseError::HandleCollision(handle) => write!(f, "handle 0x{:x} is already bound", handle),
            ParseError::UnknownHandle(handle) => write!(f, "reference to unknown handle 0x{:x}", handle),
            ParseError::ReferenceTypeMismatch(expected) => {
                write!(f, "referenced content is not a {}", expected)
            }
            ParseError::FlagConflict(flags) => {
                write!(f, "conflicting class descriptor flags: 0x{:02x}", flags)
            }
            ParseError::CannotInterpretExternalizable(class) => {
                write!(f, "externalizable block data of {} cannot be interpreted", class)
            }
            ParseError::UnexpectedEndOfStream => write!(f, "unexpected end of stream"),
            ParseError::DecodingError(detail) => write!(f, "modified UTF-8 decoding failed: {}", detail),
            ParseError::ValidationFailed(detail) => write!(f, "content validation failed: {}", detail),
            ParseError::Io(kind) => write!(f, "i/o error: {:?}", kind),
            ParseError::ExceptionRead(_) => write!(f, "exception content read"),
        }
    }
}

impl error::Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(io_error: io::Error) -> Self {
        if io_error.kind() == io::ErrorKind::UnexpectedEof {
            ParseError::UnexpectedEndOfStream
        } else {
            ParseError::Io(io_error.kind())
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
