use thiserror::Error;

use crate::types::EntityId;

/// Coarse classification of an [`ErrorKind`], which decides whether decoding can
/// continue past the packet that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Container is damaged. Always fatal.
    Format,
    /// Definitions don't match the stream (wrong or unsupported game version). Always fatal.
    Schema,
    /// A single packet could not be decoded. Fatal only in strict mode.
    Decode,
    /// A handler referenced state we don't track. Never fatal.
    Semantic,
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("Nom error ({kind:?}) with {remaining} bytes left")]
    Nom {
        kind: nom::error::ErrorKind,
        remaining: usize,
    },
    #[error("Invalid replay signature {found:02x?}")]
    InvalidSignature { found: Vec<u8> },
    #[error("Replay container is truncated while reading {0}")]
    TruncatedContainer(&'static str),
    #[error("Packet frame at offset {offset} runs past the end of the stream")]
    TruncatedFrame { offset: usize },
    #[error("Failed to inflate packet stream")]
    Inflate(#[source] std::io::Error),
    #[error("Replay header is not valid JSON")]
    HeaderJson(#[from] serde_json::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("Invalid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Unknown type alias `{0}`")]
    UnknownAlias(String),
    #[error("Type alias `{0}` refers to itself")]
    RecursiveAlias(String),
    #[error("Unknown entity type `{0}`")]
    UnknownEntityType(String),
    #[error("Entity type index {index} is out of range ({count} types known)")]
    EntityTypeIndex { index: u32, count: usize },
    #[error("{entity}: {scope} property index {index} is out of range")]
    PropertyIndex {
        entity: String,
        scope: &'static str,
        index: usize,
    },
    #[error("{entity}: client method index {index} is out of range")]
    MethodIndex { entity: String, index: usize },
    #[error("Game version {0} is not supported")]
    UnsupportedVersion(String),
    #[error("Malformed definition {path}: {reason}")]
    MalformedDefinition { path: String, reason: String },
    #[error("Definition file {0} does not exist")]
    MissingDefinitionFile(String),
    #[error("XML error in {path}")]
    Xml {
        path: String,
        #[source]
        err: roxmltree::Error,
    },

    #[error("Packet payload has {0} unconsumed bytes")]
    TrailingBytes(usize),
    #[error("Bit reader ran out of data after {bits_read} bits")]
    BitReaderExhausted { bits_read: u64 },
    #[error("Handler for {handler} expects {expected} arguments, got {got}")]
    HandlerArity {
        handler: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Unexpected value for {0}")]
    UnexpectedValue(String),
    #[error("Failed to unpickle {what}: {reason}")]
    Pickle { what: &'static str, reason: String },
    #[error("Invalid nested property update: {0}")]
    NestedProperty(String),

    #[error("Entity {0} is not known")]
    UnknownEntity(EntityId),
    #[error("No {table} record for id {id}")]
    MissingRecord { table: &'static str, id: i64 },
    #[error("Owner player is not known yet")]
    OwnerUnknown,

    #[error("Packet type {packet_type:#x} at {clock:.3}s failed")]
    Packet {
        clock: f32,
        packet_type: u32,
        #[source]
        source: Box<ErrorKind>,
    },
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidSignature { .. }
            | ErrorKind::TruncatedContainer(_)
            | ErrorKind::TruncatedFrame { .. }
            | ErrorKind::Inflate(_)
            | ErrorKind::HeaderJson(_)
            | ErrorKind::Io(_) => ErrorCategory::Format,

            ErrorKind::UnknownAlias(_)
            | ErrorKind::RecursiveAlias(_)
            | ErrorKind::UnknownEntityType(_)
            | ErrorKind::EntityTypeIndex { .. }
            | ErrorKind::PropertyIndex { .. }
            | ErrorKind::MethodIndex { .. }
            | ErrorKind::UnsupportedVersion(_)
            | ErrorKind::MalformedDefinition { .. }
            | ErrorKind::MissingDefinitionFile(_)
            | ErrorKind::Xml { .. } => ErrorCategory::Schema,

            ErrorKind::Nom { .. }
            | ErrorKind::Utf8(_)
            | ErrorKind::TrailingBytes(_)
            | ErrorKind::BitReaderExhausted { .. }
            | ErrorKind::HandlerArity { .. }
            | ErrorKind::UnexpectedValue(_)
            | ErrorKind::Pickle { .. }
            | ErrorKind::NestedProperty(_) => ErrorCategory::Decode,

            ErrorKind::UnknownEntity(_)
            | ErrorKind::MissingRecord { .. }
            | ErrorKind::OwnerUnknown => ErrorCategory::Semantic,

            ErrorKind::Packet { source, .. } => source.category(),
        }
    }

    /// Whether this error stops decoding given the current strictness.
    pub fn is_fatal(&self, strict: bool) -> bool {
        match self.category() {
            ErrorCategory::Format | ErrorCategory::Schema => true,
            ErrorCategory::Decode => strict,
            ErrorCategory::Semantic => false,
        }
    }

    pub(crate) fn unexpected(what: impl Into<String>) -> Self {
        ErrorKind::UnexpectedValue(what.into())
    }
}

/// Error type threaded through the nom parsers.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind }
    }
}

impl<'a> nom::error::ParseError<&'a [u8]> for Error {
    fn from_error_kind(input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        Error {
            kind: ErrorKind::Nom {
                kind,
                remaining: input.len(),
            },
        }
    }

    fn append(_input: &'a [u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<nom::Err<Error>> for ErrorKind {
    fn from(err: nom::Err<Error>) -> Self {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e.kind,
            nom::Err::Incomplete(_) => ErrorKind::Nom {
                kind: nom::error::ErrorKind::Eof,
                remaining: 0,
            },
        }
    }
}

impl From<bitreader::BitReaderError> for ErrorKind {
    fn from(err: bitreader::BitReaderError) -> Self {
        match err {
            bitreader::BitReaderError::NotEnoughData { position, .. } => {
                ErrorKind::BitReaderExhausted {
                    bits_read: position,
                }
            }
            other => ErrorKind::NestedProperty(other.to_string()),
        }
    }
}

/// Lifts a library error into a nom failure so it can be returned from a parser.
pub(crate) fn failure<I, T>(kind: ErrorKind) -> IResult<I, T> {
    Err(nom::Err::Failure(Error { kind }))
}

pub type IResult<I, O> = nom::IResult<I, O, Error>;
