//! Busbar Variant
//!
//! Self-describing typed-value serialization used as the payload codec of the
//! busbar message bus. A *variant* pairs a signature string with a flat,
//! little-endian encoding of the values it describes:
//!
//! - basic types: `b` bool, `y` u8, `n` i16, `q` u16, `i` i32, `u` u32,
//!   `x` i64, `t` u64, `d` f64, `s` string
//! - containers: `(...)` tuple, `a<type>` array, `v` nested variant
//!
//! Values are written through [`VariantBuilder`], sealed into an immutable
//! [`Variant`], and read back through [`VariantCursor`] — a forward cursor
//! with explicit container entry/exit, mirroring how the transport consumes
//! the codec: build, seal, export segments, parse on the far side.
//!
//! The encoding is self-delimiting (strings, arrays and nested variants are
//! length- or count-prefixed), so a cursor can skip any complete type without
//! understanding it.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

use thiserror::Error;

pub mod builder;
pub mod cursor;
pub mod signature;
pub mod variant;

pub use builder::VariantBuilder;
pub use cursor::VariantCursor;
pub use variant::Variant;

/// Errors produced by signature handling, building and reading.
#[derive(Debug, Error)]
pub enum VariantError {
    /// Signature string violates the grammar
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Read or write does not match the expected type
    #[error("type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// Data ended before the signature was satisfied
    #[error("truncated variant data")]
    Truncated,

    /// Data extends past what the signature describes
    #[error("trailing bytes after variant data")]
    TrailingData,

    /// Seal or fold attempted with an open container
    #[error("container left open")]
    UnclosedContainer,

    /// Exit or end called without a matching container
    #[error("no open container")]
    NotInContainer,

    /// Array element signature differs from the first element
    #[error("array element mismatch: expected '{expected}', found '{found}'")]
    ElementMismatch { expected: String, found: String },

    /// Array closed before its element type is known
    #[error("cannot infer element type of an empty array")]
    EmptyArray,

    /// Container nesting exceeds the supported depth
    #[error("container depth limit exceeded")]
    DepthLimit,

    /// Signature exceeds the encodable length
    #[error("signature too long ({0} bytes)")]
    SignatureTooLong(usize),

    /// String payload is not valid UTF-8
    #[error("invalid UTF-8 in string value")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Result type alias for variant operations
pub type Result<T> = std::result::Result<T, VariantError>;

/// A dynamically typed basic value.
///
/// Containers are handled through the explicit builder/cursor APIs; `Value`
/// covers the basic types only, for callers that round-trip payloads without
/// static knowledge of the signature.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
}

impl Value {
    /// The signature character describing this value.
    #[must_use]
    pub const fn type_char(&self) -> char {
        match self {
            Self::Bool(_) => 'b',
            Self::U8(_) => 'y',
            Self::I16(_) => 'n',
            Self::U16(_) => 'q',
            Self::I32(_) => 'i',
            Self::U32(_) => 'u',
            Self::I64(_) => 'x',
            Self::U64(_) => 't',
            Self::F64(_) => 'd',
            Self::Str(_) => 's',
        }
    }
}
