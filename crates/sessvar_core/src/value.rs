//! Scalar value and type-identifier model.
//!
//! The host's type system is out of scope; this module carries the
//! small set of value shapes the store itself needs to understand:
//! typed scalars, the "unknown" literal type that can be promoted to
//! text on record-key capture, and flat arrays used as key lists for
//! multi-key selection. Floats are intentionally not supported so that
//! a [`Value`] can serve directly as a record-table hash key.

use std::fmt;
use std::mem;

/// Identifier of a value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// UTF-8 text.
    Text,
    /// Byte string.
    Bytes,
    /// Microsecond-precision timestamp.
    Timestamp,
    /// Flat array of values.
    Array,
    /// An unresolved literal whose type was never determined.
    Unknown,
    /// A keyed row set (record variables only).
    Record,
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::Text => "text",
            Self::Bytes => "bytea",
            Self::Timestamp => "timestamp",
            Self::Array => "array",
            Self::Unknown => "unknown",
            Self::Record => "record",
        };
        f.write_str(name)
    }
}

/// A single datum.
///
/// `Null` carries no intrinsic type and passes any type check, the way
/// a null argument does in the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// Text string (UTF-8).
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Microsecond-precision timestamp.
    Timestamp(i64),
    /// Flat array of values.
    Array(Vec<Value>),
    /// An unresolved text literal of unknown type.
    Unknown(String),
}

impl Value {
    /// Returns the type identifier, or `None` for `Null`.
    #[must_use]
    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(TypeId::Bool),
            Self::Int(_) => Some(TypeId::Int),
            Self::Text(_) => Some(TypeId::Text),
            Self::Bytes(_) => Some(TypeId::Bytes),
            Self::Timestamp(_) => Some(TypeId::Timestamp),
            Self::Array(_) => Some(TypeId::Array),
            Self::Unknown(_) => Some(TypeId::Unknown),
        }
    }

    /// Whether this value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Approximate heap-inclusive size of the datum in bytes.
    ///
    /// Used for arena region accounting; the figure does not have to be
    /// exact, only monotone in the payload size.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        let base = mem::size_of::<Self>() as u64;
        match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Timestamp(_) => base,
            Self::Text(s) | Self::Unknown(s) => base + s.len() as u64,
            Self::Bytes(b) => base + b.len() as u64,
            Self::Array(items) => base + items.iter().map(Self::size_bytes).sum::<u64>(),
        }
    }

    /// Promotes an unknown literal to text; other values pass through.
    #[must_use]
    pub(crate) fn promote_unknown(self) -> Self {
        match self {
            Self::Unknown(s) => Self::Text(s),
            other => other,
        }
    }
}
