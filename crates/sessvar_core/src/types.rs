//! Core type definitions for SessVar.

use crate::error::{StoreError, StoreResult};
use std::fmt;

/// Maximum length of a package or variable name, in bytes.
///
/// Mirrors the identifier bound of the host the store was designed for;
/// longer names are rejected with an invalid-parameter error.
pub const NAME_MAX_LEN: usize = 63;

/// A validated package or variable name.
///
/// Names are plain UTF-8 identifiers of at most [`NAME_MAX_LEN`] bytes.
/// Uniqueness is enforced per namespace (package names in the session,
/// variable names within a package across both variable tables).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    /// Validates and creates a name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the name is empty or longer than
    /// [`NAME_MAX_LEN`] bytes.
    pub fn new(name: &str) -> StoreResult<Self> {
        if name.is_empty() {
            return Err(StoreError::invalid_parameter("name can not be empty"));
        }
        if name.len() > NAME_MAX_LEN {
            return Err(StoreError::invalid_parameter(format!(
                "name \"{name}\" is too long"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction nesting level.
///
/// Level 0 is the session steady state (no enclosing transaction
/// activity); an explicit transaction runs at level 1 and each open
/// savepoint adds one. Savepoint history states are tagged with the
/// level at which they were created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NestLevel(pub u32);

impl NestLevel {
    /// Creates a nesting level.
    #[must_use]
    pub const fn new(level: u32) -> Self {
        Self(level)
    }

    /// Returns the raw level value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the enclosing (parent) level, saturating at 0.
    #[must_use]
    pub const fn parent(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Returns the next deeper (child) level.
    #[must_use]
    pub const fn child(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for NestLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nest:{}", self.0)
    }
}

/// Handle for an open iteration scan (row scan or package-stats scan).
///
/// Cursor ids are issued by the session's cursor registry and become
/// dead once the scan is exhausted, closed, or terminated by a
/// transaction event; fetching through a dead id observes "done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorId(pub u64);

impl CursorId {
    /// Creates a cursor id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cur:{}", self.0)
    }
}

/// The two variable kinds a package can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Single typed datum.
    Scalar,
    /// Keyed set of records.
    Record,
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => f.write_str("scalar"),
            Self::Record => f.write_str("record"),
        }
    }
}
