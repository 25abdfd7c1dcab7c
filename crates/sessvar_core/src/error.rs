//! Error types for SessVar core.

use crate::types::VariableKind;
use crate::value::TypeId;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in SessVar store operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// An argument was null, overlong, or otherwise malformed.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the offending argument.
        message: String,
    },

    /// Strict lookup of a package that does not exist (or was removed
    /// in the current transaction).
    #[error("unrecognized package \"{name}\"")]
    UnknownPackage {
        /// The package name that was looked up.
        name: String,
    },

    /// Strict lookup of a variable that does not exist (or was removed
    /// in the current transaction).
    #[error("unrecognized variable \"{name}\"")]
    UnknownVariable {
        /// The variable name that was looked up.
        name: String,
    },

    /// A value type disagrees with the type recorded for the variable
    /// or for the record key.
    #[error("variable \"{name}\" requires \"{expected}\" value, not \"{actual}\"")]
    TypeMismatch {
        /// The variable whose type was violated.
        name: String,
        /// The recorded type.
        expected: TypeId,
        /// The type that was supplied.
        actual: TypeId,
    },

    /// A scalar operation was applied to a record variable or vice
    /// versa.
    #[error("variable \"{name}\" is not a {expected} variable")]
    KindMismatch {
        /// The variable whose kind was violated.
        name: String,
        /// The kind the operation requires.
        expected: VariableKind,
    },

    /// A variable already exists with the opposite transactionality.
    #[error("variable \"{name}\" already exists with a different transactionality")]
    TransactionalityConflict {
        /// The variable name.
        name: String,
        /// Whether the existing variable is transactional.
        is_transactional: bool,
    },

    /// A row with the same key already exists in the record variable.
    #[error("there is a record in the variable \"{name}\" with the same key")]
    DuplicateKey {
        /// The record variable name.
        name: String,
    },

    /// The operation is not supported in the current call context.
    #[error("feature not supported: {message}")]
    FeatureNotSupported {
        /// Description of the unsupported usage.
        message: String,
    },
}

impl StoreError {
    /// Creates an invalid-parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates an unknown-package error.
    pub fn unknown_package(name: impl Into<String>) -> Self {
        Self::UnknownPackage { name: name.into() }
    }

    /// Creates an unknown-variable error.
    pub fn unknown_variable(name: impl Into<String>) -> Self {
        Self::UnknownVariable { name: name.into() }
    }

    /// Creates a type-mismatch error.
    pub fn type_mismatch(name: impl Into<String>, expected: TypeId, actual: TypeId) -> Self {
        Self::TypeMismatch {
            name: name.into(),
            expected,
            actual,
        }
    }

    /// Creates a kind-mismatch error.
    pub fn kind_mismatch(name: impl Into<String>, expected: VariableKind) -> Self {
        Self::KindMismatch {
            name: name.into(),
            expected,
        }
    }

    /// Creates a transactionality-conflict error.
    pub fn transactionality_conflict(name: impl Into<String>, is_transactional: bool) -> Self {
        Self::TransactionalityConflict {
            name: name.into(),
            is_transactional,
        }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate_key(name: impl Into<String>) -> Self {
        Self::DuplicateKey { name: name.into() }
    }

    /// Creates a feature-not-supported error.
    pub fn feature_not_supported(message: impl Into<String>) -> Self {
        Self::FeatureNotSupported {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_object() {
        let err = StoreError::unknown_package("vars");
        assert_eq!(err.to_string(), "unrecognized package \"vars\"");

        let err = StoreError::type_mismatch("counter", TypeId::Int, TypeId::Text);
        assert_eq!(
            err.to_string(),
            "variable \"counter\" requires \"integer\" value, not \"text\""
        );

        let err = StoreError::kind_mismatch("rows", VariableKind::Record);
        assert_eq!(err.to_string(), "variable \"rows\" is not a record variable");
    }
}
