//! # SessVar Core
//!
//! In-process, session-scoped transactional store of named *packages*
//! holding named *variables*. A variable is either a typed scalar or a
//! keyed set of records, and is *transactional* (its mutations obey the
//! commit/rollback/savepoint semantics of the enclosing transaction) or
//! *regular* (its value lives for the session and ignores rollback).
//!
//! This crate provides:
//! - the object store (packages, variables, keyed row tables)
//! - savepoint history stacks and the per-subtransaction changes stack
//! - the release/rollback engine that folds, discards, or promotes
//!   object states across arbitrarily nested subtransactions
//! - the cursor-safety registry that keeps row scans alive across calls
//!   and terminates them on rollback or removal
//! - accounting arenas backing the package memory-footprint report
//!
//! All state is per-session and ephemeral; there is no persistence and
//! no cross-session visibility.
//!
//! ```rust
//! use sessvar_core::{Session, TypeId, Value};
//!
//! let mut session = Session::new();
//! session.set("vars", "counter", Value::Int(1), true)?;
//!
//! session.begin()?;
//! session.set("vars", "counter", Value::Int(2), true)?;
//! session.rollback()?;
//!
//! let value = session.get("vars", "counter", TypeId::Int, false)?;
//! assert_eq!(value, Some(Value::Int(1)));
//! # Ok::<(), sessvar_core::StoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod arena;
pub mod config;
pub mod error;
pub mod record;
pub mod session;
pub mod stats;
pub mod types;
pub mod value;

mod cursor;
mod package;
mod transaction;
mod variable;

pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use record::{ColumnDesc, Row, RowDescriptor};
pub use session::Session;
pub use stats::{ListedVariable, PackageStats};
pub use types::{CursorId, Name, NestLevel, VariableKind, NAME_MAX_LEN};
pub use value::{TypeId, Value};
