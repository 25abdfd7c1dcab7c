//! Session fixtures and row helpers.
//!
//! Convenience functions for setting up test sessions and the row
//! shapes the record tests share.

use sessvar_core::{ColumnDesc, Config, Row, RowDescriptor, Session, TypeId, Value};

/// Runs a test with a fresh default-configured session.
///
/// # Example
///
/// ```rust
/// use sessvar_testkit::with_session;
/// use sessvar_core::Value;
///
/// with_session(|session| {
///     session.set("pkg", "x", Value::Int(1), true).unwrap();
/// });
/// ```
pub fn with_session<F, R>(f: F) -> R
where
    F: FnOnce(&mut Session) -> R,
{
    let mut session = Session::new();
    f(&mut session)
}

/// Runs a test with a session that keeps unknown-typed key columns
/// unconverted.
pub fn with_unconverted_session<F, R>(f: F) -> R
where
    F: FnOnce(&mut Session) -> R,
{
    let mut session = Session::with_config(Config::new().convert_unknownoid(false));
    f(&mut session)
}

/// The (id integer, payload text) descriptor most record tests use.
pub fn kv_descriptor() -> RowDescriptor {
    RowDescriptor::new(vec![
        ColumnDesc::new("id", TypeId::Int),
        ColumnDesc::new("payload", TypeId::Text),
    ])
    .expect("descriptor has columns")
}

/// A row for [`kv_descriptor`].
pub fn kv_row(id: i64, payload: &str) -> Row {
    Row::new(vec![Value::Int(id), Value::Text(payload.to_owned())])
}

/// A [`kv_descriptor`] row with a null key.
pub fn null_key_row(payload: &str) -> Row {
    Row::new(vec![Value::Null, Value::Text(payload.to_owned())])
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A session holding `row_count` rows in `data.records` plus a
    /// transactional and a regular scalar.
    pub fn populated_session(row_count: usize) -> Session {
        let mut session = Session::new();
        session
            .set("data", "trans_counter", Value::Int(0), true)
            .expect("set transactional scalar");
        session
            .set("data", "plain_counter", Value::Int(0), false)
            .expect("set regular scalar");
        for i in 0..row_count {
            session
                .insert(
                    "data",
                    "records",
                    &kv_descriptor(),
                    kv_row(i as i64, &format!("row {i}")),
                    true,
                )
                .expect("insert row");
        }
        session
    }
}
