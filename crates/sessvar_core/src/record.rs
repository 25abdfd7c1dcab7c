//! Rows, row descriptors, and the keyed row table of record variables.
//!
//! A record variable stores rows keyed by their first column value.
//! The descriptor is captured from the first inserted row and every
//! later insert or update is validated against it attribute by
//! attribute, so a cached descriptor can never go stale.

use crate::arena::{Arena, RegionId};
use crate::error::{StoreError, StoreResult};
use crate::value::{TypeId, Value};
use std::collections::HashMap;
use std::mem;

/// A single column of a row descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    /// Attribute name.
    pub name: String,
    /// Attribute type.
    pub ty: TypeId,
}

impl ColumnDesc {
    /// Creates a column descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Describes the shape of the rows held by a record variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptor {
    columns: Vec<ColumnDesc>,
}

impl RowDescriptor {
    /// Creates a descriptor from its columns.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` when the column list is empty; a row
    /// needs at least the key column.
    pub fn new(columns: Vec<ColumnDesc>) -> StoreResult<Self> {
        if columns.is_empty() {
            return Err(StoreError::invalid_parameter(
                "record must have at least one column",
            ));
        }
        Ok(Self { columns })
    }

    /// Number of columns.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// The columns in order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    /// The key column type (the first column).
    #[must_use]
    pub fn key_type(&self) -> TypeId {
        self.columns[0].ty
    }

    /// Returns a copy with an unknown-typed key column promoted to text.
    fn promoted(&self) -> Self {
        let mut columns = self.columns.clone();
        if columns[0].ty == TypeId::Unknown {
            columns[0].ty = TypeId::Text;
        }
        Self { columns }
    }
}

/// A row of values; the first value is the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from its values in column order.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// The key value (first column).
    #[must_use]
    pub fn key(&self) -> &Value {
        &self.values[0]
    }

    /// The values in column order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Approximate heap-inclusive size in bytes, for region accounting.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        mem::size_of::<Self>() as u64 + self.values.iter().map(Value::size_bytes).sum::<u64>()
    }

    /// Checks the row against a descriptor: arity and per-column types.
    fn check_shape(&self, desc: &RowDescriptor, var_name: &str) -> StoreResult<()> {
        if self.values.is_empty() {
            return Err(StoreError::invalid_parameter(
                "record must have at least one column",
            ));
        }
        if self.values.len() != desc.arity() {
            return Err(StoreError::invalid_parameter(format!(
                "record for variable \"{var_name}\" has {} columns, descriptor has {}",
                self.values.len(),
                desc.arity()
            )));
        }
        for (value, column) in self.values.iter().zip(desc.columns()) {
            if let Some(actual) = value.type_id() {
                if actual != column.ty {
                    return Err(StoreError::invalid_parameter(format!(
                        "record column \"{}\" for variable \"{var_name}\" is {actual}, expected {}",
                        column.name, column.ty
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the row with an unknown key value promoted to text.
    fn promoted(mut self) -> Self {
        let key = mem::replace(&mut self.values[0], Value::Null);
        self.values[0] = key.promote_unknown();
        self
    }
}

/// The keyed row set of a record variable.
///
/// Uninitialized until the first insert captures the descriptor and the
/// key type. Each table owns an arena region charged with its rows.
#[derive(Debug)]
pub(crate) struct RecordTable {
    desc: Option<RowDescriptor>,
    key_type: Option<TypeId>,
    rows: HashMap<Value, Row>,
    pub(crate) region: RegionId,
}

impl RecordTable {
    pub(crate) fn new(region: RegionId) -> Self {
        Self {
            desc: None,
            key_type: None,
            rows: HashMap::new(),
            region,
        }
    }

    pub(crate) fn descriptor(&self) -> Option<&RowDescriptor> {
        self.desc.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Captures the descriptor and key type from the first insert.
    ///
    /// With `convert_unknown` set, an unknown-typed key column is
    /// promoted to text before capture.
    fn init_attributes(&mut self, desc: &RowDescriptor, convert_unknown: bool) {
        let captured = if convert_unknown {
            desc.promoted()
        } else {
            desc.clone()
        };
        self.key_type = Some(captured.key_type());
        self.desc = Some(captured);
    }

    /// Validates an incoming descriptor against the captured one.
    fn check_attributes(
        &self,
        desc: &RowDescriptor,
        convert_unknown: bool,
        var_name: &str,
    ) -> StoreResult<()> {
        let Some(cached) = self.desc.as_ref() else {
            return Ok(());
        };
        let incoming = if convert_unknown {
            desc.promoted()
        } else {
            desc.clone()
        };
        if incoming != *cached {
            return Err(StoreError::invalid_parameter(format!(
                "new record structure differs from variable \"{var_name}\" structure"
            )));
        }
        Ok(())
    }

    /// Validates a key value type against the established key type.
    ///
    /// Unknown literals are accepted against a text key; they are the
    /// shape conversion promotes on capture.
    pub(crate) fn check_record_key(&self, ty: TypeId, var_name: &str) -> StoreResult<()> {
        match self.key_type {
            Some(expected)
                if expected != ty && !(expected == TypeId::Text && ty == TypeId::Unknown) =>
            {
                Err(StoreError::type_mismatch(var_name, expected, ty))
            }
            _ => Ok(()),
        }
    }

    /// Promotes an unknown key to text when the table is text-keyed.
    fn normalize_key(&self, key: Value) -> Value {
        if self.key_type == Some(TypeId::Text) {
            key.promote_unknown()
        } else {
            key
        }
    }

    /// Inserts a row, capturing the descriptor on the first call.
    pub(crate) fn insert_row(
        &mut self,
        arena: &mut Arena,
        desc: &RowDescriptor,
        row: Row,
        convert_unknown: bool,
        var_name: &str,
    ) -> StoreResult<()> {
        if self.desc.is_none() {
            row.check_shape(desc, var_name)?;
            self.init_attributes(desc, convert_unknown);
        } else {
            self.check_attributes(desc, convert_unknown, var_name)?;
            row.check_shape(desc, var_name)?;
        }
        let row = if convert_unknown { row.promoted() } else { row };
        if let Some(actual) = row.key().type_id() {
            self.check_record_key(actual, var_name)?;
        }
        let key = row.key().clone();
        if self.rows.contains_key(&key) {
            return Err(StoreError::duplicate_key(var_name));
        }
        arena.charge(self.region, row.size_bytes());
        self.rows.insert(key, row);
        Ok(())
    }

    /// Replaces the row with a matching key. Returns whether a row
    /// matched.
    pub(crate) fn update_row(
        &mut self,
        arena: &mut Arena,
        desc: &RowDescriptor,
        row: Row,
        convert_unknown: bool,
        var_name: &str,
    ) -> StoreResult<bool> {
        self.check_attributes(desc, convert_unknown, var_name)?;
        row.check_shape(desc, var_name)?;
        let row = if convert_unknown { row.promoted() } else { row };
        if let Some(actual) = row.key().type_id() {
            self.check_record_key(actual, var_name)?;
        }
        let key = row.key().clone();
        match self.rows.get_mut(&key) {
            Some(existing) => {
                arena.release(self.region, existing.size_bytes());
                arena.charge(self.region, row.size_bytes());
                *existing = row;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deletes the row with a matching key (a null key deletes the
    /// null-keyed row). Returns whether a row matched.
    pub(crate) fn delete_row(&mut self, arena: &mut Arena, key: Value) -> bool {
        let key = self.normalize_key(key);
        match self.rows.remove(&key) {
            Some(row) => {
                arena.release(self.region, row.size_bytes());
                true
            }
            None => false,
        }
    }

    /// Looks up a row by key value.
    pub(crate) fn get_row(&self, key: &Value) -> Option<&Row> {
        if self.key_type == Some(TypeId::Text) {
            if let Value::Unknown(text) = key {
                return self.rows.get(&Value::Text(text.clone()));
            }
        }
        self.rows.get(key)
    }

    /// Snapshot of the current keys, in internal (unordered) order.
    pub(crate) fn keys_snapshot(&self) -> Vec<Value> {
        self.rows.keys().cloned().collect()
    }

    /// Planner-grade row-count estimate derived from region accounting.
    ///
    /// Clamped below by the live row count; the estimator is a rough
    /// proxy and callers must treat it as replaceable.
    pub(crate) fn estimated_rows(&self, arena: &Arena) -> u64 {
        (arena.allocated(self.region) / 128).max(self.rows.len() as u64)
    }

    /// Deep copy into a fresh region under `parent`: used when a
    /// savepoint snapshots a record state.
    pub(crate) fn deep_copy(&self, arena: &mut Arena, parent: RegionId) -> Self {
        let region = arena.create_region(Some(parent));
        let mut rows = HashMap::with_capacity(self.rows.len());
        for (key, row) in &self.rows {
            arena.charge(region, row.size_bytes());
            rows.insert(key.clone(), row.clone());
        }
        Self {
            desc: self.desc.clone(),
            key_type: self.key_type,
            rows,
            region,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> RowDescriptor {
        RowDescriptor::new(vec![
            ColumnDesc::new("id", TypeId::Int),
            ColumnDesc::new("payload", TypeId::Text),
        ])
        .unwrap()
    }

    fn row(id: i64, payload: &str) -> Row {
        Row::new(vec![Value::Int(id), Value::Text(payload.into())])
    }

    fn table(arena: &mut Arena) -> RecordTable {
        let region = arena.create_region(None);
        RecordTable::new(region)
    }

    #[test]
    fn first_insert_establishes_descriptor() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        assert!(t.descriptor().is_none());

        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();
        assert_eq!(t.descriptor().unwrap().arity(), 2);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn insert_rejects_duplicate_key() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();
        let err = t
            .insert_row(&mut arena, &desc(), row(1, "b"), true, "v")
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[test]
    fn insert_rejects_descriptor_drift() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();

        let other = RowDescriptor::new(vec![
            ColumnDesc::new("id", TypeId::Int),
            ColumnDesc::new("amount", TypeId::Int),
        ])
        .unwrap();
        let bad = Row::new(vec![Value::Int(2), Value::Int(9)]);
        assert!(t.insert_row(&mut arena, &other, bad, true, "v").is_err());
    }

    #[test]
    fn key_type_mismatch_is_rejected() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();
        assert!(t.check_record_key(TypeId::Text, "v").is_err());
        assert!(t.check_record_key(TypeId::Int, "v").is_ok());
    }

    #[test]
    fn unknown_key_promotes_to_text_on_capture() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        let d = RowDescriptor::new(vec![ColumnDesc::new("k", TypeId::Unknown)]).unwrap();
        let r = Row::new(vec![Value::Unknown("alpha".into())]);
        t.insert_row(&mut arena, &d, r, true, "v").unwrap();

        assert_eq!(t.descriptor().unwrap().key_type(), TypeId::Text);
        assert!(t.get_row(&Value::Text("alpha".into())).is_some());
    }

    #[test]
    fn unknown_key_stays_unknown_when_conversion_disabled() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        let d = RowDescriptor::new(vec![ColumnDesc::new("k", TypeId::Unknown)]).unwrap();
        let r = Row::new(vec![Value::Unknown("alpha".into())]);
        t.insert_row(&mut arena, &d, r, false, "v").unwrap();
        assert_eq!(t.descriptor().unwrap().key_type(), TypeId::Unknown);
    }

    #[test]
    fn update_replaces_matching_row_only() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();

        let updated = t
            .update_row(&mut arena, &desc(), row(1, "b"), true, "v")
            .unwrap();
        assert!(updated);
        assert_eq!(t.get_row(&Value::Int(1)), Some(&row(1, "b")));

        let missed = t
            .update_row(&mut arena, &desc(), row(2, "c"), true, "v")
            .unwrap();
        assert!(!missed);
    }

    #[test]
    fn null_key_round_trip() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        let r = Row::new(vec![Value::Null, Value::Text("no key".into())]);
        t.insert_row(&mut arena, &desc(), r.clone(), true, "v")
            .unwrap();
        assert_eq!(t.get_row(&Value::Null), Some(&r));
        assert!(t.delete_row(&mut arena, Value::Null));
        assert!(t.get_row(&Value::Null).is_none());
    }

    #[test]
    fn delete_releases_accounting() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();
        assert!(arena.allocated(t.region) > 0);
        assert!(t.delete_row(&mut arena, Value::Int(1)));
        assert_eq!(arena.allocated(t.region), 0);
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut arena = Arena::new();
        let parent = arena.create_region(None);
        let mut t = table(&mut arena);
        t.insert_row(&mut arena, &desc(), row(1, "a"), true, "v")
            .unwrap();

        let mut copy = t.deep_copy(&mut arena, parent);
        assert!(copy.delete_row(&mut arena, Value::Int(1)));
        assert_eq!(copy.len(), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn estimate_tracks_row_count() {
        let mut arena = Arena::new();
        let mut t = table(&mut arena);
        assert_eq!(t.estimated_rows(&arena), 0);
        for i in 0..10 {
            t.insert_row(&mut arena, &desc(), row(i, "abc"), true, "v")
                .unwrap();
        }
        assert!(t.estimated_rows(&arena) >= 10);
    }
}
