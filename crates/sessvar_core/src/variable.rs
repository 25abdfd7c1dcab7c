//! Variables and their savepoint history states.

use crate::arena::{Arena, RegionId};
use crate::record::RecordTable;
use crate::types::{Name, NestLevel, VariableKind};
use crate::value::{TypeId, Value};

/// The value body of one variable state.
#[derive(Debug)]
pub(crate) enum VarBody {
    /// A single datum (possibly null).
    Scalar(Value),
    /// A keyed row set.
    Record(RecordTable),
}

/// One entry in a variable's savepoint history.
///
/// The last element of the stack is the "actual" state visible to
/// readers; deeper entries belong to enclosing subtransactions.
#[derive(Debug)]
pub(crate) struct VariableState {
    /// Whether the variable is visible at this state.
    pub(crate) is_valid: bool,
    /// Nesting level at which this state was created.
    pub(crate) level: NestLevel,
    /// The value snapshot.
    pub(crate) body: VarBody,
}

/// A named entry inside a package.
///
/// Regular variables hold exactly one state for their whole life;
/// transactional variables hold one state per savepoint level at which
/// they were touched.
#[derive(Debug)]
pub(crate) struct Variable {
    pub(crate) name: Name,
    pub(crate) ty: TypeId,
    pub(crate) is_record: bool,
    pub(crate) is_transactional: bool,
    /// Tombstone set when the owning package is removed; cleared if a
    /// rollback restores the variable.
    pub(crate) is_deleted: bool,
    pub(crate) states: Vec<VariableState>,
}

impl Variable {
    /// Creates a scalar variable with an initial null state.
    pub(crate) fn new_scalar(
        name: Name,
        ty: TypeId,
        is_transactional: bool,
        level: NestLevel,
    ) -> Self {
        Self {
            name,
            ty,
            is_record: false,
            is_transactional,
            is_deleted: false,
            states: vec![VariableState {
                is_valid: true,
                level,
                body: VarBody::Scalar(Value::Null),
            }],
        }
    }

    /// Creates a record variable around a prepared row table.
    pub(crate) fn new_record(
        name: Name,
        is_transactional: bool,
        level: NestLevel,
        table: RecordTable,
    ) -> Self {
        Self {
            name,
            ty: TypeId::Record,
            is_record: true,
            is_transactional,
            is_deleted: false,
            states: vec![VariableState {
                is_valid: true,
                level,
                body: VarBody::Record(table),
            }],
        }
    }

    pub(crate) fn kind(&self) -> VariableKind {
        if self.is_record {
            VariableKind::Record
        } else {
            VariableKind::Scalar
        }
    }

    pub(crate) fn head(&self) -> Option<&VariableState> {
        self.states.last()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut VariableState> {
        self.states.last_mut()
    }

    /// Whether the variable is visible to readers.
    pub(crate) fn is_valid(&self) -> bool {
        !self.is_deleted && self.head().is_some_and(|s| s.is_valid)
    }

    /// The actual scalar value, if this is a scalar variable.
    pub(crate) fn scalar(&self) -> Option<&Value> {
        match self.head() {
            Some(VariableState {
                body: VarBody::Scalar(value),
                ..
            }) => Some(value),
            _ => None,
        }
    }

    /// The actual row table, if this is a record variable.
    pub(crate) fn record(&self) -> Option<&RecordTable> {
        match self.head() {
            Some(VariableState {
                body: VarBody::Record(table),
                ..
            }) => Some(table),
            _ => None,
        }
    }

    /// Mutable access to the actual row table.
    pub(crate) fn record_mut(&mut self) -> Option<&mut RecordTable> {
        match self.head_mut() {
            Some(VariableState {
                body: VarBody::Record(table),
                ..
            }) => Some(table),
            _ => None,
        }
    }
}

/// Releases the storage accounting of a state body.
///
/// `region` is the variable-table region the body's scalar bytes were
/// charged to; record bodies own a region of their own, which is
/// destroyed outright.
pub(crate) fn free_state_body(arena: &mut Arena, region: RegionId, body: &VarBody) {
    match body {
        VarBody::Scalar(value) => arena.release(region, value.size_bytes()),
        VarBody::Record(table) => arena.destroy_region(table.region),
    }
}
