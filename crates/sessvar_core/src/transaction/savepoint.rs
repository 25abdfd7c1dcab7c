//! Savepoint history: state snapshots and level-decision helpers.
//!
//! Every transactional object carries a stack of states; the head is
//! the actual state. A savepoint deep-copies the head so that a later
//! rollback can restore it, and the decision helpers below tell the
//! setters and the release/rollback processor whether an object was
//! already touched at the current or at the enclosing level.

use crate::arena::{Arena, RegionId};
use crate::package::{Package, PackageState};
use crate::transaction::changes::{self, ChangesStack};
use crate::types::{Name, NestLevel};
use crate::variable::{VarBody, Variable, VariableState};
use tracing::trace;

/// Shared context for savepoint creation: the pieces of the session a
/// setter has to hand over while it holds the object itself mutably.
pub(crate) struct ChangeCtx<'a> {
    pub(crate) changes: &'a mut Option<ChangesStack>,
    pub(crate) arena: &'a mut Arena,
    pub(crate) module_region: RegionId,
    pub(crate) nest: NestLevel,
}

/// Whether the variable was already touched at the current level.
///
/// Without a changes stack nothing counts as touched; the first touch
/// will build the stack.
pub(crate) fn var_changed_in_current(
    changes: &Option<ChangesStack>,
    var: &Variable,
    nest: NestLevel,
) -> bool {
    changes.is_some() && var.head().is_some_and(|h| h.level == nest)
}

/// Whether the variable was touched at the enclosing level: either the
/// state beneath the head was created there, or the head itself already
/// sits at the enclosing level.
pub(crate) fn var_changed_in_upper(var: &Variable, nest: NestLevel) -> bool {
    let n = var.states.len();
    if n >= 2 {
        var.states[n - 2].level == nest.parent()
    } else {
        var.head().is_some_and(|h| h.level == nest.parent())
    }
}

/// Whether the package was already touched at the current level.
pub(crate) fn pack_changed_in_current(
    changes: &Option<ChangesStack>,
    pkg: &Package,
    nest: NestLevel,
) -> bool {
    changes.is_some() && pkg.head().is_some_and(|h| h.level == nest)
}

/// Whether the package was touched at the enclosing level.
pub(crate) fn pack_changed_in_upper(pkg: &Package, nest: NestLevel) -> bool {
    let n = pkg.states.len();
    if n >= 2 {
        pkg.states[n - 2].level == nest.parent()
    } else {
        pkg.head().is_some_and(|h| h.level == nest.parent())
    }
}

/// Pushes a copy of the package's head state.
pub(crate) fn create_savepoint_pack(pkg: &mut Package) {
    if let Some(head) = pkg.head() {
        trace!(package = %pkg.name, level = head.level.as_u32(), "savepoint package state");
        let copy = PackageState { ..*head };
        pkg.states.push(copy);
    }
}

/// Pushes a deep copy of the variable's head state.
///
/// Scalar bodies are cloned and charged to the owning table region;
/// record bodies are rebuilt row by row into a fresh region.
pub(crate) fn create_savepoint_var(arena: &mut Arena, table_region: RegionId, var: &mut Variable) {
    let Some(head) = var.states.last() else {
        return;
    };
    trace!(variable = %var.name, level = head.level.as_u32(), "savepoint variable state");
    let body = match &head.body {
        VarBody::Scalar(value) => {
            arena.charge(table_region, value.size_bytes());
            VarBody::Scalar(value.clone())
        }
        VarBody::Record(table) => VarBody::Record(table.deep_copy(arena, table_region)),
    };
    let state = VariableState {
        is_valid: head.is_valid,
        level: head.level,
        body,
    };
    var.states.push(state);
}

/// Savepoints the package and links it into the current frame, unless
/// it was already touched at the current level.
pub(crate) fn savepoint_pack_if_needed(ctx: &mut ChangeCtx<'_>, pkg: &mut Package) {
    if !pack_changed_in_current(ctx.changes, pkg, ctx.nest) {
        create_savepoint_pack(pkg);
        changes::add_to_changed_packs(ctx.changes, ctx.arena, ctx.module_region, pkg, ctx.nest);
    }
}

/// Savepoints a transactional variable and links it into the current
/// frame, unless it was already touched at the current level. No-op for
/// regular variables.
pub(crate) fn savepoint_var_if_needed(
    ctx: &mut ChangeCtx<'_>,
    pkg_name: &Name,
    table_region: RegionId,
    var: &mut Variable,
) {
    if !var.is_transactional {
        return;
    }
    if !var_changed_in_current(ctx.changes, var, ctx.nest) {
        create_savepoint_var(ctx.arena, table_region, var);
        changes::add_to_changed_vars(
            ctx.changes,
            ctx.arena,
            ctx.module_region,
            pkg_name,
            var,
            ctx.nest,
        );
    }
}
