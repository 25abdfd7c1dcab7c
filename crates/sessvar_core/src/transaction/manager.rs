//! Transaction-control surface and the release/rollback processor.
//!
//! The host's transaction callbacks map onto explicit methods here:
//! subtransaction start pushes a changes frame, subtransaction commit
//! pops it and releases every object it lists, subtransaction abort
//! pops it and rolls every object back. Top-level commit and abort do
//! the same with no parent frame left, which lets the per-object
//! procedures apply their top-level cleanup.
//!
//! Variables are processed before packages in each frame so that
//! variable finalization can still consult the owning package.

use crate::error::{StoreError, StoreResult};
use crate::package::{Package, PackageState};
use crate::session::Session;
use crate::transaction::{changes, savepoint};
use crate::types::{Name, NestLevel};
use crate::variable::free_state_body;
use tracing::debug;

/// What to do with the objects of a finished subtransaction's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// The subtransaction committed: fold histories toward the parent.
    Release,
    /// The subtransaction aborted: restore the previous states.
    Rollback,
}

impl Session {
    /// Starts an explicit transaction.
    ///
    /// # Errors
    ///
    /// `FeatureNotSupported` when a transaction is already in progress.
    pub fn begin(&mut self) -> StoreResult<()> {
        if self.in_xact {
            return Err(StoreError::feature_not_supported(
                "a transaction is already in progress",
            ));
        }
        self.in_xact = true;
        self.nest = NestLevel::new(1);
        debug!("begin transaction");
        Ok(())
    }

    /// Opens a savepoint (starts a subtransaction).
    pub fn savepoint(&mut self) -> StoreResult<()> {
        if !self.in_xact {
            return Err(StoreError::feature_not_supported(
                "savepoint requires a transaction",
            ));
        }
        self.nest = self.nest.child();
        changes::push_frame(&mut self.changes, &mut self.arena);
        debug!(level = self.nest.as_u32(), "savepoint");
        Ok(())
    }

    /// Releases the innermost savepoint (the subtransaction commits).
    pub fn release(&mut self) -> StoreResult<()> {
        if !self.in_xact || self.nest.as_u32() <= 1 {
            return Err(StoreError::feature_not_supported("no savepoint to release"));
        }
        self.subtransaction_end(Action::Release);
        Ok(())
    }

    /// Rolls back to the innermost savepoint (the subtransaction
    /// aborts). Mutations made since the savepoint become undetectable.
    pub fn rollback_to(&mut self) -> StoreResult<()> {
        if !self.in_xact || self.nest.as_u32() <= 1 {
            return Err(StoreError::feature_not_supported(
                "no savepoint to roll back to",
            ));
        }
        self.subtransaction_end(Action::Rollback);
        Ok(())
    }

    /// Commits the transaction, releasing any still-open savepoints
    /// first. Every transactional object folds to a single level-0
    /// state and every live scan is terminated.
    pub fn commit(&mut self) -> StoreResult<()> {
        if !self.in_xact {
            return Err(StoreError::feature_not_supported(
                "no transaction in progress",
            ));
        }
        while self.nest.as_u32() > 1 {
            self.subtransaction_end(Action::Release);
        }
        self.process_changes(Action::Release);
        self.cursors.drop_all();
        self.nest = NestLevel::new(0);
        self.in_xact = false;
        debug!("commit transaction");
        Ok(())
    }

    /// Aborts the transaction, rolling back any still-open savepoints
    /// first.
    pub fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_xact {
            return Err(StoreError::feature_not_supported(
                "no transaction in progress",
            ));
        }
        while self.nest.as_u32() > 1 {
            self.subtransaction_end(Action::Rollback);
        }
        self.process_changes(Action::Rollback);
        self.cursors.drop_all();
        self.nest = NestLevel::new(0);
        self.in_xact = false;
        debug!("rollback transaction");
        Ok(())
    }

    /// Host executor-end hook: terminates every live scan.
    pub fn executor_finish(&mut self) {
        self.cursors.drop_all();
    }

    /// Starts an implicit single-statement transaction when no explicit
    /// one is open. Returns whether the wrapper is active.
    pub(crate) fn statement_begin(&mut self) -> bool {
        if self.in_xact {
            false
        } else {
            self.nest = NestLevel::new(1);
            true
        }
    }

    /// Finishes an implicit statement: release on success, rollback on
    /// failure, then return to the idle level.
    pub(crate) fn statement_end(&mut self, implicit: bool, ok: bool) {
        if !implicit {
            return;
        }
        if self.changes.is_some() {
            self.process_changes(if ok { Action::Release } else { Action::Rollback });
        }
        self.nest = NestLevel::new(0);
    }

    fn subtransaction_end(&mut self, action: Action) {
        let finished = self.nest;
        self.process_changes(action);
        self.cursors.drop_level(finished);
        self.nest = finished.parent();
    }

    /// Pops the current changes frame and applies `action` to every
    /// object it lists, then tears down the stack and the store's root
    /// region when they become empty.
    fn process_changes(&mut self, action: Action) {
        let Some(frame) = self.changes.as_mut().and_then(|s| s.frames.pop()) else {
            return;
        };
        debug!(
            ?action,
            level = self.nest.as_u32(),
            vars = frame.vars.len(),
            packs = frame.packs.len(),
            "process changes"
        );

        for (pkg_name, var_name) in frame.vars.iter().rev() {
            self.apply_var_change(action, pkg_name, var_name);
        }
        for pkg_name in frame.packs.iter().rev() {
            self.apply_pack_change(action, pkg_name);
        }
        self.arena.destroy_region(frame.region);

        if self.changes.as_ref().is_some_and(|s| s.frames.is_empty()) {
            if let Some(stack) = self.changes.take() {
                self.arena.destroy_region(stack.region);
            }
        }
        if self.packages.is_empty() {
            if let Some(stack) = self.changes.take() {
                self.arena.destroy_region(stack.region);
            }
            if let Some(region) = self.module_region.take() {
                self.arena.destroy_region(region);
            }
            self.cursors.drop_all();
        }
    }

    fn apply_var_change(&mut self, action: Action, pkg_name: &Name, var_name: &Name) {
        let nest = self.nest;
        let frames_remain = self.changes.as_ref().is_some_and(|s| !s.frames.is_empty());
        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return;
        };
        let pkg_valid = pkg.head().is_some_and(|h| h.is_valid);
        let Package {
            states, transact, ..
        } = pkg;
        let table_region = transact.region;

        match action {
            Action::Rollback => {
                let Some((popped_valid, destroyed, now_valid)) = ({
                    transact.vars.get_mut(var_name).and_then(|var| {
                        let popped = var.states.pop()?;
                        free_state_body(&mut self.arena, table_region, &popped.body);
                        let destroyed = var.states.is_empty();
                        let now_valid = var.states.last().is_some_and(|s| s.is_valid);
                        if !destroyed && now_valid {
                            // Restored by the rollback.
                            var.is_deleted = false;
                        }
                        Some((popped.is_valid, destroyed, now_valid))
                    })
                }) else {
                    return;
                };
                if destroyed {
                    transact.vars.remove(var_name);
                }
                if let Some(head) = states.last_mut() {
                    let counted_now = !destroyed && now_valid;
                    if popped_valid && !counted_now {
                        head.trans_var_num = head.trans_var_num.saturating_sub(1);
                    } else if !popped_valid && counted_now {
                        head.trans_var_num += 1;
                    }
                }
            }
            Action::Release => {
                // A package removed at this level takes its variables
                // with it.
                if !pkg_valid {
                    let mut decrement = false;
                    if let Some(var) = transact.vars.get_mut(var_name) {
                        if let Some(head) = var.head_mut() {
                            if head.is_valid {
                                head.is_valid = false;
                                decrement = true;
                            }
                        }
                    }
                    if decrement {
                        if let Some(head) = states.last_mut() {
                            head.trans_var_num = head.trans_var_num.saturating_sub(1);
                        }
                    }
                }

                let fold = match transact.vars.get(var_name) {
                    Some(var) => !frames_remain || savepoint::var_changed_in_upper(var, nest),
                    None => return,
                };
                if fold {
                    let destroy = match transact.vars.get_mut(var_name) {
                        Some(var) => {
                            if var.states.len() >= 2 {
                                let index = var.states.len() - 2;
                                let second = var.states.remove(index);
                                free_state_body(&mut self.arena, table_region, &second.body);
                            }
                            if let Some(head) = var.states.last_mut() {
                                head.level = head.level.parent();
                            }
                            var.states.len() == 1 && !var.states[0].is_valid
                        }
                        None => return,
                    };
                    if destroy {
                        if let Some(var) = transact.vars.remove(var_name) {
                            for state in &var.states {
                                free_state_body(&mut self.arena, table_region, &state.body);
                            }
                        }
                        self.cursors.drop_variable(pkg_name, var_name);
                    }
                } else {
                    // Not touched at the parent level: promote the head
                    // there and hand the variable to the parent frame.
                    if let Some(var) = transact.vars.get_mut(var_name) {
                        if let Some(head) = var.head_mut() {
                            head.level = head.level.parent();
                        }
                    }
                    if let Some(parent) = self.changes.as_mut().and_then(|s| s.frames.last_mut()) {
                        changes::push_var_entry(parent, &mut self.arena, pkg_name, var_name);
                    }
                }
            }
        }
    }

    fn apply_pack_change(&mut self, action: Action, pkg_name: &Name) {
        let nest = self.nest;
        let frames_remain = self.changes.as_ref().is_some_and(|s| !s.frames.is_empty());
        let Some(module_region) = self.module_region else {
            return;
        };

        match action {
            Action::Rollback => {
                enum After {
                    Keep,
                    SynthValid,
                    SynthInvalid,
                    Destroy,
                }
                let after = {
                    let Some(pkg) = self.packages.get_mut(pkg_name) else {
                        return;
                    };
                    if pkg.states.pop().is_none() {
                        return;
                    }
                    if pkg.states.is_empty() {
                        let has_regular = pkg.regular.as_ref().is_some_and(|t| !t.vars.is_empty());
                        if has_regular {
                            After::SynthValid
                        } else if frames_remain {
                            After::SynthInvalid
                        } else {
                            After::Destroy
                        }
                    } else {
                        // The previous state is the actual one again;
                        // resync the regular table with its validity.
                        if pkg.is_valid() && pkg.regular.is_none() {
                            let region = self.arena.create_region(Some(module_region));
                            pkg.regular = Some(crate::package::VarTable::new(region));
                        } else if !pkg.is_valid() {
                            if let Some(table) = pkg.regular.take() {
                                self.arena.destroy_region(table.region);
                            }
                        }
                        After::Keep
                    }
                };
                match after {
                    After::Keep => {}
                    After::SynthValid => {
                        if let Some(pkg) = self.packages.get_mut(pkg_name) {
                            let count = pkg.valid_trans_count();
                            pkg.states.push(PackageState {
                                is_valid: true,
                                level: nest.parent(),
                                trans_var_num: count,
                            });
                        }
                        if let Some(parent) =
                            self.changes.as_mut().and_then(|s| s.frames.last_mut())
                        {
                            changes::push_pack_entry(parent, &mut self.arena, pkg_name);
                        }
                    }
                    After::SynthInvalid => {
                        if let Some(pkg) = self.packages.get_mut(pkg_name) {
                            pkg.states.push(PackageState {
                                is_valid: false,
                                level: nest.parent(),
                                trans_var_num: 0,
                            });
                            if let Some(table) = pkg.regular.take() {
                                self.arena.destroy_region(table.region);
                            }
                        }
                        if let Some(parent) =
                            self.changes.as_mut().and_then(|s| s.frames.last_mut())
                        {
                            changes::push_pack_entry(parent, &mut self.arena, pkg_name);
                        }
                    }
                    After::Destroy => self.destroy_package(pkg_name),
                }
            }
            Action::Release => {
                let fold = match self.packages.get(pkg_name) {
                    Some(pkg) => !frames_remain || savepoint::pack_changed_in_upper(pkg, nest),
                    None => return,
                };
                if fold {
                    let destroy = match self.packages.get_mut(pkg_name) {
                        Some(pkg) => {
                            if pkg.states.len() >= 2 {
                                let index = pkg.states.len() - 2;
                                pkg.states.remove(index);
                            }
                            if pkg.states.len() == 1 && !pkg.states[0].is_valid {
                                true
                            } else {
                                if let Some(head) = pkg.head_mut() {
                                    head.level = head.level.parent();
                                }
                                false
                            }
                        }
                        None => return,
                    };
                    if destroy {
                        self.destroy_package(pkg_name);
                    }
                } else {
                    if let Some(pkg) = self.packages.get_mut(pkg_name) {
                        if let Some(head) = pkg.head_mut() {
                            head.level = head.level.parent();
                        }
                    }
                    if let Some(parent) = self.changes.as_mut().and_then(|s| s.frames.last_mut()) {
                        changes::push_pack_entry(parent, &mut self.arena, pkg_name);
                    }
                }
            }
        }
    }

    /// Physically removes a package: terminates its scans, destroys its
    /// regions, and purges its entries from the parent frame.
    fn destroy_package(&mut self, pkg_name: &Name) {
        debug!(package = %pkg_name, "destroy package");
        self.cursors.drop_package(pkg_name);
        if let Some(pkg) = self.packages.remove(pkg_name) {
            if let Some(table) = pkg.regular {
                self.arena.destroy_region(table.region);
            }
            self.arena.destroy_region(pkg.transact.region);
        }
        if let Some(parent) = self.changes.as_mut().and_then(|s| s.frames.last_mut()) {
            changes::purge_package(parent, pkg_name);
        }
    }
}
