//! The session store facade.
//!
//! [`Session`] is the per-session singleton: the package table, the
//! changes stack, the cursor registry and the arena all hang off it.
//! Its methods form the callable surface (setters, getters, record
//! operations, removal, listing) plus the transaction-control seam that
//! replaces the host's transaction callbacks (see
//! `transaction::manager`).
//!
//! Operations invoked outside an explicit transaction run as an
//! implicit single-statement transaction: they mutate at level 1 and
//! release to level 0 before returning, so the steady state after any
//! standalone call is a single level-0 state per object.

use crate::arena::{Arena, RegionId};
use crate::config::Config;
use crate::cursor::CursorRegistry;
use crate::error::{StoreError, StoreResult};
use crate::package::{Package, VarTable};
use crate::record::{RecordTable, Row, RowDescriptor};
use crate::stats::{ListedVariable, PackageStats};
use crate::transaction::changes::{self, ChangesStack};
use crate::transaction::savepoint::{self, ChangeCtx};
use crate::types::{CursorId, Name, NestLevel, VariableKind};
use crate::value::{TypeId, Value};
use crate::variable::{free_state_body, VarBody, Variable};
use std::collections::HashMap;
use tracing::debug;

/// The session-scoped store of packages and variables.
pub struct Session {
    pub(crate) config: Config,
    pub(crate) arena: Arena,
    /// Root region; absent while the store is empty.
    pub(crate) module_region: Option<RegionId>,
    pub(crate) packages: HashMap<Name, Package>,
    pub(crate) changes: Option<ChangesStack>,
    pub(crate) cursors: CursorRegistry,
    /// Current transaction nesting level; 0 when idle.
    pub(crate) nest: NestLevel,
    /// Whether an explicit transaction is open.
    pub(crate) in_xact: bool,
}

impl Session {
    /// Creates a session store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a session store with the given configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            arena: Arena::new(),
            module_region: None,
            packages: HashMap::new(),
            changes: None,
            cursors: CursorRegistry::new(),
            nest: NestLevel::new(0),
            in_xact: false,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of visible (valid) packages.
    #[must_use]
    pub fn package_count(&self) -> usize {
        self.packages.values().filter(|p| p.is_valid()).count()
    }

    /// Number of live cursors in the registry.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.cursors.live_scans()
    }

    /// Whether an explicit transaction is in progress.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_xact
    }

    fn module_region_ensure(&mut self) -> RegionId {
        match self.module_region {
            Some(region) => region,
            None => {
                let region = self.arena.create_region(None);
                self.module_region = Some(region);
                region
            }
        }
    }

    fn find_package(&self, name: &Name) -> Option<&Package> {
        self.packages.get(name).filter(|p| p.is_valid())
    }

    fn expect_package(&self, name: &Name) -> StoreResult<&Package> {
        self.find_package(name)
            .ok_or_else(|| StoreError::unknown_package(name.as_str()))
    }

    /// Type, kind, and validity checks shared by the read paths.
    ///
    /// Returns `Ok(false)` when the variable should be treated as
    /// absent (invalid, non-strict lookup).
    fn check_variable(
        var: &Variable,
        kind: VariableKind,
        type_hint: Option<TypeId>,
        strict: bool,
    ) -> StoreResult<bool> {
        if var.kind() != kind {
            return Err(StoreError::kind_mismatch(var.name.as_str(), kind));
        }
        if let Some(hint) = type_hint {
            if var.ty != hint && var.ty != TypeId::Unknown {
                return Err(StoreError::type_mismatch(var.name.as_str(), var.ty, hint));
            }
        }
        if !var.is_valid() {
            if strict {
                return Err(StoreError::unknown_variable(var.name.as_str()));
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Finds a valid record variable for a read, strictly.
    fn read_record_variable(&self, pkg_name: &Name, var_name: &Name) -> StoreResult<&Variable> {
        let pkg = self.expect_package(pkg_name)?;
        let Some(var) = pkg.find_variable(var_name) else {
            return Err(StoreError::unknown_variable(var_name.as_str()));
        };
        Self::check_variable(var, VariableKind::Record, None, true)?;
        Ok(var)
    }

    /// Creates the package if missing, or re-validates it when it was
    /// logically removed during this transaction. Resurrection does not
    /// resurrect the package's contents: the regular table comes back
    /// empty and every pre-existing transactional variable is
    /// savepoint-ed and marked invalid.
    fn create_package(&mut self, name: &Name) {
        let module_region = self.module_region_ensure();
        let nest = self.nest;

        if let Some(pkg) = self.packages.get_mut(name) {
            if pkg.is_valid() {
                return;
            }
            let mut ctx = ChangeCtx {
                changes: &mut self.changes,
                arena: &mut self.arena,
                module_region,
                nest,
            };
            savepoint::savepoint_pack_if_needed(&mut ctx, pkg);
            if let Some(head) = pkg.head_mut() {
                head.is_valid = true;
                head.trans_var_num = 0;
            }
            let region = ctx.arena.create_region(Some(module_region));
            pkg.regular = Some(VarTable::new(region));

            let table_region = pkg.transact.region;
            let pkg_name = pkg.name.clone();
            for var in pkg.transact.vars.values_mut() {
                savepoint::savepoint_var_if_needed(&mut ctx, &pkg_name, table_region, var);
                if let Some(head) = var.head_mut() {
                    head.is_valid = false;
                }
            }
            return;
        }

        let mut pkg = Package::new(name.clone(), &mut self.arena, module_region);
        changes::add_to_changed_packs(
            &mut self.changes,
            &mut self.arena,
            module_region,
            &mut pkg,
            nest,
        );
        self.packages.insert(name.clone(), pkg);
    }

    // === Scalar surface ===

    /// Sets a scalar variable, creating the package and the variable on
    /// first reference.
    ///
    /// # Errors
    ///
    /// `TransactionalityConflict` when the name exists with the other
    /// transactionality, `KindMismatch` when it names a record
    /// variable, `TypeMismatch` when the stored type disagrees with the
    /// value.
    pub fn set(
        &mut self,
        package: &str,
        name: &str,
        value: Value,
        is_transactional: bool,
    ) -> StoreResult<()> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let implicit = self.statement_begin();
        let result = self.set_inner(&pkg_name, &var_name, value, is_transactional);
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn set_inner(
        &mut self,
        pkg_name: &Name,
        var_name: &Name,
        value: Value,
        is_transactional: bool,
    ) -> StoreResult<()> {
        self.create_package(pkg_name);
        let module_region = self.module_region_ensure();
        let nest = self.nest;
        let value_ty = value.type_id();

        // Inspect before mutating anything.
        let (exists, will_revalidate) = {
            let Some(pkg) = self.packages.get(pkg_name) else {
                return Err(StoreError::unknown_package(pkg_name.as_str()));
            };
            let conflict = if is_transactional {
                pkg.regular
                    .as_ref()
                    .is_some_and(|t| t.vars.contains_key(var_name))
            } else {
                pkg.transact.vars.contains_key(var_name)
            };
            if conflict {
                return Err(StoreError::transactionality_conflict(
                    var_name.as_str(),
                    !is_transactional,
                ));
            }
            let existing = if is_transactional {
                pkg.transact.vars.get(var_name)
            } else {
                pkg.regular.as_ref().and_then(|t| t.vars.get(var_name))
            };
            match existing {
                Some(var) => {
                    if var.is_record {
                        return Err(StoreError::kind_mismatch(
                            var_name.as_str(),
                            VariableKind::Scalar,
                        ));
                    }
                    if let Some(ty) = value_ty {
                        if var.ty != ty && var.ty != TypeId::Unknown {
                            return Err(StoreError::type_mismatch(var_name.as_str(), var.ty, ty));
                        }
                    }
                    let valid = var.head().is_some_and(|h| h.is_valid);
                    (true, !valid)
                }
                None => (false, false),
            }
        };

        // The package counter changes when a transactional variable is
        // born or comes back; the package must be savepoint-ed first.
        let counter_bump = is_transactional && (!exists || will_revalidate);
        if counter_bump {
            if let Some(pkg) = self.packages.get_mut(pkg_name) {
                let mut ctx = ChangeCtx {
                    changes: &mut self.changes,
                    arena: &mut self.arena,
                    module_region,
                    nest,
                };
                savepoint::savepoint_pack_if_needed(&mut ctx, pkg);
            }
        }

        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        };
        let Package {
            states,
            regular,
            transact,
            ..
        } = pkg;
        let table = if is_transactional {
            &mut *transact
        } else {
            match regular.as_mut() {
                Some(table) => table,
                None => return Err(StoreError::unknown_package(pkg_name.as_str())),
            }
        };
        let table_region = table.region;

        if exists {
            if let Some(var) = table.vars.get_mut(var_name) {
                {
                    let mut ctx = ChangeCtx {
                        changes: &mut self.changes,
                        arena: &mut self.arena,
                        module_region,
                        nest,
                    };
                    savepoint::savepoint_var_if_needed(&mut ctx, pkg_name, table_region, var);
                }
                write_scalar(&mut self.arena, table_region, var, value);
                if let Some(ty) = value_ty {
                    if var.ty == TypeId::Unknown {
                        var.ty = ty;
                    }
                }
            }
        } else {
            let ty = value_ty.unwrap_or(TypeId::Unknown);
            let mut var = Variable::new_scalar(var_name.clone(), ty, is_transactional, nest);
            self.arena.charge(table_region, Value::Null.size_bytes());
            write_scalar(&mut self.arena, table_region, &mut var, value);
            if is_transactional {
                changes::add_to_changed_vars(
                    &mut self.changes,
                    &mut self.arena,
                    module_region,
                    pkg_name,
                    &mut var,
                    nest,
                );
            }
            table.vars.insert(var_name.clone(), var);
        }

        if counter_bump {
            if let Some(head) = states.last_mut() {
                head.trans_var_num += 1;
            }
        }
        Ok(())
    }

    /// Reads a scalar variable.
    ///
    /// Returns `None` when the package or variable is absent and
    /// `strict` is off; a stored null comes back as `Some(Value::Null)`.
    pub fn get(
        &self,
        package: &str,
        name: &str,
        type_hint: TypeId,
        strict: bool,
    ) -> StoreResult<Option<Value>> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;

        let pkg = if strict {
            Some(self.expect_package(&pkg_name)?)
        } else {
            self.find_package(&pkg_name)
        };
        let Some(pkg) = pkg else {
            return Ok(None);
        };
        let Some(var) = pkg.find_variable(&var_name) else {
            if strict {
                return Err(StoreError::unknown_variable(var_name.as_str()));
            }
            return Ok(None);
        };
        if !Self::check_variable(var, VariableKind::Scalar, Some(type_hint), strict)? {
            return Ok(None);
        }
        Ok(var.scalar().cloned())
    }

    // === Record surface ===

    /// Inserts a row into a record variable, creating the package and
    /// the variable on first reference. The first insert establishes
    /// the row descriptor; later inserts are validated against it.
    pub fn insert(
        &mut self,
        package: &str,
        name: &str,
        descriptor: &RowDescriptor,
        row: Row,
        is_transactional: bool,
    ) -> StoreResult<()> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let implicit = self.statement_begin();
        let result = self.insert_inner(&pkg_name, &var_name, descriptor, row, is_transactional);
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn insert_inner(
        &mut self,
        pkg_name: &Name,
        var_name: &Name,
        descriptor: &RowDescriptor,
        row: Row,
        is_transactional: bool,
    ) -> StoreResult<()> {
        self.create_package(pkg_name);
        let module_region = self.module_region_ensure();
        let nest = self.nest;
        let convert = self.config.convert_unknownoid;

        let (exists, will_revalidate) = {
            let Some(pkg) = self.packages.get(pkg_name) else {
                return Err(StoreError::unknown_package(pkg_name.as_str()));
            };
            let conflict = if is_transactional {
                pkg.regular
                    .as_ref()
                    .is_some_and(|t| t.vars.contains_key(var_name))
            } else {
                pkg.transact.vars.contains_key(var_name)
            };
            if conflict {
                return Err(StoreError::transactionality_conflict(
                    var_name.as_str(),
                    !is_transactional,
                ));
            }
            let existing = if is_transactional {
                pkg.transact.vars.get(var_name)
            } else {
                pkg.regular.as_ref().and_then(|t| t.vars.get(var_name))
            };
            match existing {
                Some(var) => {
                    if !var.is_record {
                        return Err(StoreError::kind_mismatch(
                            var_name.as_str(),
                            VariableKind::Record,
                        ));
                    }
                    let valid = var.head().is_some_and(|h| h.is_valid);
                    (true, !valid)
                }
                None => (false, false),
            }
        };

        let counter_bump = is_transactional && (!exists || will_revalidate);
        if counter_bump {
            if let Some(pkg) = self.packages.get_mut(pkg_name) {
                let mut ctx = ChangeCtx {
                    changes: &mut self.changes,
                    arena: &mut self.arena,
                    module_region,
                    nest,
                };
                savepoint::savepoint_pack_if_needed(&mut ctx, pkg);
            }
        }

        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        };
        let Package {
            states,
            regular,
            transact,
            ..
        } = pkg;
        let table = if is_transactional {
            &mut *transact
        } else {
            match regular.as_mut() {
                Some(table) => table,
                None => return Err(StoreError::unknown_package(pkg_name.as_str())),
            }
        };
        let table_region = table.region;

        if exists {
            if let Some(var) = table.vars.get_mut(var_name) {
                {
                    let mut ctx = ChangeCtx {
                        changes: &mut self.changes,
                        arena: &mut self.arena,
                        module_region,
                        nest,
                    };
                    savepoint::savepoint_var_if_needed(&mut ctx, pkg_name, table_region, var);
                }
                if will_revalidate {
                    // A removed record variable comes back empty, like a
                    // freshly created one.
                    if let Some(head) = var.head_mut() {
                        head.is_valid = true;
                        if let VarBody::Record(table_body) = &mut head.body {
                            self.arena.destroy_region(table_body.region);
                            let region = self.arena.create_region(Some(table_region));
                            *table_body = RecordTable::new(region);
                        }
                    }
                    var.is_deleted = false;
                }
                // Count the revalidation before the fallible insert so a
                // shape error cannot leave the counter behind.
                if counter_bump {
                    if let Some(head) = states.last_mut() {
                        head.trans_var_num += 1;
                    }
                }
                if let Some(rec) = var.record_mut() {
                    rec.insert_row(&mut self.arena, descriptor, row, convert, var_name.as_str())?;
                }
            }
        } else {
            let region = self.arena.create_region(Some(table_region));
            let mut rec = RecordTable::new(region);
            if let Err(err) =
                rec.insert_row(&mut self.arena, descriptor, row, convert, var_name.as_str())
            {
                self.arena.destroy_region(region);
                return Err(err);
            }
            let mut var = Variable::new_record(var_name.clone(), is_transactional, nest, rec);
            if is_transactional {
                changes::add_to_changed_vars(
                    &mut self.changes,
                    &mut self.arena,
                    module_region,
                    pkg_name,
                    &mut var,
                    nest,
                );
            }
            table.vars.insert(var_name.clone(), var);
            if counter_bump {
                if let Some(head) = states.last_mut() {
                    head.trans_var_num += 1;
                }
            }
        }
        Ok(())
    }

    /// Replaces the row whose key matches the given row's key. Returns
    /// whether a row matched.
    pub fn update(
        &mut self,
        package: &str,
        name: &str,
        descriptor: &RowDescriptor,
        row: Row,
    ) -> StoreResult<bool> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let implicit = self.statement_begin();
        let result = self.update_inner(&pkg_name, &var_name, descriptor, row);
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn update_inner(
        &mut self,
        pkg_name: &Name,
        var_name: &Name,
        descriptor: &RowDescriptor,
        row: Row,
    ) -> StoreResult<bool> {
        if self.find_package(pkg_name).is_none() {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        }
        let module_region = self.module_region_ensure();
        let nest = self.nest;
        let convert = self.config.convert_unknownoid;

        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        };
        let Package {
            regular, transact, ..
        } = pkg;
        let Some((table_region, var)) = table_and_var_mut(regular, transact, var_name) else {
            return Err(StoreError::unknown_variable(var_name.as_str()));
        };
        Self::check_variable(var, VariableKind::Record, None, true)?;

        {
            let mut ctx = ChangeCtx {
                changes: &mut self.changes,
                arena: &mut self.arena,
                module_region,
                nest,
            };
            savepoint::savepoint_var_if_needed(&mut ctx, pkg_name, table_region, var);
        }
        match var.record_mut() {
            Some(rec) => rec.update_row(&mut self.arena, descriptor, row, convert, var_name.as_str()),
            None => Ok(false),
        }
    }

    /// Deletes the row with the given key (a null key deletes the
    /// null-keyed row). Returns whether a row matched.
    pub fn delete(&mut self, package: &str, name: &str, key: Value) -> StoreResult<bool> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let implicit = self.statement_begin();
        let result = self.delete_inner(&pkg_name, &var_name, key);
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn delete_inner(&mut self, pkg_name: &Name, var_name: &Name, key: Value) -> StoreResult<bool> {
        if self.find_package(pkg_name).is_none() {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        }
        let module_region = self.module_region_ensure();
        let nest = self.nest;

        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        };
        let Package {
            regular, transact, ..
        } = pkg;
        let Some((table_region, var)) = table_and_var_mut(regular, transact, var_name) else {
            return Err(StoreError::unknown_variable(var_name.as_str()));
        };
        Self::check_variable(var, VariableKind::Record, None, true)?;

        {
            let mut ctx = ChangeCtx {
                changes: &mut self.changes,
                arena: &mut self.arena,
                module_region,
                nest,
            };
            savepoint::savepoint_var_if_needed(&mut ctx, pkg_name, table_region, var);
        }
        match var.record_mut() {
            Some(rec) => {
                if let Some(ty) = key.type_id() {
                    rec.check_record_key(ty, var_name.as_str())?;
                }
                Ok(rec.delete_row(&mut self.arena, key))
            }
            None => Ok(false),
        }
    }

    /// Opens a scan over all rows of a record variable. Drive it with
    /// [`Session::fetch`].
    pub fn select(&mut self, package: &str, name: &str) -> StoreResult<CursorId> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let keys = {
            let var = self.read_record_variable(&pkg_name, &var_name)?;
            var.record().map(RecordTable::keys_snapshot).unwrap_or_default()
        };
        let level = self.nest;
        Ok(self
            .cursors
            .register_var_scan(pkg_name, var_name, level, keys))
    }

    /// Looks up a single row by key value.
    pub fn select_by_key(&self, package: &str, name: &str, key: &Value) -> StoreResult<Option<Row>> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let var = self.read_record_variable(&pkg_name, &var_name)?;
        let Some(rec) = var.record() else {
            return Ok(None);
        };
        if let Some(ty) = key.type_id() {
            rec.check_record_key(ty, var_name.as_str())?;
        }
        Ok(rec.get_row(key).cloned())
    }

    /// Opens a scan that probes the table with each element of a key
    /// array in order; unmatched elements are skipped. Drive it with
    /// [`Session::fetch`].
    ///
    /// # Errors
    ///
    /// `FeatureNotSupported` when the array is multidimensional (an
    /// element is itself an array).
    pub fn select_by_values(
        &mut self,
        package: &str,
        name: &str,
        keys: &Value,
    ) -> StoreResult<CursorId> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let Value::Array(elements) = keys else {
            return Err(StoreError::invalid_parameter("array argument required"));
        };
        if elements.iter().any(|e| matches!(e, Value::Array(_))) {
            return Err(StoreError::feature_not_supported(
                "searching for elements in multidimensional arrays is not supported",
            ));
        }
        {
            let var = self.read_record_variable(&pkg_name, &var_name)?;
            if let Some(rec) = var.record() {
                for element in elements {
                    if let Some(ty) = element.type_id() {
                        rec.check_record_key(ty, var_name.as_str())?;
                    }
                }
            }
        }
        let level = self.nest;
        Ok(self
            .cursors
            .register_var_scan(pkg_name, var_name, level, elements.clone()))
    }

    /// Fetches the next row of a scan. Returns `None` once the scan is
    /// exhausted or was terminated; keys deleted mid-scan are skipped.
    pub fn fetch(&mut self, cursor: CursorId) -> Option<Row> {
        loop {
            let step = self.cursors.advance_var(cursor)?;
            let Some(row) = ({
                self.packages
                    .get(&step.package)
                    .and_then(|pkg| pkg.find_variable(&step.variable))
                    .and_then(Variable::record)
                    .map(|rec| rec.get_row(&step.key).cloned())
            }) else {
                // The scan's target is gone; observe "done".
                self.cursors.drop_cursor(cursor);
                return None;
            };
            if let Some(row) = row {
                return Some(row);
            }
        }
    }

    /// Closes a scan early.
    pub fn close_cursor(&mut self, cursor: CursorId) {
        self.cursors.drop_cursor(cursor);
    }

    // === Existence, removal, listing ===

    /// Whether a valid variable with this name exists in the package.
    pub fn variable_exists(&self, package: &str, name: &str) -> StoreResult<bool> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let Some(pkg) = self.find_package(&pkg_name) else {
            return Ok(false);
        };
        Ok(pkg.find_variable(&var_name).is_some_and(Variable::is_valid))
    }

    /// Whether a valid package with this name exists.
    pub fn package_exists(&self, package: &str) -> StoreResult<bool> {
        let pkg_name = Name::new(package)?;
        Ok(self.find_package(&pkg_name).is_some())
    }

    /// Removes a variable.
    ///
    /// Regular variables are destroyed immediately; transactional
    /// variables become invalid at the current level and can come back
    /// on rollback. Emptying a package this way makes the package
    /// itself invalid.
    pub fn remove_variable(&mut self, package: &str, name: &str) -> StoreResult<()> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let implicit = self.statement_begin();
        let result = self.remove_variable_inner(&pkg_name, &var_name);
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn remove_variable_inner(&mut self, pkg_name: &Name, var_name: &Name) -> StoreResult<()> {
        let nest = self.nest;

        enum Target {
            Regular,
            Trans { was_valid: bool },
        }

        let target = {
            let Some(pkg) = self.packages.get(pkg_name) else {
                return Err(StoreError::unknown_package(pkg_name.as_str()));
            };
            if !pkg.is_valid() {
                return Err(StoreError::unknown_package(pkg_name.as_str()));
            }
            if pkg
                .regular
                .as_ref()
                .is_some_and(|t| t.vars.contains_key(var_name))
            {
                Target::Regular
            } else if let Some(var) = pkg.transact.vars.get(var_name) {
                Target::Trans {
                    was_valid: var.head().is_some_and(|h| h.is_valid),
                }
            } else {
                return Err(StoreError::unknown_variable(var_name.as_str()));
            }
        };
        let module_region = self.module_region_ensure();

        // The package counter is about to change; savepoint it first.
        if matches!(target, Target::Trans { was_valid: true }) {
            if let Some(pkg) = self.packages.get_mut(pkg_name) {
                let mut ctx = ChangeCtx {
                    changes: &mut self.changes,
                    arena: &mut self.arena,
                    module_region,
                    nest,
                };
                savepoint::savepoint_pack_if_needed(&mut ctx, pkg);
            }
        }

        match target {
            Target::Regular => {
                if let Some(pkg) = self.packages.get_mut(pkg_name) {
                    if let Some(table) = pkg.regular.as_mut() {
                        let region = table.region;
                        if let Some(var) = table.vars.remove(var_name) {
                            for state in &var.states {
                                free_state_body(&mut self.arena, region, &state.body);
                            }
                        }
                    }
                }
            }
            Target::Trans { was_valid } => {
                if let Some(pkg) = self.packages.get_mut(pkg_name) {
                    let Package {
                        states, transact, ..
                    } = pkg;
                    let table_region = transact.region;
                    if let Some(var) = transact.vars.get_mut(var_name) {
                        {
                            let mut ctx = ChangeCtx {
                                changes: &mut self.changes,
                                arena: &mut self.arena,
                                module_region,
                                nest,
                            };
                            savepoint::savepoint_var_if_needed(&mut ctx, pkg_name, table_region, var);
                        }
                        if let Some(head) = var.head_mut() {
                            head.is_valid = false;
                        }
                    }
                    if was_valid {
                        if let Some(head) = states.last_mut() {
                            head.trans_var_num = head.trans_var_num.saturating_sub(1);
                        }
                    }
                }
            }
        }

        self.cursors.drop_variable(pkg_name, var_name);
        self.invalidate_package_if_empty(pkg_name, module_region);
        Ok(())
    }

    /// A package whose last valid variable just went away becomes
    /// invalid at the current level.
    fn invalidate_package_if_empty(&mut self, pkg_name: &Name, module_region: RegionId) {
        let nest = self.nest;
        let empty = self.packages.get(pkg_name).is_some_and(|p| {
            p.is_valid()
                && p.regular_count() == 0
                && p.head().is_some_and(|h| h.trans_var_num == 0)
        });
        if !empty {
            return;
        }
        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return;
        };
        {
            let mut ctx = ChangeCtx {
                changes: &mut self.changes,
                arena: &mut self.arena,
                module_region,
                nest,
            };
            savepoint::savepoint_pack_if_needed(&mut ctx, pkg);
        }
        if let Some(table) = pkg.regular.take() {
            self.arena.destroy_region(table.region);
        }
        if let Some(head) = pkg.head_mut() {
            head.is_valid = false;
            head.trans_var_num = 0;
        }
    }

    /// Removes a package: regular variables are destroyed immediately,
    /// transactional variables and the package become invalid at the
    /// current level.
    pub fn remove_package(&mut self, package: &str) -> StoreResult<()> {
        let pkg_name = Name::new(package)?;
        let implicit = self.statement_begin();
        let result = self.remove_package_checked(&pkg_name);
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn remove_package_checked(&mut self, pkg_name: &Name) -> StoreResult<()> {
        if self.find_package(pkg_name).is_none() {
            return Err(StoreError::unknown_package(pkg_name.as_str()));
        }
        let module_region = self.module_region_ensure();
        self.remove_package_internal(pkg_name, module_region);
        Ok(())
    }

    fn remove_package_internal(&mut self, pkg_name: &Name, module_region: RegionId) {
        let nest = self.nest;
        debug!(package = %pkg_name, "remove package");

        // Terminate scans over the package's variables before the
        // storage goes away.
        self.cursors.drop_package(pkg_name);

        // Savepoint the package before anything inside it changes.
        if let Some(pkg) = self.packages.get_mut(pkg_name) {
            let mut ctx = ChangeCtx {
                changes: &mut self.changes,
                arena: &mut self.arena,
                module_region,
                nest,
            };
            savepoint::savepoint_pack_if_needed(&mut ctx, pkg);
        }

        let Some(pkg) = self.packages.get_mut(pkg_name) else {
            return;
        };
        // All regular variables vanish with their region.
        if let Some(table) = pkg.regular.take() {
            self.arena.destroy_region(table.region);
        }
        // Still-valid transactional variables are savepoint-ed, marked
        // deleted, and invalidated.
        let Package {
            states, transact, ..
        } = pkg;
        let table_region = transact.region;
        for var in transact.vars.values_mut() {
            if var.head().is_some_and(|h| h.is_valid) {
                let mut ctx = ChangeCtx {
                    changes: &mut self.changes,
                    arena: &mut self.arena,
                    module_region,
                    nest,
                };
                savepoint::savepoint_var_if_needed(&mut ctx, pkg_name, table_region, var);
                if let Some(head) = var.head_mut() {
                    head.is_valid = false;
                }
                var.is_deleted = true;
            }
        }
        if let Some(head) = states.last_mut() {
            head.is_valid = false;
            head.trans_var_num = 0;
        }
    }

    /// Removes every package.
    ///
    /// Outside a transaction the whole store is freed immediately,
    /// bypassing the changes stack; inside a transaction packages are
    /// marked invalid and commit frees them. Either way every live scan
    /// is terminated first.
    pub fn remove_packages(&mut self) -> StoreResult<()> {
        let implicit = self.statement_begin();
        let result = self.remove_packages_inner();
        self.statement_end(implicit, result.is_ok());
        result
    }

    fn remove_packages_inner(&mut self) -> StoreResult<()> {
        self.cursors.drop_all();
        if self.packages.is_empty() {
            return Ok(());
        }
        if !self.in_xact {
            if let Some(stack) = self.changes.take() {
                self.arena.destroy_region(stack.region);
            }
            if let Some(region) = self.module_region.take() {
                self.arena.destroy_region(region);
            }
            self.packages.clear();
            return Ok(());
        }
        let module_region = self.module_region_ensure();
        let names: Vec<Name> = self.packages.keys().cloned().collect();
        for name in &names {
            if self.packages.get(name).is_some_and(Package::is_valid) {
                self.remove_package_internal(name, module_region);
            }
        }
        Ok(())
    }

    /// Lists every valid package and variable.
    #[must_use]
    pub fn list(&self) -> Vec<ListedVariable> {
        let mut out = Vec::new();
        for pkg in self.packages.values() {
            if !pkg.is_valid() {
                continue;
            }
            if let Some(table) = &pkg.regular {
                for var in table.vars.values() {
                    if var.is_valid() {
                        out.push(ListedVariable {
                            package: pkg.name.as_str().to_owned(),
                            variable: var.name.as_str().to_owned(),
                            is_transactional: var.is_transactional,
                        });
                    }
                }
            }
            for var in pkg.transact.vars.values() {
                if var.is_valid() {
                    out.push(ListedVariable {
                        package: pkg.name.as_str().to_owned(),
                        variable: var.name.as_str().to_owned(),
                        is_transactional: var.is_transactional,
                    });
                }
            }
        }
        out
    }

    /// Opens a scan over the package table for the memory-footprint
    /// report. Drive it with [`Session::fetch_stats`].
    pub fn package_stats(&mut self) -> CursorId {
        let names: Vec<Name> = self.packages.keys().cloned().collect();
        let level = self.nest;
        self.cursors.register_pkg_scan(level, names)
    }

    /// Fetches the next entry of a package-stats scan.
    pub fn fetch_stats(&mut self, cursor: CursorId) -> Option<PackageStats> {
        loop {
            let name = self.cursors.advance_pkg(cursor)?;
            if let Some(pkg) = self.packages.get(&name) {
                let mut total = self.arena.total_allocated(pkg.transact.region);
                if let Some(table) = &pkg.regular {
                    total += self.arena.total_allocated(table.region);
                }
                return Some(PackageStats {
                    package: name.as_str().to_owned(),
                    total_bytes: total,
                });
            }
        }
    }

    /// Planner-grade estimate of a record variable's row count.
    ///
    /// Derived from region accounting; callers must treat the figure as
    /// a rough, replaceable proxy.
    pub fn estimated_rows(&self, package: &str, name: &str) -> StoreResult<u64> {
        let pkg_name = Name::new(package)?;
        let var_name = Name::new(name)?;
        let var = self.read_record_variable(&pkg_name, &var_name)?;
        Ok(var.record().map_or(0, |rec| rec.estimated_rows(&self.arena)))
    }

    /// Verifies the engine's bookkeeping invariants; returns the first
    /// violation found. Intended for tests.
    pub fn verify_invariants(&self) -> Result<(), String> {
        // Counter agreement for every package.
        for pkg in self.packages.values() {
            let counted = pkg.head().map_or(0, |h| h.trans_var_num);
            let actual = pkg.valid_trans_count();
            if counted != actual {
                return Err(format!(
                    "package \"{}\": trans_var_num {counted} != valid count {actual}",
                    pkg.name
                ));
            }
            if pkg.is_valid() && pkg.regular.is_none() {
                return Err(format!(
                    "package \"{}\": valid but regular table is absent",
                    pkg.name
                ));
            }
            if !pkg.is_valid() {
                for var in pkg.transact.vars.values() {
                    if var.is_valid() {
                        return Err(format!(
                            "package \"{}\": invalid but variable \"{}\" is valid",
                            pkg.name, var.name
                        ));
                    }
                }
            }
        }
        // Stack depth matches the nesting depth while present.
        if let Some(stack) = &self.changes {
            if stack.depth() != self.nest.as_u32() as usize {
                return Err(format!(
                    "changes stack depth {} != nesting level {}",
                    stack.depth(),
                    self.nest.as_u32()
                ));
            }
        }
        // Head-level / frame membership agreement.
        if let Some(frame) = self.changes.as_ref().and_then(|s| s.frames.last()) {
            for pkg in self.packages.values() {
                let in_frame = frame.packs.contains(&pkg.name);
                let at_level = pkg.head().is_some_and(|h| h.level == self.nest);
                if in_frame != at_level {
                    return Err(format!(
                        "package \"{}\": frame membership {in_frame} != head level match {at_level}",
                        pkg.name
                    ));
                }
                for var in pkg.transact.vars.values() {
                    let in_frame = frame
                        .vars
                        .iter()
                        .any(|(p, v)| *p == pkg.name && *v == var.name);
                    let at_level = var.head().is_some_and(|h| h.level == self.nest);
                    if in_frame != at_level {
                        return Err(format!(
                            "variable \"{}.{}\": frame membership {in_frame} != head level match {at_level}",
                            pkg.name, var.name
                        ));
                    }
                }
            }
        }
        // Every live row scan references existing storage.
        for (pkg_name, var_name) in self.cursors.var_scan_targets() {
            let present = self
                .packages
                .get(&pkg_name)
                .is_some_and(|p| p.find_variable(&var_name).is_some());
            if !present {
                return Err(format!(
                    "cursor over \"{pkg_name}.{var_name}\" references destroyed storage"
                ));
            }
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("packages", &self.packages.len())
            .field("nest", &self.nest)
            .field("in_xact", &self.in_xact)
            .field("open_cursors", &self.cursors.live_scans())
            .finish_non_exhaustive()
    }
}

/// Overwrites a scalar head state: release the old datum's accounting,
/// move the new one in, and mark the state valid.
fn write_scalar(arena: &mut Arena, region: RegionId, var: &mut Variable, value: Value) {
    if let Some(head) = var.states.last_mut() {
        head.is_valid = true;
        if let VarBody::Scalar(slot) = &mut head.body {
            arena.release(region, slot.size_bytes());
            let bytes = value.size_bytes();
            *slot = value;
            arena.charge(region, bytes);
        }
    }
    var.is_deleted = false;
}

/// Finds a variable in the regular table first, then the transactional
/// table, returning it with its owning table's region.
fn table_and_var_mut<'a>(
    regular: &'a mut Option<VarTable>,
    transact: &'a mut VarTable,
    name: &Name,
) -> Option<(RegionId, &'a mut Variable)> {
    if let Some(table) = regular.as_mut() {
        if table.vars.contains_key(name) {
            let region = table.region;
            return table.vars.get_mut(name).map(|var| (region, var));
        }
    }
    if transact.vars.contains_key(name) {
        let region = transact.region;
        return transact.vars.get_mut(name).map(|var| (region, var));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ColumnDesc;

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

    #[test]
    fn set_creates_package_and_variable() {
        let mut session = Session::new();
        session.set("pkg", "x", Value::Int(1), true).unwrap();
        assert_eq!(session.package_count(), 1);
        assert!(session.package_exists("pkg").unwrap());
        assert!(session.variable_exists("pkg", "x").unwrap());
        session.verify_invariants().unwrap();
    }

    #[test]
    fn overlong_names_are_rejected() {
        let mut session = Session::new();
        let long = "x".repeat(200);
        assert!(matches!(
            session.set(&long, "x", Value::Int(1), true),
            Err(StoreError::InvalidParameter { .. })
        ));
        assert!(matches!(
            session.set("pkg", &long, Value::Int(1), true),
            Err(StoreError::InvalidParameter { .. })
        ));
        assert_eq!(session.package_count(), 0);
    }

    #[test]
    fn null_created_variable_adopts_a_type_later() {
        let mut session = Session::new();
        session.set("pkg", "x", Value::Null, true).unwrap();
        // Untyped so far: any hint is accepted.
        assert_eq!(
            session.get("pkg", "x", TypeId::Text, false).unwrap(),
            Some(Value::Null)
        );
        session.set("pkg", "x", Value::Int(5), true).unwrap();
        assert_eq!(
            session.get("pkg", "x", TypeId::Int, false).unwrap(),
            Some(Value::Int(5))
        );
        // The type is now fixed.
        assert!(session.set("pkg", "x", Value::Text("no".into()), true).is_err());
    }

    #[test]
    fn scalar_and_record_kinds_do_not_mix() {
        let mut session = Session::new();
        session.set("pkg", "s", Value::Int(1), true).unwrap();
        session.insert("pkg", "r", &desc(), row(1, "a"), true).unwrap();

        assert!(matches!(
            session.get("pkg", "r", TypeId::Int, false),
            Err(StoreError::KindMismatch { .. })
        ));
        assert!(matches!(
            session.select("pkg", "s"),
            Err(StoreError::KindMismatch { .. })
        ));
        assert!(matches!(
            session.set("pkg", "r", Value::Int(1), true),
            Err(StoreError::KindMismatch { .. })
        ));
    }

    #[test]
    fn removing_regular_variable_is_immediate() {
        let mut session = Session::new();
        session.set("pkg", "r", Value::Int(1), false).unwrap();
        session.set("pkg", "t", Value::Int(2), true).unwrap();
        session.remove_variable("pkg", "r").unwrap();

        assert!(!session.variable_exists("pkg", "r").unwrap());
        assert!(session.variable_exists("pkg", "t").unwrap());
        assert!(session.package_exists("pkg").unwrap());
        session.verify_invariants().unwrap();
    }

    #[test]
    fn removing_last_variable_invalidates_the_package() {
        let mut session = Session::new();
        session.set("pkg", "t", Value::Int(1), true).unwrap();
        session.begin().unwrap();
        session.remove_variable("pkg", "t").unwrap();
        assert!(!session.package_exists("pkg").unwrap());
        session.verify_invariants().unwrap();
        session.commit().unwrap();
        assert!(session.packages.is_empty());
    }

    #[test]
    fn resurrection_savepoints_the_old_contents() {
        let mut session = Session::new();
        session.set("pkg", "t", Value::Int(1), true).unwrap();
        session.begin().unwrap();
        session.remove_package("pkg").unwrap();
        session.set("pkg", "fresh", Value::Int(2), true).unwrap();

        assert!(session.variable_exists("pkg", "fresh").unwrap());
        assert!(!session.variable_exists("pkg", "t").unwrap());
        session.verify_invariants().unwrap();

        session.rollback().unwrap();
        assert!(session.variable_exists("pkg", "t").unwrap());
        assert!(!session.variable_exists("pkg", "fresh").unwrap());
        assert_eq!(
            session.get("pkg", "t", TypeId::Int, false).unwrap(),
            Some(Value::Int(1))
        );
        session.verify_invariants().unwrap();
    }

    #[test]
    fn stats_scan_reports_removed_packages_too() {
        let mut session = Session::new();
        session.set("pkg", "t", Value::Int(1), true).unwrap();
        session.begin().unwrap();
        session.remove_package("pkg").unwrap();

        let cursor = session.package_stats();
        let entry = session.fetch_stats(cursor).expect("entry for removed package");
        assert_eq!(entry.package, "pkg");
        assert!(session.fetch_stats(cursor).is_none());
        session.rollback().unwrap();
    }

    #[test]
    fn estimated_rows_grows_with_contents() {
        let mut session = Session::new();
        session.insert("pkg", "r", &desc(), row(1, "a"), true).unwrap();
        let small = session.estimated_rows("pkg", "r").unwrap();
        for i in 2..50 {
            session
                .insert("pkg", "r", &desc(), row(i, "payload payload"), true)
                .unwrap();
        }
        let big = session.estimated_rows("pkg", "r").unwrap();
        assert!(big > small);
    }

    #[test]
    fn debug_output_is_compact() {
        let session = Session::new();
        let rendered = format!("{session:?}");
        assert!(rendered.contains("Session"));
        assert!(rendered.contains("packages"));
    }
}
