//! Packages: named containers of regular and transactional variables.

use crate::arena::{Arena, RegionId};
use crate::types::{Name, NestLevel};
use crate::variable::Variable;
use std::collections::HashMap;

/// One of a package's two variable tables, with the arena region that
/// owns its storage.
#[derive(Debug)]
pub(crate) struct VarTable {
    pub(crate) region: RegionId,
    pub(crate) vars: HashMap<Name, Variable>,
}

impl VarTable {
    pub(crate) fn new(region: RegionId) -> Self {
        Self {
            region,
            vars: HashMap::new(),
        }
    }
}

/// One entry in a package's savepoint history.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PackageState {
    /// Whether the package is visible at this state.
    pub(crate) is_valid: bool,
    /// Nesting level at which this state was created.
    pub(crate) level: NestLevel,
    /// Count of transactional variables whose head state is valid.
    pub(crate) trans_var_num: u32,
}

/// A named container of variables.
///
/// The regular table is destroyed wholesale when the package is removed
/// (regular variables do not survive removal even if the removal is
/// rolled back), so it is absent while the package is invalid. The
/// transactional table always exists; its entries carry their own
/// savepoint history.
#[derive(Debug)]
pub(crate) struct Package {
    pub(crate) name: Name,
    pub(crate) regular: Option<VarTable>,
    pub(crate) transact: VarTable,
    pub(crate) states: Vec<PackageState>,
}

impl Package {
    /// Creates a package with empty tables and an initial valid state.
    pub(crate) fn new(name: Name, arena: &mut Arena, module_region: RegionId) -> Self {
        let regular = VarTable::new(arena.create_region(Some(module_region)));
        let transact = VarTable::new(arena.create_region(Some(module_region)));
        Self {
            name,
            regular: Some(regular),
            transact,
            states: vec![PackageState {
                is_valid: true,
                level: NestLevel::new(0),
                trans_var_num: 0,
            }],
        }
    }

    pub(crate) fn head(&self) -> Option<&PackageState> {
        self.states.last()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut PackageState> {
        self.states.last_mut()
    }

    /// Whether the package is visible to readers.
    pub(crate) fn is_valid(&self) -> bool {
        self.head().is_some_and(|s| s.is_valid)
    }

    /// Looks up a variable in the regular table first, then the
    /// transactional table.
    pub(crate) fn find_variable(&self, name: &Name) -> Option<&Variable> {
        if let Some(regular) = &self.regular {
            if let Some(var) = regular.vars.get(name) {
                return Some(var);
            }
        }
        self.transact.vars.get(name)
    }

    /// Number of variables in the regular table.
    pub(crate) fn regular_count(&self) -> usize {
        self.regular.as_ref().map_or(0, |t| t.vars.len())
    }

    /// Recounts valid transactional variables; the head state's
    /// `trans_var_num` must always agree with this.
    pub(crate) fn valid_trans_count(&self) -> u32 {
        self.transact
            .vars
            .values()
            .filter(|v| v.is_valid())
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeId;

    fn name(n: &str) -> Name {
        Name::new(n).unwrap()
    }

    fn package(arena: &mut Arena) -> Package {
        let module = arena.create_region(None);
        Package::new(name("pkg"), arena, module)
    }

    #[test]
    fn new_package_is_valid_and_empty() {
        let mut arena = Arena::new();
        let pkg = package(&mut arena);
        assert!(pkg.is_valid());
        assert_eq!(pkg.regular_count(), 0);
        assert_eq!(pkg.valid_trans_count(), 0);
        assert_eq!(pkg.head().unwrap().trans_var_num, 0);
    }

    #[test]
    fn lookup_prefers_regular_table() {
        let mut arena = Arena::new();
        let mut pkg = package(&mut arena);
        let var_name = name("x");
        let regular = Variable::new_scalar(var_name.clone(), TypeId::Int, false, NestLevel::new(0));
        if let Some(table) = pkg.regular.as_mut() {
            table.vars.insert(var_name.clone(), regular);
        }
        let found = pkg.find_variable(&var_name).unwrap();
        assert!(!found.is_transactional);
    }

    #[test]
    fn counter_recount_matches_table() {
        let mut arena = Arena::new();
        let mut pkg = package(&mut arena);
        let var_name = name("t");
        let var = Variable::new_scalar(var_name.clone(), TypeId::Int, true, NestLevel::new(1));
        pkg.transact.vars.insert(var_name, var);
        assert_eq!(pkg.valid_trans_count(), 1);
    }
}
