//! Cursor-safety registry: bookkeeping of open iteration scans.
//!
//! Row scans and package-stats scans stay usable across calls, so the
//! registry tracks which object each scan references and the nesting
//! level it was opened at. Transaction events and object removal
//! terminate the affected scans; a terminated cursor id simply observes
//! "done" on the next fetch.

use crate::types::{CursorId, Name, NestLevel};
use crate::value::Value;

/// One step of a row scan: the target object plus the next key to
/// probe.
#[derive(Debug)]
pub(crate) struct VarScanStep {
    pub(crate) package: Name,
    pub(crate) variable: Name,
    pub(crate) key: Value,
}

#[derive(Debug)]
struct VarScan {
    id: u64,
    package: Name,
    variable: Name,
    level: NestLevel,
    keys: Vec<Value>,
    pos: usize,
}

#[derive(Debug)]
struct PkgScan {
    id: u64,
    level: NestLevel,
    names: Vec<Name>,
    pos: usize,
}

/// Registry of live scans for one session.
#[derive(Debug, Default)]
pub(crate) struct CursorRegistry {
    var_scans: Vec<VarScan>,
    pkg_scans: Vec<PkgScan>,
    next_id: u64,
}

impl CursorRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn issue_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Registers a scan over a record variable's keys.
    pub(crate) fn register_var_scan(
        &mut self,
        package: Name,
        variable: Name,
        level: NestLevel,
        keys: Vec<Value>,
    ) -> CursorId {
        let id = self.issue_id();
        self.var_scans.push(VarScan {
            id,
            package,
            variable,
            level,
            keys,
            pos: 0,
        });
        CursorId::new(id)
    }

    /// Registers a scan over the package table.
    pub(crate) fn register_pkg_scan(&mut self, level: NestLevel, names: Vec<Name>) -> CursorId {
        let id = self.issue_id();
        self.pkg_scans.push(PkgScan {
            id,
            level,
            names,
            pos: 0,
        });
        CursorId::new(id)
    }

    /// Yields the next key of a row scan, or `None` when the scan is
    /// exhausted (the entry is dropped) or already terminated.
    pub(crate) fn advance_var(&mut self, cursor: CursorId) -> Option<VarScanStep> {
        let index = self.var_scans.iter().position(|s| s.id == cursor.as_u64())?;
        let scan = &mut self.var_scans[index];
        if scan.pos >= scan.keys.len() {
            self.var_scans.swap_remove(index);
            return None;
        }
        let step = VarScanStep {
            package: scan.package.clone(),
            variable: scan.variable.clone(),
            key: scan.keys[scan.pos].clone(),
        };
        scan.pos += 1;
        Some(step)
    }

    /// Yields the next package name of a package-table scan.
    pub(crate) fn advance_pkg(&mut self, cursor: CursorId) -> Option<Name> {
        let index = self.pkg_scans.iter().position(|s| s.id == cursor.as_u64())?;
        let scan = &mut self.pkg_scans[index];
        if scan.pos >= scan.names.len() {
            self.pkg_scans.swap_remove(index);
            return None;
        }
        let name = scan.names[scan.pos].clone();
        scan.pos += 1;
        Some(name)
    }

    /// Terminates one scan.
    pub(crate) fn drop_cursor(&mut self, cursor: CursorId) {
        self.var_scans.retain(|s| s.id != cursor.as_u64());
        self.pkg_scans.retain(|s| s.id != cursor.as_u64());
    }

    /// Terminates every scan (executor end, top-level commit/abort).
    pub(crate) fn drop_all(&mut self) {
        self.var_scans.clear();
        self.pkg_scans.clear();
    }

    /// Terminates the scans opened at a finished subtransaction level.
    pub(crate) fn drop_level(&mut self, level: NestLevel) {
        self.var_scans.retain(|s| s.level != level);
        self.pkg_scans.retain(|s| s.level != level);
    }

    /// Terminates the scans over one variable.
    pub(crate) fn drop_variable(&mut self, package: &Name, variable: &Name) {
        self.var_scans
            .retain(|s| !(s.package == *package && s.variable == *variable));
    }

    /// Terminates the scans over any variable of one package.
    pub(crate) fn drop_package(&mut self, package: &Name) {
        self.var_scans.retain(|s| s.package != *package);
    }

    /// Number of live scans.
    pub(crate) fn live_scans(&self) -> usize {
        self.var_scans.len() + self.pkg_scans.len()
    }

    /// The (package, variable) targets of every live row scan, for
    /// invariant checking.
    pub(crate) fn var_scan_targets(&self) -> Vec<(Name, Name)> {
        self.var_scans
            .iter()
            .map(|s| (s.package.clone(), s.variable.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> Name {
        Name::new(n).unwrap()
    }

    fn registry_with_scan(keys: Vec<Value>) -> (CursorRegistry, CursorId) {
        let mut reg = CursorRegistry::new();
        let id = reg.register_var_scan(name("p"), name("v"), NestLevel::new(1), keys);
        (reg, id)
    }

    #[test]
    fn scan_yields_keys_in_order_then_drops() {
        let (mut reg, id) = registry_with_scan(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(reg.advance_var(id).unwrap().key, Value::Int(1));
        assert_eq!(reg.advance_var(id).unwrap().key, Value::Int(2));
        assert!(reg.advance_var(id).is_none());
        assert_eq!(reg.live_scans(), 0);
        // A dead id keeps observing "done".
        assert!(reg.advance_var(id).is_none());
    }

    #[test]
    fn drop_level_only_hits_that_level() {
        let mut reg = CursorRegistry::new();
        let outer = reg.register_var_scan(name("p"), name("v"), NestLevel::new(1), vec![]);
        let inner = reg.register_var_scan(name("p"), name("v"), NestLevel::new(2), vec![Value::Null]);
        reg.drop_level(NestLevel::new(2));
        assert!(reg.advance_var(inner).is_none());
        // The outer scan survives (and is then exhausted normally).
        assert_eq!(reg.live_scans(), 1);
        assert!(reg.advance_var(outer).is_none());
    }

    #[test]
    fn drop_variable_and_package() {
        let mut reg = CursorRegistry::new();
        let a = reg.register_var_scan(name("p"), name("a"), NestLevel::new(1), vec![Value::Int(1)]);
        let b = reg.register_var_scan(name("p"), name("b"), NestLevel::new(1), vec![Value::Int(1)]);
        reg.drop_variable(&name("p"), &name("a"));
        assert!(reg.advance_var(a).is_none());
        assert_eq!(reg.live_scans(), 1);
        reg.drop_package(&name("p"));
        assert!(reg.advance_var(b).is_none());
        assert_eq!(reg.live_scans(), 0);
    }

    #[test]
    fn package_scan_walks_names() {
        let mut reg = CursorRegistry::new();
        let id = reg.register_pkg_scan(NestLevel::new(0), vec![name("a"), name("b")]);
        assert_eq!(reg.advance_pkg(id), Some(name("a")));
        assert_eq!(reg.advance_pkg(id), Some(name("b")));
        assert_eq!(reg.advance_pkg(id), None);
        assert_eq!(reg.live_scans(), 0);
    }

    #[test]
    fn drop_all_clears_everything() {
        let mut reg = CursorRegistry::new();
        reg.register_var_scan(name("p"), name("v"), NestLevel::new(1), vec![]);
        reg.register_pkg_scan(NestLevel::new(1), vec![]);
        assert_eq!(reg.live_scans(), 2);
        reg.drop_all();
        assert_eq!(reg.live_scans(), 0);
    }
}
