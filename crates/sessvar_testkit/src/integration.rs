//! End-to-end scenarios and the model-checked transaction harness.
//!
//! The harness replays a random savepoint-aware workload against both a
//! real session and a naive model (a stack of name→value maps, one per
//! open savepoint level) and checks that they agree after every step.

use crate::generators::{pooled_name, VarOperation};
use sessvar_core::{Session, StoreError, TypeId, Value};
use std::collections::HashMap;

/// The package the harness works in.
pub const HARNESS_PACKAGE: &str = "prop";

/// A model-checked harness for transactional integer scalars.
pub struct TransactionHarness {
    /// The session under test.
    pub session: Session,
    /// One map per open savepoint level; the last one is current.
    model: Vec<HashMap<String, i64>>,
}

impl TransactionHarness {
    /// Opens a session with a running transaction and an empty model.
    pub fn new() -> Self {
        let mut session = Session::new();
        session.begin().expect("begin");
        Self {
            session,
            model: vec![HashMap::new()],
        }
    }

    /// Current savepoint depth (1 = no open savepoints).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.model.len()
    }

    /// Applies one workload operation to both sides.
    pub fn apply(&mut self, op: &VarOperation) {
        match op {
            VarOperation::Set { name, value } => {
                let name = pooled_name(*name);
                self.session
                    .set(HARNESS_PACKAGE, &name, Value::Int(*value), true)
                    .expect("set");
                if let Some(top) = self.model.last_mut() {
                    top.insert(name, *value);
                }
            }
            VarOperation::Remove { name } => {
                let name = pooled_name(*name);
                let known = self.model.last().is_some_and(|top| top.contains_key(&name));
                let result = self.session.remove_variable(HARNESS_PACKAGE, &name);
                if known {
                    result.expect("remove existing variable");
                    if let Some(top) = self.model.last_mut() {
                        top.remove(&name);
                    }
                } else {
                    assert!(result.is_err(), "removing a missing variable must fail");
                }
            }
            VarOperation::Savepoint => {
                self.session.savepoint().expect("savepoint");
                let top = self.model.last().cloned().unwrap_or_default();
                self.model.push(top);
            }
            VarOperation::Release => {
                if self.model.len() > 1 {
                    self.session.release().expect("release");
                    if let Some(top) = self.model.pop() {
                        if let Some(parent) = self.model.last_mut() {
                            *parent = top;
                        }
                    }
                }
            }
            VarOperation::RollbackTo => {
                if self.model.len() > 1 {
                    self.session.rollback_to().expect("rollback to savepoint");
                    self.model.pop();
                }
            }
        }
    }

    /// Checks that the session agrees with the model and that the
    /// engine's invariants hold.
    pub fn verify(&self) {
        let top = self.model.last().cloned().unwrap_or_default();
        for index in 0..5 {
            let name = pooled_name(index);
            let expected = top.get(&name).copied().map(Value::Int);
            let actual = self
                .session
                .get(HARNESS_PACKAGE, &name, TypeId::Int, false)
                .expect("get");
            assert_eq!(actual, expected, "variable \"{name}\" diverged from model");
        }
        self.session
            .verify_invariants()
            .expect("engine invariants hold");
    }

    /// Commits or rolls back the transaction and checks the end state.
    pub fn finish(mut self, commit: bool) {
        let expected = if commit {
            self.model.last().cloned().unwrap_or_default()
        } else {
            HashMap::new()
        };
        if commit {
            self.session.commit().expect("commit");
        } else {
            self.session.rollback().expect("rollback");
        }
        for index in 0..5 {
            let name = pooled_name(index);
            let actual = self
                .session
                .get(HARNESS_PACKAGE, &name, TypeId::Int, false)
                .expect("get");
            assert_eq!(actual, expected.get(&name).copied().map(Value::Int));
        }
        self.session
            .verify_invariants()
            .expect("engine invariants hold after finish");
    }
}

impl Default for TransactionHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// The end-to-end scenarios of the store's contract.
pub mod scenarios {
    use super::*;
    use crate::fixtures::{kv_descriptor, kv_row};

    /// Writes at the outer level survive a nested rollback.
    pub fn check_nested_rollback(session: &mut Session) {
        session.begin().expect("begin");
        session
            .set("p", "x", Value::Int(1), true)
            .expect("outer set");
        session.savepoint().expect("savepoint");
        session
            .set("p", "x", Value::Int(2), true)
            .expect("inner set");
        session.rollback_to().expect("rollback to savepoint");
        assert_eq!(
            session.get("p", "x", TypeId::Int, false).expect("get"),
            Some(Value::Int(1))
        );
        session.commit().expect("commit");
        assert_eq!(
            session.get("p", "x", TypeId::Int, false).expect("get"),
            Some(Value::Int(1))
        );
    }

    /// A removed package resurrects on re-use, without its contents.
    pub fn check_package_resurrection(session: &mut Session) {
        session.set("p", "r", Value::Int(1), false).expect("set r");
        session.set("p", "t", Value::Int(1), true).expect("set t");
        session.remove_package("p").expect("remove package");

        session
            .set("p", "r2", Value::Int(1), false)
            .expect("set r2 re-creates the package");
        assert!(session.variable_exists("p", "r2").expect("exists"));
        assert_eq!(
            session.get("p", "r", TypeId::Int, false).expect("get r"),
            None,
            "regular variable vanished with the package's regular storage"
        );
        assert!(
            !session.variable_exists("p", "t").expect("exists"),
            "transactional variable did not come back with the package"
        );
    }

    /// Commit folds nested mutations into a single visible value.
    pub fn check_commit_folding(session: &mut Session) {
        session.begin().expect("begin");
        session.set("p", "x", Value::Int(1), true).expect("set 1");
        session.savepoint().expect("savepoint");
        session.set("p", "x", Value::Int(2), true).expect("set 2");
        session.release().expect("release");
        session.commit().expect("commit");
        assert_eq!(
            session.get("p", "x", TypeId::Int, false).expect("get"),
            Some(Value::Int(2))
        );
        session.verify_invariants().expect("invariants");
    }

    /// An open row scan observes "done" after its variable is removed.
    pub fn check_iterator_survives_remove(session: &mut Session) {
        session.begin().expect("begin");
        session
            .insert("p", "t", &kv_descriptor(), kv_row(1, "one"), true)
            .expect("insert");
        let cursor = session.select("p", "t").expect("select");
        session.remove_variable("p", "t").expect("remove variable");
        assert!(
            session.fetch(cursor).is_none(),
            "scan over a removed variable observes done"
        );
        session.commit().expect("commit");
    }

    /// A package emptied before commit is gone after commit.
    pub fn check_empty_package_gc(session: &mut Session) {
        session.set("p", "t", Value::Int(1), true).expect("set");
        session.begin().expect("begin");
        session.remove_variable("p", "t").expect("remove");
        session.commit().expect("commit");
        assert!(!session.package_exists("p").expect("exists"));
        assert!(session.list().is_empty());
    }

    /// Re-creating a variable with the opposite transactionality fails.
    pub fn check_transactionality_conflict(session: &mut Session) {
        session.set("p", "a", Value::Int(1), true).expect("set");
        let err = session.set("p", "a", Value::Int(2), false).unwrap_err();
        assert!(matches!(err, StoreError::TransactionalityConflict { .. }));

        session.set("p", "b", Value::Int(1), false).expect("set");
        let err = session.set("p", "b", Value::Int(2), true).unwrap_err();
        assert!(matches!(err, StoreError::TransactionalityConflict { .. }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        kv_descriptor, kv_row, null_key_row, with_session, with_unconverted_session,
    };
    use crate::generators::{operation_sequence_strategy, PropTestConfig};
    use proptest::prelude::*;
    use sessvar_core::{ColumnDesc, Row, RowDescriptor};

    #[test]
    fn nested_rollback_preserves_outer_writes() {
        with_session(|s| scenarios::check_nested_rollback(s));
    }

    #[test]
    fn package_resurrects_without_contents() {
        with_session(|s| scenarios::check_package_resurrection(s));
    }

    #[test]
    fn commit_folds_across_levels() {
        with_session(|s| scenarios::check_commit_folding(s));
    }

    #[test]
    fn iterator_survives_remove() {
        with_session(|s| scenarios::check_iterator_survives_remove(s));
    }

    #[test]
    fn empty_package_is_collected_on_commit() {
        with_session(|s| scenarios::check_empty_package_gc(s));
    }

    #[test]
    fn transactionality_conflicts_are_rejected() {
        with_session(|s| scenarios::check_transactionality_conflict(s));
    }

    #[test]
    fn set_get_round_trip() {
        with_session(|s| {
            let values = [
                (Value::Int(42), TypeId::Int),
                (Value::Text("hello".into()), TypeId::Text),
                (Value::Bool(true), TypeId::Bool),
                (Value::Bytes(vec![1, 2, 3]), TypeId::Bytes),
            ];
            for (i, (value, ty)) in values.iter().enumerate() {
                let name = format!("v{i}");
                s.set("pkg", &name, value.clone(), true).unwrap();
                assert_eq!(
                    s.get("pkg", &name, *ty, true).unwrap(),
                    Some(value.clone())
                );
            }
            // Null round-trips and keeps the variable visible.
            s.set("pkg", "n", Value::Null, true).unwrap();
            assert_eq!(
                s.get("pkg", "n", TypeId::Int, false).unwrap(),
                Some(Value::Null)
            );
            assert!(s.variable_exists("pkg", "n").unwrap());
            s.verify_invariants().unwrap();
        });
    }

    #[test]
    fn get_type_mismatch_is_rejected() {
        with_session(|s| {
            s.set("pkg", "x", Value::Int(1), true).unwrap();
            let err = s.get("pkg", "x", TypeId::Text, false).unwrap_err();
            assert!(matches!(err, StoreError::TypeMismatch { .. }));
        });
    }

    #[test]
    fn strict_lookups_fail_loudly() {
        with_session(|s| {
            assert!(matches!(
                s.get("nope", "x", TypeId::Int, true).unwrap_err(),
                StoreError::UnknownPackage { .. }
            ));
            s.set("pkg", "x", Value::Int(1), true).unwrap();
            assert!(matches!(
                s.get("pkg", "nope", TypeId::Int, true).unwrap_err(),
                StoreError::UnknownVariable { .. }
            ));
            assert_eq!(s.get("pkg", "nope", TypeId::Int, false).unwrap(), None);
        });
    }

    #[test]
    fn insert_select_delete_round_trip() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            s.insert("pkg", "rows", &desc, kv_row(2, "two"), true)
                .unwrap();

            assert_eq!(
                s.select_by_key("pkg", "rows", &Value::Int(1)).unwrap(),
                Some(kv_row(1, "one"))
            );
            assert!(s.delete("pkg", "rows", Value::Int(1)).unwrap());
            assert_eq!(s.select_by_key("pkg", "rows", &Value::Int(1)).unwrap(), None);
            assert!(!s.delete("pkg", "rows", Value::Int(1)).unwrap());
            s.verify_invariants().unwrap();
        });
    }

    #[test]
    fn update_replaces_row_by_key() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            assert!(s.update("pkg", "rows", &desc, kv_row(1, "uno")).unwrap());
            assert!(!s.update("pkg", "rows", &desc, kv_row(9, "nine")).unwrap());
            assert_eq!(
                s.select_by_key("pkg", "rows", &Value::Int(1)).unwrap(),
                Some(kv_row(1, "uno"))
            );
        });
    }

    #[test]
    fn null_keyed_row_is_addressable() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, null_key_row("void"), true)
                .unwrap();
            assert_eq!(
                s.select_by_key("pkg", "rows", &Value::Null).unwrap(),
                Some(null_key_row("void"))
            );
            assert!(s.delete("pkg", "rows", Value::Null).unwrap());
        });
    }

    #[test]
    fn scan_yields_every_row() {
        with_session(|s| {
            let desc = kv_descriptor();
            for i in 0..8 {
                s.insert("pkg", "rows", &desc, kv_row(i, "x"), true).unwrap();
            }
            let cursor = s.select("pkg", "rows").unwrap();
            let mut seen = Vec::new();
            while let Some(row) = s.fetch(cursor) {
                if let Value::Int(id) = row.key() {
                    seen.push(*id);
                }
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..8).collect::<Vec<_>>());
            assert_eq!(s.open_cursors(), 0, "exhausted scan leaves the registry");
        });
    }

    #[test]
    fn scan_skips_rows_deleted_mid_scan() {
        with_session(|s| {
            let desc = kv_descriptor();
            for i in 0..4 {
                s.insert("pkg", "rows", &desc, kv_row(i, "x"), true).unwrap();
            }
            let cursor = s.select("pkg", "rows").unwrap();
            let first = s.fetch(cursor).expect("first row");
            // Delete every row except the one already fetched.
            for i in 0..4 {
                if Value::Int(i) != *first.key() {
                    assert!(s.delete("pkg", "rows", Value::Int(i)).unwrap());
                }
            }
            assert!(s.fetch(cursor).is_none(), "deleted keys are skipped");
        });
    }

    #[test]
    fn select_by_values_probes_in_order_and_skips_misses() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            s.insert("pkg", "rows", &desc, kv_row(3, "three"), true)
                .unwrap();

            let keys = Value::Array(vec![
                Value::Int(3),
                Value::Int(2),
                Value::Int(1),
                Value::Int(1),
            ]);
            let cursor = s.select_by_values("pkg", "rows", &keys).unwrap();
            assert_eq!(s.fetch(cursor), Some(kv_row(3, "three")));
            assert_eq!(s.fetch(cursor), Some(kv_row(1, "one")));
            assert_eq!(s.fetch(cursor), Some(kv_row(1, "one")));
            assert_eq!(s.fetch(cursor), None);
        });
    }

    #[test]
    fn select_by_values_rejects_multidimensional_arrays() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            let keys = Value::Array(vec![Value::Array(vec![Value::Int(1)])]);
            let err = s.select_by_values("pkg", "rows", &keys).unwrap_err();
            assert!(matches!(err, StoreError::FeatureNotSupported { .. }));
        });
    }

    #[test]
    fn executor_finish_terminates_every_scan() {
        with_session(|s| {
            let desc = kv_descriptor();
            for i in 0..3 {
                s.insert("pkg", "rows", &desc, kv_row(i, "x"), true).unwrap();
            }
            let a = s.select("pkg", "rows").unwrap();
            let b = s.select("pkg", "rows").unwrap();
            let stats = s.package_stats();
            assert!(s.open_cursors() >= 3);

            s.executor_finish();
            assert_eq!(s.open_cursors(), 0);
            assert!(s.fetch(a).is_none());
            assert!(s.fetch(b).is_none());
            assert!(s.fetch_stats(stats).is_none());
        });
    }

    #[test]
    fn subtransaction_scans_die_with_their_level() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.begin().unwrap();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            let outer = s.select("pkg", "rows").unwrap();
            s.savepoint().unwrap();
            let inner = s.select("pkg", "rows").unwrap();
            s.rollback_to().unwrap();

            assert!(s.fetch(inner).is_none(), "inner-level scan is terminated");
            assert!(s.fetch(outer).is_some(), "outer-level scan survives");
            s.commit().unwrap();
            assert!(s.fetch(outer).is_none(), "commit terminates scans");
        });
    }

    #[test]
    fn rollback_erases_rows_and_variables() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, kv_row(1, "keep"), true)
                .unwrap();
            s.begin().unwrap();
            s.insert("pkg", "rows", &desc, kv_row(2, "drop"), true)
                .unwrap();
            s.set("pkg", "fresh", Value::Int(1), true).unwrap();
            s.rollback().unwrap();

            assert_eq!(
                s.select_by_key("pkg", "rows", &Value::Int(1)).unwrap(),
                Some(kv_row(1, "keep"))
            );
            assert_eq!(s.select_by_key("pkg", "rows", &Value::Int(2)).unwrap(), None);
            assert!(!s.variable_exists("pkg", "fresh").unwrap());
            s.verify_invariants().unwrap();
        });
    }

    #[test]
    fn duplicate_row_keys_are_rejected() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            let err = s
                .insert("pkg", "rows", &desc, kv_row(1, "again"), true)
                .unwrap_err();
            assert!(matches!(err, StoreError::DuplicateKey { .. }));
            // The failed autocommit statement left no residue.
            s.verify_invariants().unwrap();
            assert_eq!(
                s.select_by_key("pkg", "rows", &Value::Int(1)).unwrap(),
                Some(kv_row(1, "one"))
            );
        });
    }

    #[test]
    fn unknown_key_column_promotes_to_text_by_default() {
        with_session(|s| {
            let desc = RowDescriptor::new(vec![
                ColumnDesc::new("k", TypeId::Unknown),
                ColumnDesc::new("v", TypeId::Int),
            ])
            .unwrap();
            let row = Row::new(vec![Value::Unknown("alpha".into()), Value::Int(1)]);
            s.insert("pkg", "rows", &desc, row, true).unwrap();

            let found = s
                .select_by_key("pkg", "rows", &Value::Text("alpha".into()))
                .unwrap();
            assert!(found.is_some());
            assert_eq!(found.unwrap().key(), &Value::Text("alpha".into()));
        });
    }

    #[test]
    fn unknown_key_column_is_kept_when_conversion_is_off() {
        with_unconverted_session(|s| {
            let desc = RowDescriptor::new(vec![ColumnDesc::new("k", TypeId::Unknown)]).unwrap();
            let row = Row::new(vec![Value::Unknown("alpha".into())]);
            s.insert("pkg", "rows", &desc, row, true).unwrap();

            let found = s
                .select_by_key("pkg", "rows", &Value::Unknown("alpha".into()))
                .unwrap();
            assert!(found.is_some());
            assert!(s
                .select_by_key("pkg", "rows", &Value::Text("alpha".into()))
                .is_err());
        });
    }

    #[test]
    fn listing_skips_removed_entries() {
        with_session(|s| {
            s.set("a", "x", Value::Int(1), true).unwrap();
            s.set("a", "y", Value::Int(2), false).unwrap();
            s.set("b", "z", Value::Int(3), true).unwrap();

            let mut listed = s.list();
            listed.sort();
            assert_eq!(listed.len(), 3);
            assert!(listed.iter().any(|e| e.package == "a" && e.variable == "y"));

            s.remove_variable("a", "x").unwrap();
            s.remove_package("b").unwrap();
            let listed = s.list();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].variable, "y");
        });
    }

    #[test]
    fn package_stats_reports_footprints() {
        let mut s = crate::fixtures::scenarios::populated_session(16);
        let cursor = s.package_stats();
        let entry = s.fetch_stats(cursor).expect("one package");
        assert_eq!(entry.package, "data");
        assert!(entry.total_bytes > 0);
        assert!(s.fetch_stats(cursor).is_none());
    }

    #[test]
    fn remove_packages_outside_transaction_frees_everything() {
        let mut s = crate::fixtures::scenarios::populated_session(4);
        let cursor = s.select("data", "records").unwrap();
        s.remove_packages().unwrap();

        assert!(s.fetch(cursor).is_none(), "scans were terminated first");
        assert_eq!(s.package_count(), 0);
        assert!(s.list().is_empty());
        s.verify_invariants().unwrap();
    }

    #[test]
    fn remove_packages_inside_transaction_rolls_back() {
        let mut s = crate::fixtures::scenarios::populated_session(4);
        s.begin().unwrap();
        s.remove_packages().unwrap();
        assert!(!s.package_exists("data").unwrap());
        s.rollback().unwrap();

        assert!(s.package_exists("data").unwrap());
        assert_eq!(
            s.select_by_key("data", "records", &Value::Int(0)).unwrap(),
            Some(crate::fixtures::kv_row(0, "row 0"))
        );
        s.verify_invariants().unwrap();
    }

    #[test]
    fn record_rows_revert_on_nested_rollback() {
        with_session(|s| {
            let desc = kv_descriptor();
            s.begin().unwrap();
            s.insert("pkg", "rows", &desc, kv_row(1, "one"), true)
                .unwrap();
            s.savepoint().unwrap();
            s.insert("pkg", "rows", &desc, kv_row(2, "two"), true)
                .unwrap();
            assert!(s.delete("pkg", "rows", Value::Int(1)).unwrap());
            s.rollback_to().unwrap();

            assert_eq!(
                s.select_by_key("pkg", "rows", &Value::Int(1)).unwrap(),
                Some(kv_row(1, "one"))
            );
            assert_eq!(s.select_by_key("pkg", "rows", &Value::Int(2)).unwrap(), None);
            s.commit().unwrap();
            s.verify_invariants().unwrap();
        });
    }

    #[test]
    fn harness_tracks_a_simple_workload() {
        let mut harness = TransactionHarness::new();
        harness.apply(&VarOperation::Set { name: 0, value: 1 });
        harness.apply(&VarOperation::Savepoint);
        harness.apply(&VarOperation::Set { name: 0, value: 2 });
        harness.apply(&VarOperation::Remove { name: 1 });
        harness.verify();
        harness.apply(&VarOperation::RollbackTo);
        harness.verify();
        harness.finish(true);
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn random_workloads_match_the_model(
            ops in operation_sequence_strategy(1, 40),
            commit in any::<bool>(),
        ) {
            let mut harness = TransactionHarness::new();
            for op in &ops {
                harness.apply(op);
                harness.verify();
            }
            harness.finish(commit);
        }
    }
}
