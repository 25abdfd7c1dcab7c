//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random names, values, and
//! savepoint-aware operation sequences.

use proptest::prelude::*;
use sessvar_core::Value;

/// Strategy for generating valid package and variable names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,14}").expect("valid regex")
}

/// Strategy for generating scalar values of mixed types (no arrays).
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        2 => any::<bool>().prop_map(Value::Bool),
        4 => any::<i64>().prop_map(Value::Int),
        3 => prop::string::string_regex("[ -~]{0,24}")
            .expect("valid regex")
            .prop_map(Value::Text),
        2 => prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        1 => any::<i64>().prop_map(Value::Timestamp),
    ]
}

/// One step of a random transactional workload over integer scalars in
/// a single package.
#[derive(Debug, Clone)]
pub enum VarOperation {
    /// Set variable `name` (an index into a small name pool) to `value`.
    Set {
        /// Name-pool index.
        name: u8,
        /// The integer value to store.
        value: i64,
    },
    /// Remove variable `name` if it exists.
    Remove {
        /// Name-pool index.
        name: u8,
    },
    /// Open a savepoint.
    Savepoint,
    /// Release the innermost savepoint.
    Release,
    /// Roll back to the innermost savepoint.
    RollbackTo,
}

/// Resolves a name-pool index to its variable name.
#[must_use]
pub fn pooled_name(index: u8) -> String {
    format!("v{}", index % 5)
}

/// Strategy for a single workload operation.
pub fn operation_strategy() -> impl Strategy<Value = VarOperation> {
    prop_oneof![
        5 => (any::<u8>(), any::<i64>()).prop_map(|(name, value)| VarOperation::Set { name, value }),
        2 => any::<u8>().prop_map(|name| VarOperation::Remove { name }),
        2 => Just(VarOperation::Savepoint),
        1 => Just(VarOperation::Release),
        1 => Just(VarOperation::RollbackTo),
    ]
}

/// Strategy for a sequence of workload operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<VarOperation>> {
    prop::collection::vec(operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn names_fit_the_identifier_bound(name in name_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.len() <= sessvar_core::NAME_MAX_LEN);
        }

        #[test]
        fn values_have_consistent_type_ids(value in value_strategy()) {
            match &value {
                Value::Null => prop_assert!(value.type_id().is_none()),
                _ => prop_assert!(value.type_id().is_some()),
            }
        }

        #[test]
        fn pooled_names_stay_in_pool(index in any::<u8>()) {
            let name = pooled_name(index);
            prop_assert!(name.starts_with('v'));
            prop_assert!(name.len() == 2);
        }
    }
}
