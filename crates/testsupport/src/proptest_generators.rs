//! Property-based test generators using proptest.
//!
//! Strategies for the names and timestamps catalog tests are keyed on.

use proptest::prelude::*;
use types::{DatabaseName, NamespaceString, TenantId, Timestamp};

/// Strategy for collection names, including dotted `system.*` style names.
pub fn arb_collection_name() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => "[a-z][a-z0-9_]{0,11}",
        1 => "[a-z]{1,6}\\.[a-z]{1,6}",
    ]
}

/// Strategy for database names, with a tenant one time in four.
///
/// # Example
///
/// ```
/// use proptest::prelude::*;
/// use testsupport::proptest_generators::arb_database_name;
///
/// proptest! {
///     #[test]
///     fn test_db_name_property(db in arb_database_name()) {
///         assert!(!db.db.is_empty());
///     }
/// }
/// ```
pub fn arb_database_name() -> impl Strategy<Value = DatabaseName> {
    let db = "[a-z][a-z0-9]{0,7}";
    prop_oneof![
        3 => db.prop_map(DatabaseName::new),
        1 => (1u64..4, db).prop_map(|(tenant, db)| DatabaseName::with_tenant(TenantId(tenant), db)),
    ]
}

pub fn arb_namespace() -> impl Strategy<Value = NamespaceString> {
    (arb_database_name(), arb_collection_name())
        .prop_map(|(db, coll)| NamespaceString::from_db(db, coll))
}

/// Strategy for non-null timestamps.
pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (1u32..1_000, 0u32..4).prop_map(|(secs, inc)| Timestamp::new(secs, inc))
}

/// Strategy for `len` strictly increasing timestamps.
pub fn arb_increasing_timestamps(len: usize) -> impl Strategy<Value = Vec<Timestamp>> {
    prop::collection::vec(1u32..20, len).prop_map(|steps| {
        steps
            .into_iter()
            .scan(0u32, |secs, step| {
                *secs += step;
                Some(Timestamp::new(*secs, 0))
            })
            .collect()
    })
}
