//! Custom assertion helpers for testing.
//!
//! Provides assertion functions for the shapes catalog tests check over and
//! over: collection identity, index sets and error kinds.

use std::sync::Arc;

use catalog::{Collection, ServiceContext};
use common::{DbError, DbResult};

use crate::fixtures::index_names;

/// Assert that two handles are the same collection instance, not merely
/// equal metadata.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let ctx = TestContext::new().unwrap();
/// let nss = nss!("app.users");
/// let created = create_collection(ctx.service(), &nss, ts!(1)).unwrap();
/// let found = ctx.catalog().find_collection_by_namespace(&nss).unwrap();
/// assert_same_collection(&created, &found);
/// ```
pub fn assert_same_collection(actual: &Arc<Collection>, expected: &Arc<Collection>) {
    assert!(
        Arc::ptr_eq(actual, expected),
        "Expected the same instance of {} ({}), got a different instance of {} ({})",
        expected.ns(),
        expected.uuid(),
        actual.ns(),
        actual.uuid()
    );
}

/// Assert that two handles are distinct instances.
pub fn assert_distinct_collection(actual: &Arc<Collection>, other: &Arc<Collection>) {
    assert!(
        !Arc::ptr_eq(actual, other),
        "Expected a new instance of {}, got the shared one",
        actual.ns()
    );
}

/// Assert that `collection` lists exactly `expected` indexes, in order.
pub fn assert_index_names(collection: &Collection, expected: &[&str]) {
    let actual = index_names(collection);
    assert_eq!(
        actual, expected,
        "Index mismatch on {}:\nExpected: {:?}\nActual:   {:?}",
        collection.ns(), expected, actual
    );
}

/// Assert that `collection` describes the latest durable entry for its
/// catalog id.
pub fn assert_consistent_with_durable(service: &Arc<ServiceContext>, collection: &Collection) {
    let engine = service.engine();
    let mut ru = engine.new_recovery_unit();
    let entry = engine
        .durable_catalog()
        .get_parsed_catalog_entry(&mut ru, collection.catalog_id())
        .expect("durable catalog read failed")
        .unwrap_or_else(|| panic!("No durable entry for {}", collection.catalog_id()));
    assert_eq!(
        collection.ident_name(),
        entry.ident,
        "Ident mismatch for {}",
        collection.ns()
    );
    assert!(
        collection.is_metadata_equal(&entry.metadata),
        "Metadata mismatch for {}:\nDurable:   {:?}\nInstance:  {:?}",
        collection.ns(),
        entry.metadata,
        collection.metadata()
    );
}

/// Assert that an operation returns an error containing a specific substring.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let result: Result<(), common::DbError> =
///     Err(common::DbError::NamespaceNotFound("app.users".into()));
/// assert_error_contains(result, "app.users");
/// ```
pub fn assert_error_contains<T>(result: DbResult<T>, expected_msg: &str) {
    match result {
        Ok(_) => panic!("Expected error containing '{}', but got Ok", expected_msg),
        Err(e) => {
            let error_string = e.to_string();
            assert!(
                error_string.contains(expected_msg),
                "Expected error to contain '{}', but got: {}",
                expected_msg,
                error_string
            );
        }
    }
}

pub fn assert_namespace_not_found<T>(result: DbResult<T>) {
    match result {
        Err(DbError::NamespaceNotFound(_)) => {}
        Ok(_) => panic!("Expected NamespaceNotFound, but got Ok"),
        Err(other) => panic!("Expected NamespaceNotFound, but got: {}", other),
    }
}

pub fn assert_write_conflict<T>(result: DbResult<T>) {
    match result {
        Err(DbError::WriteConflict(_)) => {}
        Ok(_) => panic!("Expected WriteConflict, but got Ok"),
        Err(other) => panic!("Expected WriteConflict, but got: {}", other),
    }
}
