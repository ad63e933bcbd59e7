//! Timestamped DDL fixtures and read helpers.
//!
//! Every DDL fixture runs on its own operation, takes the locks the catalog
//! requires, and commits one write unit of work at the given timestamp.
//! `Timestamp::MIN` commits untimestamped.

use catalog::{ddl, Collection, CollectionCatalog, OperationContext, ServiceContext, WriteUnitOfWork};
use common::DbResult;
use std::sync::Arc;
use storage::{LockMode, ReadSource};
use types::{NamespaceString, NamespaceStringOrUuid, Timestamp};

/// Run `f` in a write unit of work on `op` holding exclusive locks on
/// `namespaces`, and commit at `commit_ts`.
///
/// # Example
///
/// ```
/// use catalog::ddl;
/// use testsupport::prelude::*;
///
/// let ctx = TestContext::new().unwrap();
/// let nss = nss!("app.users");
/// let mut op = ctx.operation_context();
/// run_ddl(&mut op, &[&nss], ts!(5), |op| ddl::create_collection(op, &nss)).unwrap();
/// assert!(ctx.catalog().find_collection_by_namespace(&nss).is_some());
/// ```
pub fn run_ddl<R>(
    op: &mut OperationContext,
    namespaces: &[&NamespaceString],
    commit_ts: Timestamp,
    f: impl FnOnce(&mut OperationContext) -> DbResult<R>,
) -> DbResult<R> {
    op.set_read_source(ReadSource::NoTimestamp);
    lock_for_ddl(op, namespaces);
    let result = commit_unit_of_work(op, commit_ts, f);
    op.recovery_unit_mut().clear_commit_timestamp();
    unlock_after_ddl(op, namespaces);
    result
}

/// Take the global intent lock and exclusive locks on `namespaces`.
pub fn lock_for_ddl(op: &mut OperationContext, namespaces: &[&NamespaceString]) {
    op.locker_mut().lock_global(LockMode::IX);
    for nss in namespaces {
        op.locker_mut().lock_collection(nss, LockMode::X);
    }
}

pub fn unlock_after_ddl(op: &mut OperationContext, namespaces: &[&NamespaceString]) {
    for nss in namespaces {
        op.locker_mut().unlock_collection(nss);
    }
    op.locker_mut().unlock_global();
}

fn commit_unit_of_work<R>(
    op: &mut OperationContext,
    commit_ts: Timestamp,
    f: impl FnOnce(&mut OperationContext) -> DbResult<R>,
) -> DbResult<R> {
    let mut wuow = WriteUnitOfWork::new(op);
    wuow.recovery_unit_mut().set_commit_timestamp(commit_ts);
    let value = f(&mut wuow)?;
    wuow.commit()?;
    Ok(value)
}

/// Create `nss` at `ts` and return the committed collection.
pub fn create_collection(
    service: &Arc<ServiceContext>,
    nss: &NamespaceString,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| ddl::create_collection(op, nss))
}

pub fn drop_collection(service: &Arc<ServiceContext>, nss: &NamespaceString, ts: Timestamp) -> DbResult<()> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| ddl::drop_collection(op, nss))
}

pub fn rename_collection(
    service: &Arc<ServiceContext>,
    from: &NamespaceString,
    to: &NamespaceString,
    drop_target: bool,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[from, to], ts, |op| {
        ddl::rename_collection(op, from, to, drop_target)
    })
}

/// Create a ready index named `name` keyed on the field of the same name.
pub fn create_index(
    service: &Arc<ServiceContext>,
    nss: &NamespaceString,
    name: &str,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| {
        ddl::create_index(op, nss, name, vec![name.to_string()])
    })
}

pub fn drop_index(
    service: &Arc<ServiceContext>,
    nss: &NamespaceString,
    name: &str,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| ddl::drop_index(op, nss, name))
}

pub fn start_index_build(
    service: &Arc<ServiceContext>,
    nss: &NamespaceString,
    name: &str,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| {
        ddl::start_index_build(op, nss, name, vec![name.to_string()])
    })
}

pub fn finish_index_build(
    service: &Arc<ServiceContext>,
    nss: &NamespaceString,
    name: &str,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| ddl::finish_index_build(op, nss, name))
}

pub fn set_index_multikey(
    service: &Arc<ServiceContext>,
    nss: &NamespaceString,
    name: &str,
    multikey: bool,
    ts: Timestamp,
) -> DbResult<Arc<Collection>> {
    let mut op = service.make_operation_context();
    run_ddl(&mut op, &[nss], ts, |op| {
        ddl::set_index_multikey(op, nss, name, multikey)
    })
}

/// Establish `key` for `op` at `read_ts`, or at the operation's current read
/// source when `None`.
pub fn establish(
    op: &mut OperationContext,
    key: impl Into<NamespaceStringOrUuid>,
    read_ts: Option<Timestamp>,
) -> DbResult<Option<Arc<Collection>>> {
    let key = key.into();
    CollectionCatalog::get(op).establish_consistent_collection(op, &key, read_ts)
}

/// An operation reading at `read_ts`, or at latest when `None`.
pub fn reader(service: &Arc<ServiceContext>, read_ts: Option<Timestamp>) -> OperationContext {
    let mut op = service.make_operation_context();
    if let Some(ts) = read_ts {
        op.set_read_source(ReadSource::Provided(ts));
    }
    op
}

/// Names of the indexes of `collection`, including unfinished builds.
pub fn index_names(collection: &Collection) -> Vec<String> {
    collection
        .index_catalog()
        .entries()
        .map(|entry| entry.name().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TestContext;
    use crate::{nss, ts};
    use pretty_assertions::assert_eq;
    use storage::SnapshotProvider;

    #[test]
    fn test_ddl_fixtures_commit_at_timestamp() {
        let ctx = TestContext::new().unwrap();
        let nss = nss!("app.users");
        let coll = create_collection(ctx.service(), &nss, ts!(10)).unwrap();
        assert_eq!(coll.minimum_valid_snapshot(), Some(ts!(10)));

        let with_index = create_index(ctx.service(), &nss, "x", ts!(20)).unwrap();
        assert_eq!(index_names(&with_index), vec!["x".to_string()]);
        assert_eq!(with_index.minimum_valid_snapshot(), Some(ts!(20)));
        assert!(Arc::ptr_eq(
            &ctx.catalog().find_collection_by_namespace(&nss).unwrap(),
            &with_index
        ));
    }

    #[test]
    fn test_failed_ddl_releases_locks() {
        let ctx = TestContext::new().unwrap();
        let nss = nss!("app.missing");
        let mut op = ctx.operation_context();
        let err = run_ddl(&mut op, &[&nss], ts!(1), |op| ddl::drop_collection(op, &nss)).unwrap_err();
        assert!(matches!(err, common::DbError::NamespaceNotFound(_)));
        assert!(!op.locker().is_locked());
        assert!(!op.in_write_unit_of_work());
    }

    #[test]
    fn test_reader_read_source() {
        let ctx = TestContext::new().unwrap();
        let op = reader(ctx.service(), Some(ts!(3)));
        assert_eq!(op.recovery_unit().read_source(), ReadSource::Provided(ts!(3)));
        let op = reader(ctx.service(), None);
        assert_eq!(op.recovery_unit().read_source(), ReadSource::NoTimestamp);
    }
}
