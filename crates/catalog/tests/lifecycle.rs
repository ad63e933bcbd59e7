//! Closing and reopening the catalog, restarts, and catalog-wide listings.

use catalog::{CollectionCatalog, OperationContext, catalog_control};
use common::Config;
use pretty_assertions::assert_eq;
use storage::LockMode;
use testsupport::prelude::*;
use types::{DatabaseName, NamespaceString, NamespaceStringOrUuid, TenantId};

fn with_global_exclusive<R>(op: &mut OperationContext, f: impl FnOnce(&mut OperationContext) -> R) -> R {
    op.locker_mut().lock_global(LockMode::X);
    let result = f(op);
    op.locker_mut().unlock_global();
    result
}

#[test_log::test]
fn close_and_open_rebuilds_from_durable_catalog() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let users = nss!("app.users");
    let orders = nss!("app.orders");
    let users_uuid = create_collection(ctx.service(), &users, ts!(10))?.uuid();
    create_collection(ctx.service(), &orders, ts!(10))?;
    let before = create_index(ctx.service(), &orders, "x", ts!(20))?;
    let epoch = ctx.catalog().get_epoch();

    let mut op = ctx.operation_context();
    with_global_exclusive(&mut op, catalog_control::close_catalog);

    let closed = ctx.catalog();
    assert!(closed.is_closed());
    assert_eq!(closed.num_collections(), 0);
    assert!(closed.find_collection_by_uuid(users_uuid).is_none());
    assert_eq!(closed.find_nss_by_uuid(users_uuid), Some(users.clone()));
    assert_eq!(closed.get_epoch(), epoch);

    with_global_exclusive(&mut op, catalog_control::open_catalog)?;

    let reopened = ctx.catalog();
    assert!(!reopened.is_closed());
    assert_eq!(reopened.get_epoch(), epoch + 1);
    assert_eq!(reopened.num_collections(), 2);
    assert_eq!(reopened.find_nss_by_uuid(users_uuid), Some(users));

    let after = reopened.find_collection_by_namespace(&orders).unwrap();
    assert_distinct_collection(&after, &before);
    assert_eq!(after.uuid(), before.uuid());
    assert_eq!(after.ident_name(), before.ident_name());
    assert_index_names(&after, &["x"]);
    assert_consistent_with_durable(ctx.service(), &after);
    Ok(())
}

#[test]
fn uuids_of_dropped_collections_resolve_while_closed() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let nss = nss!("app.events");
    let uuid = create_collection(ctx.service(), &nss, ts!(10))?.uuid();
    drop_collection(ctx.service(), &nss, ts!(20))?;

    let mut op = ctx.operation_context();
    with_global_exclusive(&mut op, catalog_control::close_catalog);
    assert_eq!(ctx.catalog().find_nss_by_uuid(uuid), Some(nss));

    with_global_exclusive(&mut op, catalog_control::open_catalog)?;
    assert_eq!(ctx.catalog().find_nss_by_uuid(uuid), None);
    Ok(())
}

#[test]
fn every_open_starts_a_new_epoch() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let mut op = ctx.operation_context();
    for expected in 1..=3 {
        with_global_exclusive(&mut op, |op| {
            catalog_control::close_catalog(op);
            // A second close within the same cycle is a no-op.
            catalog_control::close_catalog(op);
            catalog_control::open_catalog(op)
        })?;
        assert_eq!(ctx.catalog().get_epoch(), expected);
    }
    Ok(())
}

#[test]
#[should_panic(expected = "global exclusive lock")]
fn closing_requires_the_global_exclusive_lock() {
    let ctx = TestContext::new().unwrap();
    let mut op = ctx.operation_context();
    op.locker_mut().lock_global(LockMode::IX);
    catalog_control::close_catalog(&mut op);
}

#[test]
#[should_panic(expected = "not closed")]
fn opening_an_open_catalog_panics() {
    let ctx = TestContext::new().unwrap();
    let mut op = ctx.operation_context();
    with_global_exclusive(&mut op, catalog_control::open_catalog).unwrap();
}

#[test]
fn restart_restores_the_latest_durable_state() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let kept = nss!("app.kept");
    let dropped = nss!("app.dropped");
    let renamed_from = nss!("app.before");
    let renamed_to = nss!("app.after");
    create_collection(ctx.service(), &kept, ts!(10))?;
    start_index_build(ctx.service(), &kept, "building", ts!(11))?;
    create_collection(ctx.service(), &dropped, ts!(10))?;
    drop_collection(ctx.service(), &dropped, ts!(12))?;
    let moved = create_collection(ctx.service(), &renamed_from, ts!(10))?.uuid();
    rename_collection(ctx.service(), &renamed_from, &renamed_to, false, ts!(13))?;

    let restarted = ctx.restart()?;
    let catalog = CollectionCatalog::latest(&restarted);
    assert_eq!(catalog.num_collections(), 2);
    assert!(catalog.find_collection_by_namespace(&dropped).is_none());
    assert_eq!(catalog.find_nss_by_uuid(moved), Some(renamed_to));

    let kept_coll = catalog.find_collection_by_namespace(&kept).unwrap();
    assert_eq!(kept_coll.index_catalog().num_indexes_in_progress(), 1);
    assert_eq!(kept_coll.minimum_valid_snapshot(), None);

    // New idents and catalog ids continue after the persisted ones.
    let fresh = create_collection(&restarted, &nss!("app.fresh"), ts!(20))?;
    assert!(fresh.catalog_id() > kept_coll.catalog_id());
    assert_ne!(fresh.ident_name(), kept_coll.ident_name());
    Ok(())
}

#[test]
fn open_fails_when_an_ident_is_missing() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let nss = nss!("app.users");
    let ident = create_collection(ctx.service(), &nss, ts!(10))?
        .ident_name()
        .to_string();
    ctx.engine().drop_ident(&ident)?;

    let mut op = ctx.operation_context();
    with_global_exclusive(&mut op, catalog_control::close_catalog);
    let result = with_global_exclusive(&mut op, catalog_control::open_catalog);
    assert_error_contains(result, "missing from storage");
    Ok(())
}

#[test]
fn range_is_stable_across_later_writes() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let db = DatabaseName::new("app");
    for name in ["c", "a", "b"] {
        create_collection(ctx.service(), &NamespaceString::from_db(db.clone(), name), ts!(10))?;
    }
    create_collection(ctx.service(), &nss!("apple.z"), ts!(10))?;

    let range = ctx.catalog().range(&db);
    create_collection(ctx.service(), &nss!("app.d"), ts!(20))?;
    drop_collection(ctx.service(), &nss!("app.a"), ts!(30))?;

    let names: Vec<&str> = range.iter().map(|c| c.ns().coll.as_str()).collect();
    assert_eq!(names, ["a", "b", "c"]);
    let names_again: Vec<&str> = (&range).into_iter().map(|c| c.ns().coll.as_str()).collect();
    assert_eq!(names_again, names);

    let current: Vec<String> = ctx
        .catalog()
        .get_all_collection_names_from_db(&db)
        .into_iter()
        .map(|nss| nss.coll)
        .collect();
    assert_eq!(current, ["b", "c", "d"]);
    Ok(())
}

#[test]
fn tenant_listings_follow_multitenancy_setting() -> anyhow::Result<()> {
    let tenant_db = DatabaseName::with_tenant(TenantId(7), "app");
    let tenant_nss = NamespaceString::from_db(tenant_db.clone(), "users");

    let ctx = TestContext::with_multitenancy()?;
    create_collection(ctx.service(), &nss!("plain.users"), ts!(1))?;
    create_collection(ctx.service(), &tenant_nss, ts!(1))?;
    let catalog = ctx.catalog();
    assert_eq!(catalog.get_all_db_names_for_tenant(Some(TenantId(7))), vec![tenant_db.clone()]);
    assert_eq!(
        catalog.get_all_db_names_for_tenant(None),
        vec![DatabaseName::new("plain")]
    );
    assert_eq!(catalog.get_all_tenants().into_iter().collect::<Vec<_>>(), vec![TenantId(7)]);

    let ctx = TestContext::with_config(Config::default())?;
    create_collection(ctx.service(), &nss!("plain.users"), ts!(1))?;
    create_collection(ctx.service(), &tenant_nss, ts!(1))?;
    let catalog = ctx.catalog();
    assert!(catalog.get_all_db_names_for_tenant(Some(TenantId(7))).is_empty());
    assert_eq!(catalog.get_all_db_names_for_tenant(None).len(), 2);
    assert!(catalog.get_all_tenants().is_empty());
    Ok(())
}

#[test]
fn resolve_namespace_or_uuid_at_latest() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let nss = nss!("app.users");
    let coll = create_collection(ctx.service(), &nss, ts!(10))?;
    let op = ctx.operation_context();
    let catalog = CollectionCatalog::get(&op);

    let by_uuid = NamespaceStringOrUuid::Uuid(DatabaseName::new("app"), coll.uuid());
    assert_eq!(catalog.resolve_namespace_string_or_uuid(&op, &by_uuid)?, nss);
    assert_eq!(catalog.resolve_namespace_string_or_uuid(&op, &(&nss).into())?, nss);

    let wrong_db = NamespaceStringOrUuid::Uuid(DatabaseName::new("other"), coll.uuid());
    assert_namespace_not_found(catalog.resolve_namespace_string_or_uuid(&op, &wrong_db));

    let unknown = NamespaceStringOrUuid::Uuid(DatabaseName::new("app"), types::CollectionUuid::generate());
    assert_namespace_not_found(catalog.resolve_namespace_string_or_uuid(&op, &unknown));
    Ok(())
}

#[test]
fn uncommitted_changes_are_visible_only_to_their_operation() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let nss = nss!("app.users");
    let existing = create_collection(ctx.service(), &nss, ts!(10))?;

    let mut writer = ctx.operation_context();
    lock_for_ddl(&mut writer, &[&nss]);
    {
        let mut wuow = catalog::WriteUnitOfWork::new(&mut writer);
        let revision = catalog::ddl::create_index(&mut wuow, &nss, "x", vec!["x".into()])?;
        let catalog = CollectionCatalog::get(&wuow);
        let mine = catalog.lookup_collection_by_namespace(&wuow, &nss).unwrap();
        assert_same_collection(&mine, &revision);

        let other = ctx.operation_context();
        let theirs = catalog.lookup_collection_by_namespace(&other, &nss).unwrap();
        assert_same_collection(&theirs, &existing);
        // Dropped without commit: rolled back.
    }
    unlock_after_ddl(&mut writer, &[&nss]);

    assert!(writer.uncommitted().lock().is_empty());
    let latest = ctx.catalog().find_collection_by_namespace(&nss).unwrap();
    assert_same_collection(&latest, &existing);
    Ok(())
}
