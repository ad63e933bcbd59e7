use super::*;
use common::{Config, DbError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::tempdir;
use types::{CollectionUuid, NamespaceString, Timestamp};

fn engine() -> Arc<StorageEngine> {
    StorageEngine::new(Config::default())
}

fn create_at(
    engine: &Arc<StorageEngine>,
    nss: &NamespaceString,
    ts: Timestamp,
) -> (types::CatalogId, CollectionMetadata) {
    let mut ru = engine.new_recovery_unit();
    ru.begin_unit_of_work();
    ru.set_commit_timestamp(ts);
    let ident = engine.create_ident(IdentKind::Collection);
    let metadata = CollectionMetadata::new(nss.clone(), CollectionUuid::generate());
    let id = engine
        .durable_catalog()
        .create_collection(&mut ru, ident.name(), metadata.clone())
        .unwrap();
    ru.commit_unit_of_work().unwrap();
    (id, metadata)
}

#[test]
fn timestamped_reads_see_history() {
    let engine = engine();
    let nss = NamespaceString::new("app", "users");
    let (id, mut metadata) = create_at(&engine, &nss, Timestamp::new(10, 0));

    let mut writer = engine.new_recovery_unit();
    writer.begin_unit_of_work();
    writer.set_commit_timestamp(Timestamp::new(20, 0));
    metadata
        .indexes
        .push(IndexMetadata::new("x_1", vec!["x".into()], "index-9"));
    engine
        .durable_catalog()
        .put_metadata(&mut writer, id, metadata.clone())
        .unwrap();
    writer.commit_unit_of_work().unwrap();

    let catalog = engine.durable_catalog();
    let mut reader = engine.new_recovery_unit();

    reader.set_read_source(ReadSource::Provided(Timestamp::new(5, 0)));
    assert!(catalog.get_parsed_catalog_entry(&mut reader, id).unwrap().is_none());

    reader.set_read_source(ReadSource::Provided(Timestamp::new(15, 0)));
    let entry = catalog.get_parsed_catalog_entry(&mut reader, id).unwrap().unwrap();
    assert!(entry.metadata.indexes.is_empty());

    reader.set_read_source(ReadSource::NoTimestamp);
    let entry = catalog.scan_for_catalog_entry_by_nss(&mut reader, &nss).unwrap().unwrap();
    assert_eq!(entry.metadata, metadata);
    let by_uuid = catalog
        .scan_for_catalog_entry_by_uuid(&mut reader, metadata.uuid)
        .unwrap()
        .unwrap();
    assert_eq!(by_uuid.catalog_id, id);
}

#[test]
fn open_snapshot_ignores_later_commits() {
    let engine = engine();
    let mut reader = engine.new_recovery_unit();
    assert!(!reader.has_open_snapshot());
    let _ = reader.read_view();
    assert!(reader.has_open_snapshot());

    let nss = NamespaceString::new("app", "late");
    create_at(&engine, &nss, Timestamp::MIN);

    let catalog = engine.durable_catalog();
    assert!(catalog.scan_for_catalog_entry_by_nss(&mut reader, &nss).unwrap().is_none());
    reader.abandon_snapshot();
    assert!(!reader.has_open_snapshot());
    assert!(catalog.scan_for_catalog_entry_by_nss(&mut reader, &nss).unwrap().is_some());
}

#[test]
fn staged_writes_are_private_until_commit() {
    let engine = engine();
    let nss = NamespaceString::new("app", "pending");
    let catalog = engine.durable_catalog();

    let mut writer = engine.new_recovery_unit();
    writer.begin_unit_of_work();
    let id = catalog
        .create_collection(&mut writer, "collection-1", CollectionMetadata::new(nss.clone(), CollectionUuid::generate()))
        .unwrap();
    assert!(catalog.get_parsed_catalog_entry(&mut writer, id).unwrap().is_some());

    let mut other = engine.new_recovery_unit();
    assert!(catalog.get_parsed_catalog_entry(&mut other, id).unwrap().is_none());

    writer.abort_unit_of_work();
    assert!(catalog.scan_for_catalog_entry_by_nss(&mut writer, &nss).unwrap().is_none());
}

#[test]
fn writes_outside_unit_of_work_fail() {
    let engine = engine();
    let mut ru = engine.new_recovery_unit();
    let err = engine
        .durable_catalog()
        .create_collection(&mut ru, "collection-1", CollectionMetadata::new(NamespaceString::new("a", "b"), CollectionUuid::generate()))
        .unwrap_err();
    assert!(matches!(err, DbError::Storage(_)));
}

#[test]
fn commit_runs_hooks_in_order() {
    let engine = engine();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut ru = engine.new_recovery_unit();
    ru.begin_unit_of_work();
    ru.set_commit_timestamp(Timestamp::new(7, 0));

    let log = Arc::clone(&order);
    ru.on_commit(move |ts| log.lock().push(format!("change {ts:?}")));
    let log = Arc::clone(&order);
    ru.register_pre_commit_hook(Box::new(move || {
        log.lock().push("pre-commit".into());
        Ok(())
    }));
    struct Visible(Arc<Mutex<Vec<String>>>);
    impl Change for Visible {
        fn commit(self: Box<Self>, _ts: Option<Timestamp>) {
            self.0.lock().push("visibility".into());
        }
        fn rollback(self: Box<Self>) {}
    }
    ru.register_catalog_visibility_change(Box::new(Visible(Arc::clone(&order))));
    ru.commit_unit_of_work().unwrap();

    assert_eq!(
        *order.lock(),
        vec![
            "pre-commit".to_string(),
            "visibility".to_string(),
            format!("change {:?}", Some(Timestamp::new(7, 0))),
        ]
    );
}

#[test]
fn failing_pre_commit_hook_rolls_back() {
    let engine = engine();
    let rolled_back = Arc::new(Mutex::new(false));
    let mut ru = engine.new_recovery_unit();
    ru.begin_unit_of_work();
    let nss = NamespaceString::new("app", "conflict");
    engine
        .durable_catalog()
        .create_collection(&mut ru, "collection-1", CollectionMetadata::new(nss.clone(), CollectionUuid::generate()))
        .unwrap();
    let flag = Arc::clone(&rolled_back);
    ru.on_rollback(move || *flag.lock() = true);
    ru.register_pre_commit_hook(Box::new(|| Err(DbError::WriteConflict("taken".into()))));

    let err = ru.commit_unit_of_work().unwrap_err();
    assert!(matches!(err, DbError::WriteConflict(_)));
    assert!(*rolled_back.lock());
    assert!(!ru.in_unit_of_work());
    assert!(engine
        .durable_catalog()
        .scan_for_catalog_entry_by_nss(&mut ru, &nss)
        .unwrap()
        .is_none());
}

#[test]
fn nested_units_commit_once() {
    let engine = engine();
    let commits = Arc::new(Mutex::new(0));
    let mut ru = engine.new_recovery_unit();
    ru.begin_unit_of_work();
    ru.begin_unit_of_work();
    let counter = Arc::clone(&commits);
    ru.on_commit(move |_| *counter.lock() += 1);
    ru.commit_unit_of_work().unwrap();
    assert_eq!(*commits.lock(), 0);
    assert!(ru.in_unit_of_work());
    ru.commit_unit_of_work().unwrap();
    assert_eq!(*commits.lock(), 1);
}

#[test]
fn dropped_idents_notify_listener() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.set_ident_dropped_listener(Box::new(move |name: &str| sink.lock().push(name.to_string())));

    let ident = engine.create_ident(IdentKind::Index);
    let name = ident.name().to_string();
    engine.add_drop_pending_ident(Timestamp::new(3, 0), &ident);
    drop(ident);

    assert_eq!(engine.drop_idents_older_than(Timestamp::new(2, 0)), Vec::<String>::new());
    assert_eq!(engine.drop_idents_older_than(Timestamp::new(3, 0)), vec![name.clone()]);
    assert!(!engine.has_ident(&name));
    assert_eq!(*seen.lock(), vec![name]);
}

#[test]
fn live_idents_share_one_handle() {
    let engine = engine();
    let created = engine.create_ident(IdentKind::Collection);
    let found = engine.get_ident(created.name()).unwrap();
    assert!(Arc::ptr_eq(&found, &created));
    assert!(engine.mark_ident_in_use(created.name()).is_none());

    let name = created.name().to_string();
    drop(found);
    drop(created);
    let fresh = engine.get_ident(&name).unwrap();
    assert!(Arc::ptr_eq(&fresh, &engine.get_ident(&name).unwrap()));
    assert!(engine.get_ident("collection-404").is_none());
}

#[test]
fn idents_are_not_handed_out_while_being_removed() {
    let engine = engine();
    let ident = engine.create_ident(IdentKind::Collection);
    let name = ident.name().to_string();
    engine.add_drop_pending_ident(Timestamp::new(3, 0), &ident);
    drop(ident);

    // Re-acquired through the reaper, so the held handle blocks removal.
    let reacquired = engine.get_ident(&name).unwrap();
    assert!(engine.drop_idents_older_than(Timestamp::new(5, 0)).is_empty());
    drop(reacquired);

    let mut acquired = Vec::new();
    let dropped = engine.reaper().drop_idents_older_than(Timestamp::new(5, 0), |name| {
        acquired.push(engine.get_ident(name));
        acquired.push(engine.mark_ident_in_use(name));
        engine.drop_ident(name)
    });
    assert_eq!(dropped, vec![name.clone()]);
    assert!(acquired.iter().all(Option::is_none));
    assert!(!engine.has_ident(&name));
    assert!(engine.get_ident(&name).is_none());
}

#[test_log::test]
fn checkpoint_round_trip() {
    let dir = tempdir().unwrap();
    let config = Config::builder().data_dir(dir.path().to_path_buf()).build();
    let engine = StorageEngine::new(config.clone());
    let nss = NamespaceString::new("app", "persisted");
    let (id, metadata) = create_at(&engine, &nss, Timestamp::new(4, 0));
    engine.checkpoint().unwrap();

    let reopened = StorageEngine::open(config).unwrap();
    let mut ru = reopened.new_recovery_unit();
    let entry = reopened
        .durable_catalog()
        .get_parsed_catalog_entry(&mut ru, id)
        .unwrap()
        .unwrap();
    assert_eq!(entry.metadata, metadata);
    assert!(reopened.has_ident(&entry.ident));
    assert!(reopened.durable_catalog().next_catalog_id() > id.0);
    assert_ne!(reopened.create_ident(IdentKind::Collection).name(), entry.ident);
}
