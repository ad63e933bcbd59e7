//! Catalog writes: collection and index DDL inside a write unit of work.
//!
//! Every operation stages its durable change in the operation's recovery unit
//! and records the new collection state as an uncommitted catalog update, so
//! the change becomes visible to others only when the unit of work commits.

use std::sync::Arc;

use common::{DbError, DbResult};
use storage::{CollectionMetadata, IdentKind, IndexMetadata, LockMode, SharedIdent, SnapshotProvider};
use tracing::{debug, warn};
use types::{CollectionUuid, NamespaceString};

use crate::{
    collection::Collection, collection_catalog::CollectionCatalog,
    operation_context::OperationContext, uncommitted,
};

pub fn create_collection(op: &mut OperationContext, nss: &NamespaceString) -> DbResult<Arc<Collection>> {
    assert_can_write(op, nss, LockMode::X);
    if CollectionCatalog::get(op).lookup_collection_by_namespace(op, nss).is_some() {
        return Err(DbError::NamespaceExists(nss.to_string()));
    }

    let engine = Arc::clone(op.service().engine());
    let ident = engine.create_ident(IdentKind::Collection);
    drop_ident_on_rollback(op, &ident);
    let metadata = CollectionMetadata::new(nss.clone(), CollectionUuid::generate());
    let catalog_id = engine.durable_catalog().create_collection(
        op.recovery_unit_mut(),
        ident.name(),
        metadata.clone(),
    )?;
    debug!(%nss, %catalog_id, ident = %ident, "creating collection");

    let collection = Arc::new(Collection::new(catalog_id, ident, metadata));
    uncommitted::on_create_collection(op, Arc::clone(&collection));
    Ok(collection)
}

/// Drop `nss` and its indexes. Storage is reclaimed by the reaper once the
/// drop timestamp is old enough and no reader holds the collection.
pub fn drop_collection(op: &mut OperationContext, nss: &NamespaceString) -> DbResult<()> {
    assert_can_write(op, nss, LockMode::X);
    let mut collection = lookup_for_write(op, nss)?;

    let index_names: Vec<String> = collection
        .index_catalog()
        .entries()
        .map(|entry| entry.name().to_string())
        .collect();
    for name in index_names {
        collection = drop_index_from(op, &collection, &name)?;
    }

    let engine = Arc::clone(op.service().engine());
    engine
        .durable_catalog()
        .drop_collection(op.recovery_unit_mut(), collection.catalog_id())?;
    debug!(%nss, uuid = %collection.uuid(), "dropping collection");
    uncommitted::on_drop_collection(op, &collection, true);
    Ok(())
}

/// Rename `from` to `to`. An existing `to` is dropped when `drop_target` is
/// set and is an error otherwise.
pub fn rename_collection(
    op: &mut OperationContext,
    from: &NamespaceString,
    to: &NamespaceString,
    drop_target: bool,
) -> DbResult<Arc<Collection>> {
    assert_can_write(op, from, LockMode::X);
    assert_can_write(op, to, LockMode::X);
    let collection = lookup_for_write(op, from)?;
    if CollectionCatalog::get(op).lookup_collection_by_namespace(op, to).is_some() {
        if !drop_target {
            return Err(DbError::NamespaceExists(to.to_string()));
        }
        drop_collection(op, to)?;
    }

    let renamed = Arc::new(collection.renamed(to.clone()));
    put_metadata(op, &renamed)?;
    debug!(%from, %to, uuid = %renamed.uuid(), "renaming collection");
    uncommitted::on_collection_rename(op, Arc::clone(&renamed), from);
    Ok(renamed)
}

/// Create a ready index.
pub fn create_index(
    op: &mut OperationContext,
    nss: &NamespaceString,
    name: &str,
    key: Vec<String>,
) -> DbResult<Arc<Collection>> {
    add_index(op, nss, name, key, true)
}

/// Add an index that stays hidden from ready-only lookups until
/// [`finish_index_build`].
pub fn start_index_build(
    op: &mut OperationContext,
    nss: &NamespaceString,
    name: &str,
    key: Vec<String>,
) -> DbResult<Arc<Collection>> {
    add_index(op, nss, name, key, false)
}

pub fn finish_index_build(
    op: &mut OperationContext,
    nss: &NamespaceString,
    name: &str,
) -> DbResult<Arc<Collection>> {
    assert_can_write(op, nss, LockMode::X);
    let collection = lookup_for_write(op, nss)?;
    let revision = collection
        .with_index_ready(name)
        .ok_or_else(|| index_not_found(nss, name))?;
    publish_revision(op, Arc::new(revision))
}

pub fn drop_index(op: &mut OperationContext, nss: &NamespaceString, name: &str) -> DbResult<Arc<Collection>> {
    assert_can_write(op, nss, LockMode::X);
    let collection = lookup_for_write(op, nss)?;
    drop_index_from(op, &collection, name)
}

/// Record whether the named index holds multikey entries.
pub fn set_index_multikey(
    op: &mut OperationContext,
    nss: &NamespaceString,
    name: &str,
    multikey: bool,
) -> DbResult<Arc<Collection>> {
    assert_can_write(op, nss, LockMode::IX);
    let collection = lookup_for_write(op, nss)?;
    match collection.is_multikey(name) {
        None => return Err(index_not_found(nss, name)),
        Some(current) if current == multikey => return Ok(collection),
        Some(_) => {}
    }
    let revision = collection
        .with_index_multikey(name, multikey)
        .ok_or_else(|| index_not_found(nss, name))?;
    publish_revision(op, Arc::new(revision))
}

fn add_index(
    op: &mut OperationContext,
    nss: &NamespaceString,
    name: &str,
    key: Vec<String>,
    ready: bool,
) -> DbResult<Arc<Collection>> {
    assert_can_write(op, nss, LockMode::X);
    let collection = lookup_for_write(op, nss)?;
    if collection.metadata().find_index_offset(name).is_some() {
        return Err(DbError::Catalog(format!("index '{name}' already exists on {nss}")));
    }

    let ident = op.service().engine().create_ident(IdentKind::Index);
    drop_ident_on_rollback(op, &ident);
    let mut index = IndexMetadata::new(name, key, ident.name());
    index.ready = ready;
    debug!(%nss, index = name, ready, ident = %ident, "adding index");
    publish_revision(op, Arc::new(collection.with_index(index, ident)))
}

fn drop_index_from(
    op: &mut OperationContext,
    collection: &Arc<Collection>,
    name: &str,
) -> DbResult<Arc<Collection>> {
    let (revision, entry) = collection
        .without_index(name)
        .ok_or_else(|| index_not_found(collection.ns(), name))?;
    let revision = Arc::new(revision);
    put_metadata(op, &revision)?;
    debug!(nss = %collection.ns(), index = name, "dropping index");
    uncommitted::on_drop_index(op, entry, true);
    uncommitted::on_writable_collection(op, Arc::clone(&revision));
    Ok(revision)
}

fn publish_revision(op: &mut OperationContext, revision: Arc<Collection>) -> DbResult<Arc<Collection>> {
    put_metadata(op, &revision)?;
    uncommitted::on_writable_collection(op, Arc::clone(&revision));
    Ok(revision)
}

fn put_metadata(op: &mut OperationContext, collection: &Collection) -> DbResult<()> {
    let engine = Arc::clone(op.service().engine());
    engine.durable_catalog().put_metadata(
        op.recovery_unit_mut(),
        collection.catalog_id(),
        collection.metadata().clone(),
    )
}

fn lookup_for_write(op: &OperationContext, nss: &NamespaceString) -> DbResult<Arc<Collection>> {
    CollectionCatalog::get(op)
        .lookup_collection_by_namespace(op, nss)
        .ok_or_else(|| DbError::NamespaceNotFound(nss.to_string()))
}

fn drop_ident_on_rollback(op: &mut OperationContext, ident: &SharedIdent) {
    let engine = Arc::clone(op.service().engine());
    let name = ident.name().to_string();
    op.recovery_unit_mut().on_rollback(move || {
        if let Err(err) = engine.drop_ident(&name) {
            warn!(ident = %name, error = %err, "failed to remove ident of rolled back write");
        }
    });
}

fn index_not_found(nss: &NamespaceString, name: &str) -> DbError {
    DbError::Catalog(format!("index '{name}' not found on {nss}"))
}

fn assert_can_write(op: &OperationContext, nss: &NamespaceString, mode: LockMode) {
    assert!(
        op.in_write_unit_of_work(),
        "catalog writes on {nss} require a write unit of work"
    );
    assert!(
        op.locker().is_collection_locked_for_mode(nss, mode),
        "catalog writes on {nss} require a {mode:?} collection lock"
    );
}
