//! Closing the in-memory catalog and rebuilding it from the durable catalog.

use std::sync::Arc;

use common::{DbError, DbResult};
use storage::{SharedIdent, StorageEngine};
use tracing::info;

use crate::{
    collection::Collection,
    operation_context::{OperationContext, ServiceContext},
};

/// Drop every collection from the published catalog and freeze uuid
/// resolution until [`open_catalog`]. Requires the global exclusive lock.
pub fn close_catalog(op: &mut OperationContext) {
    assert!(
        op.locker().is_w(),
        "closing the catalog requires the global exclusive lock"
    );
    op.service().catalog_store().write(|catalog| {
        catalog.on_close_catalog();
        catalog.deregister_all_collections();
    });
}

/// Re-register every durable collection and start a new epoch. Requires the
/// global exclusive lock and a closed catalog.
pub fn open_catalog(op: &mut OperationContext) -> DbResult<()> {
    assert!(
        op.locker().is_w(),
        "opening the catalog requires the global exclusive lock"
    );
    let collections = load_durable_collections(op.service().engine())?;
    let count = collections.len();
    op.service().catalog_store().write(|catalog| {
        for collection in collections {
            catalog.register_collection(collection, None);
        }
        catalog.on_open_catalog();
    });
    info!(collections = count, "reopened collection catalog");
    Ok(())
}

/// Populate a fresh service's catalog from its durable catalog.
pub fn init_from_durable(service: &Arc<ServiceContext>) -> DbResult<()> {
    let collections = load_durable_collections(service.engine())?;
    let count = collections.len();
    service.catalog_store().write(|catalog| {
        for collection in collections {
            catalog.register_collection(collection, None);
        }
    });
    info!(collections = count, "loaded collection catalog");
    Ok(())
}

fn load_durable_collections(engine: &Arc<StorageEngine>) -> DbResult<Vec<Arc<Collection>>> {
    let mut ru = engine.new_recovery_unit();
    let entries = engine.durable_catalog().all_entries(&mut ru)?;
    entries
        .into_iter()
        .map(|entry| {
            let ident = existing_ident(engine, &entry.ident)?;
            let mut missing = None;
            let collection = Collection::from_metadata(
                entry.catalog_id,
                ident,
                entry.metadata,
                |index| match existing_ident(engine, &index.ident) {
                    Ok(ident) => Some(ident),
                    Err(err) => {
                        missing = Some(err);
                        None
                    }
                },
            );
            match (collection, missing) {
                (Some(collection), _) => Ok(Arc::new(collection)),
                (None, Some(err)) => Err(err),
                (None, None) => Err(DbError::Catalog(format!(
                    "unable to rebuild collection {}",
                    entry.catalog_id
                ))),
            }
        })
        .collect()
}

fn existing_ident(engine: &StorageEngine, name: &str) -> DbResult<SharedIdent> {
    engine
        .get_ident(name)
        .ok_or_else(|| DbError::Catalog(format!("ident '{name}' is missing from storage")))
}
