//! Catalog changes made inside a write unit of work, and their two-phase
//! publication at commit.

use std::{mem, sync::Arc};

use common::{DbError, DbResult};
use parking_lot::Mutex;
use storage::{Change, SharedIdent, SnapshotProvider, StorageEngine};
use tracing::{debug, trace};
use types::{CollectionUuid, NamespaceString, Timestamp};

use crate::{
    collection::{Collection, IndexCatalogEntry},
    collection_catalog::CollectionCatalog,
    operation_context::{CatalogStore, OperationContext},
};

#[derive(Debug)]
pub enum UncommittedEntry {
    Created(Arc<Collection>),
    /// New revision of a registered collection.
    Writable(Arc<Collection>),
    Renamed {
        from: NamespaceString,
        collection: Arc<Collection>,
    },
    Dropped {
        nss: NamespaceString,
        uuid: CollectionUuid,
        ident: SharedIdent,
        is_drop_pending: bool,
    },
    DroppedIndex {
        entry: Arc<IndexCatalogEntry>,
        is_drop_pending: bool,
    },
}

/// Catalog changes of one operation that are not yet published.
#[derive(Debug, Default)]
pub struct UncommittedCatalogUpdates {
    entries: Vec<UncommittedEntry>,
    registered: bool,
    precommitted: bool,
}

impl UncommittedCatalogUpdates {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[UncommittedEntry] {
        &self.entries
    }

    /// This operation's view of `nss`: `Some(None)` when it dropped or renamed
    /// it away, `None` when it did not touch it.
    pub fn lookup_collection_by_namespace(&self, nss: &NamespaceString) -> Option<Option<Arc<Collection>>> {
        self.entries.iter().rev().find_map(|entry| match entry {
            UncommittedEntry::Created(c) | UncommittedEntry::Writable(c) if c.ns() == nss => {
                Some(Some(Arc::clone(c)))
            }
            UncommittedEntry::Renamed { collection, .. } if collection.ns() == nss => {
                Some(Some(Arc::clone(collection)))
            }
            UncommittedEntry::Renamed { from, .. } if from == nss => Some(None),
            UncommittedEntry::Dropped { nss: dropped, .. } if dropped == nss => Some(None),
            _ => None,
        })
    }

    pub fn lookup_collection_by_uuid(&self, uuid: CollectionUuid) -> Option<Option<Arc<Collection>>> {
        self.entries.iter().rev().find_map(|entry| match entry {
            UncommittedEntry::Created(c)
            | UncommittedEntry::Writable(c)
            | UncommittedEntry::Renamed { collection: c, .. }
                if c.uuid() == uuid =>
            {
                Some(Some(Arc::clone(c)))
            }
            UncommittedEntry::Dropped { uuid: dropped, .. } if *dropped == uuid => Some(None),
            _ => None,
        })
    }

    // Namespaces and uuids whose published state changes at commit, with the
    // collection each one will map to. Later entries win.
    fn pending_keys(&self) -> (Vec<(NamespaceString, Option<Arc<Collection>>)>, Vec<(CollectionUuid, Option<Arc<Collection>>)>) {
        let mut namespaces = Vec::new();
        let mut uuids = Vec::new();
        for entry in &self.entries {
            match entry {
                UncommittedEntry::Created(c) | UncommittedEntry::Writable(c) => {
                    namespaces.push((c.ns().clone(), Some(Arc::clone(c))));
                    uuids.push((c.uuid(), Some(Arc::clone(c))));
                }
                UncommittedEntry::Renamed { from, collection } => {
                    namespaces.push((from.clone(), None));
                    namespaces.push((collection.ns().clone(), Some(Arc::clone(collection))));
                    uuids.push((collection.uuid(), Some(Arc::clone(collection))));
                }
                UncommittedEntry::Dropped { nss, uuid, .. } => {
                    namespaces.push((nss.clone(), None));
                    uuids.push((*uuid, None));
                }
                UncommittedEntry::DroppedIndex { .. } => {}
            }
        }
        (namespaces, uuids)
    }

    fn release(&mut self) -> Vec<UncommittedEntry> {
        self.registered = false;
        self.precommitted = false;
        mem::take(&mut self.entries)
    }
}

pub fn on_create_collection(op: &mut OperationContext, collection: Arc<Collection>) {
    record(op, UncommittedEntry::Created(collection));
}

pub fn on_writable_collection(op: &mut OperationContext, collection: Arc<Collection>) {
    record(op, UncommittedEntry::Writable(collection));
}

pub fn on_collection_rename(op: &mut OperationContext, collection: Arc<Collection>, from: &NamespaceString) {
    record(
        op,
        UncommittedEntry::Renamed {
            from: from.clone(),
            collection,
        },
    );
}

pub fn on_drop_collection(op: &mut OperationContext, collection: &Collection, is_drop_pending: bool) {
    record(
        op,
        UncommittedEntry::Dropped {
            nss: collection.ns().clone(),
            uuid: collection.uuid(),
            ident: Arc::clone(collection.shared_ident()),
            is_drop_pending,
        },
    );
}

pub fn on_drop_index(op: &mut OperationContext, entry: Arc<IndexCatalogEntry>, is_drop_pending: bool) {
    record(
        op,
        UncommittedEntry::DroppedIndex {
            entry,
            is_drop_pending,
        },
    );
}

fn record(op: &mut OperationContext, entry: UncommittedEntry) {
    assert!(
        op.in_write_unit_of_work(),
        "catalog updates require a write unit of work"
    );
    trace!(?entry, "recording uncommitted catalog update");
    let needs_registration = {
        let mut updates = op.uncommitted().lock();
        updates.entries.push(entry);
        !mem::replace(&mut updates.registered, true)
    };
    if needs_registration {
        register_publish_hooks(op);
    }
}

fn register_publish_hooks(op: &mut OperationContext) {
    let store = Arc::clone(op.service().catalog_store());
    let engine = Arc::clone(op.service().engine());
    let updates = Arc::clone(op.uncommitted());

    let pre_commit_store = Arc::clone(&store);
    let pre_commit_updates = Arc::clone(&updates);
    op.recovery_unit_mut()
        .register_pre_commit_hook(Box::new(move || {
            let mut updates = pre_commit_updates.lock();
            pre_commit_store.try_write(|catalog| mark_pending_commit(catalog, &updates))?;
            updates.precommitted = true;
            Ok(())
        }));
    op.recovery_unit_mut()
        .register_catalog_visibility_change(Box::new(PublishCatalogUpdates {
            store,
            engine,
            updates,
        }));
}

fn mark_pending_commit(catalog: &mut CollectionCatalog, updates: &UncommittedCatalogUpdates) -> DbResult<()> {
    for entry in &updates.entries {
        match entry {
            UncommittedEntry::Created(collection) | UncommittedEntry::Renamed { collection, .. } => {
                ensure_namespace_is_free(catalog, updates, collection.ns())?
            }
            _ => {}
        }
    }
    let (namespaces, uuids) = updates.pending_keys();
    for (nss, collection) in namespaces {
        catalog.mark_pending_namespace(nss, collection);
    }
    for (uuid, collection) in uuids {
        catalog.mark_pending_uuid(uuid, collection);
    }
    Ok(())
}

// A namespace this operation creates or renames onto must not be taken by a
// published collection or by another operation's commit in flight, unless
// this operation itself dropped or renamed the current holder away.
fn ensure_namespace_is_free(
    catalog: &CollectionCatalog,
    updates: &UncommittedCatalogUpdates,
    nss: &NamespaceString,
) -> DbResult<()> {
    let released_here = updates.entries.iter().any(|entry| match entry {
        UncommittedEntry::Dropped { nss: dropped, .. } => dropped == nss,
        UncommittedEntry::Renamed { from, .. } => from == nss,
        _ => false,
    });
    if released_here {
        return Ok(());
    }
    if catalog.find_collection_by_namespace(nss).is_some() {
        return Err(DbError::WriteConflict(format!("{nss} was created concurrently")));
    }
    if let Some(Some(_)) = catalog.pending_commit_namespace(nss) {
        return Err(DbError::WriteConflict(format!("{nss} is being created concurrently")));
    }
    Ok(())
}

/// Publishes an operation's catalog changes at storage commit.
struct PublishCatalogUpdates {
    store: Arc<CatalogStore>,
    engine: Arc<StorageEngine>,
    updates: Arc<Mutex<UncommittedCatalogUpdates>>,
}

impl PublishCatalogUpdates {
    // Dropped idents reach the reaper before the catalog forgets their
    // collections, so a reader rebuilding one in between is tracked.
    // Untimestamped drops become reapable immediately.
    fn register_drop_pending_idents(&self, entries: &[UncommittedEntry], commit_ts: Option<Timestamp>) {
        let drop_ts = commit_ts.unwrap_or(Timestamp::MIN);
        for entry in entries {
            match entry {
                UncommittedEntry::Dropped {
                    ident,
                    is_drop_pending: true,
                    ..
                } => self.engine.add_drop_pending_ident(drop_ts, ident),
                UncommittedEntry::DroppedIndex {
                    entry: index,
                    is_drop_pending: true,
                } => self.engine.add_drop_pending_ident(drop_ts, index.shared_ident()),
                _ => {}
            }
        }
    }
}

impl Change for PublishCatalogUpdates {
    fn commit(self: Box<Self>, commit_ts: Option<Timestamp>) {
        let (entries, (namespaces, uuids)) = {
            let mut updates = self.updates.lock();
            let keys = updates.pending_keys();
            (updates.release(), keys)
        };
        debug!(entries = entries.len(), ?commit_ts, "publishing catalog updates");
        self.register_drop_pending_idents(&entries, commit_ts);
        self.store.write(|catalog| {
            for entry in entries {
                match entry {
                    UncommittedEntry::Created(collection) => {
                        catalog.register_collection(collection, commit_ts)
                    }
                    UncommittedEntry::Writable(collection) => {
                        catalog.publish_collection_revision(collection, commit_ts)
                    }
                    UncommittedEntry::Renamed { from, collection } => {
                        catalog.on_collection_rename(collection, &from, commit_ts)
                    }
                    UncommittedEntry::Dropped {
                        uuid,
                        is_drop_pending,
                        ..
                    } => {
                        catalog.deregister_collection(uuid, is_drop_pending, commit_ts);
                    }
                    UncommittedEntry::DroppedIndex {
                        entry,
                        is_drop_pending,
                    } => {
                        if is_drop_pending {
                            catalog.deregister_index(&entry);
                        }
                    }
                }
            }
            for (nss, _) in &namespaces {
                catalog.clear_pending_namespace(nss);
            }
            for (uuid, _) in &uuids {
                catalog.clear_pending_uuid(*uuid);
            }
        });
    }

    fn rollback(self: Box<Self>) {
        let (precommitted, (namespaces, uuids)) = {
            let mut updates = self.updates.lock();
            let precommitted = updates.precommitted;
            let keys = updates.pending_keys();
            updates.release();
            (precommitted, keys)
        };
        if !precommitted {
            return;
        }
        debug!("rolling back pending catalog updates");
        self.store.write(|catalog| {
            for (nss, _) in &namespaces {
                catalog.clear_pending_namespace(nss);
            }
            for (uuid, _) in &uuids {
                catalog.clear_pending_uuid(*uuid);
            }
        });
    }
}
