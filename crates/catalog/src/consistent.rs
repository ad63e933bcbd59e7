//! Establishing collection instances that match an operation's storage
//! snapshot, either at a point in time or at latest while other operations
//! are committing catalog changes.

use std::{collections::BTreeSet, sync::Arc};

use common::DbResult;
use storage::{DurableCatalogEntry, ReadSource, SharedIdent, StorageEngine};
use tracing::{debug, trace};
use types::{DatabaseName, NamespaceStringOrUuid, Timestamp};

use crate::{
    catalog_id_tracker::CatalogIdLookup,
    collection::Collection,
    collection_catalog::CollectionCatalog,
    operation_context::OperationContext,
};

impl CollectionCatalog {
    /// The collection `key` refers to in `op`'s snapshot, opened from the
    /// durable catalog when the shared catalog cannot serve it.
    ///
    /// `read_ts` defaults to the recovery unit's read timestamp; a different
    /// timestamp switches the operation to read at it. The result is recorded
    /// in the operation's opened collections, so later lookups by namespace
    /// or uuid agree with it until the snapshot is released.
    ///
    /// Panics inside a write unit of work.
    pub fn establish_consistent_collection(
        &self,
        op: &mut OperationContext,
        key: &NamespaceStringOrUuid,
        read_ts: Option<Timestamp>,
    ) -> DbResult<Option<Arc<Collection>>> {
        assert!(
            !op.in_write_unit_of_work(),
            "cannot establish a consistent collection inside a write unit of work"
        );
        if let Some(ts) = read_ts {
            if op.recovery_unit().read_timestamp() != Some(ts) {
                op.set_read_source(ReadSource::Provided(ts));
            }
        }
        let read_ts = op.recovery_unit().read_timestamp();

        if !self.needs_open_collection(op, key, read_ts) {
            return Ok(self.lookup_collection_by_namespace_or_uuid(op, key));
        }
        match read_ts {
            Some(ts) => self.open_collection_at_point_in_time(op, key, ts),
            None => self.open_collection_at_latest(op, key),
        }
    }

    /// Establish every collection of `db` that exists either in this catalog
    /// or in `op`'s durable snapshot.
    pub fn establish_consistent_collections(
        &self,
        op: &mut OperationContext,
        db: &DatabaseName,
    ) -> DbResult<()> {
        let mut uuids: BTreeSet<_> = self.get_all_collection_uuids_from_db(db).into_iter().collect();
        let engine = Arc::clone(op.service().engine());
        for entry in engine.durable_catalog().all_entries(op.recovery_unit_mut())? {
            if entry.metadata.nss.db_name() == db {
                uuids.insert(entry.metadata.uuid);
            }
        }
        for uuid in uuids {
            self.establish_consistent_collection(
                op,
                &NamespaceStringOrUuid::Uuid(db.clone(), uuid),
                None,
            )?;
        }
        Ok(())
    }

    fn needs_open_collection(
        &self,
        op: &OperationContext,
        key: &NamespaceStringOrUuid,
        read_ts: Option<Timestamp>,
    ) -> bool {
        if op.opened_collections().contains(key) {
            return false;
        }
        match read_ts {
            Some(ts) => self
                .lookup_collection_by_namespace_or_uuid(op, key)
                .is_none_or(|collection| !collection.is_valid_at(ts)),
            None => self.is_pending_commit(key),
        }
    }

    fn open_collection_at_point_in_time(
        &self,
        op: &mut OperationContext,
        key: &NamespaceStringOrUuid,
        ts: Timestamp,
    ) -> DbResult<Option<Arc<Collection>>> {
        let collection = match self.fetch_catalog_entry(op, key, ts)? {
            Some(entry) => self.instantiate(op, &entry, Some(ts)),
            None => None,
        };
        debug!(%key, %ts, found = collection.is_some(), "opened collection at point in time");
        store_opened(op, key, collection.as_ref());
        Ok(collection)
    }

    fn fetch_catalog_entry(
        &self,
        op: &mut OperationContext,
        key: &NamespaceStringOrUuid,
        ts: Timestamp,
    ) -> DbResult<Option<DurableCatalogEntry>> {
        let lookup = if self.is_pending_commit(key) {
            CatalogIdLookup::Unknown
        } else {
            match key {
                NamespaceStringOrUuid::Nss(nss) => {
                    self.catalog_id_tracker().lookup_by_nss(nss, Some(ts))
                }
                NamespaceStringOrUuid::Uuid(_, uuid) => {
                    self.catalog_id_tracker().lookup_by_uuid(*uuid, Some(ts))
                }
            }
        };
        trace!(%key, %ts, ?lookup, "catalog id lookup");
        match lookup {
            CatalogIdLookup::NotExists => Ok(None),
            CatalogIdLookup::Exists(catalog_id) => {
                let engine = Arc::clone(op.service().engine());
                let entry = engine
                    .durable_catalog()
                    .get_parsed_catalog_entry(op.recovery_unit_mut(), catalog_id)?;
                match entry {
                    Some(entry) if entry_matches(&entry, key) => Ok(Some(entry)),
                    _ => scan_catalog_entry(op, key),
                }
            }
            CatalogIdLookup::Unknown => scan_catalog_entry(op, key),
        }
    }

    fn open_collection_at_latest(
        &self,
        op: &mut OperationContext,
        key: &NamespaceStringOrUuid,
    ) -> DbResult<Option<Arc<Collection>>> {
        let collection = self.open_latest(op, key)?;

        // Every other key with a commit in flight has to agree with the
        // snapshot the requested one was resolved against.
        for related in self.pending_commit_keys(key.db_name()) {
            if !op.opened_collections().contains(&related) {
                self.open_latest(op, &related)?;
            }
        }
        Ok(collection)
    }

    fn open_latest(
        &self,
        op: &mut OperationContext,
        key: &NamespaceStringOrUuid,
    ) -> DbResult<Option<Arc<Collection>>> {
        let collection = match scan_catalog_entry(op, key)? {
            Some(entry) => self.resolve_latest(op, &entry),
            None => None,
        };
        trace!(%key, found = collection.is_some(), "opened collection at latest");
        store_opened(op, key, collection.as_ref());
        Ok(collection)
    }

    fn resolve_latest(
        &self,
        op: &OperationContext,
        entry: &DurableCatalogEntry,
    ) -> Option<Arc<Collection>> {
        let uuid = entry.metadata.uuid;
        if let Some(Some(opened)) = op.opened_collections().lookup_by_uuid(uuid) {
            if describes(&opened, entry) {
                return Some(opened);
            }
        }

        let pending_by_nss = self
            .pending_commit_namespace(&entry.metadata.nss)
            .flatten()
            .filter(|collection| collection.uuid() == uuid);
        let candidates = [
            self.find_collection_by_uuid(uuid),
            self.pending_commit_uuid(uuid).flatten(),
            pending_by_nss,
        ];
        if let Some(found) = candidates
            .into_iter()
            .flatten()
            .find(|collection| describes(collection, entry))
        {
            return Some(found);
        }
        self.create_compatible_collection(op, entry)
            .or_else(|| self.create_new_collection(op, entry))
    }

    // Reuse or rebuild from the shared catalog before touching the reaper.
    fn instantiate(
        &self,
        op: &OperationContext,
        entry: &DurableCatalogEntry,
        ts: Option<Timestamp>,
    ) -> Option<Arc<Collection>> {
        if let Some(latest) = self.find_collection_by_uuid(entry.metadata.uuid) {
            let valid = ts.is_none_or(|ts| latest.is_valid_at(ts));
            if valid && describes(&latest, entry) {
                return Some(latest);
            }
        }
        self.create_compatible_collection(op, entry)
            .or_else(|| self.create_new_collection(op, entry))
    }

    /// An instance for `entry` sharing idents with the live or drop-pending
    /// collection of the same catalog id.
    fn create_compatible_collection(
        &self,
        op: &OperationContext,
        entry: &DurableCatalogEntry,
    ) -> Option<Arc<Collection>> {
        let uuid = entry.metadata.uuid;
        let drop_pending = self.find_drop_pending_collection(uuid);
        if let Some(dropped) = &drop_pending {
            if describes(dropped, entry) {
                return Some(Arc::clone(dropped));
            }
        }
        let same_storage = |collection: &Arc<Collection>| {
            collection.catalog_id() == entry.catalog_id && collection.ident_name() == entry.ident
        };
        let base = self
            .find_collection_by_uuid(uuid)
            .filter(same_storage)
            .or_else(|| drop_pending.filter(same_storage))?;
        let collection =
            self.build_collection(op.service().engine(), entry, Arc::clone(base.shared_ident()), Some(&base));
        trace!(nss = %entry.metadata.nss, built = collection.is_some(), "created compatible collection");
        collection
    }

    /// An instance for `entry` whose idents are re-acquired from storage.
    fn create_new_collection(
        &self,
        op: &OperationContext,
        entry: &DurableCatalogEntry,
    ) -> Option<Arc<Collection>> {
        let engine = op.service().engine();
        let Some(ident) = engine.get_ident(&entry.ident) else {
            debug!(nss = %entry.metadata.nss, ident = %entry.ident, "collection ident already dropped");
            return None;
        };
        self.build_collection(engine, entry, ident, None)
    }

    fn build_collection(
        &self,
        engine: &Arc<StorageEngine>,
        entry: &DurableCatalogEntry,
        ident: SharedIdent,
        base: Option<&Arc<Collection>>,
    ) -> Option<Arc<Collection>> {
        Collection::from_metadata(entry.catalog_id, ident, entry.metadata.clone(), |index| {
            base.and_then(|base| base.index_catalog().find_index_by_ident(&index.ident))
                .map(|existing| Arc::clone(existing.shared_ident()))
                .or_else(|| {
                    self.find_drop_pending_index(&index.ident)
                        .map(|dropped| Arc::clone(dropped.shared_ident()))
                })
                .or_else(|| engine.get_ident(&index.ident))
        })
        .map(Arc::new)
    }

    // Keys of `db` touched by in-flight commits, plus the other key of every
    // collection involved.
    fn pending_commit_keys(&self, db: &DatabaseName) -> Vec<NamespaceStringOrUuid> {
        fn push_collection(keys: &mut Vec<NamespaceStringOrUuid>, collection: &Collection) {
            keys.push(NamespaceStringOrUuid::Nss(collection.ns().clone()));
            keys.push(NamespaceStringOrUuid::Uuid(
                collection.ns().db_name().clone(),
                collection.uuid(),
            ));
        }

        let mut keys = Vec::new();

        for nss in self.pending_commit_namespaces() {
            keys.push(NamespaceStringOrUuid::Nss(nss.clone()));
            if let Some(Some(collection)) = self.pending_commit_namespace(nss) {
                push_collection(&mut keys, &collection);
            }
            if let Some(collection) = self.find_collection_by_namespace(nss) {
                push_collection(&mut keys, &collection);
            }
        }
        for uuid in self.pending_commit_uuids() {
            let owner = self
                .pending_commit_uuid(*uuid)
                .flatten()
                .map(|collection| collection.ns().db_name().clone())
                .or_else(|| self.find_nss_by_uuid(*uuid).map(|nss| nss.db_name().clone()))
                .unwrap_or_else(|| db.clone());
            keys.push(NamespaceStringOrUuid::Uuid(owner, *uuid));
            if let Some(Some(collection)) = self.pending_commit_uuid(*uuid) {
                push_collection(&mut keys, &collection);
            }
            if let Some(collection) = self.find_collection_by_uuid(*uuid) {
                push_collection(&mut keys, &collection);
            }
        }
        keys
    }
}

fn store_opened(op: &mut OperationContext, key: &NamespaceStringOrUuid, collection: Option<&Arc<Collection>>) {
    match collection {
        Some(collection) => op.opened_collections_mut().store(Arc::clone(collection)),
        None => op.opened_collections_mut().store_absent(key),
    }
}

fn scan_catalog_entry(
    op: &mut OperationContext,
    key: &NamespaceStringOrUuid,
) -> DbResult<Option<DurableCatalogEntry>> {
    let engine = Arc::clone(op.service().engine());
    let durable = engine.durable_catalog();
    match key {
        NamespaceStringOrUuid::Nss(nss) => {
            durable.scan_for_catalog_entry_by_nss(op.recovery_unit_mut(), nss)
        }
        NamespaceStringOrUuid::Uuid(_, uuid) => {
            durable.scan_for_catalog_entry_by_uuid(op.recovery_unit_mut(), *uuid)
        }
    }
}

fn entry_matches(entry: &DurableCatalogEntry, key: &NamespaceStringOrUuid) -> bool {
    match key {
        NamespaceStringOrUuid::Nss(nss) => &entry.metadata.nss == nss,
        NamespaceStringOrUuid::Uuid(_, uuid) => entry.metadata.uuid == *uuid,
    }
}

fn describes(collection: &Collection, entry: &DurableCatalogEntry) -> bool {
    collection.catalog_id() == entry.catalog_id && collection.is_metadata_equal(&entry.metadata)
}
