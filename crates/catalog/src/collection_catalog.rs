use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

use common::Config;
use imbl::OrdMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use types::{
    CollectionUuid, DatabaseName, NamespaceString, NamespaceStringOrUuid, TenantId, Timestamp,
};

use crate::{
    catalog_id_tracker::HistoricalCatalogIdTracker,
    collection::{Collection, IndexCatalogEntry},
};

/// Profiler configuration of one database.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub level: i32,
    pub filter: Option<ProfileFilter>,
}

/// Opaque filter expression applied to profiled operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFilter(pub String);

#[derive(Clone, Copy, Debug)]
struct CatalogSettings {
    multitenancy_support: bool,
    default_profile_level: i32,
}

/// A dropped collection kept reachable for historical reads while someone
/// still holds it.
#[derive(Clone, Debug)]
pub struct DropPendingCollection {
    pub nss: NamespaceString,
    pub ident: String,
    pub collection: Weak<Collection>,
    pub drop_ts: Option<Timestamp>,
}

/// One immutable version of the collection catalog.
///
/// Writers clone the current version (cheap: every map is persistent), apply
/// their change and publish the result; readers keep whatever version they
/// loaded for as long as they need it.
#[derive(Clone)]
pub struct CollectionCatalog {
    catalog: OrdMap<CollectionUuid, Arc<Collection>>,
    collections: OrdMap<NamespaceString, Arc<Collection>>,
    pending_commit_namespaces: OrdMap<NamespaceString, Option<Arc<Collection>>>,
    pending_commit_uuids: OrdMap<CollectionUuid, Option<Arc<Collection>>>,
    drop_pending_collections: OrdMap<CollectionUuid, DropPendingCollection>,
    drop_pending_indexes: OrdMap<String, Weak<IndexCatalogEntry>>,
    shadow_catalog: Option<OrdMap<CollectionUuid, NamespaceString>>,
    catalog_id_tracker: HistoricalCatalogIdTracker,
    epoch: u64,
    profile_settings: OrdMap<DatabaseName, ProfileSettings>,
    settings: CatalogSettings,
}

impl CollectionCatalog {
    pub fn new(config: &Config) -> Self {
        Self {
            catalog: OrdMap::new(),
            collections: OrdMap::new(),
            pending_commit_namespaces: OrdMap::new(),
            pending_commit_uuids: OrdMap::new(),
            drop_pending_collections: OrdMap::new(),
            drop_pending_indexes: OrdMap::new(),
            shadow_catalog: None,
            catalog_id_tracker: HistoricalCatalogIdTracker::new(),
            epoch: 0,
            profile_settings: OrdMap::new(),
            settings: CatalogSettings {
                multitenancy_support: config.multitenancy_support,
                default_profile_level: config.default_profile_level,
            },
        }
    }

    /// Insert a newly created collection.
    ///
    /// Panics if the uuid or the namespace is already registered.
    pub fn register_collection(&mut self, collection: Arc<Collection>, commit_ts: Option<Timestamp>) {
        let uuid = collection.uuid();
        let nss = collection.ns().clone();
        assert!(
            !self.catalog.contains_key(&uuid),
            "conflicting uuid {uuid} already registered"
        );
        assert!(
            !self.collections.contains_key(&nss),
            "namespace {nss} already registered"
        );
        if let Some(ts) = commit_ts {
            collection.set_minimum_valid_snapshot(ts);
        }
        debug!(%nss, %uuid, ?commit_ts, "registering collection");

        self.catalog_id_tracker
            .create(&nss, uuid, collection.catalog_id(), commit_ts);
        self.catalog.insert(uuid, Arc::clone(&collection));
        self.collections.insert(nss.clone(), collection);
        self.pending_commit_namespaces.remove(&nss);
        self.pending_commit_uuids.remove(&uuid);
    }

    /// Remove a collection from the live view. Drop-pending collections stay
    /// reachable for historical reads while they are referenced.
    ///
    /// Panics if the uuid is unknown.
    pub fn deregister_collection(
        &mut self,
        uuid: CollectionUuid,
        is_drop_pending: bool,
        commit_ts: Option<Timestamp>,
    ) -> Arc<Collection> {
        let collection = self
            .catalog
            .remove(&uuid)
            .unwrap_or_else(|| panic!("deregistering unknown collection {uuid}"));
        let nss = collection.ns().clone();
        debug!(%nss, %uuid, is_drop_pending, ?commit_ts, "deregistering collection");

        self.collections.remove(&nss);
        self.pending_commit_namespaces.remove(&nss);
        self.pending_commit_uuids.remove(&uuid);
        self.catalog_id_tracker.drop(&nss, uuid, commit_ts);

        if is_drop_pending {
            self.drop_pending_collections.insert(
                uuid,
                DropPendingCollection {
                    nss,
                    ident: collection.ident_name().to_string(),
                    collection: Arc::downgrade(&collection),
                    drop_ts: commit_ts,
                },
            );
            for entry in collection.index_catalog().entries() {
                self.drop_pending_indexes
                    .insert(entry.ident_name().to_string(), Arc::downgrade(entry));
            }
        }
        collection
    }

    /// Move `collection` from `from` to its current namespace. The uuid keeps
    /// pointing at `collection`.
    pub fn on_collection_rename(
        &mut self,
        collection: Arc<Collection>,
        from: &NamespaceString,
        commit_ts: Option<Timestamp>,
    ) {
        let uuid = collection.uuid();
        let to = collection.ns().clone();
        assert_ne!(from, &to, "renaming {from} onto itself");
        if let Some(previous) = self.collections.get(from) {
            assert_eq!(previous.uuid(), uuid, "{from} does not belong to {uuid}");
            self.collections.remove(from);
        }
        if let Some(ts) = commit_ts {
            collection.set_minimum_valid_snapshot(ts);
        }
        info!(%from, %to, %uuid, ?commit_ts, "renamed collection");

        self.catalog_id_tracker
            .rename(from, &to, collection.catalog_id(), commit_ts);
        self.catalog.insert(uuid, Arc::clone(&collection));
        self.collections.insert(to.clone(), collection);
        for nss in [from, &to] {
            self.pending_commit_namespaces.remove(nss);
        }
        self.pending_commit_uuids.remove(&uuid);
    }

    /// Replace the published revision of an already registered collection.
    pub fn publish_collection_revision(
        &mut self,
        collection: Arc<Collection>,
        commit_ts: Option<Timestamp>,
    ) {
        let uuid = collection.uuid();
        let nss = collection.ns().clone();
        let previous = self
            .catalog
            .get(&uuid)
            .unwrap_or_else(|| panic!("publishing revision of unknown collection {uuid}"));
        assert_eq!(previous.ns(), &nss, "revision of {uuid} changed namespace");
        if let Some(ts) = commit_ts {
            collection.set_minimum_valid_snapshot(ts);
        }
        self.catalog.insert(uuid, Arc::clone(&collection));
        self.collections.insert(nss.clone(), collection);
        self.pending_commit_namespaces.remove(&nss);
        self.pending_commit_uuids.remove(&uuid);
    }

    /// Keep a dropped index reachable for historical reads.
    pub fn deregister_index(&mut self, entry: &Arc<IndexCatalogEntry>) {
        self.drop_pending_indexes
            .insert(entry.ident_name().to_string(), Arc::downgrade(entry));
    }

    /// Forget drop-pending state once the reaper removed `ident`.
    pub fn notify_ident_dropped(&mut self, ident: &str) {
        self.drop_pending_indexes.remove(ident);
        let dropped: Vec<CollectionUuid> = self
            .drop_pending_collections
            .iter()
            .filter(|(_, record)| record.ident == ident)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in dropped {
            self.drop_pending_collections.remove(&uuid);
        }
    }

    /// Remove every collection from the live view.
    pub fn deregister_all_collections(&mut self) {
        for collection in self.catalog.values() {
            self.catalog_id_tracker.drop(collection.ns(), collection.uuid(), None);
        }
        self.catalog = OrdMap::new();
        self.collections = OrdMap::new();
        self.pending_commit_namespaces = OrdMap::new();
        self.pending_commit_uuids = OrdMap::new();
    }

    pub fn find_collection_by_uuid(&self, uuid: CollectionUuid) -> Option<Arc<Collection>> {
        self.catalog.get(&uuid).cloned()
    }

    pub fn find_collection_by_namespace(&self, nss: &NamespaceString) -> Option<Arc<Collection>> {
        self.collections.get(nss).cloned()
    }

    pub fn find_collection(&self, key: &NamespaceStringOrUuid) -> Option<Arc<Collection>> {
        match key {
            NamespaceStringOrUuid::Nss(nss) => self.find_collection_by_namespace(nss),
            NamespaceStringOrUuid::Uuid(_, uuid) => self.find_collection_by_uuid(*uuid),
        }
    }

    /// Namespace of `uuid`. While the catalog is closed, falls back to the
    /// state captured at close time and then to drop-pending records.
    pub fn find_nss_by_uuid(&self, uuid: CollectionUuid) -> Option<NamespaceString> {
        if let Some(collection) = self.catalog.get(&uuid) {
            return Some(collection.ns().clone());
        }
        let shadow = self.shadow_catalog.as_ref()?;
        shadow.get(&uuid).cloned().or_else(|| {
            self.drop_pending_collections
                .get(&uuid)
                .map(|record| record.nss.clone())
        })
    }

    pub fn find_uuid_by_nss(&self, nss: &NamespaceString) -> Option<CollectionUuid> {
        self.collections.get(nss).map(|collection| collection.uuid())
    }

    pub fn find_drop_pending_collection(&self, uuid: CollectionUuid) -> Option<Arc<Collection>> {
        self.drop_pending_collections
            .get(&uuid)
            .and_then(|record| record.collection.upgrade())
    }

    pub fn find_drop_pending_index(&self, ident: &str) -> Option<Arc<IndexCatalogEntry>> {
        self.drop_pending_indexes
            .get(ident)
            .and_then(|entry| entry.upgrade())
    }

    pub fn drop_pending_collection_record(&self, uuid: CollectionUuid) -> Option<&DropPendingCollection> {
        self.drop_pending_collections.get(&uuid)
    }

    /// Collections of `db` in namespace order, as of this catalog version.
    pub fn range(&self, db: &DatabaseName) -> Range {
        Range {
            collections: self.collections.clone(),
            db: db.clone(),
        }
    }

    pub fn get_all_collection_names_from_db(&self, db: &DatabaseName) -> Vec<NamespaceString> {
        self.range(db).iter().map(|c| c.ns().clone()).collect()
    }

    pub fn get_all_collection_uuids_from_db(&self, db: &DatabaseName) -> Vec<CollectionUuid> {
        self.range(db).iter().map(|c| c.uuid()).collect()
    }

    pub fn num_collections(&self) -> usize {
        self.catalog.len()
    }

    /// Every database with at least one collection, ordered by (tenant, name).
    pub fn get_all_db_names(&self) -> Vec<DatabaseName> {
        let mut names: Vec<DatabaseName> = Vec::new();
        for nss in self.collections.keys() {
            if names.last() != Some(&nss.db) {
                names.push(nss.db.clone());
            }
        }
        names
    }

    /// Databases of `tenant`. Without multitenancy every database belongs to
    /// no tenant: `None` lists all of them and any tenant lists none.
    pub fn get_all_db_names_for_tenant(&self, tenant: Option<TenantId>) -> Vec<DatabaseName> {
        let multitenant = self.settings.multitenancy_support;
        self.get_all_db_names()
            .into_iter()
            .filter(|db| if multitenant { db.tenant == tenant } else { tenant.is_none() })
            .collect()
    }

    pub fn get_all_tenants(&self) -> BTreeSet<TenantId> {
        if !self.settings.multitenancy_support {
            return BTreeSet::new();
        }
        self.collections
            .keys()
            .filter_map(|nss| nss.tenant())
            .collect()
    }

    pub fn get_database_profile_settings(&self, db: &DatabaseName) -> ProfileSettings {
        self.profile_settings
            .get(db)
            .cloned()
            .unwrap_or(ProfileSettings {
                level: self.settings.default_profile_level,
                filter: None,
            })
    }

    pub fn set_database_profile_settings(&mut self, db: &DatabaseName, settings: ProfileSettings) {
        self.profile_settings.insert(db.clone(), settings);
    }

    /// Replace the filter of every database with explicit settings.
    pub fn set_all_database_profile_filters(&mut self, filter: Option<ProfileFilter>) {
        let updated = self
            .profile_settings
            .iter()
            .map(|(db, settings)| {
                (
                    db.clone(),
                    ProfileSettings {
                        level: settings.level,
                        filter: filter.clone(),
                    },
                )
            })
            .collect();
        self.profile_settings = updated;
    }

    pub fn clear_database_profile_settings(&mut self, db: &DatabaseName) {
        self.profile_settings.remove(db);
    }

    /// Freeze uuid to namespace resolution for the duration of a close.
    pub fn on_close_catalog(&mut self) {
        if self.shadow_catalog.is_some() {
            return;
        }
        let shadow = self
            .catalog
            .iter()
            .map(|(uuid, collection)| (*uuid, collection.ns().clone()))
            .collect();
        self.shadow_catalog = Some(shadow);
        info!(epoch = self.epoch, "closed collection catalog");
    }

    pub fn on_open_catalog(&mut self) {
        assert!(
            self.shadow_catalog.take().is_some(),
            "opening a catalog that was not closed"
        );
        self.epoch += 1;
        info!(epoch = self.epoch, "opened collection catalog");
    }

    pub fn is_closed(&self) -> bool {
        self.shadow_catalog.is_some()
    }

    pub fn get_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn catalog_id_tracker(&self) -> &HistoricalCatalogIdTracker {
        &self.catalog_id_tracker
    }

    pub fn cleanup_catalog_id_history(&mut self, oldest: Timestamp) {
        self.catalog_id_tracker.cleanup(oldest);
    }

    pub fn is_pending_commit(&self, key: &NamespaceStringOrUuid) -> bool {
        match key {
            NamespaceStringOrUuid::Nss(nss) => self.pending_commit_namespaces.contains_key(nss),
            NamespaceStringOrUuid::Uuid(_, uuid) => self.pending_commit_uuids.contains_key(uuid),
        }
    }

    /// Collection `nss` becomes at the pending commit; outer `None` when no
    /// commit touching `nss` is pending.
    pub fn pending_commit_namespace(&self, nss: &NamespaceString) -> Option<Option<Arc<Collection>>> {
        self.pending_commit_namespaces.get(nss).cloned()
    }

    pub fn pending_commit_uuid(&self, uuid: CollectionUuid) -> Option<Option<Arc<Collection>>> {
        self.pending_commit_uuids.get(&uuid).cloned()
    }

    pub fn pending_commit_namespaces(&self) -> impl Iterator<Item = &NamespaceString> {
        self.pending_commit_namespaces.keys()
    }

    pub fn pending_commit_uuids(&self) -> impl Iterator<Item = &CollectionUuid> {
        self.pending_commit_uuids.keys()
    }

    pub(crate) fn mark_pending_namespace(&mut self, nss: NamespaceString, collection: Option<Arc<Collection>>) {
        self.pending_commit_namespaces.insert(nss, collection);
    }

    pub(crate) fn mark_pending_uuid(&mut self, uuid: CollectionUuid, collection: Option<Arc<Collection>>) {
        self.pending_commit_uuids.insert(uuid, collection);
    }

    pub(crate) fn clear_pending_namespace(&mut self, nss: &NamespaceString) {
        self.pending_commit_namespaces.remove(nss);
    }

    pub(crate) fn clear_pending_uuid(&mut self, uuid: CollectionUuid) {
        self.pending_commit_uuids.remove(&uuid);
    }
}

/// Ordered, restartable view over one database's collections. Holds its own
/// version of the namespace map, so later catalog writes never move it.
#[derive(Clone)]
pub struct Range {
    collections: OrdMap<NamespaceString, Arc<Collection>>,
    db: DatabaseName,
}

impl Range {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Collection>> + '_ {
        self.collections
            .range(self.db.first_namespace()..)
            .take_while(move |(nss, _)| nss.db == self.db)
            .map(|(_, collection)| collection)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for &'a Range {
    type Item = &'a Arc<Collection>;
    type IntoIter = Box<dyn Iterator<Item = &'a Arc<Collection>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
