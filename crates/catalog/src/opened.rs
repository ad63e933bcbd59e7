use std::sync::Arc;

use types::{CollectionUuid, NamespaceString, NamespaceStringOrUuid};

use crate::collection::Collection;

#[derive(Debug)]
struct OpenedEntry {
    // `None` records that the key does not exist in the snapshot.
    collection: Option<Arc<Collection>>,
    nss: Option<NamespaceString>,
    uuid: Option<CollectionUuid>,
}

/// Collections established for the current storage snapshot.
///
/// Lookups answer `None` when the key was never established and
/// `Some(None)` when it was established as absent.
#[derive(Debug, Default)]
pub struct OpenedCollections {
    entries: Vec<OpenedEntry>,
}

impl OpenedCollections {
    pub fn lookup_by_namespace(&self, nss: &NamespaceString) -> Option<Option<Arc<Collection>>> {
        self.entries
            .iter()
            .find(|entry| entry.nss.as_ref() == Some(nss))
            .map(|entry| entry.collection.clone())
    }

    pub fn lookup_by_uuid(&self, uuid: CollectionUuid) -> Option<Option<Arc<Collection>>> {
        self.entries
            .iter()
            .find(|entry| entry.uuid == Some(uuid))
            .map(|entry| entry.collection.clone())
    }

    pub fn lookup(&self, key: &NamespaceStringOrUuid) -> Option<Option<Arc<Collection>>> {
        match key {
            NamespaceStringOrUuid::Nss(nss) => self.lookup_by_namespace(nss),
            NamespaceStringOrUuid::Uuid(_, uuid) => self.lookup_by_uuid(*uuid),
        }
    }

    pub fn contains(&self, key: &NamespaceStringOrUuid) -> bool {
        self.lookup(key).is_some()
    }

    /// Record `collection` under its own namespace and uuid.
    pub fn store(&mut self, collection: Arc<Collection>) {
        let nss = collection.ns().clone();
        let uuid = collection.uuid();
        self.insert(OpenedEntry {
            collection: Some(collection),
            nss: Some(nss),
            uuid: Some(uuid),
        });
    }

    /// Record that `key` does not exist in this snapshot.
    pub fn store_absent(&mut self, key: &NamespaceStringOrUuid) {
        let (nss, uuid) = match key {
            NamespaceStringOrUuid::Nss(nss) => (Some(nss.clone()), None),
            NamespaceStringOrUuid::Uuid(_, uuid) => (None, Some(*uuid)),
        };
        self.insert(OpenedEntry {
            collection: None,
            nss,
            uuid,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn insert(&mut self, entry: OpenedEntry) {
        self.entries.retain(|existing| {
            let same_nss = entry.nss.is_some() && existing.nss == entry.nss;
            let same_uuid = entry.uuid.is_some() && existing.uuid == entry.uuid;
            !(same_nss || same_uuid)
        });
        self.entries.push(entry);
    }
}
