use std::{fmt, sync::Arc};

use parking_lot::RwLock;
use storage::{CollectionMetadata, IndexMetadata, SharedIdent};
use types::{CatalogId, CollectionUuid, NamespaceString, Timestamp};

/// Logical definition of an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub key: Vec<String>,
}

/// One index of one collection revision.
///
/// `offset` is the position of this index inside the owning revision's
/// metadata and is always assigned from that position.
#[derive(Debug)]
pub struct IndexCatalogEntry {
    descriptor: IndexDescriptor,
    ident: SharedIdent,
    ready: bool,
    offset: usize,
}

impl IndexCatalogEntry {
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn shared_ident(&self) -> &SharedIdent {
        &self.ident
    }

    pub fn ident_name(&self) -> &str {
        self.ident.name()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Multikey state as recorded in `collection`'s metadata.
    pub fn is_multikey(&self, collection: &Collection) -> bool {
        let index = collection
            .metadata
            .indexes
            .get(self.offset)
            .unwrap_or_else(|| panic!("index offset {} out of range", self.offset));
        assert_eq!(
            index.name, self.descriptor.name,
            "index offset {} does not refer to '{}'",
            self.offset, self.descriptor.name
        );
        index.multikey
    }
}

/// The indexes of one collection revision, in metadata order.
#[derive(Clone, Debug, Default)]
pub struct IndexCatalog {
    entries: Vec<Arc<IndexCatalogEntry>>,
}

impl IndexCatalog {
    pub fn num_indexes_total(&self) -> usize {
        self.entries.len()
    }

    pub fn num_indexes_ready(&self) -> usize {
        self.entries.iter().filter(|entry| entry.ready).count()
    }

    pub fn num_indexes_in_progress(&self) -> usize {
        self.num_indexes_total() - self.num_indexes_ready()
    }

    pub fn find_index_by_name(
        &self,
        name: &str,
        include_unfinished: bool,
    ) -> Option<&Arc<IndexCatalogEntry>> {
        self.entries
            .iter()
            .find(|entry| entry.name() == name && (include_unfinished || entry.ready))
    }

    pub fn find_index_by_ident(&self, ident: &str) -> Option<&Arc<IndexCatalogEntry>> {
        self.entries.iter().find(|entry| entry.ident_name() == ident)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<IndexCatalogEntry>> {
        self.entries.iter()
    }

    pub fn ready_entries(&self) -> impl Iterator<Item = &Arc<IndexCatalogEntry>> {
        self.entries.iter().filter(|entry| entry.ready)
    }
}

/// In-memory state of one collection at one metadata revision.
///
/// Revisions are immutable. Every metadata change produces a new `Collection`
/// that shares the idents of everything that did not change.
pub struct Collection {
    catalog_id: CatalogId,
    ident: SharedIdent,
    metadata: CollectionMetadata,
    index_catalog: IndexCatalog,
    min_valid_snapshot: RwLock<Option<Timestamp>>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("ns", &self.metadata.nss)
            .field("uuid", &self.metadata.uuid)
            .field("catalog_id", &self.catalog_id)
            .field("ident", &self.ident.name())
            .field("indexes", &self.index_catalog.num_indexes_total())
            .field("min_valid_snapshot", &*self.min_valid_snapshot.read())
            .finish()
    }
}

impl Collection {
    /// A collection without indexes.
    pub fn new(catalog_id: CatalogId, ident: SharedIdent, metadata: CollectionMetadata) -> Self {
        assert!(
            metadata.indexes.is_empty(),
            "use Collection::from_metadata for collections with indexes"
        );
        Self {
            catalog_id,
            ident,
            metadata,
            index_catalog: IndexCatalog::default(),
            min_valid_snapshot: RwLock::new(None),
        }
    }

    /// Build a collection from durable metadata. `resolve_ident` supplies the
    /// ident for each index; `None` from it aborts construction.
    pub fn from_metadata<F>(
        catalog_id: CatalogId,
        ident: SharedIdent,
        metadata: CollectionMetadata,
        mut resolve_ident: F,
    ) -> Option<Self>
    where
        F: FnMut(&IndexMetadata) -> Option<SharedIdent>,
    {
        let mut entries = Vec::with_capacity(metadata.indexes.len());
        for (offset, index) in metadata.indexes.iter().enumerate() {
            let ident = resolve_ident(index)?;
            debug_assert_eq!(ident.name(), index.ident);
            entries.push(Arc::new(IndexCatalogEntry {
                descriptor: IndexDescriptor {
                    name: index.name.clone(),
                    key: index.key.clone(),
                },
                ident,
                ready: index.ready,
                offset,
            }));
        }
        Some(Self {
            catalog_id,
            ident,
            metadata,
            index_catalog: IndexCatalog { entries },
            min_valid_snapshot: RwLock::new(None),
        })
    }

    pub fn uuid(&self) -> CollectionUuid {
        self.metadata.uuid
    }

    pub fn ns(&self) -> &NamespaceString {
        &self.metadata.nss
    }

    pub fn catalog_id(&self) -> CatalogId {
        self.catalog_id
    }

    pub fn shared_ident(&self) -> &SharedIdent {
        &self.ident
    }

    pub fn ident_name(&self) -> &str {
        self.ident.name()
    }

    pub fn metadata(&self) -> &CollectionMetadata {
        &self.metadata
    }

    pub fn index_catalog(&self) -> &IndexCatalog {
        &self.index_catalog
    }

    /// True when `metadata` describes exactly this revision.
    pub fn is_metadata_equal(&self, metadata: &CollectionMetadata) -> bool {
        &self.metadata == metadata
    }

    pub fn minimum_valid_snapshot(&self) -> Option<Timestamp> {
        *self.min_valid_snapshot.read()
    }

    /// Set when the revision is published; never moves backwards.
    pub fn set_minimum_valid_snapshot(&self, ts: Timestamp) {
        let mut current = self.min_valid_snapshot.write();
        if current.is_none_or(|existing| existing < ts) {
            *current = Some(ts);
        }
    }

    /// True when this revision may serve reads at `read_ts`.
    pub fn is_valid_at(&self, read_ts: Timestamp) -> bool {
        self.minimum_valid_snapshot()
            .is_none_or(|min_valid| min_valid <= read_ts)
    }

    pub fn is_multikey(&self, index_name: &str) -> Option<bool> {
        self.metadata
            .find_index_offset(index_name)
            .map(|offset| self.metadata.indexes[offset].multikey)
    }

    /// New revision with `index` appended.
    pub fn with_index(&self, index: IndexMetadata, ident: SharedIdent) -> Self {
        assert!(
            self.metadata.find_index_offset(&index.name).is_none(),
            "index '{}' already exists on {}",
            index.name,
            self.ns()
        );
        let mut metadata = self.metadata.clone();
        metadata.indexes.push(index);
        self.revise(metadata, Some(ident))
    }

    /// New revision without the named index, plus the removed entry.
    pub fn without_index(&self, name: &str) -> Option<(Self, Arc<IndexCatalogEntry>)> {
        let removed = Arc::clone(self.index_catalog.find_index_by_name(name, true)?);
        let mut metadata = self.metadata.clone();
        metadata.indexes.retain(|index| index.name != name);
        Some((self.revise(metadata, None), removed))
    }

    pub fn with_index_ready(&self, name: &str) -> Option<Self> {
        let offset = self.metadata.find_index_offset(name)?;
        let mut metadata = self.metadata.clone();
        metadata.indexes[offset].ready = true;
        Some(self.revise(metadata, None))
    }

    pub fn with_index_multikey(&self, name: &str, multikey: bool) -> Option<Self> {
        let offset = self.metadata.find_index_offset(name)?;
        let mut metadata = self.metadata.clone();
        metadata.indexes[offset].multikey = multikey;
        Some(self.revise(metadata, None))
    }

    pub fn renamed(&self, to: NamespaceString) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.nss = to;
        self.revise(metadata, None)
    }

    // Unchanged index entries are shared; everything else is rebuilt at its new offset.
    fn revise(&self, metadata: CollectionMetadata, added: Option<SharedIdent>) -> Self {
        let mut entries = Vec::with_capacity(metadata.indexes.len());
        for (offset, index) in metadata.indexes.iter().enumerate() {
            let existing = self.index_catalog.find_index_by_ident(&index.ident);
            let entry = match existing {
                Some(entry)
                    if entry.offset == offset
                        && entry.ready == index.ready
                        && entry.descriptor.name == index.name =>
                {
                    Arc::clone(entry)
                }
                _ => {
                    let ident = existing
                        .map(|entry| Arc::clone(&entry.ident))
                        .or_else(|| added.clone().filter(|ident| ident.name() == index.ident))
                        .unwrap_or_else(|| {
                            panic!("no ident available for index '{}'", index.name)
                        });
                    Arc::new(IndexCatalogEntry {
                        descriptor: IndexDescriptor {
                            name: index.name.clone(),
                            key: index.key.clone(),
                        },
                        ident,
                        ready: index.ready,
                        offset,
                    })
                }
            };
            entries.push(entry);
        }
        Self {
            catalog_id: self.catalog_id,
            ident: Arc::clone(&self.ident),
            metadata,
            index_catalog: IndexCatalog { entries },
            min_valid_snapshot: RwLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::Ident;

    fn ident(name: &str) -> SharedIdent {
        Arc::new(Ident::new(name))
    }

    fn collection() -> Collection {
        Collection::new(
            CatalogId(1),
            ident("collection-1"),
            CollectionMetadata::new(NamespaceString::new("app", "c"), CollectionUuid::generate()),
        )
    }

    fn index(name: &str, ident: &str) -> IndexMetadata {
        IndexMetadata::new(name, vec![name.to_string()], ident)
    }

    #[test]
    fn revisions_share_unchanged_state() {
        let base = collection();
        let with_x = base.with_index(index("x", "index-2"), ident("index-2"));
        let with_y = with_x.with_index(index("y", "index-3"), ident("index-3"));

        assert!(Arc::ptr_eq(base.shared_ident(), with_y.shared_ident()));
        let x_before = with_x.index_catalog().find_index_by_name("x", false).unwrap();
        let x_after = with_y.index_catalog().find_index_by_name("x", false).unwrap();
        assert!(Arc::ptr_eq(x_before, x_after));
        assert_eq!(base.index_catalog().num_indexes_total(), 0);
        assert_eq!(with_y.index_catalog().num_indexes_total(), 2);
    }

    #[test]
    fn offsets_follow_metadata_position() {
        let c = collection()
            .with_index(index("x", "index-2"), ident("index-2"))
            .with_index(index("y", "index-3"), ident("index-3"));
        let (without_x, removed) = c.without_index("x").unwrap();
        assert_eq!(removed.offset(), 0);

        let y = without_x.index_catalog().find_index_by_name("y", false).unwrap();
        assert_eq!(y.offset(), 0);
        assert!(Arc::ptr_eq(
            y.shared_ident(),
            c.index_catalog().find_index_by_name("y", false).unwrap().shared_ident()
        ));

        let multikey = without_x.with_index_multikey("y", true).unwrap();
        let y = multikey.index_catalog().find_index_by_name("y", false).unwrap();
        assert!(y.is_multikey(&multikey));
        assert!(!y.is_multikey(&without_x));
    }

    #[test]
    fn unfinished_indexes_are_hidden_by_default() {
        let mut building = index("x", "index-2");
        building.ready = false;
        let c = collection().with_index(building, ident("index-2"));
        assert_eq!(c.index_catalog().num_indexes_ready(), 0);
        assert_eq!(c.index_catalog().num_indexes_in_progress(), 1);
        assert!(c.index_catalog().find_index_by_name("x", false).is_none());
        assert!(c.index_catalog().find_index_by_name("x", true).is_some());

        let ready = c.with_index_ready("x").unwrap();
        assert_eq!(ready.index_catalog().num_indexes_ready(), 1);
        assert!(!c.index_catalog().entries().next().unwrap().is_ready());
    }

    #[test]
    fn minimum_valid_snapshot_only_advances() {
        let c = collection();
        assert!(c.is_valid_at(Timestamp::new(1, 0)));
        c.set_minimum_valid_snapshot(Timestamp::new(20, 0));
        c.set_minimum_valid_snapshot(Timestamp::new(10, 0));
        assert_eq!(c.minimum_valid_snapshot(), Some(Timestamp::new(20, 0)));
        assert!(!c.is_valid_at(Timestamp::new(15, 0)));
        assert!(c.is_valid_at(Timestamp::new(20, 0)));
    }

    #[test]
    fn rename_keeps_identity() {
        let c = collection();
        let renamed = c.renamed(NamespaceString::new("app", "d"));
        assert_eq!(renamed.uuid(), c.uuid());
        assert_eq!(renamed.catalog_id(), c.catalog_id());
        assert_eq!(renamed.ns(), &NamespaceString::new("app", "d"));
        assert_eq!(c.ns(), &NamespaceString::new("app", "c"));
    }
}
