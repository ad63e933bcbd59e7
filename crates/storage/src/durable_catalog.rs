use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{DbError, DbResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;
use types::{CatalogId, CollectionUuid, NamespaceString, Timestamp};

use crate::{
    bincode_config,
    recovery_unit::{RecoveryUnit, SnapshotProvider},
};

/// Durable description of one index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub key: Vec<String>,
    pub ready: bool,
    pub multikey: bool,
    pub ident: String,
}

impl IndexMetadata {
    /// A finished, non-multikey index.
    pub fn new(name: impl Into<String>, key: Vec<String>, ident: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key,
            ready: true,
            multikey: false,
            ident: ident.into(),
        }
    }
}

/// Durable description of a collection and its indexes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub nss: NamespaceString,
    pub uuid: CollectionUuid,
    pub indexes: Vec<IndexMetadata>,
}

impl CollectionMetadata {
    pub fn new(nss: NamespaceString, uuid: CollectionUuid) -> Self {
        Self {
            nss,
            uuid,
            indexes: Vec::new(),
        }
    }

    /// Position of the named index within `indexes`.
    pub fn find_index_offset(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|index| index.name == name)
    }
}

/// A parsed durable catalog record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableCatalogEntry {
    pub catalog_id: CatalogId,
    pub ident: String,
    pub metadata: CollectionMetadata,
}

/// The point in history a read observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadView {
    /// Highest commit sequence visible to the read.
    pub seq: u64,
    /// `None` reads the latest version at `seq`.
    pub read_ts: Option<Timestamp>,
}

/// A write buffered in a recovery unit until commit. `None` deletes.
#[derive(Clone, Debug)]
pub struct StagedWrite {
    pub catalog_id: CatalogId,
    pub bytes: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
struct Version {
    seq: u64,
    ts: Option<Timestamp>,
    bytes: Option<Vec<u8>>,
}

impl Version {
    fn visible_at(&self, view: ReadView) -> bool {
        if self.seq > view.seq {
            return false;
        }
        match (self.ts, view.read_ts) {
            (Some(ts), Some(read_ts)) => ts <= read_ts,
            _ => true,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<CatalogId, Vec<Version>>,
    seq: u64,
}

/// Multi-version record of collection metadata keyed by [`CatalogId`].
///
/// Every committed write appends a version tagged with its commit sequence and
/// optional commit timestamp, so reads can observe the catalog as of any
/// snapshot and timestamp.
pub struct DurableCatalog {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl Default for DurableCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableCatalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuild a catalog holding `entries` as untimestamped history.
    pub fn from_entries(entries: Vec<DurableCatalogEntry>, next_id: u64) -> DbResult<Self> {
        let catalog = Self::new();
        {
            let mut inner = catalog.inner.write();
            inner.seq = 1;
            for entry in entries {
                let bytes = encode_entry(&entry)?;
                inner.entries.insert(
                    entry.catalog_id,
                    vec![Version {
                        seq: 1,
                        ts: None,
                        bytes: Some(bytes),
                    }],
                );
            }
        }
        catalog.next_id.store(next_id, Ordering::SeqCst);
        Ok(catalog)
    }

    /// Sequence number of the most recent commit.
    pub fn latest_seq(&self) -> u64 {
        self.inner.read().seq
    }

    pub fn next_catalog_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Stage a new collection entry. Visible to others once `ru` commits.
    pub fn create_collection(
        &self,
        ru: &mut RecoveryUnit,
        ident: &str,
        metadata: CollectionMetadata,
    ) -> DbResult<CatalogId> {
        if !ru.in_unit_of_work() {
            return Err(DbError::Storage(
                "durable catalog writes require a unit of work".into(),
            ));
        }
        let catalog_id = CatalogId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = DurableCatalogEntry {
            catalog_id,
            ident: ident.to_string(),
            metadata,
        };
        ru.stage_write(StagedWrite {
            catalog_id,
            bytes: Some(encode_entry(&entry)?),
        });
        Ok(catalog_id)
    }

    /// Stage replacement metadata for an existing entry.
    pub fn put_metadata(
        &self,
        ru: &mut RecoveryUnit,
        catalog_id: CatalogId,
        metadata: CollectionMetadata,
    ) -> DbResult<()> {
        if !ru.in_unit_of_work() {
            return Err(DbError::Storage(
                "durable catalog writes require a unit of work".into(),
            ));
        }
        let mut entry = self
            .get_parsed_catalog_entry(ru, catalog_id)?
            .ok_or_else(|| DbError::Storage(format!("unknown catalog id {catalog_id}")))?;
        entry.metadata = metadata;
        ru.stage_write(StagedWrite {
            catalog_id,
            bytes: Some(encode_entry(&entry)?),
        });
        Ok(())
    }

    /// Stage removal of an entry.
    pub fn drop_collection(&self, ru: &mut RecoveryUnit, catalog_id: CatalogId) -> DbResult<()> {
        if !ru.in_unit_of_work() {
            return Err(DbError::Storage(
                "durable catalog writes require a unit of work".into(),
            ));
        }
        if self.get_parsed_catalog_entry(ru, catalog_id)?.is_none() {
            return Err(DbError::Storage(format!("unknown catalog id {catalog_id}")));
        }
        ru.stage_write(StagedWrite {
            catalog_id,
            bytes: None,
        });
        Ok(())
    }

    /// Entry for `catalog_id` as seen by `ru`'s snapshot and pending writes.
    pub fn get_parsed_catalog_entry(
        &self,
        ru: &mut RecoveryUnit,
        catalog_id: CatalogId,
    ) -> DbResult<Option<DurableCatalogEntry>> {
        if let Some(staged) = ru.staged_write(catalog_id) {
            return staged.bytes.as_deref().map(decode_entry).transpose();
        }
        let view = ru.read_view();
        let inner = self.inner.read();
        inner
            .entries
            .get(&catalog_id)
            .and_then(|versions| visible(versions, view))
            .map(decode_entry)
            .transpose()
    }

    /// Every entry visible to `ru`, ordered by catalog id.
    pub fn all_entries(&self, ru: &mut RecoveryUnit) -> DbResult<Vec<DurableCatalogEntry>> {
        let view = ru.read_view();
        let mut raw: BTreeMap<CatalogId, Option<Vec<u8>>> = {
            let inner = self.inner.read();
            inner
                .entries
                .iter()
                .map(|(id, versions)| (*id, visible(versions, view).map(<[u8]>::to_vec)))
                .collect()
        };
        for write in ru.staged_writes() {
            raw.insert(write.catalog_id, write.bytes.clone());
        }
        raw.values()
            .filter_map(|bytes| bytes.as_deref())
            .map(decode_entry)
            .collect()
    }

    pub fn scan_for_catalog_entry_by_nss(
        &self,
        ru: &mut RecoveryUnit,
        nss: &NamespaceString,
    ) -> DbResult<Option<DurableCatalogEntry>> {
        let found = self
            .all_entries(ru)?
            .into_iter()
            .rev()
            .find(|entry| &entry.metadata.nss == nss);
        trace!(%nss, found = found.is_some(), "scanned durable catalog by namespace");
        Ok(found)
    }

    pub fn scan_for_catalog_entry_by_uuid(
        &self,
        ru: &mut RecoveryUnit,
        uuid: CollectionUuid,
    ) -> DbResult<Option<DurableCatalogEntry>> {
        let found = self
            .all_entries(ru)?
            .into_iter()
            .rev()
            .find(|entry| entry.metadata.uuid == uuid);
        trace!(%uuid, found = found.is_some(), "scanned durable catalog by uuid");
        Ok(found)
    }

    /// Apply a committed batch atomically, returning its commit sequence.
    pub(crate) fn apply(&self, writes: Vec<StagedWrite>, ts: Option<Timestamp>) -> u64 {
        let mut inner = self.inner.write();
        inner.seq += 1;
        let seq = inner.seq;
        for write in writes {
            inner.entries.entry(write.catalog_id).or_default().push(Version {
                seq,
                ts,
                bytes: write.bytes,
            });
        }
        seq
    }
}

fn visible(versions: &[Version], view: ReadView) -> Option<&[u8]> {
    versions
        .iter()
        .rev()
        .find(|version| version.visible_at(view))
        .and_then(|version| version.bytes.as_deref())
}

fn encode_entry(entry: &DurableCatalogEntry) -> DbResult<Vec<u8>> {
    encode_to_vec(entry, bincode_config())
        .map_err(|e| DbError::Storage(format!("encode catalog entry failed: {e}")))
}

fn decode_entry(bytes: &[u8]) -> DbResult<DurableCatalogEntry> {
    let (entry, _) = decode_from_slice(bytes, bincode_config())
        .map_err(|e| DbError::Storage(format!("decode catalog entry failed: {e}")))?;
    Ok(entry)
}
