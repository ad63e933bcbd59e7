use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use common::{Config, DbError, DbResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use types::Timestamp;

use crate::{
    durable_catalog::{DurableCatalog, DurableCatalogEntry},
    ident::{Ident, IdentKind, SharedIdent},
    reaper::IdentReaper,
    recovery_unit::{RecoveryUnit, SnapshotProvider},
};

/// Called with the ident name after it has been physically removed.
pub type IdentDroppedListener = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Serialize, Deserialize)]
struct PersistedCatalog {
    next_catalog_id: u64,
    next_ident: u64,
    entries: Vec<DurableCatalogEntry>,
}

/// In-memory storage engine: the physical ident set, the ident reaper and the
/// versioned durable catalog.
pub struct StorageEngine {
    config: Config,
    // Physical idents, each with the handle shared by its live holders.
    idents: Mutex<BTreeMap<String, Weak<Ident>>>,
    next_ident: AtomicU64,
    reaper: IdentReaper,
    durable_catalog: DurableCatalog,
    ident_dropped: RwLock<Option<IdentDroppedListener>>,
}

impl StorageEngine {
    /// Fresh engine with an empty catalog.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            idents: Mutex::new(BTreeMap::new()),
            next_ident: AtomicU64::new(1),
            reaper: IdentReaper::new(),
            durable_catalog: DurableCatalog::new(),
            ident_dropped: RwLock::new(None),
        })
    }

    /// Engine restored from the catalog persisted under `config.data_dir`, or
    /// an empty one when nothing was persisted.
    pub fn open(config: Config) -> DbResult<Arc<Self>> {
        let path = config.catalog_path();
        if !path.exists() {
            return Ok(Self::new(config));
        }
        let data = fs::read_to_string(&path)?;
        let persisted: PersistedCatalog = serde_json::from_str(&data)
            .map_err(|err| DbError::Storage(format!("invalid catalog file: {err}")))?;

        let mut idents = BTreeMap::new();
        for entry in &persisted.entries {
            idents.insert(entry.ident.clone(), Weak::new());
            for index in &entry.metadata.indexes {
                idents.insert(index.ident.clone(), Weak::new());
            }
        }
        info!(path = %path.display(), collections = persisted.entries.len(), "opened durable catalog");
        Ok(Arc::new(Self {
            config,
            idents: Mutex::new(idents),
            next_ident: AtomicU64::new(persisted.next_ident),
            reaper: IdentReaper::new(),
            durable_catalog: DurableCatalog::from_entries(
                persisted.entries,
                persisted.next_catalog_id,
            )?,
            ident_dropped: RwLock::new(None),
        }))
    }

    /// Persist the latest committed catalog state as pretty JSON.
    pub fn checkpoint(self: &Arc<Self>) -> DbResult<()> {
        fs::create_dir_all(&self.config.data_dir)?;
        self.save_catalog(&self.config.catalog_path())
    }

    fn save_catalog(self: &Arc<Self>, path: &Path) -> DbResult<()> {
        let mut ru = self.new_recovery_unit();
        let persisted = PersistedCatalog {
            next_catalog_id: self.durable_catalog.next_catalog_id(),
            next_ident: self.next_ident.load(Ordering::SeqCst),
            entries: self.durable_catalog.all_entries(&mut ru)?,
        };
        ru.abandon_snapshot();
        let data = serde_json::to_string_pretty(&persisted)
            .map_err(|err| DbError::Storage(format!("serialize failed: {err}")))?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn durable_catalog(&self) -> &DurableCatalog {
        &self.durable_catalog
    }

    pub fn reaper(&self) -> &IdentReaper {
        &self.reaper
    }

    pub fn new_recovery_unit(self: &Arc<Self>) -> RecoveryUnit {
        RecoveryUnit::new(Arc::clone(self))
    }

    /// Physically create a new ident.
    pub fn create_ident(&self, kind: IdentKind) -> SharedIdent {
        let n = self.next_ident.fetch_add(1, Ordering::SeqCst);
        let ident = Arc::new(Ident::new(format!("{}-{n}", kind.prefix())));
        self.idents
            .lock()
            .insert(ident.name().to_string(), Arc::downgrade(&ident));
        debug!(ident = %ident, "created ident");
        ident
    }

    pub fn has_ident(&self, name: &str) -> bool {
        self.idents.lock().contains_key(name)
    }

    /// Handle to an existing ident, used when rebuilding collections.
    ///
    /// Drop-pending idents are handed out by the reaper so it sees the new
    /// holder, and idents being removed are refused. Every other caller gets
    /// the handle the ident's live holders already share.
    pub fn get_ident(&self, name: &str) -> Option<SharedIdent> {
        self.reaper.acquire_ident(name, || self.live_ident(name))
    }

    fn live_ident(&self, name: &str) -> Option<SharedIdent> {
        let mut idents = self.idents.lock();
        let token = idents.get_mut(name)?;
        if let Some(existing) = token.upgrade() {
            return Some(existing);
        }
        let fresh = Arc::new(Ident::new(name));
        *token = Arc::downgrade(&fresh);
        Some(fresh)
    }

    /// Physically remove an ident and notify the listener.
    pub fn drop_ident(&self, name: &str) -> DbResult<()> {
        if self.idents.lock().remove(name).is_none() {
            return Err(DbError::Storage(format!("unknown ident '{name}'")));
        }
        if let Some(listener) = self.ident_dropped.read().as_ref() {
            listener(name);
        }
        Ok(())
    }

    pub fn set_ident_dropped_listener(&self, listener: IdentDroppedListener) {
        *self.ident_dropped.write() = Some(listener);
    }

    pub fn add_drop_pending_ident(&self, drop_ts: Timestamp, ident: &SharedIdent) {
        self.reaper.add_drop_pending_ident(drop_ts, ident);
    }

    pub fn drop_idents_older_than(&self, ts: Timestamp) -> Vec<String> {
        self.reaper
            .drop_idents_older_than(ts, |name| self.drop_ident(name))
    }

    pub fn mark_ident_in_use(&self, name: &str) -> Option<SharedIdent> {
        self.reaper.mark_ident_in_use(name)
    }

    pub fn get_num_drop_pending_idents(&self) -> usize {
        self.reaper.get_num_drop_pending_idents()
    }

    pub fn get_drop_pending_idents(&self) -> BTreeSet<String> {
        self.reaper.get_drop_pending_idents()
    }
}
