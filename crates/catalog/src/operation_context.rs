//! Service-wide and per-operation state: the published catalog, the storage
//! engine, and each operation's recovery unit, locks and catalog view.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

use arc_swap::ArcSwap;
use common::{Config, DbResult};
use parking_lot::Mutex;
use storage::{LockProvider, Locker, ReadSource, RecoveryUnit, SnapshotProvider, StorageEngine};
use tracing::trace;

use crate::{
    catalog_control, collection_catalog::CollectionCatalog, opened::OpenedCollections,
    uncommitted::UncommittedCatalogUpdates,
};

/// Holder of the latest published [`CollectionCatalog`].
///
/// Readers load the current version without blocking. Writers are serialized,
/// copy the current version, modify the copy and publish it.
pub struct CatalogStore {
    latest: ArcSwap<CollectionCatalog>,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    pub fn new(catalog: CollectionCatalog) -> Self {
        Self {
            latest: ArcSwap::from_pointee(catalog),
            write_lock: Mutex::new(()),
        }
    }

    pub fn latest(&self) -> Arc<CollectionCatalog> {
        self.latest.load_full()
    }

    /// Apply `f` to a copy of the latest catalog and publish the copy.
    pub fn write<R>(&self, f: impl FnOnce(&mut CollectionCatalog) -> R) -> R {
        let _guard = self.write_lock.lock();
        let mut catalog = CollectionCatalog::clone(&self.latest.load());
        let result = f(&mut catalog);
        self.latest.store(Arc::new(catalog));
        result
    }

    /// Like [`CatalogStore::write`], but nothing is published when `f` fails.
    pub fn try_write<R>(
        &self,
        f: impl FnOnce(&mut CollectionCatalog) -> DbResult<R>,
    ) -> DbResult<R> {
        let _guard = self.write_lock.lock();
        let mut catalog = CollectionCatalog::clone(&self.latest.load());
        let result = f(&mut catalog)?;
        self.latest.store(Arc::new(catalog));
        Ok(result)
    }
}

/// Process-wide state shared by every operation.
pub struct ServiceContext {
    config: Config,
    engine: Arc<StorageEngine>,
    catalog: Arc<CatalogStore>,
}

impl ServiceContext {
    /// Service over a fresh, empty storage engine.
    pub fn new(config: Config) -> Arc<Self> {
        let engine = StorageEngine::new(config.clone());
        Self::with_engine(config, engine)
    }

    /// Service over the engine persisted under `config.data_dir`, with the
    /// in-memory catalog rebuilt from its durable entries.
    pub fn open(config: Config) -> DbResult<Arc<Self>> {
        let engine = StorageEngine::open(config.clone())?;
        let service = Self::with_engine(config, engine);
        catalog_control::init_from_durable(&service)?;
        Ok(service)
    }

    pub fn with_engine(config: Config, engine: Arc<StorageEngine>) -> Arc<Self> {
        let catalog = Arc::new(CatalogStore::new(CollectionCatalog::new(&config)));
        let listener: Weak<CatalogStore> = Arc::downgrade(&catalog);
        engine.set_ident_dropped_listener(Box::new(move |ident: &str| {
            if let Some(store) = listener.upgrade() {
                store.write(|catalog| catalog.notify_ident_dropped(ident));
            }
        }));
        Arc::new(Self {
            config,
            engine,
            catalog,
        })
    }

    pub fn make_operation_context(self: &Arc<Self>) -> OperationContext {
        OperationContext::new(Arc::clone(self))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn catalog_store(&self) -> &Arc<CatalogStore> {
        &self.catalog
    }
}

/// State of one operation.
pub struct OperationContext {
    service: Arc<ServiceContext>,
    recovery_unit: RecoveryUnit,
    locker: Box<dyn LockProvider>,
    stashed_catalog: Option<Arc<CollectionCatalog>>,
    opened: OpenedCollections,
    uncommitted: Arc<Mutex<UncommittedCatalogUpdates>>,
}

impl OperationContext {
    pub fn new(service: Arc<ServiceContext>) -> Self {
        Self::with_locker(service, Box::new(Locker::new()))
    }

    pub fn with_locker(service: Arc<ServiceContext>, locker: Box<dyn LockProvider>) -> Self {
        let recovery_unit = service.engine().new_recovery_unit();
        Self {
            service,
            recovery_unit,
            locker,
            stashed_catalog: None,
            opened: OpenedCollections::default(),
            uncommitted: Arc::new(Mutex::new(UncommittedCatalogUpdates::default())),
        }
    }

    pub fn service(&self) -> &Arc<ServiceContext> {
        &self.service
    }

    pub fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    pub fn recovery_unit_mut(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    pub fn locker(&self) -> &dyn LockProvider {
        self.locker.as_ref()
    }

    pub fn locker_mut(&mut self) -> &mut dyn LockProvider {
        self.locker.as_mut()
    }

    pub fn opened_collections(&self) -> &OpenedCollections {
        &self.opened
    }

    pub fn opened_collections_mut(&mut self) -> &mut OpenedCollections {
        &mut self.opened
    }

    pub fn uncommitted(&self) -> &Arc<Mutex<UncommittedCatalogUpdates>> {
        &self.uncommitted
    }

    pub fn in_write_unit_of_work(&self) -> bool {
        self.recovery_unit.in_unit_of_work()
    }

    /// Release the storage snapshot and everything established against it.
    pub fn abandon_snapshot(&mut self) {
        self.recovery_unit.abandon_snapshot();
        self.reset_catalog_view();
    }

    pub fn set_read_source(&mut self, source: ReadSource) {
        self.abandon_snapshot();
        self.recovery_unit.set_read_source(source);
    }

    fn reset_catalog_view(&mut self) {
        if !self.opened.is_empty() || self.stashed_catalog.is_some() {
            trace!(opened = self.opened.len(), "releasing operation catalog view");
        }
        self.opened.clear();
        self.stashed_catalog = None;
    }
}

impl CollectionCatalog {
    /// The catalog version `op` reads: its stashed version, else the latest.
    pub fn get(op: &OperationContext) -> Arc<CollectionCatalog> {
        match &op.stashed_catalog {
            Some(catalog) => Arc::clone(catalog),
            None => Self::latest(op.service()),
        }
    }

    pub fn latest(service: &ServiceContext) -> Arc<CollectionCatalog> {
        service.catalog_store().latest()
    }

    /// Pin `catalog` as `op`'s view until its snapshot is released.
    pub fn stash(op: &mut OperationContext, catalog: Arc<CollectionCatalog>) {
        op.stashed_catalog = Some(catalog);
    }
}

/// Scope of one write unit of work. Dropping it without
/// [`WriteUnitOfWork::commit`] rolls everything back.
pub struct WriteUnitOfWork<'a> {
    op: &'a mut OperationContext,
    committed: bool,
}

impl<'a> WriteUnitOfWork<'a> {
    pub fn new(op: &'a mut OperationContext) -> Self {
        op.recovery_unit.begin_unit_of_work();
        Self {
            op,
            committed: false,
        }
    }

    pub fn commit(mut self) -> DbResult<()> {
        self.committed = true;
        let result = self.op.recovery_unit.commit_unit_of_work();
        if !self.op.recovery_unit.in_unit_of_work() {
            self.op.reset_catalog_view();
        }
        result
    }
}

impl Deref for WriteUnitOfWork<'_> {
    type Target = OperationContext;

    fn deref(&self) -> &OperationContext {
        self.op
    }
}

impl DerefMut for WriteUnitOfWork<'_> {
    fn deref_mut(&mut self) -> &mut OperationContext {
        self.op
    }
}

impl Drop for WriteUnitOfWork<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.op.recovery_unit.abort_unit_of_work();
        self.op.reset_catalog_view();
    }
}
