//! Multi-version collection catalog.
//!
//! [`CollectionCatalog`] is an immutable, cheaply cloned view of every
//! registered collection. Writers publish new versions through
//! [`CatalogStore`]; operations read a version, see their own uncommitted
//! changes on top of it, and establish collections matching their storage
//! snapshot with [`CollectionCatalog::establish_consistent_collection`].


pub mod catalog_control;
pub mod catalog_id_tracker;
pub mod collection;
pub mod collection_catalog;
mod consistent;
pub mod ddl;
mod lookup;
pub mod opened;
pub mod operation_context;
pub mod uncommitted;

pub use catalog_id_tracker::{CatalogIdLookup, HistoricalCatalogIdTracker};
pub use collection::{Collection, IndexCatalog, IndexCatalogEntry, IndexDescriptor};
pub use collection_catalog::{
    CollectionCatalog, DropPendingCollection, ProfileFilter, ProfileSettings, Range,
};
pub use opened::OpenedCollections;
pub use operation_context::{CatalogStore, OperationContext, ServiceContext, WriteUnitOfWork};
pub use uncommitted::{UncommittedCatalogUpdates, UncommittedEntry};
