//! Storage-engine collaborators of the collection catalog: idents and their
//! reaper, the versioned durable catalog, recovery units and locking.

#[cfg(test)]
mod tests;

pub mod durable_catalog;
pub mod engine;
pub mod ident;
pub mod lock;
pub mod reaper;
pub mod recovery_unit;

use bincode::config::{self, Config};

pub use durable_catalog::{
    CollectionMetadata, DurableCatalog, DurableCatalogEntry, IndexMetadata, ReadView,
};
pub use engine::{IdentDroppedListener, StorageEngine};
pub use ident::{Ident, IdentKind, SharedIdent};
pub use lock::{LockMode, LockProvider, Locker};
pub use reaper::IdentReaper;
pub use recovery_unit::{Change, PreCommitHook, ReadSource, RecoveryUnit, SnapshotProvider};

fn bincode_config() -> impl Config {
    config::legacy()
}
