//! Test service contexts and their on-disk state.
//!
//! Each test gets its own [`ServiceContext`] whose data directory lives in a
//! temporary directory that is removed when the context is dropped.

use catalog::{CollectionCatalog, OperationContext, ServiceContext};
use common::{Config, DbResult};
use std::{path::Path, sync::Arc};
use storage::StorageEngine;
use tempfile::TempDir;

/// An isolated catalog service with temporary storage.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let ctx = TestContext::new().unwrap();
/// let op = ctx.operation_context();
/// assert!(!op.in_write_unit_of_work());
/// assert_eq!(ctx.catalog().num_collections(), 0);
/// ```
pub struct TestContext {
    _temp_dir: TempDir,
    config: Config,
    service: Arc<ServiceContext>,
}

impl TestContext {
    /// Create a new test context with default configuration.
    pub fn new() -> DbResult<Self> {
        Self::with_config(Config::default())
    }

    /// Create a test context with multitenancy enabled.
    pub fn with_multitenancy() -> DbResult<Self> {
        Self::with_config(Config::builder().multitenancy_support(true).build())
    }

    /// Create a test context from `config`. Its `data_dir` is replaced by a
    /// fresh temporary directory.
    pub fn with_config(config: Config) -> DbResult<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..config
        };
        let service = ServiceContext::new(config.clone());
        Ok(Self {
            _temp_dir: temp_dir,
            config,
            service,
        })
    }

    pub fn service(&self) -> &Arc<ServiceContext> {
        &self.service
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        self.service.engine()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// A new operation reading at latest.
    pub fn operation_context(&self) -> OperationContext {
        self.service.make_operation_context()
    }

    /// The latest published catalog.
    pub fn catalog(&self) -> Arc<CollectionCatalog> {
        CollectionCatalog::latest(&self.service)
    }

    /// Checkpoint the durable catalog and start a second service from it, as
    /// a restart would.
    pub fn restart(&self) -> DbResult<Arc<ServiceContext>> {
        self.engine().checkpoint()?;
        ServiceContext::open(self.config.clone())
    }
}
