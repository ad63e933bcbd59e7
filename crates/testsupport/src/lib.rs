//! Test support utilities for the collection catalog workspace.
//!
//! This crate provides the testing infrastructure shared by the catalog
//! integration tests:
//! - Isolated service contexts backed by a temporary data directory
//! - Timestamped DDL fixtures that run inside a write unit of work
//! - A harness that stalls a DDL commit so readers can race it
//! - Property-based generators and assertion helpers
//!
//! # Example Usage
//!
//! ```
//! use testsupport::prelude::*;
//!
//! let ctx = TestContext::new().unwrap();
//! let nss = nss!("app.users");
//! create_collection(ctx.service(), &nss, ts!(10)).unwrap();
//!
//! let mut op = ctx.operation_context();
//! let coll = establish(&mut op, &nss, Some(ts!(10))).unwrap();
//! assert!(coll.is_some());
//! ```

pub mod assertions;
pub mod concurrent;
pub mod context;
pub mod fixtures;
pub mod macros;
pub mod proptest_generators;

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::concurrent::*;
    pub use crate::context::*;
    pub use crate::fixtures::*;
    pub use crate::{nss, ts};
}
