use std::{mem, sync::Arc};

use common::DbResult;
use tracing::{debug, trace};
use types::{CatalogId, Timestamp};

use crate::{
    durable_catalog::{ReadView, StagedWrite},
    engine::StorageEngine,
};

/// Where reads take their timestamp from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    /// Read the latest committed data.
    NoTimestamp,
    /// Read as of the given timestamp.
    Provided(Timestamp),
}

/// Work deferred until the unit of work resolves.
pub trait Change: Send {
    fn commit(self: Box<Self>, commit_ts: Option<Timestamp>);
    fn rollback(self: Box<Self>);
}

/// Hook run before durable writes are applied. An error aborts the commit.
pub type PreCommitHook = Box<dyn FnOnce() -> DbResult<()> + Send>;

struct OnCommit<F>(F);

impl<F> Change for OnCommit<F>
where
    F: FnOnce(Option<Timestamp>) + Send,
{
    fn commit(self: Box<Self>, commit_ts: Option<Timestamp>) {
        (self.0)(commit_ts)
    }

    fn rollback(self: Box<Self>) {}
}

struct OnRollback<F>(F);

impl<F> Change for OnRollback<F>
where
    F: FnOnce() + Send,
{
    fn commit(self: Box<Self>, _commit_ts: Option<Timestamp>) {}

    fn rollback(self: Box<Self>) {
        (self.0)()
    }
}

/// Snapshot and commit-hook capabilities consumed by the catalog.
pub trait SnapshotProvider {
    fn read_source(&self) -> ReadSource;
    fn set_read_source(&mut self, source: ReadSource);
    fn abandon_snapshot(&mut self);
    fn in_unit_of_work(&self) -> bool;
    fn register_pre_commit_hook(&mut self, hook: PreCommitHook);
    /// Changes registered here commit before every regular change.
    fn register_catalog_visibility_change(&mut self, change: Box<dyn Change>);
    fn register_change(&mut self, change: Box<dyn Change>);

    fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce(Option<Timestamp>) + Send + 'static,
        Self: Sized,
    {
        self.register_change(Box::new(OnCommit(f)));
    }

    fn on_rollback<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.register_change(Box::new(OnRollback(f)));
    }
}

/// Per-operation storage transaction state.
///
/// Commit order: pre-commit hooks, durable writes, catalog visibility
/// changes, regular changes. Rollback runs changes in reverse.
pub struct RecoveryUnit {
    engine: Arc<StorageEngine>,
    read_source: ReadSource,
    snapshot: Option<u64>,
    commit_ts: Option<Timestamp>,
    depth: u32,
    staged: Vec<StagedWrite>,
    pre_commit: Vec<PreCommitHook>,
    visibility_changes: Vec<Box<dyn Change>>,
    changes: Vec<Box<dyn Change>>,
}

impl RecoveryUnit {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            read_source: ReadSource::NoTimestamp,
            snapshot: None,
            commit_ts: None,
            depth: 0,
            staged: Vec::new(),
            pre_commit: Vec::new(),
            visibility_changes: Vec::new(),
            changes: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Timestamp reads are served at, if any.
    pub fn read_timestamp(&self) -> Option<Timestamp> {
        match self.read_source {
            ReadSource::NoTimestamp => None,
            ReadSource::Provided(ts) => Some(ts),
        }
    }

    pub fn has_open_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Opens the snapshot on first use.
    pub fn read_view(&mut self) -> ReadView {
        let engine = &self.engine;
        let seq = *self
            .snapshot
            .get_or_insert_with(|| engine.durable_catalog().latest_seq());
        ReadView {
            seq,
            read_ts: self.read_timestamp(),
        }
    }

    /// Commit timestamp for the current unit of work; the null timestamp clears it.
    pub fn set_commit_timestamp(&mut self, ts: Timestamp) {
        self.commit_ts = ts.non_null();
    }

    pub fn clear_commit_timestamp(&mut self) {
        self.commit_ts = None;
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_ts
    }

    pub fn begin_unit_of_work(&mut self) {
        self.depth += 1;
    }

    /// Commits the outermost unit of work; nested commits only unwind depth.
    pub fn commit_unit_of_work(&mut self) -> DbResult<()> {
        assert!(self.depth > 0, "commit without an active unit of work");
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }

        for hook in mem::take(&mut self.pre_commit) {
            if let Err(err) = hook() {
                debug!(error = %err, "pre-commit hook failed, rolling back");
                self.rollback();
                return Err(err);
            }
        }

        let commit_ts = self.commit_ts;
        let staged = mem::take(&mut self.staged);
        if !staged.is_empty() {
            let seq = self.engine.durable_catalog().apply(staged, commit_ts);
            trace!(seq, ?commit_ts, "applied durable catalog writes");
        }
        for change in mem::take(&mut self.visibility_changes) {
            change.commit(commit_ts);
        }
        for change in mem::take(&mut self.changes) {
            change.commit(commit_ts);
        }
        self.snapshot = None;
        Ok(())
    }

    /// Abandons every pending write of the unit of work. No-op outside one.
    pub fn abort_unit_of_work(&mut self) {
        if self.depth == 0 {
            return;
        }
        self.depth = 0;
        self.rollback();
    }

    fn rollback(&mut self) {
        self.staged.clear();
        self.pre_commit.clear();
        for change in mem::take(&mut self.changes).into_iter().rev() {
            change.rollback();
        }
        for change in mem::take(&mut self.visibility_changes).into_iter().rev() {
            change.rollback();
        }
        self.snapshot = None;
    }

    pub(crate) fn stage_write(&mut self, write: StagedWrite) {
        self.staged.push(write);
    }

    pub(crate) fn staged_write(&self, catalog_id: CatalogId) -> Option<&StagedWrite> {
        self.staged
            .iter()
            .rev()
            .find(|write| write.catalog_id == catalog_id)
    }

    pub(crate) fn staged_writes(&self) -> &[StagedWrite] {
        &self.staged
    }
}

impl SnapshotProvider for RecoveryUnit {
    fn read_source(&self) -> ReadSource {
        self.read_source
    }

    fn set_read_source(&mut self, source: ReadSource) {
        if self.read_source != source {
            self.snapshot = None;
        }
        self.read_source = source;
    }

    fn abandon_snapshot(&mut self) {
        assert!(
            self.depth == 0,
            "cannot abandon the snapshot inside a unit of work"
        );
        self.snapshot = None;
    }

    fn in_unit_of_work(&self) -> bool {
        self.depth > 0
    }

    fn register_pre_commit_hook(&mut self, hook: PreCommitHook) {
        assert!(self.depth > 0, "pre-commit hooks require a unit of work");
        self.pre_commit.push(hook);
    }

    fn register_catalog_visibility_change(&mut self, change: Box<dyn Change>) {
        assert!(self.depth > 0, "changes require a unit of work");
        self.visibility_changes.push(change);
    }

    fn register_change(&mut self, change: Box<dyn Change>) {
        assert!(self.depth > 0, "changes require a unit of work");
        self.changes.push(change);
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        self.abort_unit_of_work();
    }
}
