//! Racing readers against a DDL commit that is stalled at a chosen point.
//!
//! The DDL runs on its own thread. Once it reaches the stall point it waits
//! until the reader on the calling thread has finished, then completes its
//! commit.

use std::{sync::Arc, thread};

use catalog::{OperationContext, ServiceContext, WriteUnitOfWork};
use common::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use storage::{Change, SnapshotProvider};
use tracing::debug;
use types::{NamespaceString, Timestamp};

use crate::fixtures::{lock_for_ddl, unlock_after_ddl};

/// Where a DDL commit is held while the reader runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPoint {
    /// The catalog has marked the changed namespaces as pending, but storage
    /// has not applied the durable writes yet.
    BeforeCommit,
    /// Storage has applied the durable writes, but the new catalog version is
    /// not published yet.
    AfterCommit,
}

#[derive(Default)]
struct State {
    arrived: bool,
    released: bool,
}

/// One-shot handshake between the stalled committer and the reader.
#[derive(Clone, Default)]
pub struct Rendezvous {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal arrival and block until [`Rendezvous::release`].
    pub fn arrive_and_wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.arrived = true;
        cvar.notify_all();
        while !state.released {
            cvar.wait(&mut state);
        }
    }

    /// Block until the other side has arrived. Returns `false` if it was
    /// released without arriving.
    pub fn wait_for_arrival(&self) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        while !state.arrived && !state.released {
            cvar.wait(&mut state);
        }
        state.arrived
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.released = true;
        cvar.notify_all();
    }

    fn mark_arrived(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().arrived = true;
        cvar.notify_all();
    }
}

// Unblocks the reader if the DDL thread exits without reaching its stall.
struct ArriveOnDrop(Rendezvous);

impl Drop for ArriveOnDrop {
    fn drop(&mut self) {
        self.0.mark_arrived();
    }
}

// Unblocks the committer if the reader panics.
struct ReleaseOnDrop(Rendezvous);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct StallOnCommit(Rendezvous);

impl Change for StallOnCommit {
    fn commit(self: Box<Self>, commit_ts: Option<Timestamp>) {
        debug!(?commit_ts, "stalling catalog publication");
        self.0.arrive_and_wait();
    }

    fn rollback(self: Box<Self>) {}
}

/// Run `ddl` on `service` in a write unit of work committed at `commit_ts`,
/// hold its commit at `commit_point`, and run `read` on a fresh operation
/// while it is held. Returns what `read` returned once the DDL finished.
///
/// `namespaces` are locked exclusively for the DDL. An error from `ddl` or
/// from its commit is returned after the reader ran.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let ctx = TestContext::new().unwrap();
/// let nss = nss!("app.users");
/// let seen = concurrent_commit_and_establish(
///     ctx.service(),
///     CommitPoint::BeforeCommit,
///     ts!(10),
///     &[&nss],
///     |op| catalog::ddl::create_collection(op, &nss).map(|_| ()),
///     |op| establish(op, &nss, None).unwrap(),
/// )
/// .unwrap();
/// assert!(seen.is_none());
/// assert!(ctx.catalog().find_collection_by_namespace(&nss).is_some());
/// ```
pub fn concurrent_commit_and_establish<D, R, T>(
    service: &Arc<ServiceContext>,
    commit_point: CommitPoint,
    commit_ts: Timestamp,
    namespaces: &[&NamespaceString],
    ddl: D,
    read: R,
) -> DbResult<T>
where
    D: FnOnce(&mut OperationContext) -> DbResult<()> + Send,
    R: FnOnce(&mut OperationContext) -> T,
{
    let rendezvous = Rendezvous::new();

    thread::scope(|scope| {
        let committer = {
            let rendezvous = rendezvous.clone();
            scope.spawn(move || {
                let _arrived = ArriveOnDrop(rendezvous.clone());
                let mut op = service.make_operation_context();
                lock_for_ddl(&mut op, namespaces);
                let result = stalled_unit_of_work(&mut op, commit_point, commit_ts, rendezvous, ddl);
                op.recovery_unit_mut().clear_commit_timestamp();
                unlock_after_ddl(&mut op, namespaces);
                result
            })
        };

        let value = {
            let _release = ReleaseOnDrop(rendezvous.clone());
            let stalled = rendezvous.wait_for_arrival();
            debug!(?commit_point, stalled, "running reader against in-flight commit");
            let mut op = service.make_operation_context();
            read(&mut op)
        };

        let ddl_result = committer
            .join()
            .map_err(|_| DbError::Catalog("ddl thread panicked".into()))?;
        ddl_result.map(|()| value)
    })
}

fn stalled_unit_of_work<D>(
    op: &mut OperationContext,
    commit_point: CommitPoint,
    commit_ts: Timestamp,
    rendezvous: Rendezvous,
    ddl: D,
) -> DbResult<()>
where
    D: FnOnce(&mut OperationContext) -> DbResult<()>,
{
    let mut wuow = WriteUnitOfWork::new(op);
    wuow.recovery_unit_mut().set_commit_timestamp(commit_ts);
    match commit_point {
        // Runs ahead of the catalog publication registered by the DDL.
        CommitPoint::AfterCommit => wuow
            .recovery_unit_mut()
            .register_catalog_visibility_change(Box::new(StallOnCommit(rendezvous.clone()))),
        CommitPoint::BeforeCommit => {}
    }
    ddl(&mut wuow)?;
    if commit_point == CommitPoint::BeforeCommit {
        // Runs after the catalog marked its pending namespaces.
        wuow.recovery_unit_mut().register_pre_commit_hook(Box::new(move || {
            rendezvous.arrive_and_wait();
            Ok(())
        }));
    }
    wuow.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous_handshake() {
        let rendezvous = Rendezvous::new();
        let waiter = rendezvous.clone();
        let handle = thread::spawn(move || waiter.arrive_and_wait());
        assert!(rendezvous.wait_for_arrival());
        rendezvous.release();
        handle.join().unwrap();
    }

    #[test]
    fn test_rendezvous_released_without_arrival() {
        let rendezvous = Rendezvous::new();
        rendezvous.release();
        assert!(!rendezvous.wait_for_arrival());
    }

    #[test]
    fn test_arrive_on_drop_unblocks_reader() {
        let rendezvous = Rendezvous::new();
        drop(ArriveOnDrop(rendezvous.clone()));
        assert!(rendezvous.wait_for_arrival());
    }
}
