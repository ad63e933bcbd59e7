use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
};

use common::DbResult;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use types::Timestamp;

use crate::ident::{Ident, SharedIdent};

struct DropPendingIdent {
    drop_ts: Timestamp,
    // Strong references live in collections and index entries; the reaper only observes them.
    token: Weak<Ident>,
    // Set while the physical removal runs. The ident can no longer be acquired.
    dropping: bool,
}

type DropPendingIdents = BTreeMap<String, DropPendingIdent>;

/// Tracks drop-pending idents and physically removes them once they are both
/// old enough and unreferenced.
#[derive(Default)]
pub struct IdentReaper {
    idents: Mutex<DropPendingIdents>,
}

impl IdentReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ident` as removable once `drop_ts` is no longer needed.
    ///
    /// Panics if the ident is already drop-pending.
    pub fn add_drop_pending_ident(&self, drop_ts: Timestamp, ident: &SharedIdent) {
        let mut idents = self.idents.lock();
        let previous = idents.insert(
            ident.name().to_string(),
            DropPendingIdent {
                drop_ts,
                token: Arc::downgrade(ident),
                dropping: false,
            },
        );
        assert!(
            previous.is_none(),
            "ident '{}' is already drop-pending",
            ident.name()
        );
        debug!(ident = %ident, %drop_ts, "registered drop-pending ident");
    }

    /// Re-acquire a drop-pending ident. Returns the live handle when one still
    /// exists, a fresh handle when every previous holder is gone, and `None`
    /// when the ident is not drop-pending or is being removed.
    pub fn mark_ident_in_use(&self, name: &str) -> Option<SharedIdent> {
        Self::reacquire(&mut self.idents.lock(), name)
    }

    /// Acquire `name` whether or not it is drop-pending. Drop-pending idents
    /// are re-acquired as by [`Self::mark_ident_in_use`]; any other ident is
    /// resolved by `untracked` while the reaper's lock is held, so it cannot
    /// start being removed in between.
    pub fn acquire_ident<F>(&self, name: &str, untracked: F) -> Option<SharedIdent>
    where
        F: FnOnce() -> Option<SharedIdent>,
    {
        let mut idents = self.idents.lock();
        if idents.contains_key(name) {
            return Self::reacquire(&mut idents, name);
        }
        untracked()
    }

    fn reacquire(idents: &mut DropPendingIdents, name: &str) -> Option<SharedIdent> {
        let entry = idents.get_mut(name)?;
        if entry.dropping {
            return None;
        }
        if let Some(existing) = entry.token.upgrade() {
            return Some(existing);
        }
        let fresh = Arc::new(Ident::new(name));
        entry.token = Arc::downgrade(&fresh);
        debug!(ident = name, "re-acquired expired drop-pending ident");
        Some(fresh)
    }

    /// Remove every ident dropped at or before `ts` that nobody references.
    ///
    /// `drop_fn` performs the physical removal. Failed removals are kept and
    /// retried on the next call. Returns the names that were removed.
    pub fn drop_idents_older_than<F>(&self, ts: Timestamp, mut drop_fn: F) -> Vec<String>
    where
        F: FnMut(&str) -> DbResult<()>,
    {
        let candidates: Vec<(String, Timestamp)> = self
            .idents
            .lock()
            .iter_mut()
            .filter(|(_, info)| {
                !info.dropping && info.drop_ts <= ts && info.token.strong_count() == 0
            })
            .map(|(name, info)| {
                info.dropping = true;
                (name.clone(), info.drop_ts)
            })
            .collect();

        let mut dropped = Vec::with_capacity(candidates.len());
        for (name, drop_ts) in candidates {
            let result = drop_fn(&name);
            let mut idents = self.idents.lock();
            match result {
                Ok(()) => {
                    idents.remove(&name);
                    info!(ident = %name, %drop_ts, "dropped ident");
                    dropped.push(name);
                }
                Err(err) => {
                    warn!(ident = %name, error = %err, "failed to drop ident, will retry");
                    if let Some(entry) = idents.get_mut(&name) {
                        entry.dropping = false;
                    }
                }
            }
        }
        dropped
    }

    pub fn get_num_drop_pending_idents(&self) -> usize {
        self.idents.lock().len()
    }

    pub fn get_drop_pending_idents(&self) -> BTreeSet<String> {
        self.idents.lock().keys().cloned().collect()
    }

    /// Earliest drop timestamp among pending idents.
    pub fn get_earliest_drop_timestamp(&self) -> Option<Timestamp> {
        self.idents.lock().values().map(|info| info.drop_ts).min()
    }

}
