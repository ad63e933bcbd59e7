use ahash::RandomState;
use hashbrown::HashMap;
use types::NamespaceString;

type Map<K, V> = HashMap<K, V, RandomState>;

/// Lock modes in the usual intent hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    IS,
    IX,
    S,
    X,
}

impl LockMode {
    /// True when holding `self` satisfies a request for `other`.
    pub fn covers(self, other: LockMode) -> bool {
        match self {
            LockMode::X => true,
            LockMode::S => matches!(other, LockMode::S | LockMode::IS),
            LockMode::IX => matches!(other, LockMode::IX | LockMode::IS),
            LockMode::IS => other == LockMode::IS,
        }
    }

    fn strongest(self, other: LockMode) -> LockMode {
        match (self, other) {
            (LockMode::X, _) | (_, LockMode::X) => LockMode::X,
            (LockMode::S, LockMode::IX) | (LockMode::IX, LockMode::S) => LockMode::X,
            (LockMode::S, _) | (_, LockMode::S) => LockMode::S,
            (LockMode::IX, _) | (_, LockMode::IX) => LockMode::IX,
            _ => LockMode::IS,
        }
    }
}

/// Lock acquisition and mode checks consumed by the catalog.
pub trait LockProvider: Send {
    fn lock_global(&mut self, mode: LockMode);
    fn unlock_global(&mut self);
    fn lock_collection(&mut self, nss: &NamespaceString, mode: LockMode);
    fn unlock_collection(&mut self, nss: &NamespaceString);
    fn global_mode(&self) -> Option<LockMode>;
    fn collection_mode(&self, nss: &NamespaceString) -> Option<LockMode>;

    fn is_locked(&self) -> bool {
        self.global_mode().is_some()
    }

    /// Global exclusive.
    fn is_w(&self) -> bool {
        self.global_mode() == Some(LockMode::X)
    }

    fn is_collection_locked_for_mode(&self, nss: &NamespaceString, mode: LockMode) -> bool {
        self.is_w()
            || self
                .collection_mode(nss)
                .is_some_and(|held| held.covers(mode))
    }
}

/// Bookkeeping lock provider. Records held modes recursively; conflicts
/// between operations are not arbitrated.
#[derive(Debug, Default)]
pub struct Locker {
    global: Vec<LockMode>,
    collections: Map<NamespaceString, Vec<LockMode>>,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockProvider for Locker {
    fn lock_global(&mut self, mode: LockMode) {
        self.global.push(mode);
    }

    fn unlock_global(&mut self) {
        assert!(self.global.pop().is_some(), "global lock not held");
        if self.global.is_empty() {
            assert!(
                self.collections.is_empty(),
                "collection locks outlive the global lock"
            );
        }
    }

    fn lock_collection(&mut self, nss: &NamespaceString, mode: LockMode) {
        let global = self
            .global_mode()
            .unwrap_or_else(|| panic!("locking {nss} requires the global lock"));
        let intent = match mode {
            LockMode::IS | LockMode::S => LockMode::IS,
            LockMode::IX | LockMode::X => LockMode::IX,
        };
        assert!(
            global.covers(intent),
            "global {global:?} does not cover collection {mode:?} on {nss}"
        );
        self.collections.entry(nss.clone()).or_default().push(mode);
    }

    fn unlock_collection(&mut self, nss: &NamespaceString) {
        let held = self
            .collections
            .get_mut(nss)
            .unwrap_or_else(|| panic!("collection lock on {nss} not held"));
        held.pop();
        if held.is_empty() {
            self.collections.remove(nss);
        }
    }

    fn global_mode(&self) -> Option<LockMode> {
        self.global.iter().copied().reduce(LockMode::strongest)
    }

    fn collection_mode(&self, nss: &NamespaceString) -> Option<LockMode> {
        self.collections
            .get(nss)
            .and_then(|held| held.iter().copied().reduce(LockMode::strongest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_coverage() {
        assert!(LockMode::X.covers(LockMode::S));
        assert!(LockMode::IX.covers(LockMode::IS));
        assert!(!LockMode::IX.covers(LockMode::S));
        assert!(!LockMode::IS.covers(LockMode::IX));
        assert!(LockMode::S.covers(LockMode::IS));
    }

    #[test]
    fn collection_locks_nest_under_global() {
        let nss = NamespaceString::new("app", "users");
        let mut locker = Locker::new();
        locker.lock_global(LockMode::IX);
        locker.lock_collection(&nss, LockMode::X);
        assert!(locker.is_collection_locked_for_mode(&nss, LockMode::IX));
        assert!(!locker.is_w());

        locker.unlock_collection(&nss);
        assert!(!locker.is_collection_locked_for_mode(&nss, LockMode::IS));
        locker.unlock_global();
        assert!(!locker.is_locked());
    }

    #[test]
    fn global_exclusive_implies_every_collection() {
        let mut locker = Locker::new();
        locker.lock_global(LockMode::X);
        assert!(locker.is_collection_locked_for_mode(&NamespaceString::new("a", "b"), LockMode::X));
    }

    #[test]
    #[should_panic(expected = "requires the global lock")]
    fn collection_lock_without_global_panics() {
        Locker::new().lock_collection(&NamespaceString::new("a", "b"), LockMode::IS);
    }
}
