use imbl::OrdMap;
use types::{CatalogId, CollectionUuid, NamespaceString, Timestamp};

/// Answer of a historical catalog-id lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogIdLookup {
    Exists(CatalogId),
    NotExists,
    /// Not enough history; the durable catalog must be scanned.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TimestampedCatalogId {
    id: Option<CatalogId>,
    // `None` for an untimestamped write.
    ts: Option<Timestamp>,
}

type History = Vec<TimestampedCatalogId>;

/// Remembers which catalog id a namespace or uuid mapped to over time.
///
/// Untimestamped writes reset the history of their key, since nothing can be
/// said about earlier timestamps afterwards.
#[derive(Clone, Debug, Default)]
pub struct HistoricalCatalogIdTracker {
    nss: OrdMap<NamespaceString, History>,
    uuid: OrdMap<CollectionUuid, History>,
    oldest: Option<Timestamp>,
}

impl HistoricalCatalogIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        nss: &NamespaceString,
        uuid: CollectionUuid,
        id: CatalogId,
        ts: Option<Timestamp>,
    ) {
        record(&mut self.nss, nss, Some(id), ts);
        record(&mut self.uuid, &uuid, Some(id), ts);
    }

    pub fn drop(&mut self, nss: &NamespaceString, uuid: CollectionUuid, ts: Option<Timestamp>) {
        record(&mut self.nss, nss, None, ts);
        record(&mut self.uuid, &uuid, None, ts);
    }

    pub fn rename(
        &mut self,
        from: &NamespaceString,
        to: &NamespaceString,
        id: CatalogId,
        ts: Option<Timestamp>,
    ) {
        record(&mut self.nss, from, None, ts);
        record(&mut self.nss, to, Some(id), ts);
    }

    pub fn lookup_by_nss(&self, nss: &NamespaceString, ts: Option<Timestamp>) -> CatalogIdLookup {
        lookup(self.nss.get(nss), ts, self.oldest)
    }

    pub fn lookup_by_uuid(&self, uuid: CollectionUuid, ts: Option<Timestamp>) -> CatalogIdLookup {
        lookup(self.uuid.get(&uuid), ts, self.oldest)
    }

    /// Oldest timestamp history is kept for.
    pub fn oldest(&self) -> Option<Timestamp> {
        self.oldest
    }

    /// Forget history no reader at or after `oldest` can need.
    pub fn cleanup(&mut self, oldest: Timestamp) {
        self.nss = cleanup_map(&self.nss, oldest);
        self.uuid = cleanup_map(&self.uuid, oldest);
        self.oldest = Some(self.oldest.map_or(oldest, |current| current.max(oldest)));
    }
}

fn record<K: Ord + Clone>(
    map: &mut OrdMap<K, History>,
    key: &K,
    id: Option<CatalogId>,
    ts: Option<Timestamp>,
) {
    let mut history = map.get(key).cloned().unwrap_or_default();
    push(&mut history, id, ts);
    map.insert(key.clone(), history);
}

fn push(history: &mut History, id: Option<CatalogId>, ts: Option<Timestamp>) {
    match ts {
        None => {
            history.clear();
            history.push(TimestampedCatalogId { id, ts: None });
        }
        Some(ts) => match history.last_mut() {
            // Several writes in one commit: the last one wins.
            Some(last) if last.ts == Some(ts) => last.id = id,
            _ => history.push(TimestampedCatalogId { id, ts: Some(ts) }),
        },
    }
}

fn lookup(history: Option<&History>, ts: Option<Timestamp>, oldest: Option<Timestamp>) -> CatalogIdLookup {
    let to_lookup = |id: Option<CatalogId>| match id {
        Some(id) => CatalogIdLookup::Exists(id),
        None => CatalogIdLookup::NotExists,
    };
    match ts {
        None => history
            .and_then(|history| history.last())
            .map_or(CatalogIdLookup::NotExists, |last| to_lookup(last.id)),
        Some(ts) => {
            if oldest.is_some_and(|oldest| ts < oldest) {
                return CatalogIdLookup::Unknown;
            }
            history
                .and_then(|history| {
                    history
                        .iter()
                        .rev()
                        .find(|entry| entry.ts.is_some_and(|entry_ts| entry_ts <= ts))
                })
                .map_or(CatalogIdLookup::Unknown, |entry| to_lookup(entry.id))
        }
    }
}

fn cleanup_map<K: Ord + Clone>(map: &OrdMap<K, History>, oldest: Timestamp) -> OrdMap<K, History> {
    let mut cleaned = OrdMap::new();
    for (key, history) in map.iter() {
        let keep_from = history
            .iter()
            .rposition(|entry| entry.ts.is_some_and(|ts| ts <= oldest))
            .unwrap_or(0);
        let kept: History = history[keep_from..].to_vec();
        let only_old_drop = kept.len() == 1
            && kept[0].id.is_none()
            && kept[0].ts.is_some_and(|ts| ts <= oldest);
        if !only_old_drop {
            cleaned.insert(key.clone(), kept);
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use testsupport::proptest_generators::{arb_increasing_timestamps, arb_namespace};

    fn ts(secs: u32) -> Option<Timestamp> {
        Some(Timestamp::new(secs, 0))
    }

    #[test]
    fn timestamped_history() {
        let nss = NamespaceString::new("a", "b");
        let uuid = CollectionUuid::generate();
        let mut tracker = HistoricalCatalogIdTracker::new();
        tracker.create(&nss, uuid, CatalogId(1), ts(10));
        tracker.drop(&nss, uuid, ts(20));

        assert_eq!(tracker.lookup_by_nss(&nss, ts(5)), CatalogIdLookup::Unknown);
        assert_eq!(tracker.lookup_by_nss(&nss, ts(15)), CatalogIdLookup::Exists(CatalogId(1)));
        assert_eq!(tracker.lookup_by_uuid(uuid, ts(25)), CatalogIdLookup::NotExists);
        assert_eq!(tracker.lookup_by_nss(&nss, None), CatalogIdLookup::NotExists);
    }

    #[test]
    fn rename_moves_namespace_history() {
        let from = NamespaceString::new("a", "from");
        let to = NamespaceString::new("a", "to");
        let uuid = CollectionUuid::generate();
        let mut tracker = HistoricalCatalogIdTracker::new();
        tracker.create(&from, uuid, CatalogId(4), ts(10));
        tracker.rename(&from, &to, CatalogId(4), ts(20));

        assert_eq!(tracker.lookup_by_nss(&from, ts(15)), CatalogIdLookup::Exists(CatalogId(4)));
        assert_eq!(tracker.lookup_by_nss(&from, ts(20)), CatalogIdLookup::NotExists);
        assert_eq!(tracker.lookup_by_nss(&to, ts(20)), CatalogIdLookup::Exists(CatalogId(4)));
        assert_eq!(tracker.lookup_by_uuid(uuid, ts(30)), CatalogIdLookup::Exists(CatalogId(4)));
    }

    #[test]
    fn drop_and_create_in_one_commit_keeps_the_create() {
        let nss = NamespaceString::new("a", "b");
        let mut tracker = HistoricalCatalogIdTracker::new();
        tracker.create(&nss, CollectionUuid::generate(), CatalogId(1), ts(10));
        tracker.drop(&nss, CollectionUuid::generate(), ts(20));
        tracker.create(&nss, CollectionUuid::generate(), CatalogId(2), ts(20));
        assert_eq!(tracker.lookup_by_nss(&nss, ts(20)), CatalogIdLookup::Exists(CatalogId(2)));
    }

    #[test]
    fn mixed_mode_writes_survive_cleanup() {
        let nss = NamespaceString::new("a", "b");
        let mut tracker = HistoricalCatalogIdTracker::new();

        let first = CollectionUuid::generate();
        tracker.create(&nss, first, CatalogId(1), None);
        tracker.drop(&nss, first, ts(10));

        let second = CollectionUuid::generate();
        tracker.create(&nss, second, CatalogId(2), None);
        tracker.cleanup(Timestamp::new(20, 0));
        assert_eq!(tracker.lookup_by_nss(&nss, None), CatalogIdLookup::Exists(CatalogId(2)));

        tracker.drop(&nss, second, ts(30));
        tracker.cleanup(Timestamp::new(40, 0));
        assert_eq!(tracker.lookup_by_nss(&nss, None), CatalogIdLookup::NotExists);
        assert_eq!(tracker.lookup_by_nss(&nss, ts(35)), CatalogIdLookup::Unknown);
        assert_eq!(tracker.lookup_by_nss(&nss, ts(10)), CatalogIdLookup::Unknown);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Create(bool),
        Drop(bool),
        Cleanup,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(Op::Create),
            any::<bool>().prop_map(Op::Drop),
            Just(Op::Cleanup),
        ]
    }

    proptest! {
        #[test]
        fn cleanup_never_changes_definite_answers(
            nss in arb_namespace(),
            (ops, times) in prop::collection::vec(arb_op(), 1..40)
                .prop_flat_map(|ops| {
                    let len = ops.len();
                    (Just(ops), arb_increasing_timestamps(len))
                }),
        ) {
            let mut tracker = HistoricalCatalogIdTracker::new();
            let mut live: Option<(CollectionUuid, CatalogId)> = None;
            let mut next_id = 1;

            for (op, &now) in ops.into_iter().zip(&times) {
                match op {
                    Op::Create(timestamped) if live.is_none() => {
                        let uuid = CollectionUuid::generate();
                        let id = CatalogId(next_id);
                        next_id += 1;
                        tracker.create(&nss, uuid, id, timestamped.then_some(now));
                        live = Some((uuid, id));
                    }
                    Op::Drop(timestamped) => {
                        if let Some((uuid, _)) = live.take() {
                            tracker.drop(&nss, uuid, timestamped.then_some(now));
                        }
                    }
                    Op::Cleanup => {
                        let answers: Vec<_> = times
                            .iter()
                            .copied()
                            .filter(|at| *at >= now)
                            .map(|at| (at, tracker.lookup_by_nss(&nss, Some(at))))
                            .collect();
                        tracker.cleanup(now);
                        for (at, before) in answers {
                            let after = tracker.lookup_by_nss(&nss, Some(at));
                            prop_assert!(after == before || after == CatalogIdLookup::Unknown);
                        }
                    }
                    Op::Create(_) => {}
                }
                let expected = live.map_or(CatalogIdLookup::NotExists, |(_, id)| CatalogIdLookup::Exists(id));
                prop_assert_eq!(tracker.lookup_by_nss(&nss, None), expected);
            }
        }
    }
}
