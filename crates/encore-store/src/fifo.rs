use crate::entry::{CachedEntry, StoreError};
use crate::generation::Generation;
use crate::key::RequestKey;

/// FIFO (First-In, First-Out) bound over a subset of a generation's keys.
///
/// The subset is selected by a key predicate, so a bounded class of entries
/// (audio files) can share a generation with unbounded ones (shell assets).
/// New entries go to the newest position; evictions always take the oldest
/// member. No promotion on access.
///
/// Admission reads the member list under one lock acquisition, then evicts
/// and inserts under another. Two concurrent admissions of different keys can
/// both see room and both insert, so the bound may be overshot by the number
/// of admissions in flight. It settles back on the next admission. A refused
/// insert evicts nothing.
pub struct FifoBound<P> {
    max_entries: usize,
    member: P,
}

/// What `FifoBound::admit` did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Admission {
    pub evicted: Vec<RequestKey>,
}

impl<P> FifoBound<P>
where
    P: Fn(&RequestKey) -> bool,
{
    pub fn new(max_entries: usize, member: P) -> Self {
        assert!(max_entries > 0, "fifo bound must be > 0");
        Self {
            max_entries,
            member,
        }
    }

    /// Members of the bounded set, oldest first.
    pub fn members(&self, generation: &Generation) -> Vec<RequestKey> {
        generation.keys_matching(|k| (self.member)(k))
    }

    /// Insert `value` under `key`, evicting the oldest members first if the
    /// set is at capacity. Replacing a key that is already present never
    /// evicts.
    pub fn admit(
        &self,
        generation: &Generation,
        key: RequestKey,
        value: CachedEntry,
    ) -> Result<Admission, StoreError> {
        let victims: Vec<RequestKey> = if generation.contains(&key) {
            Vec::new()
        } else {
            let members = self.members(generation);
            let excess = (members.len() + 1).saturating_sub(self.max_entries);
            members.into_iter().take(excess).collect()
        };

        let evicted = generation.put_evicting(key, value, &victims)?;
        for oldest in &evicted {
            tracing::debug!(
                generation = generation.name(),
                key = %oldest,
                "fifo bound evicted oldest entry"
            );
        }
        Ok(Admission { evicted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn resp() -> CachedEntry {
        CachedEntry::new(200, vec![], Bytes::from_static(b"test"))
    }

    fn is_mp3(key: &RequestKey) -> bool {
        key.path().ends_with(".mp3")
    }

    fn song(name: &str) -> RequestKey {
        RequestKey::get(&format!("/mp3/{name}.mp3"))
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let generation = Generation::new("v1", None);
        let bound = FifoBound::new(2, is_mp3);

        bound.admit(&generation, song("a"), resp()).unwrap();
        bound.admit(&generation, song("b"), resp()).unwrap();
        let admission = bound.admit(&generation, song("c"), resp()).unwrap();

        assert_eq!(admission.evicted, vec![song("a")]);
        assert_eq!(bound.members(&generation), vec![song("b"), song("c")]);
    }

    #[test]
    fn no_promotion_on_hit() {
        let generation = Generation::new("v1", None);
        let bound = FifoBound::new(2, is_mp3);
        bound.admit(&generation, song("a"), resp()).unwrap();
        bound.admit(&generation, song("b"), resp()).unwrap();

        // Reading "a" must not save it from eviction
        assert!(generation.get(&song("a")).is_some());

        bound.admit(&generation, song("c"), resp()).unwrap();
        assert!(!generation.contains(&song("a")));
    }

    #[test]
    fn non_members_are_never_evicted_or_counted() {
        let generation = Generation::new("v1", None);
        generation
            .put(RequestKey::get("/index.html"), resp())
            .unwrap();
        let bound = FifoBound::new(1, is_mp3);

        bound.admit(&generation, song("a"), resp()).unwrap();
        bound.admit(&generation, song("b"), resp()).unwrap();

        assert!(generation.contains(&RequestKey::get("/index.html")));
        assert_eq!(bound.members(&generation), vec![song("b")]);
    }

    #[test]
    fn readmitting_present_key_does_not_evict() {
        let generation = Generation::new("v1", None);
        let bound = FifoBound::new(2, is_mp3);
        bound.admit(&generation, song("a"), resp()).unwrap();
        bound.admit(&generation, song("b"), resp()).unwrap();

        let admission = bound.admit(&generation, song("b"), resp()).unwrap();
        assert!(admission.evicted.is_empty());
        assert_eq!(generation.len(), 2);
    }

    #[test]
    fn overshoot_is_trimmed_on_next_admission() {
        let generation = Generation::new("v1", None);
        // Simulate two racing admissions that both skipped eviction
        for name in ["a", "b", "c"] {
            generation.put(song(name), resp()).unwrap();
        }
        let bound = FifoBound::new(2, is_mp3);

        let admission = bound.admit(&generation, song("d"), resp()).unwrap();
        assert_eq!(admission.evicted, vec![song("a"), song("b")]);
        assert_eq!(bound.members(&generation), vec![song("c"), song("d")]);
    }

    #[test]
    fn keeps_most_recent_n() {
        let generation = Generation::new("v1", None);
        let bound = FifoBound::new(3, is_mp3);
        for i in 0..10 {
            bound
                .admit(&generation, song(&format!("s{i}")), resp())
                .unwrap();
        }
        assert_eq!(
            bound.members(&generation),
            vec![song("s7"), song("s8"), song("s9")]
        );
        assert_eq!(generation.stats().evictions, 7);
    }

    #[test]
    fn refused_admission_keeps_oldest() {
        let generation = Generation::new("v1", Some(20));
        let bound = FifoBound::new(1, is_mp3);
        bound.admit(&generation, song("a"), resp()).unwrap();

        let big = CachedEntry::new(200, vec![], Bytes::from_static(b"twenty-one bytes long"));
        let err = bound.admit(&generation, song("big"), big).unwrap_err();

        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert_eq!(bound.members(&generation), vec![song("a")]);
        assert_eq!(generation.stats().evictions, 0);
    }

    #[test]
    #[should_panic(expected = "fifo bound must be > 0")]
    fn zero_bound_panics() {
        let _ = FifoBound::new(0, is_mp3);
    }
}
