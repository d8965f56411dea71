//! Vector clocks
//!
//! A [`Clock`] maps each actor to the highest sequence number known from it.
//! Clocks form a join semilattice under [`union`]; [`cmp`] gives the partial
//! order and [`is_satisfied`] answers "does this state cover that one".

use crate::keys::ActorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sequence number of a change within an actor's feed (1-based).
pub type Seq = u64;

/// Cursor sentinel meaning "every future sequence number".
pub const INFINITY: Seq = u64::MAX;

/// Outcome of comparing two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpClock {
    Eq,
    Gt,
    Lt,
    Concurrent,
}

impl CmpClock {
    /// The result of the comparison with the arguments swapped.
    pub fn mirror(self) -> Self {
        match self {
            CmpClock::Gt => CmpClock::Lt,
            CmpClock::Lt => CmpClock::Gt,
            other => other,
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clock(BTreeMap<ActorId, Seq>);

impl Clock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sequence known for `actor`, zero when absent.
    pub fn get(&self, actor: &ActorId) -> Seq {
        self.0.get(actor).copied().unwrap_or(0)
    }

    pub fn contains(&self, actor: &ActorId) -> bool {
        self.0.contains_key(actor)
    }

    /// Raise the entry for `actor` to `seq`. Returns true if it changed.
    pub fn raise(&mut self, actor: ActorId, seq: Seq) -> bool {
        let entry = self.0.entry(actor).or_insert(0);
        if seq > *entry {
            *entry = seq;
            true
        } else {
            false
        }
    }

    /// Overwrite an entry, regardless of the current value.
    pub fn insert(&mut self, actor: ActorId, seq: Seq) {
        self.0.insert(actor, seq);
    }

    pub fn remove(&mut self, actor: &ActorId) -> Option<Seq> {
        self.0.remove(actor)
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> + '_ {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, &Seq)> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold `other` into this clock. Returns true if anything grew.
    pub fn union_with(&mut self, other: &Clock) -> bool {
        let mut changed = false;
        for (actor, seq) in other.iter() {
            changed |= self.raise(*actor, *seq);
        }
        changed
    }

    /// Entries present in both clocks, with the smaller value.
    pub fn intersection(&self, other: &Clock) -> Clock {
        self.0
            .iter()
            .filter_map(|(actor, seq)| {
                other
                    .0
                    .get(actor)
                    .map(|theirs| (*actor, (*seq).min(*theirs)))
            })
            .collect()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (actor, seq) in &self.0 {
            if *seq == INFINITY {
                map.entry(&actor.short(), &"inf");
            } else {
                map.entry(&actor.short(), seq);
            }
        }
        map.finish()
    }
}

impl FromIterator<(ActorId, Seq)> for Clock {
    fn from_iter<I: IntoIterator<Item = (ActorId, Seq)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Clock {
    type Item = (&'a ActorId, &'a Seq);
    type IntoIter = std::collections::btree_map::Iter<'a, ActorId, Seq>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Compare two clocks over the union of their actors.
pub fn cmp(a: &Clock, b: &Clock) -> CmpClock {
    let mut a_ahead = false;
    let mut b_ahead = false;

    for actor in a.actors().chain(b.actors()) {
        let (x, y) = (a.get(actor), b.get(actor));
        if x > y {
            a_ahead = true;
        } else if y > x {
            b_ahead = true;
        }
    }

    match (a_ahead, b_ahead) {
        (false, false) => CmpClock::Eq,
        (true, false) => CmpClock::Gt,
        (false, true) => CmpClock::Lt,
        (true, true) => CmpClock::Concurrent,
    }
}

/// Per-actor maximum of both clocks.
pub fn union(a: &Clock, b: &Clock) -> Clock {
    let mut out = a.clone();
    out.union_with(b);
    out
}

/// True when every actor in `target` appears in `candidate` with an equal or
/// greater sequence.
pub fn is_satisfied(target: &Clock, candidate: &Clock) -> bool {
    target.iter().all(|(actor, seq)| {
        candidate
            .0
            .get(actor)
            .map(|have| have >= seq)
            .unwrap_or(false)
    })
}

/// Equal on the union of keys, treating absent entries as zero.
pub fn equivalent(a: &Clock, b: &Clock) -> bool {
    cmp(a, b) == CmpClock::Eq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::FeedId;
    use proptest::prelude::*;

    fn actor(n: u8) -> ActorId {
        FeedId::from_bytes([n; 32])
    }

    fn clock(entries: &[(u8, Seq)]) -> Clock {
        entries.iter().map(|(a, s)| (actor(*a), *s)).collect()
    }

    fn arb_clock() -> impl Strategy<Value = Clock> {
        prop::collection::btree_map(0u8..6, 0u64..5, 0..6)
            .prop_map(|m| m.into_iter().map(|(a, s)| (actor(a), s)).collect())
    }

    #[test]
    fn test_cmp_basic_cases() {
        let a = clock(&[(1, 1), (2, 2)]);
        assert_eq!(cmp(&a, &a), CmpClock::Eq);
        assert_eq!(cmp(&clock(&[(1, 2), (2, 2)]), &a), CmpClock::Gt);
        assert_eq!(cmp(&a, &clock(&[(1, 2), (2, 2)])), CmpClock::Lt);
        assert_eq!(cmp(&clock(&[(1, 2)]), &clock(&[(2, 1)])), CmpClock::Concurrent);
    }

    #[test]
    fn test_cmp_extra_key_dominates() {
        assert_eq!(cmp(&clock(&[(1, 1), (2, 1)]), &clock(&[(1, 1)])), CmpClock::Gt);
    }

    #[test]
    fn test_is_satisfied_cases() {
        assert!(is_satisfied(&clock(&[(1, 1), (2, 2)]), &clock(&[(1, 1), (2, 2)])));
        assert!(!is_satisfied(&clock(&[(1, 2)]), &clock(&[(1, 1), (2, 2)])));
        assert!(is_satisfied(&clock(&[(1, 1)]), &clock(&[(1, 1), (2, 1)])));
        assert!(!is_satisfied(&clock(&[(1, 1), (2, 1)]), &clock(&[(1, 1)])));
    }

    #[test]
    fn test_is_satisfied_requires_presence() {
        // A zero entry still has to be present in the candidate
        assert!(!is_satisfied(&clock(&[(1, 0)]), &Clock::new()));
        assert!(is_satisfied(&Clock::new(), &Clock::new()));
    }

    #[test]
    fn test_raise_never_lowers() {
        let mut c = clock(&[(1, 5)]);
        assert!(!c.raise(actor(1), 3));
        assert_eq!(c.get(&actor(1)), 5);
        assert!(c.raise(actor(1), 6));
    }

    #[test]
    fn test_intersection() {
        let a = clock(&[(1, 3), (2, 1)]);
        let b = clock(&[(1, 2), (3, 9)]);
        assert_eq!(a.intersection(&b), clock(&[(1, 2)]));
    }

    #[test]
    fn test_infinity_serializes() {
        let c = clock(&[(1, INFINITY)]);
        let json = serde_json::to_string(&c).unwrap();
        let back: Clock = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&actor(1)), INFINITY);
    }

    proptest! {
        #[test]
        fn prop_cmp_reflexive(a in arb_clock()) {
            prop_assert_eq!(cmp(&a, &a), CmpClock::Eq);
        }

        #[test]
        fn prop_cmp_mirrors(a in arb_clock(), b in arb_clock()) {
            prop_assert_eq!(cmp(&a, &b), cmp(&b, &a).mirror());
        }

        #[test]
        fn prop_union_commutative(a in arb_clock(), b in arb_clock()) {
            prop_assert!(equivalent(&union(&a, &b), &union(&b, &a)));
        }

        #[test]
        fn prop_union_associative(a in arb_clock(), b in arb_clock(), c in arb_clock()) {
            prop_assert_eq!(union(&union(&a, &b), &c), union(&a, &union(&b, &c)));
        }

        #[test]
        fn prop_union_idempotent(a in arb_clock()) {
            prop_assert_eq!(union(&a, &a), a);
        }

        #[test]
        fn prop_union_dominates_inputs(a in arb_clock(), b in arb_clock()) {
            let u = union(&a, &b);
            let order = cmp(&u, &a);
            prop_assert!(order == CmpClock::Eq || order == CmpClock::Gt);
            prop_assert!(is_satisfied(&a, &u));
            prop_assert!(is_satisfied(&b, &u));
        }
    }
}
