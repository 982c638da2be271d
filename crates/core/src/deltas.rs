//! Counter deltas carried by a projection task.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::counter::Counter;

/// Signed counter changes to apply to one projected document.
///
/// Zero-valued entries are never stored: inserting a zero is a no-op and a
/// merge that cancels out removes the entry. Iteration follows the schema's
/// forwarding order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deltas<C: Counter> {
    values: BTreeMap<C, i64>,
}

impl<C: Counter> Default for Deltas<C> {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }
}

impl<C: Counter> Deltas<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deltas holding a single counter change.
    pub fn single(counter: C, delta: i64) -> Self {
        Self::new().with(counter, delta)
    }

    /// Builder form of [`Deltas::add`].
    pub fn with(mut self, counter: C, delta: i64) -> Self {
        self.add(counter, delta);
        self
    }

    /// Accumulate `delta` into `counter`.
    pub fn add(&mut self, counter: C, delta: i64) {
        if delta == 0 {
            return;
        }
        let sum = self.get(counter).saturating_add(delta);
        if sum == 0 {
            self.values.remove(&counter);
        } else {
            self.values.insert(counter, sum);
        }
    }

    /// Fold every change of `other` into `self`.
    pub fn merge(&mut self, other: &Deltas<C>) {
        for (counter, delta) in other.iter() {
            self.add(counter, delta);
        }
    }

    pub fn get(&self, counter: C) -> i64 {
        self.values.get(&counter).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Non-zero changes in forwarding order.
    pub fn iter(&self) -> impl Iterator<Item = (C, i64)> + '_ {
        self.values.iter().map(|(c, d)| (*c, *d))
    }
}

impl<C: Counter> FromIterator<(C, i64)> for Deltas<C> {
    fn from_iter<I: IntoIterator<Item = (C, i64)>>(iter: I) -> Self {
        let mut deltas = Self::new();
        for (counter, delta) in iter {
            deltas.add(counter, delta);
        }
        deltas
    }
}

impl<C: Counter> Serialize for Deltas<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.values.iter().map(|(c, d)| (c.as_str(), *d)))
    }
}

impl<'de, C: Counter> Deserialize<'de> for Deltas<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, i64>::deserialize(deserializer)?;
        let mut deltas = Self::new();
        for (name, delta) in raw {
            let counter = C::parse(&name).map_err(D::Error::custom)?;
            deltas.add(counter, delta);
        }
        Ok(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{DataCounter, ProjectCounter};
    use proptest::prelude::*;

    #[test]
    fn zero_entries_are_not_stored() {
        let deltas = Deltas::new()
            .with(ProjectCounter::Like, 0)
            .with(ProjectCounter::Comment, 2);

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas.get(ProjectCounter::Like), 0);
        assert_eq!(deltas.get(ProjectCounter::Comment), 2);
    }

    #[test]
    fn cancelling_merge_removes_entry() {
        let mut deltas = Deltas::single(ProjectCounter::Like, 1);
        deltas.merge(&Deltas::single(ProjectCounter::Like, -1));
        assert!(deltas.is_empty());
    }

    #[test]
    fn iteration_follows_schema_order() {
        let deltas = Deltas::new()
            .with(ProjectCounter::View, 5)
            .with(ProjectCounter::Comment, -1)
            .with(ProjectCounter::Like, 3);

        let order: Vec<_> = deltas.iter().map(|(c, _)| c).collect();
        assert_eq!(
            order,
            vec![ProjectCounter::Comment, ProjectCounter::Like, ProjectCounter::View]
        );
    }

    #[test]
    fn serializes_as_named_object() {
        let deltas = Deltas::new()
            .with(ProjectCounter::Like, -1)
            .with(ProjectCounter::View, 12);

        let json = serde_json::to_value(&deltas).unwrap();
        assert_eq!(json, serde_json::json!({"like": -1, "view": 12}));

        let back: Deltas<ProjectCounter> = serde_json::from_value(json).unwrap();
        assert_eq!(back, deltas);
    }

    #[test]
    fn decoding_rejects_counters_outside_schema() {
        let json = serde_json::json!({"like": 1});
        let err = serde_json::from_value::<Deltas<DataCounter>>(json).unwrap_err();
        assert!(err.to_string().contains("unknown counter 'like'"));
    }

    proptest! {
        /// Merging is order-independent: counter deltas commute.
        #[test]
        fn merge_is_commutative(
            a in prop::collection::vec((0usize..3, -50i64..50), 0..8),
            b in prop::collection::vec((0usize..3, -50i64..50), 0..8),
        ) {
            let to_deltas = |v: &[(usize, i64)]| -> Deltas<ProjectCounter> {
                v.iter().map(|(i, d)| (ProjectCounter::all()[*i], *d)).collect()
            };
            let (da, db) = (to_deltas(&a), to_deltas(&b));

            let mut ab = da.clone();
            ab.merge(&db);
            let mut ba = db.clone();
            ba.merge(&da);

            prop_assert_eq!(&ab, &ba);
            prop_assert!(ab.iter().all(|(_, d)| d != 0));
        }
    }
}
