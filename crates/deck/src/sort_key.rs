//! Fractional sort keys: a slide's position among its siblings, expressed as
//! a mixed-radix number of unbounded precision so that a new key can always
//! be produced between any two existing ones without touching either.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::DeckError;

/// Gap left after the last key when appending, and the value seeded into a
/// freshly opened precision level.
pub const SORT_STEP: u64 = 1000;

/// Ordered sequence of components, most significant first.
///
/// Comparison pads the shorter key with zeros. Keys are normalised on
/// construction (trailing zeros stripped) so two keys that compare equal
/// are also structurally equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortKey {
    components: Vec<u64>,
}

impl SortKey {
    pub fn new(components: impl Into<Vec<u64>>) -> Self {
        let mut components = components.into();
        while components.len() > 1 && components.last() == Some(&0) {
            components.pop();
        }
        if components.is_empty() {
            components.push(0);
        }
        Self { components }
    }

    pub fn from_value(value: u64) -> Self {
        Self::new(vec![value])
    }

    pub fn components(&self) -> &[u64] {
        &self.components
    }

    pub fn depth(&self) -> usize {
        self.components.len()
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }

    /// This key extended by one component of `steps * SORT_STEP`.
    ///
    /// Successive offsets of the same key sort after it and after each
    /// other, while staying below any key that the original was below
    /// (unless that key extends the original).
    pub fn offset(&self, steps: u64) -> SortKey {
        if steps == 0 {
            return self.clone();
        }
        let mut components = self.components.clone();
        components.push(steps.saturating_mul(SORT_STEP));
        Self::new(components)
    }

    /// A key greater than every key in `existing`.
    pub fn append_at_end<'a, I>(existing: I) -> SortKey
    where
        I: IntoIterator<Item = &'a SortKey>,
    {
        match existing.into_iter().max() {
            None => Self::from_value(SORT_STEP),
            Some(max) => match max.component(0).checked_add(SORT_STEP) {
                Some(top) => Self::from_value(top),
                None => successor_from(max, 1),
            },
        }
    }

    /// A key smaller than the smallest key in `existing`, never negative.
    ///
    /// Halves the first component above one; a component of exactly one
    /// becomes zero followed by a fresh level. The zero key has nothing
    /// below it, so it gets the literal extension `[0, SORT_STEP]` when that
    /// is free, or otherwise a key between it and its successor.
    pub fn insert_before_first<'a, I>(existing: I) -> SortKey
    where
        I: IntoIterator<Item = &'a SortKey>,
    {
        let mut pool: Vec<&SortKey> = existing.into_iter().collect();
        pool.sort();
        pool.dedup();
        let Some(first) = pool.first().copied() else {
            return Self::from_value(SORT_STEP);
        };

        let mut components = Vec::with_capacity(first.depth() + 1);
        for &component in first.components() {
            if component > 1 {
                components.push(component / 2);
                break;
            }
            if component == 1 {
                components.push(0);
                components.push(SORT_STEP);
                break;
            }
            components.push(0);
        }

        let candidate = SortKey::new(components.clone());
        if candidate != *first {
            return candidate;
        }

        components.push(SORT_STEP);
        let extended = SortKey::new(components);
        if pool.binary_search(&&extended).is_err() {
            return extended;
        }
        let owned: Vec<SortKey> = pool.iter().map(|key| (*key).clone()).collect();
        Self::between(Some(first), pool.get(1).copied(), &owned).unwrap_or(extended)
    }

    /// A key strictly between `left` and `right` that is not in `existing`.
    ///
    /// A missing `right` appends after everything, a missing `left` inserts
    /// before everything. Reversed bounds are swapped; equal bounds leave no
    /// room and fail with [`DeckError::OrderingExhausted`].
    pub fn between(
        left: Option<&SortKey>,
        right: Option<&SortKey>,
        existing: &[SortKey],
    ) -> Result<SortKey, DeckError> {
        let (left, right) = match (left, right) {
            (left, None) => return Ok(Self::append_at_end(existing.iter().chain(left))),
            (None, Some(right)) => {
                return Ok(Self::insert_before_first(existing.iter().chain(Some(right))))
            }
            (Some(left), Some(right)) => (left, right),
        };

        let (low, high) = match left.cmp(right) {
            Ordering::Less => (left, right),
            Ordering::Greater => (right, left),
            Ordering::Equal => {
                return Err(DeckError::OrderingExhausted {
                    left: left.clone(),
                    right: right.clone(),
                })
            }
        };

        let taken: BTreeSet<&SortKey> = existing.iter().collect();
        let mut upper = high.clone();
        loop {
            let candidate = midpoint(low, &upper).ok_or_else(|| DeckError::OrderingExhausted {
                left: low.clone(),
                right: upper.clone(),
            })?;
            debug_assert!(*low < candidate && candidate < upper);
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            // Someone already holds the natural midpoint: look again in the
            // lower half, which only ever shrinks towards `low`.
            upper = candidate;
        }
    }
}

/// Key strictly between `left` and `right` (`left` must sort first), or
/// `None` when they are equal.
fn midpoint(left: &SortKey, right: &SortKey) -> Option<SortKey> {
    let depth = left.depth().max(right.depth());
    for index in 0..depth {
        let (low, high) = (left.component(index), right.component(index));
        if low == high {
            continue;
        }
        if high - low >= 2 {
            let mut components: Vec<u64> = (0..index).map(|i| left.component(i)).collect();
            components.push(low + (high - low) / 2);
            return Some(SortKey::new(components));
        }
        // Adjacent at this level: anything sharing `left` up to here and
        // exceeding its tail still sorts below `right`.
        return Some(successor_from(left, index + 1));
    }
    None
}

/// Smallest-effort key greater than `key` that shares its first `from`
/// components.
fn successor_from(key: &SortKey, from: usize) -> SortKey {
    let mut components: Vec<u64> = (0..from).map(|i| key.component(i)).collect();
    let mut index = from;
    loop {
        let current = key.component(index);
        match current.checked_add(SORT_STEP) {
            Some(next) => {
                components.push(next);
                return SortKey::new(components);
            }
            None => {
                components.push(current);
                index += 1;
            }
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let depth = self.depth().max(other.depth());
        (0..depth)
            .map(|index| self.component(index).cmp(&other.component(index)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, component) in self.components.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:08}", component)?;
        }
        Ok(())
    }
}

impl FromStr for SortKey {
    type Err = DeckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(DeckError::InvalidSortKey(s.to_string()));
        }
        let components = s
            .split(':')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map_err(|_| DeckError::InvalidSortKey(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(components))
    }
}

impl TryFrom<String> for SortKey {
    type Error = DeckError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(components: &[u64]) -> SortKey {
        SortKey::new(components.to_vec())
    }

    #[test]
    fn test_padded_comparison() {
        assert!(key(&[1]) < key(&[1, 1]));
        assert_eq!(key(&[1]), key(&[1, 0]));
        assert_eq!(key(&[1, 0, 0]).components(), &[1]);
        assert!(key(&[2]) > key(&[1, 999]));
    }

    #[test]
    fn test_append_at_end() {
        assert_eq!(SortKey::append_at_end(std::iter::empty()), key(&[1000]));
        let pool = vec![key(&[1000]), key(&[3000, 5]), key(&[2000])];
        assert_eq!(SortKey::append_at_end(&pool), key(&[4000]));
    }

    #[test]
    fn test_insert_before_first_halves() {
        let pool = vec![key(&[1000]), key(&[2000])];
        assert_eq!(SortKey::insert_before_first(&pool), key(&[500]));
    }

    #[test]
    fn test_insert_before_first_extends_at_one() {
        let pool = vec![key(&[1, 7])];
        assert_eq!(SortKey::insert_before_first(&pool), key(&[0, 1000]));
        let pool = vec![key(&[0, 1])];
        assert_eq!(SortKey::insert_before_first(&pool), key(&[0, 0, 1000]));
        let pool = vec![key(&[0, 6])];
        assert_eq!(SortKey::insert_before_first(&pool), key(&[0, 3]));
    }

    #[test]
    fn test_insert_before_zero_key() {
        let pool = vec![key(&[0])];
        assert_eq!(SortKey::insert_before_first(&pool), key(&[0, 1000]));

        let pool = vec![key(&[0]), key(&[0, 1000])];
        let result = SortKey::insert_before_first(&pool);
        assert!(!pool.contains(&result));
        assert!(result > key(&[0]) && result < key(&[0, 1000]));
    }

    #[test]
    fn test_between_scenario() {
        let mut pool = vec![key(&[1000]), key(&[2000]), key(&[3000])];
        let first = SortKey::between(Some(&pool[0]), Some(&pool[1]), &pool).unwrap();
        assert_eq!(first, key(&[1500]));
        pool.push(first.clone());

        let second = SortKey::between(Some(&pool[0]), Some(&first), &pool).unwrap();
        assert!(key(&[1000]) < second && second < key(&[1500]));
        assert!(!pool.contains(&second));
    }

    #[test]
    fn test_between_adjacent_components_extends() {
        let left = key(&[1000]);
        let right = key(&[1001]);
        let result = SortKey::between(Some(&left), Some(&right), &[]).unwrap();
        assert_eq!(result, key(&[1000, 1000]));
    }

    #[test]
    fn test_between_skips_taken_midpoint() {
        let left = key(&[1000]);
        let right = key(&[2000]);
        let pool = vec![left.clone(), right.clone(), key(&[1500])];
        let result = SortKey::between(Some(&left), Some(&right), &pool).unwrap();
        assert_eq!(result, key(&[1250]));
    }

    #[test]
    fn test_between_equal_bounds() {
        let left = key(&[1000]);
        let err = SortKey::between(Some(&left), Some(&left), &[]).unwrap_err();
        assert!(matches!(err, DeckError::OrderingExhausted { .. }));
    }

    #[test]
    fn test_between_open_ends() {
        let pool = vec![key(&[1000]), key(&[2000])];
        assert_eq!(
            SortKey::between(Some(&pool[1]), None, &pool).unwrap(),
            key(&[3000])
        );
        assert_eq!(
            SortKey::between(None, Some(&pool[0]), &pool).unwrap(),
            key(&[500])
        );
    }

    #[test]
    fn test_repeated_insertion_between_same_pair() {
        let left = key(&[1000]);
        let right = key(&[2000]);
        let mut pool = vec![left.clone(), right.clone()];
        for _ in 0..1200 {
            let next = SortKey::between(Some(&left), Some(&right), &pool).unwrap();
            assert!(left < next && next < right);
            assert!(!pool.contains(&next), "collision at {}", next);
            pool.push(next);
        }
        let mut sorted = pool.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), pool.len());
    }

    #[test]
    fn test_offsets_stay_below_next_neighbour() {
        let anchor = key(&[1000]);
        let next = key(&[2000]);
        let start = SortKey::between(Some(&anchor), Some(&next), &[]).unwrap();
        let keys: Vec<SortKey> = (0..3).map(|n| start.offset(n)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(keys.iter().all(|k| *k > anchor && *k < next));
    }

    #[test]
    fn test_display_and_parse() {
        let k = key(&[1000, 500]);
        assert_eq!(k.to_string(), "00001000:00000500");
        assert_eq!("00001000:00000500".parse::<SortKey>().unwrap(), k);
        assert_eq!("7".parse::<SortKey>().unwrap(), key(&[7]));
        assert!("12:abc".parse::<SortKey>().is_err());
        assert!("".parse::<SortKey>().is_err());

        let json = serde_json::to_string(&k).unwrap();
        assert_eq!(json, "\"00001000:00000500\"");
        let back: SortKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }

    fn arb_key() -> impl Strategy<Value = SortKey> {
        prop::collection::vec(0u64..4000, 1..4).prop_map(SortKey::new)
    }

    proptest! {
        #[test]
        fn prop_between_is_strict_and_fresh(
            a in arb_key(),
            b in arb_key(),
            pool in prop::collection::vec(arb_key(), 0..24),
        ) {
            prop_assume!(a != b);
            let (low, high) = if a < b { (a, b) } else { (b, a) };
            let result = SortKey::between(Some(&low), Some(&high), &pool).unwrap();
            prop_assert!(low < result);
            prop_assert!(result < high);
            prop_assert!(!pool.contains(&result));
        }

        #[test]
        fn prop_generated_keys_have_no_ties(
            ops in prop::collection::vec((0u8..3, 0usize..64), 1..64),
        ) {
            let mut pool: Vec<SortKey> = Vec::new();
            for (op, pick) in ops {
                let mut sorted = pool.clone();
                sorted.sort();
                let next = match op {
                    0 => SortKey::append_at_end(&pool),
                    1 => SortKey::insert_before_first(&pool),
                    _ if sorted.len() >= 2 => {
                        let index = pick % (sorted.len() - 1);
                        SortKey::between(Some(&sorted[index]), Some(&sorted[index + 1]), &pool).unwrap()
                    }
                    _ => SortKey::append_at_end(&pool),
                };
                prop_assert!(!pool.contains(&next));
                pool.push(next);
            }
            let mut sorted = pool.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), pool.len());
        }

        #[test]
        fn prop_insert_before_first_is_below_minimum(pool in prop::collection::vec(arb_key(), 1..16)) {
            let result = SortKey::insert_before_first(&pool);
            let min = pool.iter().min().unwrap();
            if *min != SortKey::from_value(0) {
                prop_assert!(result < *min);
            }
            prop_assert!(!pool.contains(&result));
        }
    }
}
