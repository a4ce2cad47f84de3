use std::collections::HashMap;
use std::hash::Hash;
use std::ops::AddAssign;

/// Count + byte-sum accumulator per key; merges with `+=` so partial
/// tallies can be folded across threads.
pub(crate) struct SizeTally<K> {
    entries: HashMap<K, (u64, u64)>,
}

impl<K: Eq + Hash> SizeTally<K> {
    pub(crate) fn new() -> SizeTally<K> {
        SizeTally {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, key: K, size: u64) {
        let entry = self.entries.entry(key).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += size;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&K, &(u64, u64))> {
        self.entries.iter()
    }

    pub(crate) fn into_iter(self) -> impl Iterator<Item = (K, (u64, u64))> {
        self.entries.into_iter()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &K) -> Option<(u64, u64)> {
        self.entries.get(key).copied()
    }
}

impl<K: Eq + Hash> Default for SizeTally<K> {
    fn default() -> Self {
        SizeTally::new()
    }
}

impl<K: Eq + Hash> AddAssign for SizeTally<K> {
    fn add_assign(&mut self, rhs: Self) {
        for (key, (count, size)) in rhs.entries {
            let entry = self.entries.entry(key).or_insert((0, 0));
            entry.0 += count;
            entry.1 += size;
        }
    }
}
