//! Ordered string-keyed map with prefix walks.
//!
//! Backs [`PrefixWatch`](crate::watch::PrefixWatch). Keys are kept in a
//! `BTreeMap`, so a subtree walk is a single range scan and an ancestor walk
//! is one exact lookup per character boundary of the probe key.

use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone)]
pub struct PrefixMap<V> {
    entries: BTreeMap<String, V>,
}

impl<V> PrefixMap<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the value at exactly `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key)
    }

    /// Visit every entry whose key is a prefix of `key` (including `key`
    /// itself and the empty key), shortest first.
    pub fn walk_path<F>(&self, key: &str, mut f: F)
    where
        F: FnMut(&str, &V),
    {
        let ends = std::iter::once(0).chain(key.char_indices().map(|(i, c)| i + c.len_utf8()));
        for end in ends {
            let candidate = &key[..end];
            if let Some(value) = self.entries.get(candidate) {
                f(candidate, value);
            }
        }
    }

    /// Visit every entry whose key starts with `prefix`, in key order.
    pub fn walk_prefix<F>(&self, prefix: &str, mut f: F)
    where
        F: FnMut(&str, &V),
    {
        let range = self
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix));
        for (k, v) in range {
            f(k, v);
        }
    }
}

impl<V> Default for PrefixMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
