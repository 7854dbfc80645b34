use std::{collections::HashMap, hash::Hash, slice};

/// A hash map that guarantees iteration in insertion order.
///
/// The per-block register maps drive generation numbering, phi order and the
/// textual dumps, so their iteration order must be reproducible. [`HashMap`]
/// makes no such guarantee; this wrapper tracks key insertion order in a
/// side vector.
#[derive(Debug, Clone, Default)]
pub struct OrderedMap<K, V> {
    inner: HashMap<K, V>,
    insertion_order: Vec<K>,
}

impl<K: Eq + Hash + Clone, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Insert a key-value pair. Re-inserting an existing key updates its
    /// value but keeps its original position.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if !self.inner.contains_key(&key) {
            self.insertion_order.push(key.clone());
        }
        self.inner.insert(key, value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn keys(&self) -> slice::Iter<K> {
        self.insertion_order.iter()
    }

    pub fn iter(&self) -> OrderedMapIter<K, V> {
        OrderedMapIter {
            inner: &self.inner,
            key_iter: self.insertion_order.iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct OrderedMapIter<'m, K, V> {
    inner: &'m HashMap<K, V>,
    key_iter: slice::Iter<'m, K>,
}

impl<'m, K: Eq + Hash, V> Iterator for OrderedMapIter<'m, K, V> {
    type Item = (&'m K, &'m V);

    fn next(&mut self) -> Option<Self::Item> {
        self.key_iter
            .next()
            .map(|k| self.inner.get_key_value(k).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_insertion_order() {
        let mut map = OrderedMap::new();
        map.insert("b", 2);
        map.insert("a", 1);
        map.insert("c", 3);

        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn reinsertion_keeps_position() {
        let mut map = OrderedMap::new();
        map.insert("b", 2);
        map.insert("a", 1);
        map.insert("b", 20);

        let pairs: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(pairs, [("b", 20), ("a", 1)]);
    }
}
