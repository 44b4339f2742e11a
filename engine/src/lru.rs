//! Recency ordering of resident records.
//!
//! [`LruChain`] is a doubly linked list stored in an arena of slots and
//! indexed by key, so touching, unlinking and membership checks are O(1).
//! The head is the most recently used key, the tail the least.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Most-recently-used ordering over keys.
#[derive(Debug, Clone)]
pub struct LruChain<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Copy + Eq + Hash> Default for LruChain<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> LruChain<K> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Most recently used key.
    pub fn head(&self) -> Option<K> {
        self.head.and_then(|i| self.node(i)).map(|n| n.key)
    }

    /// Least recently used key.
    pub fn tail(&self) -> Option<K> {
        self.tail.and_then(|i| self.node(i)).map(|n| n.key)
    }

    fn node(&self, slot: usize) -> Option<&Node<K>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    /// Mark `key` as most recently used, inserting it if absent.
    pub fn touch(&mut self, key: K) {
        if let Some(&slot) = self.index.get(&key) {
            if self.head == Some(slot) {
                return;
            }
            self.unlink(slot);
            self.link_front(slot);
            return;
        }

        let node = Node {
            key,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_front(slot);
    }

    /// Drop `key` from the chain. Returns whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.unlink(slot);
        self.nodes[slot] = None;
        self.free.push(slot);
        true
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from least to most recently used.
    pub fn iter_from_tail(&self) -> impl Iterator<Item = K> + '_ {
        std::iter::successors(self.tail.and_then(|i| self.node(i)), move |n| {
            n.prev.and_then(|i| self.node(i))
        })
        .map(|n| n.key)
    }

    /// Keys from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        std::iter::successors(self.head.and_then(|i| self.node(i)), move |n| {
            n.next.and_then(|i| self.node(i))
        })
        .map(|n| n.key)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = None;
        }
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(slot) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn touch_orders_by_recency() {
        let mut lru = LruChain::new();
        lru.touch(1);
        lru.touch(2);
        lru.touch(3);
        assert_eq!(lru.head(), Some(3));
        assert_eq!(lru.tail(), Some(1));
        assert_eq!(lru.iter_from_tail().collect::<Vec<_>>(), vec![1, 2, 3]);

        lru.touch(1);
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![1, 3, 2]);
        assert_eq!(lru.tail(), Some(2));
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn remove_relinks_neighbours() {
        let mut lru = LruChain::new();
        for k in 0..5 {
            lru.touch(k);
        }
        assert!(lru.remove(&2));
        assert!(!lru.remove(&2));
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec![4, 3, 1, 0]);

        assert!(lru.remove(&4));
        assert!(lru.remove(&0));
        assert_eq!(lru.head(), Some(3));
        assert_eq!(lru.tail(), Some(1));
    }

    #[test]
    fn slots_are_reused() {
        let mut lru = LruChain::new();
        lru.touch('a');
        lru.touch('b');
        lru.remove(&'a');
        lru.touch('c');
        assert_eq!(lru.nodes.len(), 2);
        assert_eq!(lru.iter().collect::<Vec<_>>(), vec!['c', 'b']);
    }

    #[test]
    fn clear_empties() {
        let mut lru = LruChain::new();
        lru.touch(1u32);
        lru.clear();
        assert!(lru.is_empty());
        assert_eq!(lru.head(), None);
        assert_eq!(lru.iter_from_tail().count(), 0);
    }

    proptest! {
        #[test]
        fn chain_matches_reference_model(ops in prop::collection::vec((0u8..16, any::<bool>()), 0..200)) {
            let mut lru = LruChain::new();
            let mut model: Vec<u8> = Vec::new();
            for (key, remove) in ops {
                if remove {
                    let present = model.contains(&key);
                    model.retain(|k| *k != key);
                    prop_assert_eq!(lru.remove(&key), present);
                } else {
                    model.retain(|k| *k != key);
                    model.insert(0, key);
                    lru.touch(key);
                }
                prop_assert_eq!(lru.iter().collect::<Vec<_>>(), model.clone());
                prop_assert_eq!(lru.len(), model.len());
            }
            let reversed: Vec<u8> = model.iter().rev().copied().collect();
            prop_assert_eq!(lru.iter_from_tail().collect::<Vec<_>>(), reversed);
        }
    }
}
