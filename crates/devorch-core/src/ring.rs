//! Fixed-capacity ring buffer used for command history and logs.

use std::collections::VecDeque;

/// Keeps the most recent `capacity` items; pushing past the bound evicts
/// the oldest item first.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the evicted one if the buffer was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Append an item, evicting the oldest items `pinned` does not hold on
    /// to. When every item is pinned the buffer grows past its capacity
    /// and shrinks back on later pushes.
    pub fn push_unpinned<P>(&mut self, item: T, pinned: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut evicted = Vec::new();
        while self.items.len() >= self.capacity {
            match self.items.iter().position(|i| !pinned(i)) {
                Some(index) => evicted.extend(self.items.remove(index)),
                None => break,
            }
        }
        self.items.push_back(item);
        evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn find_mut<P>(&mut self, mut predicate: P) -> Option<&mut T>
    where
        P: FnMut(&T) -> bool,
    {
        self.items.iter_mut().find(|item| predicate(item))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Oldest-first copy of the contents
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_first() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_pinned_items_survive_eviction() {
        let mut ring = RingBuffer::new(2);
        ring.push_unpinned(1, |n| n % 2 == 1);
        ring.push_unpinned(2, |n| n % 2 == 1);
        assert_eq!(ring.push_unpinned(4, |n| n % 2 == 1), vec![2]);
        assert_eq!(ring.to_vec(), vec![1, 4]);

        // Everything pinned: grow instead of dropping.
        ring.push_unpinned(3, |_| true);
        assert_eq!(ring.to_vec(), vec![1, 4, 3]);

        // Once unpinned the buffer drains back to capacity.
        ring.push_unpinned(5, |n| *n == 5);
        assert_eq!(ring.to_vec(), vec![3, 5]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut ring = RingBuffer::new(0);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.to_vec(), vec!["b"]);
    }

    #[test]
    fn test_find_mut_updates_in_place() {
        let mut ring = RingBuffer::new(4);
        ring.push((1, "x"));
        ring.push((2, "y"));
        if let Some(item) = ring.find_mut(|(k, _)| *k == 2) {
            item.1 = "z";
        }
        assert_eq!(ring.to_vec(), vec![(1, "x"), (2, "z")]);
    }
}
