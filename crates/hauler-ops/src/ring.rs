//! Fixed-capacity ring buffer used by the speed meters.

/// A ring of at most `N` items; pushing onto a full ring drops the oldest.
#[derive(Debug, Clone)]
pub struct Ring<T, const N: usize> {
    items: [T; N],
    /// Index of the slot the next push writes to.
    head: usize,
    len: usize,
}

impl<T: Copy + Default, const N: usize> Ring<T, N> {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            items: [T::default(); N],
            head: 0,
            len: 0,
        }
    }

    /// Append an item, overwriting the oldest when full.
    pub fn push(&mut self, item: T) {
        if N == 0 {
            return;
        }
        self.items[self.head] = item;
        self.head = (self.head + 1) % N;
        self.len = (self.len + 1).min(N);
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the ring.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Drop every item.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// The `i`-th newest item (0 = newest).
    pub fn get_newest(&self, i: usize) -> Option<&T> {
        if i >= self.len {
            return None;
        }
        Some(&self.items[(self.head + N - 1 - i) % N])
    }

    /// Mutable access to the newest item.
    pub fn newest_mut(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + N - 1) % N;
        Some(&mut self.items[idx])
    }

    /// The newest item.
    pub fn newest(&self) -> Option<&T> {
        self.get_newest(0)
    }

    /// The oldest item.
    pub fn oldest(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get_newest(i))
    }

    /// Iterate from newest to oldest.
    pub fn iter_newest(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get_newest(i))
    }
}

impl<T: Copy + Default, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_order() {
        let mut ring: Ring<u32, 3> = Ring::new();
        assert!(ring.is_empty());
        assert_eq!(ring.oldest(), None);

        ring.push(1);
        ring.push(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.newest(), Some(&2));
        assert_eq!(ring.oldest(), Some(&1));

        ring.push(3);
        ring.push(4);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter_newest().copied().collect::<Vec<_>>(), vec![4, 3, 2]);
        assert_eq!(ring.oldest(), Some(&2));
    }

    #[test]
    fn test_newest_mut_and_clear() {
        let mut ring: Ring<u64, 4> = Ring::new();
        ring.push(10);
        if let Some(v) = ring.newest_mut() {
            *v += 5;
        }
        assert_eq!(ring.newest(), Some(&15));

        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.newest_mut().is_none());
        assert_eq!(ring.capacity(), 4);
    }
}
