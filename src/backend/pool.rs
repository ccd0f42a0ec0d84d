//! Binary min-heap of backends keyed by in-flight load.
//!
//! Unlike `std::collections::BinaryHeap`, every entry knows its own position
//! in the backing array. That makes it possible to remove or re-sort an
//! arbitrary entry in logarithmic time after its load changed.

/// Index stored by an entry that is not currently held by a pool.
pub const NOT_IN_POOL: isize = -1;

/// An element that can be held by a [`Pool`].
///
/// The pool reads `priority` for ordering and is the only writer of the index
/// slot. Implementors must use interior mutability for the index since the
/// pool only ever sees shared references.
pub trait PoolEntry {
    /// Current ordering key.
    fn priority(&self) -> u64;

    /// Position in the pool's array, or [`NOT_IN_POOL`].
    fn pool_index(&self) -> isize;

    /// Store the position assigned by the pool.
    fn set_pool_index(&self, index: isize);
}

impl<T: PoolEntry + ?Sized> PoolEntry for std::sync::Arc<T> {
    fn priority(&self) -> u64 {
        (**self).priority()
    }

    fn pool_index(&self) -> isize {
        (**self).pool_index()
    }

    fn set_pool_index(&self, index: isize) {
        (**self).set_pool_index(index)
    }
}

/// Min-heap ordered by [`PoolEntry::priority`].
///
/// Comparison is a strict less-than on load only. Equal loads are never
/// swapped, so ties keep whatever relative order the heap mechanics leave.
#[derive(Debug)]
pub struct Pool<E> {
    entries: Vec<E>,
}

impl<E> Default for Pool<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E: PoolEntry> Pool<E> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty pool with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the entry at `i` has strictly less load than the one at `j`.
    pub fn less(&self, i: usize, j: usize) -> bool {
        self.entries[i].priority() < self.entries[j].priority()
    }

    /// Exchange two positions and update both stored indices.
    pub fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        self.entries[i].set_pool_index(i as isize);
        self.entries[j].set_pool_index(j as isize);
    }

    /// Insert an entry. The entry must not already be held by a pool.
    pub fn push(&mut self, entry: E) {
        debug_assert_eq!(
            entry.pool_index(),
            NOT_IN_POOL,
            "entry pushed while already held by a pool"
        );

        let i = self.entries.len();
        entry.set_pool_index(i as isize);
        self.entries.push(entry);
        self.sift_up(i);
    }

    /// Remove and return the entry with the least load.
    pub fn pop(&mut self) -> Option<E> {
        self.remove(0)
    }

    /// The entry with the least load, without removing it.
    pub fn peek(&self) -> Option<&E> {
        self.entries.first()
    }

    /// Remove and return the entry at position `i`.
    pub fn remove(&mut self, i: usize) -> Option<E> {
        if i >= self.entries.len() {
            return None;
        }

        let last = self.entries.len() - 1;
        if i != last {
            self.swap(i, last);
        }

        let entry = self.entries.pop()?;
        entry.set_pool_index(NOT_IN_POOL);

        if i < self.entries.len() {
            self.fix(i);
        }

        Some(entry)
    }

    /// Restore heap order after the load of the entry at `i` changed.
    pub fn fix(&mut self, i: usize) {
        if i >= self.entries.len() {
            return;
        }
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    /// Entries in array order (root first).
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter()
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true if the entry moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.entries.len();
        let mut i = start;

        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }

            let right = left + 1;
            let child = if right < n && self.less(right, left) {
                right
            } else {
                left
            };

            if !self.less(child, i) {
                break;
            }

            self.swap(i, child);
            i = child;
        }

        i > start
    }
}
