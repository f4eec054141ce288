//! Sorted document id sequences (posting lists).
//!
//! An [`IdSet`] is the unit all boolean algebra runs over: indexes produce
//! them, iterators merge them, caches keep them. They are shared as
//! `Arc<IdSet>` handles between producers and consumers; mutation inside
//! indexes goes through `Arc::make_mut`, so a set captured by a running
//! query or a cache entry keeps observing its snapshot.

use memdb_types::IdType;

/// Insertion discipline for [`IdSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Keep the set sorted on every insert.
    Ordered,
    /// Append and defer sorting to [`IdSet::commit`]. Used on the write
    /// path so upserts stay O(1); the commit procedure normalizes before
    /// any query reads the set.
    Unordered,
}

/// Sorted sequence of document ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdSet {
    ids: Vec<IdType>,
    unsorted: bool,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(mut ids: Vec<IdType>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self {
            ids,
            unsorted: false,
        }
    }

    /// Build from ids that are already sorted and unique.
    pub fn from_sorted_vec(ids: Vec<IdType>) -> Self {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        Self {
            ids,
            unsorted: false,
        }
    }

    /// Build preserving the given order (full-text rank order).
    pub fn from_unsorted_vec(ids: Vec<IdType>) -> Self {
        Self {
            ids,
            unsorted: true,
        }
    }

    pub fn add(&mut self, id: IdType, mode: AddMode) {
        match mode {
            AddMode::Ordered if !self.unsorted => {
                if let Err(pos) = self.ids.binary_search(&id) {
                    self.ids.insert(pos, id);
                }
            }
            _ => {
                self.ids.push(id);
                self.unsorted = true;
            }
        }
    }

    /// Remove an id; no-op when absent.
    pub fn erase(&mut self, id: IdType) {
        if self.unsorted {
            self.ids.retain(|&v| v != id);
        } else if let Ok(pos) = self.ids.binary_search(&id) {
            self.ids.remove(pos);
        }
    }

    /// Normalize after unordered inserts: sort and drop duplicates.
    pub fn commit(&mut self) {
        if self.unsorted {
            self.ids.sort_unstable();
            self.ids.dedup();
            self.unsorted = false;
        }
    }

    pub fn contains(&self, id: IdType) -> bool {
        if self.unsorted {
            self.ids.contains(&id)
        } else {
            self.ids.binary_search(&id).is_ok()
        }
    }

    pub fn is_unsorted(&self) -> bool {
        self.unsorted
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[IdType] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = IdType> + '_ {
        self.ids.iter().copied()
    }

    /// Bytes held on the heap; reported to byte-budgeted caches.
    pub fn heap_size(&self) -> usize {
        self.ids.capacity() * std::mem::size_of::<IdType>()
    }

    /// Merge another sorted set into this one.
    pub fn union_with(&mut self, other: &IdSet) {
        debug_assert!(!self.unsorted && !other.unsorted);
        let mut merged = Vec::with_capacity(self.ids.len() + other.ids.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            match self.ids[i].cmp(&other.ids[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(self.ids[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(other.ids[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&self.ids[i..]);
        merged.extend_from_slice(&other.ids[j..]);
        self.ids = merged;
    }

    /// Sorted intersection of two sets.
    pub fn intersect(&self, other: &IdSet) -> IdSet {
        debug_assert!(!self.unsorted && !other.unsorted);
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            match self.ids[i].cmp(&other.ids[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        IdSet::from_sorted_vec(out)
    }

    /// Ids present in `self` but not in `other`.
    pub fn difference(&self, other: &IdSet) -> IdSet {
        debug_assert!(!self.unsorted && !other.unsorted);
        let mut out = Vec::new();
        let mut j = 0;
        for &id in &self.ids {
            while j < other.ids.len() && other.ids[j] < id {
                j += 1;
            }
            if j >= other.ids.len() || other.ids[j] != id {
                out.push(id);
            }
        }
        IdSet::from_sorted_vec(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_add_keeps_sorted() {
        let mut set = IdSet::new();
        for id in [5, 1, 3, 1, 9] {
            set.add(id, AddMode::Ordered);
        }
        assert_eq!(set.as_slice(), &[1, 3, 5, 9]);
        assert!(!set.is_unsorted());
    }

    #[test]
    fn test_unordered_add_and_commit() {
        let mut set = IdSet::new();
        for id in [5, 1, 3, 1, 9] {
            set.add(id, AddMode::Unordered);
        }
        assert!(set.is_unsorted());
        set.commit();
        assert_eq!(set.as_slice(), &[1, 3, 5, 9]);
    }

    #[test]
    fn test_erase() {
        let mut set = IdSet::from_vec(vec![1, 2, 3]);
        set.erase(2);
        assert_eq!(set.as_slice(), &[1, 3]);
        set.erase(42);
        assert_eq!(set.as_slice(), &[1, 3]);
    }

    #[test]
    fn test_union() {
        let mut a = IdSet::from_vec(vec![1, 3, 5]);
        let b = IdSet::from_vec(vec![2, 3, 6]);
        a.union_with(&b);
        assert_eq!(a.as_slice(), &[1, 2, 3, 5, 6]);
    }

    #[test]
    fn test_intersect() {
        let a = IdSet::from_vec(vec![1, 2, 3, 7]);
        let b = IdSet::from_vec(vec![2, 3, 8]);
        assert_eq!(a.intersect(&b).as_slice(), &[2, 3]);
    }

    #[test]
    fn test_difference() {
        let a = IdSet::from_vec(vec![1, 2, 3, 7]);
        let b = IdSet::from_vec(vec![2, 7]);
        assert_eq!(a.difference(&b).as_slice(), &[1, 3]);
    }

    #[test]
    fn test_contains() {
        let a = IdSet::from_vec(vec![10, 20, 30]);
        assert!(a.contains(20));
        assert!(!a.contains(25));
    }
}
