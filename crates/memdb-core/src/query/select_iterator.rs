//! Cursors over predicate evaluation results.
//!
//! A [`SelectIterator`] walks the union of the posting paths one predicate
//! produced (OR-appended entries extend the same iterator, which makes
//! the union dedup fall out of the merge). The selection loop drives the
//! leading iterator and catches the others up monotonically; comparators
//! ride along for predicates with no usable posting list.

use std::sync::Arc;

use memdb_types::{IdType, OpType, PayloadValue};

use crate::idset::IdSet;
use crate::index::{SelectKeyResult, SingleSelectKeyResult};
use crate::query::comparator::Comparator;
use crate::tagsmatcher::TagsMatcher;

/// Relative cost of evaluating a comparator per candidate, against one
/// posting-list step.
const COMPARATOR_COST: usize = 2;

#[derive(Debug, Clone)]
enum SubCursor {
    Ids {
        ids: Arc<IdSet>,
        procs: Option<Arc<Vec<u8>>>,
        /// -1 before first (forward); `len` before first (reverse).
        pos: isize,
        exhausted: bool,
    },
    Range {
        begin: IdType,
        end: IdType,
        cur: IdType,
        started: bool,
        exhausted: bool,
    },
}

impl SubCursor {
    fn len(&self) -> usize {
        match self {
            SubCursor::Ids { ids, .. } => ids.len(),
            SubCursor::Range { begin, end, .. } => end.saturating_sub(*begin),
        }
    }

    fn start(&mut self, reverse: bool) {
        match self {
            SubCursor::Ids { ids, pos, exhausted, .. } => {
                *pos = if reverse { ids.len() as isize } else { -1 };
                *exhausted = ids.is_empty();
            }
            SubCursor::Range {
                begin,
                end,
                cur,
                started,
                exhausted,
            } => {
                *cur = if reverse { end.saturating_sub(1) } else { *begin };
                *started = false;
                *exhausted = begin >= end;
            }
        }
    }

    fn value(&self) -> Option<IdType> {
        if self.exhausted() {
            return None;
        }
        match self {
            SubCursor::Ids { ids, pos, .. } => {
                if *pos < 0 || *pos >= ids.len() as isize {
                    None
                } else {
                    Some(ids.as_slice()[*pos as usize])
                }
            }
            SubCursor::Range { cur, started, .. } => {
                if *started {
                    Some(*cur)
                } else {
                    None
                }
            }
        }
    }

    fn exhausted(&self) -> bool {
        match self {
            SubCursor::Ids { exhausted, .. } => *exhausted,
            SubCursor::Range { exhausted, .. } => *exhausted,
        }
    }

    fn exhaust(&mut self) {
        match self {
            SubCursor::Ids { exhausted, .. } => *exhausted = true,
            SubCursor::Range { exhausted, .. } => *exhausted = true,
        }
    }

    /// Move to the first value `>= target` (forward) or `<= target`
    /// (reverse), never moving backwards.
    fn seek(&mut self, target: IdType, reverse: bool) {
        if self.exhausted() {
            return;
        }
        match self {
            SubCursor::Ids { ids, pos, exhausted, .. } => {
                let slice = ids.as_slice();
                if reverse {
                    let idx = slice.partition_point(|&v| v <= target) as isize - 1;
                    if idx < *pos {
                        *pos = idx;
                    } else if *pos >= slice.len() as isize {
                        *pos = idx;
                    }
                    if *pos < 0 {
                        *exhausted = true;
                    }
                } else {
                    let idx = slice.partition_point(|&v| v < target) as isize;
                    if idx > *pos {
                        *pos = idx;
                    }
                    if *pos >= slice.len() as isize {
                        *exhausted = true;
                    }
                }
            }
            SubCursor::Range {
                begin,
                end,
                cur,
                started,
                exhausted,
            } => {
                *started = true;
                if reverse {
                    let bounded = target.min(end.saturating_sub(1));
                    if bounded < *cur || *cur >= *end {
                        *cur = bounded;
                    }
                    if *cur < *begin || *begin >= *end {
                        *exhausted = true;
                    }
                } else {
                    let bounded = target.max(*begin);
                    if bounded > *cur || !*started {
                        *cur = bounded;
                    }
                    if *cur >= *end {
                        *exhausted = true;
                    }
                }
            }
        }
    }

    /// Sequential step, used for unsorted (full-text rank order) sets.
    fn step(&mut self) {
        if let SubCursor::Ids { ids, pos, exhausted, .. } = self {
            *pos += 1;
            if *pos >= ids.len() as isize {
                *exhausted = true;
            }
        }
    }

    fn proc_at_current(&self) -> u8 {
        match self {
            SubCursor::Ids {
                procs: Some(procs),
                pos,
                ..
            } if *pos >= 0 && (*pos as usize) < procs.len() => procs[*pos as usize],
            _ => 0,
        }
    }
}

/// Cursor over the ids produced by evaluating one predicate.
#[derive(Debug, Clone)]
pub struct SelectIterator {
    pub op: OpType,
    pub distinct: bool,
    pub name: String,
    pub comparators: Vec<Comparator>,
    subs: Vec<SubCursor>,
    reverse: bool,
    unsorted: bool,
    is_scan: bool,
    current: Option<IdType>,
    current_sub: usize,
    at_end: bool,
    matched_count: usize,
}

impl SelectIterator {
    pub fn new(result: SelectKeyResult, op: OpType, distinct: bool, name: impl Into<String>) -> Self {
        let mut it = Self {
            op,
            distinct,
            name: name.into(),
            comparators: result.comparators,
            subs: Vec::new(),
            reverse: false,
            unsorted: false,
            is_scan: false,
            current: None,
            current_sub: 0,
            at_end: false,
            matched_count: 0,
        };
        it.push_results(result.results);
        it
    }

    /// Synthetic full-scan iterator over `[begin, end)`.
    pub fn scan(begin: IdType, end: IdType, name: impl Into<String>) -> Self {
        let mut it = Self::new(SelectKeyResult::default(), OpType::And, false, name);
        it.subs.push(SubCursor::Range {
            begin,
            end,
            cur: begin,
            started: false,
            exhausted: begin >= end,
        });
        it.is_scan = true;
        it
    }

    fn push_results(&mut self, results: Vec<SingleSelectKeyResult>) {
        for single in results {
            match single {
                SingleSelectKeyResult::Ids { ids, procs } => {
                    if procs.is_some() {
                        self.unsorted = true;
                    }
                    self.subs.push(SubCursor::Ids {
                        ids,
                        procs,
                        pos: -1,
                        exhausted: false,
                    });
                }
                SingleSelectKeyResult::Range { begin, end } => {
                    self.subs.push(SubCursor::Range {
                        begin,
                        end,
                        cur: begin,
                        started: false,
                        exhausted: begin >= end,
                    });
                }
            }
        }
    }

    /// OR-append another predicate's result into this iterator; the merge
    /// handles dedup.
    pub fn append(&mut self, result: SelectKeyResult) {
        self.comparators.extend(result.comparators);
        self.push_results(result.results);
    }

    /// Full-text results come in rank order, not id order.
    pub fn set_unsorted(&mut self) {
        self.unsorted = true;
    }

    pub fn is_scan(&self) -> bool {
        self.is_scan
    }

    pub fn has_comparators(&self) -> bool {
        !self.comparators.is_empty()
    }

    /// Pure comparator iterators have no posting paths to drive.
    pub fn is_comparator_only(&self) -> bool {
        self.subs.is_empty() && !self.comparators.is_empty()
    }

    pub fn has_idsets(&self) -> bool {
        !self.subs.is_empty()
    }

    /// Number of posting paths (id sets plus ranges).
    pub fn size(&self) -> usize {
        self.subs.len()
    }

    /// Rewind all cursors for a new pass.
    pub fn start(&mut self, reverse: bool) {
        self.reverse = reverse;
        self.current = None;
        self.current_sub = 0;
        self.at_end = self.subs.is_empty() && self.comparators.is_empty();
        for sub in &mut self.subs {
            sub.start(reverse);
        }
    }

    pub fn is_end(&self) -> bool {
        self.at_end
    }

    pub fn current(&self) -> Option<IdType> {
        self.current
    }

    /// Relevance percent of the current candidate (full-text only).
    pub fn current_proc(&self) -> u8 {
        self.subs
            .get(self.current_sub)
            .map(|s| s.proc_at_current())
            .unwrap_or(0)
    }

    /// `true` when this iterator's position is still before `val` in scan
    /// direction (or it has not produced a value yet).
    pub fn before(&self, val: IdType) -> bool {
        match self.current {
            None => true,
            Some(cur) => {
                if self.reverse {
                    cur > val
                } else {
                    cur < val
                }
            }
        }
    }

    /// `true` when this iterator's position is past `val` in scan
    /// direction.
    pub fn after(&self, val: IdType) -> bool {
        match self.current {
            None => false,
            Some(cur) => {
                if self.reverse {
                    cur < val
                } else {
                    cur > val
                }
            }
        }
    }

    /// Advance to the next candidate, optionally skipping to `hint`.
    /// Values come out strictly monotone in scan direction, deduplicated
    /// across posting paths.
    pub fn next(&mut self, hint: Option<IdType>) -> bool {
        if self.at_end {
            return false;
        }
        if self.unsorted {
            return self.next_unsorted();
        }

        let target = if self.reverse {
            let below = match self.current {
                Some(0) => {
                    self.at_end = true;
                    return false;
                }
                Some(cur) => cur - 1,
                None => IdType::MAX,
            };
            match hint {
                Some(h) => below.min(h),
                None => below,
            }
        } else {
            let above = match self.current {
                Some(cur) => cur + 1,
                None => 0,
            };
            match hint {
                Some(h) => above.max(h),
                None => above,
            }
        };

        let mut best: Option<(IdType, usize)> = None;
        for (i, sub) in self.subs.iter_mut().enumerate() {
            sub.seek(target, self.reverse);
            if let Some(val) = sub.value() {
                let better = match best {
                    None => true,
                    Some((b, _)) => {
                        if self.reverse {
                            val > b
                        } else {
                            val < b
                        }
                    }
                };
                if better {
                    best = Some((val, i));
                }
            }
        }
        match best {
            Some((val, sub)) => {
                self.current = Some(val);
                self.current_sub = sub;
                true
            }
            None => {
                self.at_end = true;
                false
            }
        }
    }

    fn next_unsorted(&mut self) -> bool {
        // Rank-ordered results iterate sequentially; only the leading
        // iterator is ever unsorted, so no catch-up hints arrive here.
        loop {
            match self.subs.get_mut(self.current_sub) {
                Some(sub) => {
                    sub.step();
                    if let Some(val) = sub.value() {
                        self.current = Some(val);
                        return true;
                    }
                    self.current_sub += 1;
                }
                None => {
                    self.at_end = true;
                    return false;
                }
            }
        }
    }

    /// Evaluate this iterator's comparators against a row.
    pub fn try_compare(&mut self, payload: &PayloadValue, tags: &TagsMatcher) -> bool {
        for comparator in &self.comparators {
            if comparator.matches(payload, tags) {
                self.matched_count += 1;
                return true;
            }
        }
        false
    }

    /// Drop the posting path that produced the current value, so further
    /// candidates with the same key are skipped (distinct queries).
    pub fn exclude_last_set(&mut self) {
        if let Some(sub) = self.subs.get_mut(self.current_sub) {
            sub.exhaust();
        }
    }

    /// Upper bound of candidates this iterator can produce.
    pub fn max_iterations(&self) -> usize {
        self.subs.iter().map(|s| s.len()).sum()
    }

    /// Planner cost: posting size for idset-backed iterators, a
    /// per-candidate multiple of the expected loop length for pure
    /// comparators.
    pub fn cost(&self, expected_iterations: usize) -> usize {
        if self.is_comparator_only() {
            expected_iterations.saturating_mul(COMPARATOR_COST)
        } else {
            self.max_iterations()
                + self
                    .comparators
                    .len()
                    .saturating_mul(expected_iterations)
                    .saturating_mul(COMPARATOR_COST)
        }
    }

    pub fn matched_count(&self) -> usize {
        self.matched_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iter_of(sets: Vec<Vec<IdType>>) -> SelectIterator {
        let result = SelectKeyResult {
            results: sets
                .into_iter()
                .map(|ids| SingleSelectKeyResult::from_ids(Arc::new(IdSet::from_vec(ids))))
                .collect(),
            comparators: Vec::new(),
        };
        SelectIterator::new(result, OpType::And, false, "test")
    }

    fn drain(mut it: SelectIterator, reverse: bool) -> Vec<IdType> {
        it.start(reverse);
        let mut out = Vec::new();
        while it.next(None) {
            out.push(it.current().unwrap());
        }
        out
    }

    #[test]
    fn test_union_dedup() {
        let it = iter_of(vec![vec![1, 3, 5], vec![2, 3, 6], vec![3]]);
        assert_eq!(drain(it, false), vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn test_reverse_iteration() {
        let it = iter_of(vec![vec![1, 3, 5], vec![2, 3, 6]]);
        assert_eq!(drain(it, true), vec![6, 5, 3, 2, 1]);
    }

    #[test]
    fn test_hint_skips_forward() {
        let mut it = iter_of(vec![vec![1, 2, 3, 10, 20]]);
        it.start(false);
        assert!(it.next(None));
        assert_eq!(it.current(), Some(1));
        assert!(it.next(Some(10)));
        assert_eq!(it.current(), Some(10));
        assert!(it.next(None));
        assert_eq!(it.current(), Some(20));
        assert!(!it.next(None));
        assert!(it.is_end());
    }

    #[test]
    fn test_scan_range() {
        let it = SelectIterator::scan(2, 6, "-scan");
        assert_eq!(drain(it, false), vec![2, 3, 4, 5]);
        let it = SelectIterator::scan(2, 6, "-scan");
        assert_eq!(drain(it, true), vec![5, 4, 3, 2]);
    }

    #[test]
    fn test_exclude_last_set() {
        let mut it = iter_of(vec![vec![1, 5], vec![2, 6]]);
        it.start(false);
        assert!(it.next(None));
        assert_eq!(it.current(), Some(1));
        // Drop the set that produced 1; its 5 must not appear.
        it.exclude_last_set();
        let mut rest = Vec::new();
        while it.next(None) {
            rest.push(it.current().unwrap());
        }
        assert_eq!(rest, vec![2, 6]);
    }

    #[test]
    fn test_cost_ordering() {
        let small = iter_of(vec![vec![1, 2]]);
        let large = iter_of(vec![(0..1000).collect()]);
        assert!(small.cost(1000) < large.cost(1000));

        let comparator_only = SelectIterator::new(
            SelectKeyResult::from_comparator(Comparator::new(
                memdb_types::CondType::Any,
                vec![],
                memdb_types::FieldsSet::from_fields(vec![0]),
                memdb_types::CollateOpts::default(),
            )),
            OpType::And,
            false,
            "cmp",
        );
        assert!(comparator_only.cost(10_000) > small.cost(10_000));
    }

    #[test]
    fn test_unsorted_keeps_rank_order() {
        let result = SelectKeyResult {
            results: vec![SingleSelectKeyResult::Ids {
                ids: Arc::new(IdSet::from_unsorted_vec(vec![7, 2, 9])),
                procs: Some(Arc::new(vec![100, 80, 60])),
            }],
            comparators: Vec::new(),
        };
        let mut it = SelectIterator::new(result, OpType::And, false, "ft");
        it.start(false);
        let mut seen = Vec::new();
        while it.next(None) {
            seen.push((it.current().unwrap(), it.current_proc()));
        }
        assert_eq!(seen, vec![(7, 100), (2, 80), (9, 60)]);
    }

    #[test]
    fn test_max_iterations() {
        let it = iter_of(vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(it.max_iterations(), 5);
    }
}
