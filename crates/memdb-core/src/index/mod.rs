//! Secondary indexes.
//!
//! [`Index`] is polymorphic over a tagged [`IndexKind`]: an unordered hash
//! map, an ordered tree, or the black-box full-text engine. Composite
//! indexes are hash/tree maps over the order-preserving encoding of their
//! member tuple. Every variant shares the same capability set: posting
//! upserts, `select_key`, lazy sort permutations and a per-index IdSet
//! cache.

pub mod fulltext;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use memdb_types::{
    CollateOpts, CondType, Error, FieldsSet, IdType, IndexDef, IndexKey, IndexOpts, IndexType,
    KeyValue, KeyValueType, PayloadValue, Result,
};

use crate::cache::{CacheHit, IdSetCache, IdSetCacheKey, LruCache, DEFAULT_CACHE_SIZE};
use crate::idset::{AddMode, IdSet};
use crate::query::comparator::Comparator;

use fulltext::FullTextIndex;

/// Sentinel rank for ids that are not part of a sort permutation
/// (free slots).
pub const SORT_UNFILLED: usize = usize::MAX;

/// Access-path hint passed by the planner to `select_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectHint {
    /// Let the index choose.
    Optimal,
    /// Return a comparator instead of posting lists (full-text dominates
    /// the scan).
    ForceComparator,
    /// Return one posting set per key (distinct queries).
    ForceIdset,
}

/// One access path produced by an index: either a materialized posting
/// set (optionally with full-text relevance percents) or a contiguous
/// range in the sort-ordered id space.
#[derive(Debug, Clone)]
pub enum SingleSelectKeyResult {
    Ids {
        ids: Arc<IdSet>,
        procs: Option<Arc<Vec<u8>>>,
    },
    Range {
        begin: IdType,
        end: IdType,
    },
}

impl SingleSelectKeyResult {
    pub fn from_ids(ids: Arc<IdSet>) -> Self {
        SingleSelectKeyResult::Ids { ids, procs: None }
    }

    /// Upper bound of candidates this path yields.
    pub fn len(&self) -> usize {
        match self {
            SingleSelectKeyResult::Ids { ids, .. } => ids.len(),
            SingleSelectKeyResult::Range { begin, end } => end.saturating_sub(*begin),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The result of evaluating one predicate against one index: any number
/// of posting paths plus optional comparators.
#[derive(Debug, Clone, Default)]
pub struct SelectKeyResult {
    pub results: Vec<SingleSelectKeyResult>,
    pub comparators: Vec<Comparator>,
}

impl SelectKeyResult {
    pub fn from_comparator(comparator: Comparator) -> Self {
        Self {
            results: Vec::new(),
            comparators: vec![comparator],
        }
    }
}

pub type SelectKeyResults = Vec<SelectKeyResult>;

/// Posting entry of one key: the id set plus its rank-space projections,
/// tagged by the sort id they were built for.
#[derive(Debug, Clone, Default)]
pub struct KeyEntry {
    ids: Arc<IdSet>,
    sorted: Vec<(u32, Arc<IdSet>)>,
}

impl KeyEntry {
    fn add(&mut self, id: IdType, mode: AddMode) {
        Arc::make_mut(&mut self.ids).add(id, mode);
        self.sorted.clear();
    }

    fn erase(&mut self, id: IdType) {
        Arc::make_mut(&mut self.ids).erase(id);
        self.sorted.clear();
    }

    fn commit_ids(&mut self) {
        if self.ids.is_unsorted() {
            Arc::make_mut(&mut self.ids).commit();
        }
    }

    pub fn ids(&self) -> &Arc<IdSet> {
        &self.ids
    }

    fn sorted_for(&self, sort_id: u32) -> Option<&Arc<IdSet>> {
        self.sorted
            .iter()
            .find(|(id, _)| *id == sort_id)
            .map(|(_, set)| set)
    }

    fn set_sorted(&mut self, sort_id: u32, set: Arc<IdSet>) {
        self.sorted.retain(|(id, _)| *id != sort_id);
        self.sorted.push((sort_id, set));
    }
}

#[derive(Debug)]
enum IndexKind {
    Hash(HashMap<IndexKey, KeyEntry>),
    Tree(BTreeMap<IndexKey, KeyEntry>),
    FullText(FullTextIndex),
}

/// A secondary index over one field or a composite tuple of fields.
#[derive(Debug)]
pub struct Index {
    name: String,
    fields: FieldsSet,
    key_type: KeyValueType,
    index_type: IndexType,
    opts: IndexOpts,
    kind: IndexKind,
    /// Identifier of the sort permutation currently published by this
    /// index; 0 until the first build, bumped on every rebuild.
    sort_id: u32,
    /// id -> rank; `SORT_UNFILLED` for free slots.
    sort_orders: Vec<usize>,
    /// rank -> id over live items.
    sorted_ids: Vec<IdType>,
    /// Sort spaces this index has rank projections for.
    projected: std::collections::HashSet<u32>,
    cache: IdSetCache,
}

impl Index {
    pub fn new(def: &IndexDef, fields: FieldsSet) -> Self {
        let kind = match def.index_type {
            IndexType::Hash | IndexType::CompositeHash => IndexKind::Hash(HashMap::new()),
            IndexType::Tree | IndexType::CompositeTree => IndexKind::Tree(BTreeMap::new()),
            IndexType::FullText => IndexKind::FullText(FullTextIndex::new()),
        };
        Self {
            name: def.name.clone(),
            fields,
            key_type: def.key_type,
            index_type: def.index_type,
            opts: def.opts,
            kind,
            sort_id: 0,
            sort_orders: Vec::new(),
            sorted_ids: Vec::new(),
            projected: std::collections::HashSet::new(),
            cache: LruCache::new(DEFAULT_CACHE_SIZE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &FieldsSet {
        &self.fields
    }

    pub fn key_type(&self) -> KeyValueType {
        self.key_type
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn opts(&self) -> &IndexOpts {
        &self.opts
    }

    pub fn collate(&self) -> &CollateOpts {
        &self.opts.collate
    }

    pub fn is_ordered(&self) -> bool {
        self.index_type.is_ordered()
    }

    pub fn is_fulltext(&self) -> bool {
        self.index_type.is_fulltext()
    }

    pub fn is_composite(&self) -> bool {
        self.index_type.is_composite()
    }

    /// Number of distinct keys.
    pub fn size(&self) -> usize {
        match &self.kind {
            IndexKind::Hash(map) => map.len(),
            IndexKind::Tree(map) => map.len(),
            IndexKind::FullText(ft) => ft.size(),
        }
    }

    pub fn mem_size(&self) -> usize {
        let postings = match &self.kind {
            IndexKind::Hash(map) => map.values().map(|e| e.ids.heap_size()).sum::<usize>(),
            IndexKind::Tree(map) => map.values().map(|e| e.ids.heap_size()).sum::<usize>(),
            IndexKind::FullText(ft) => ft.mem_size(),
        };
        postings
            + self.sort_orders.capacity() * std::mem::size_of::<usize>()
            + self.sorted_ids.capacity() * std::mem::size_of::<IdType>()
    }

    /// Currently-valid sort permutation identifier; 0 when none is built.
    pub fn sort_id(&self) -> u32 {
        self.sort_id
    }

    /// id -> rank permutation.
    pub fn sort_orders(&self) -> &[usize] {
        &self.sort_orders
    }

    /// rank -> id permutation over live items.
    pub fn sorted_ids(&self) -> &[IdType] {
        &self.sorted_ids
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop sort artifacts after a write; the next commit rebuilds them.
    pub fn invalidate_sort(&mut self) {
        self.sort_orders.clear();
        self.sorted_ids.clear();
        self.projected.clear();
    }

    /// Whether rank projections for a sort space are in place.
    pub fn has_projection(&self, sort_id: u32) -> bool {
        self.projected.contains(&sort_id)
    }

    fn make_key(&self, value: &KeyValue) -> Result<IndexKey> {
        IndexKey::from_value(value, &self.opts.collate, &self.fields)
    }

    /// Key of a stored row for composite indexes.
    fn row_key(&self, payload: &PayloadValue) -> IndexKey {
        IndexKey::Composite(payload.encode_key(&self.fields))
    }

    /// Keys a stored row contributes to this index: the composite tuple
    /// key, or one key per value of the indexed field.
    fn build_row_keys(&self, payload: &PayloadValue) -> Result<Vec<IndexKey>> {
        if self.is_composite() {
            return Ok(vec![self.row_key(payload)]);
        }
        let field = self.fields.fields().first().copied().unwrap_or(0);
        payload.get(field).iter().map(|v| self.make_key(v)).collect()
    }

    fn row_text(&self, payload: &PayloadValue) -> String {
        let field = self.fields.fields().first().copied().unwrap_or(0);
        payload
            .get(field)
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Add a stored row to the posting lists. Values must already be
    /// coerced to the index key type. Sparse indexes are comparator-only
    /// and keep no postings.
    pub fn upsert_row(&mut self, payload: &PayloadValue, id: IdType) -> Result<()> {
        if self.opts.sparse {
            return Ok(());
        }
        if matches!(self.kind, IndexKind::FullText(_)) {
            let text = self.row_text(payload);
            if let IndexKind::FullText(ft) = &mut self.kind {
                ft.upsert(id, &text);
            }
            return Ok(());
        }
        let keys = self.build_row_keys(payload)?;
        match &mut self.kind {
            IndexKind::Hash(map) => {
                for key in keys {
                    map.entry(key).or_default().add(id, AddMode::Unordered);
                }
            }
            IndexKind::Tree(map) => {
                for key in keys {
                    map.entry(key).or_default().add(id, AddMode::Unordered);
                }
            }
            IndexKind::FullText(_) => unreachable!(),
        }
        Ok(())
    }

    /// Remove a stored row from the posting lists.
    pub fn delete_row(&mut self, payload: &PayloadValue, id: IdType) -> Result<()> {
        if self.opts.sparse {
            return Ok(());
        }
        if let IndexKind::FullText(ft) = &mut self.kind {
            ft.delete(id);
            return Ok(());
        }
        let keys = self.build_row_keys(payload)?;
        match &mut self.kind {
            IndexKind::Hash(map) => {
                for key in keys {
                    if let Some(entry) = map.get_mut(&key) {
                        entry.erase(id);
                        if entry.ids.is_empty() {
                            map.remove(&key);
                        }
                    }
                }
            }
            IndexKind::Tree(map) => {
                for key in keys {
                    if let Some(entry) = map.get_mut(&key) {
                        entry.erase(id);
                        if entry.ids.is_empty() {
                            map.remove(&key);
                        }
                    }
                }
            }
            IndexKind::FullText(_) => unreachable!(),
        }
        Ok(())
    }

    /// First id stored under the keys a row produces (PK and unique
    /// lookups).
    pub fn find_row(&self, payload: &PayloadValue) -> Result<Option<IdType>> {
        if matches!(self.kind, IndexKind::FullText(_)) {
            return Err(Error::logic("full-text index can't serve PK lookups"));
        }
        for key in self.build_row_keys(payload)? {
            if let Some(entry) = self.lookup(&key) {
                if let Some(&id) = entry.ids.as_slice().first() {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Normalize posting lists after unordered inserts.
    pub fn commit_idsets(&mut self) {
        match &mut self.kind {
            IndexKind::Hash(map) => map.values_mut().for_each(KeyEntry::commit_ids),
            IndexKind::Tree(map) => map.values_mut().for_each(KeyEntry::commit_ids),
            IndexKind::FullText(_) => {}
        }
    }

    /// Build the sort permutation: live ids stable-ordered by key under
    /// the index collation. Only ordered indexes publish sort orders.
    pub fn make_sort_orders(&mut self, items_len: usize, new_sort_id: u32) -> Result<()> {
        let IndexKind::Tree(map) = &self.kind else {
            return Err(Error::logic(format!(
                "index '{}' is not ordered and can't build sort orders",
                self.name
            )));
        };
        let mut sorted_ids = Vec::new();
        for entry in map.values() {
            sorted_ids.extend(entry.ids.iter());
        }
        let mut sort_orders = vec![SORT_UNFILLED; items_len];
        for (rank, &id) in sorted_ids.iter().enumerate() {
            debug_assert!(id < items_len, "posting id out of range of the item vector");
            sort_orders[id] = rank;
        }
        self.sorted_ids = sorted_ids;
        self.sort_orders = sort_orders;
        self.sort_id = new_sort_id;
        Ok(())
    }

    /// Project every posting list into the rank space of a sort
    /// permutation (`ranks` maps id -> rank).
    pub fn build_rank_projections(&mut self, sort_id: u32, ranks: &[usize]) {
        let project = |entry: &mut KeyEntry| {
            let mapped: Vec<usize> = entry
                .ids
                .iter()
                .map(|id| ranks.get(id).copied().unwrap_or(SORT_UNFILLED))
                .filter(|&r| r != SORT_UNFILLED)
                .collect();
            entry.set_sorted(sort_id, Arc::new(IdSet::from_vec(mapped)));
        };
        match &mut self.kind {
            IndexKind::Hash(map) => map.values_mut().for_each(project),
            IndexKind::Tree(map) => map.values_mut().for_each(project),
            IndexKind::FullText(_) => {}
        }
        self.projected.insert(sort_id);
    }

    fn entry_ids(&self, entry: &KeyEntry, sort_id: u32) -> Result<Arc<IdSet>> {
        if sort_id == 0 {
            Ok(entry.ids.clone())
        } else {
            entry.sorted_for(sort_id).cloned().ok_or_else(|| {
                Error::logic(format!(
                    "sort orders {} are not prepared for index '{}'",
                    sort_id, self.name
                ))
            })
        }
    }

    /// Evaluate one predicate against this index.
    ///
    /// `sort_id` selects the id space of the returned sets: 0 for plain
    /// document ids, otherwise the identifier of a prepared sort
    /// permutation (results come back as ranks, and tree indexes owning
    /// that permutation answer range conditions with a contiguous
    /// `[lo, hi)` rank window instead of a materialized set).
    pub fn select_key(
        &self,
        values: &[KeyValue],
        cond: CondType,
        sort_id: u32,
        hint: SelectHint,
    ) -> Result<SelectKeyResults> {
        // The full-text engine ignores hints: when full-text dominates a
        // query, ForceComparator applies to the other entries, not to it.
        if let IndexKind::FullText(ft) = &self.kind {
            let text = values
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::query_exec("full-text query expects a string value"))?;
            let selection = ft.select(text);
            return Ok(vec![SelectKeyResult {
                results: vec![SingleSelectKeyResult::Ids {
                    ids: Arc::new(IdSet::from_unsorted_vec(selection.ids)),
                    procs: Some(Arc::new(selection.procs)),
                }],
                comparators: Vec::new(),
            }]);
        }
        if matches!(hint, SelectHint::ForceComparator) || self.opts.sparse {
            return Ok(vec![SelectKeyResult::from_comparator(Comparator::new(
                cond,
                values.to_vec(),
                self.fields.clone(),
                self.opts.collate,
            ))]);
        }
        let distinct = matches!(hint, SelectHint::ForceIdset);
        self.select_scalar(values, cond, sort_id, distinct)
    }

    fn lookup(&self, key: &IndexKey) -> Option<&KeyEntry> {
        match &self.kind {
            IndexKind::Hash(map) => map.get(key),
            IndexKind::Tree(map) => map.get(key),
            IndexKind::FullText(_) => None,
        }
    }

    fn all_entries(&self) -> Vec<&KeyEntry> {
        match &self.kind {
            IndexKind::Hash(map) => map.values().collect(),
            IndexKind::Tree(map) => map.values().collect(),
            IndexKind::FullText(_) => Vec::new(),
        }
    }

    fn select_scalar(
        &self,
        values: &[KeyValue],
        cond: CondType,
        sort_id: u32,
        distinct: bool,
    ) -> Result<SelectKeyResults> {
        let mut result = SelectKeyResult::default();
        match cond {
            CondType::Any => {
                for entry in self.all_entries() {
                    if distinct {
                        result
                            .results
                            .push(SingleSelectKeyResult::from_ids(self.entry_ids(entry, sort_id)?));
                    } else {
                        merge_into(&mut result, self.entry_ids(entry, sort_id)?);
                    }
                }
            }
            CondType::Eq | CondType::Set => {
                // An empty Set is legal: the AND-merge pass intersects
                // value lists and may leave nothing, which means an empty
                // result rather than an error.
                if values.is_empty() && cond == CondType::Eq {
                    return Err(Error::query_exec(format!(
                        "condition requires at least 1 argument for index '{}'",
                        self.name
                    )));
                }
                if distinct || values.len() == 1 {
                    for value in values {
                        if let Some(entry) = self.lookup(&self.make_key(value)?) {
                            result
                                .results
                                .push(SingleSelectKeyResult::from_ids(self.entry_ids(entry, sort_id)?));
                        }
                    }
                } else {
                    let ids = self.cached_union(values, cond, sort_id, |index: &Index| {
                        let mut merged = IdSet::new();
                        for value in values {
                            if let Some(entry) = index.lookup(&index.make_key(value)?) {
                                merged.union_with(&*index.entry_ids(entry, sort_id)?);
                            }
                        }
                        Ok(merged)
                    })?;
                    result.results.push(SingleSelectKeyResult::from_ids(ids));
                }
            }
            CondType::AllSet => {
                if values.is_empty() {
                    return Err(Error::query_exec(format!(
                        "AllSet requires at least 1 argument for index '{}'",
                        self.name
                    )));
                }
                let mut merged: Option<IdSet> = None;
                for value in values {
                    let ids = match self.lookup(&self.make_key(value)?) {
                        Some(entry) => (*self.entry_ids(entry, sort_id)?).clone(),
                        None => IdSet::new(),
                    };
                    merged = Some(match merged {
                        Some(acc) => acc.intersect(&ids),
                        None => ids,
                    });
                }
                result
                    .results
                    .push(SingleSelectKeyResult::from_ids(Arc::new(merged.unwrap_or_default())));
            }
            CondType::Lt | CondType::Le | CondType::Gt | CondType::Ge | CondType::Range => {
                let IndexKind::Tree(map) = &self.kind else {
                    return Err(Error::query_exec(format!(
                        "range condition is not applicable to unordered index '{}'",
                        self.name
                    )));
                };
                let expected = if cond == CondType::Range { 2 } else { 1 };
                if values.len() < expected {
                    return Err(Error::query_exec(format!(
                        "condition requires {} argument(s) for index '{}'",
                        expected, self.name
                    )));
                }
                let bounds = self.range_bounds(cond, values)?;
                if distinct {
                    for (_, entry) in map.range(bounds) {
                        result
                            .results
                            .push(SingleSelectKeyResult::from_ids(self.entry_ids(entry, sort_id)?));
                    }
                } else if sort_id != 0 && sort_id == self.sort_id && !self.sorted_ids.is_empty() {
                    // This index owns the active sort permutation: the
                    // matched ids occupy a contiguous rank window.
                    let mut begin = None;
                    let mut total = 0;
                    for (_, entry) in map.range(bounds) {
                        if entry.ids.is_empty() {
                            continue;
                        }
                        if begin.is_none() {
                            let first = entry.ids.as_slice()[0];
                            begin = Some(self.sort_orders[first]);
                        }
                        total += entry.ids.len();
                    }
                    if let Some(begin) = begin {
                        result.results.push(SingleSelectKeyResult::Range {
                            begin,
                            end: begin + total,
                        });
                    }
                } else {
                    let ids = self.cached_union(values, cond, sort_id, |index: &Index| {
                        let IndexKind::Tree(map) = &index.kind else {
                            unreachable!();
                        };
                        let mut merged = IdSet::new();
                        for (_, entry) in map.range(index.range_bounds(cond, values)?) {
                            merged.union_with(&*index.entry_ids(entry, sort_id)?);
                        }
                        Ok(merged)
                    })?;
                    result.results.push(SingleSelectKeyResult::from_ids(ids));
                }
            }
        }
        if result.results.is_empty() {
            // No key matched: an explicitly empty set keeps the boolean
            // algebra simple downstream.
            result
                .results
                .push(SingleSelectKeyResult::from_ids(Arc::new(IdSet::new())));
        }
        Ok(vec![result])
    }

    /// Consult the per-index cache for a merged posting union, honoring
    /// hit-count admission.
    fn cached_union(
        &self,
        values: &[KeyValue],
        cond: CondType,
        sort_id: u32,
        build: impl Fn(&Index) -> Result<IdSet>,
    ) -> Result<Arc<IdSet>> {
        let mut key_values = values.to_vec();
        key_values.sort();
        let key = IdSetCacheKey {
            cond,
            sort_id,
            values: key_values,
        };
        match self.cache.get(&key) {
            CacheHit::Hit(ids) => Ok(ids),
            CacheHit::NeedPut => {
                let ids = Arc::new(build(self)?);
                self.cache.put(key, ids.clone());
                Ok(ids)
            }
            CacheHit::Miss => Ok(Arc::new(build(self)?)),
        }
    }

    fn range_bounds(&self, cond: CondType, values: &[KeyValue]) -> Result<(Bound<IndexKey>, Bound<IndexKey>)> {
        Ok(match cond {
            CondType::Lt => (Bound::Unbounded, Bound::Excluded(self.make_key(&values[0])?)),
            CondType::Le => (Bound::Unbounded, Bound::Included(self.make_key(&values[0])?)),
            CondType::Gt => (Bound::Excluded(self.make_key(&values[0])?), Bound::Unbounded),
            CondType::Ge => (Bound::Included(self.make_key(&values[0])?), Bound::Unbounded),
            CondType::Range => (
                Bound::Included(self.make_key(&values[0])?),
                Bound::Included(self.make_key(&values[1])?),
            ),
            _ => return Err(Error::logic("not a range condition")),
        })
    }
}

fn merge_into(result: &mut SelectKeyResult, ids: Arc<IdSet>) {
    match result.results.first_mut() {
        Some(SingleSelectKeyResult::Ids { ids: acc, .. }) => {
            Arc::make_mut(acc).union_with(&ids);
        }
        _ => result.results.push(SingleSelectKeyResult::from_ids(ids)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::IndexDef;

    fn row(v: i32) -> PayloadValue {
        let mut pv = PayloadValue::alloc(1);
        pv.set(0, vec![KeyValue::Int(v)]);
        pv
    }

    fn tree_index() -> Index {
        let def = IndexDef::new("age", IndexType::Tree, KeyValueType::Int);
        let mut index = Index::new(&def, FieldsSet::from_fields(vec![0]));
        for (id, age) in [(0, 30), (1, 10), (2, 20), (3, 20), (4, 40)] {
            index.upsert_row(&row(age), id).unwrap();
        }
        index.commit_idsets();
        index
    }

    fn ids_of(results: &SelectKeyResults) -> Vec<IdType> {
        let mut out = Vec::new();
        for res in results {
            for single in &res.results {
                match single {
                    SingleSelectKeyResult::Ids { ids, .. } => out.extend(ids.iter()),
                    SingleSelectKeyResult::Range { begin, end } => out.extend(*begin..*end),
                }
            }
        }
        out.sort_unstable();
        out
    }

    #[test]
    fn test_eq_select() {
        let index = tree_index();
        let results = index
            .select_key(&[KeyValue::Int(20)], CondType::Eq, 0, SelectHint::Optimal)
            .unwrap();
        assert_eq!(ids_of(&results), vec![2, 3]);
    }

    #[test]
    fn test_set_select_merges() {
        let index = tree_index();
        let results = index
            .select_key(
                &[KeyValue::Int(10), KeyValue::Int(40)],
                CondType::Set,
                0,
                SelectHint::Optimal,
            )
            .unwrap();
        assert_eq!(ids_of(&results), vec![1, 4]);
    }

    #[test]
    fn test_range_select() {
        let index = tree_index();
        let results = index
            .select_key(
                &[KeyValue::Int(15), KeyValue::Int(30)],
                CondType::Range,
                0,
                SelectHint::Optimal,
            )
            .unwrap();
        assert_eq!(ids_of(&results), vec![0, 2, 3]);
    }

    #[test]
    fn test_range_on_hash_rejected() {
        let def = IndexDef::new("name", IndexType::Hash, KeyValueType::Int);
        let mut index = Index::new(&def, FieldsSet::from_fields(vec![0]));
        index.upsert_row(&row(1), 0).unwrap();
        let err = index
            .select_key(&[KeyValue::Int(1)], CondType::Lt, 0, SelectHint::Optimal)
            .unwrap_err();
        assert_eq!(err.code(), memdb_types::ErrorCode::QueryExec);
    }

    #[test]
    fn test_sort_orders_and_range_window() {
        let mut index = tree_index();
        index.make_sort_orders(5, 1).unwrap();
        // Key order: 10, 20, 20, 30, 40 -> ids 1, 2, 3, 0, 4.
        assert_eq!(index.sorted_ids(), &[1, 2, 3, 0, 4]);
        assert_eq!(index.sort_orders()[1], 0);
        assert_eq!(index.sort_orders()[4], 4);

        let results = index
            .select_key(
                &[KeyValue::Int(20), KeyValue::Int(30)],
                CondType::Range,
                1,
                SelectHint::Optimal,
            )
            .unwrap();
        // Ranks 1..4 cover both 20s and the 30.
        match &results[0].results[0] {
            SingleSelectKeyResult::Range { begin, end } => {
                assert_eq!((*begin, *end), (1, 4));
            }
            other => panic!("expected range result, got {other:?}"),
        }
    }

    #[test]
    fn test_rank_projections() {
        let mut index = tree_index();
        index.make_sort_orders(5, 1).unwrap();
        let ranks = index.sort_orders().to_vec();
        index.build_rank_projections(1, &ranks);

        let results = index
            .select_key(&[KeyValue::Int(20)], CondType::Eq, 1, SelectHint::Optimal)
            .unwrap();
        // Ids 2 and 3 hold ranks 1 and 2.
        assert_eq!(ids_of(&results), vec![1, 2]);
    }

    #[test]
    fn test_distinct_returns_per_key_sets() {
        let index = tree_index();
        let results = index
            .select_key(&[], CondType::Any, 0, SelectHint::ForceIdset)
            .unwrap();
        // 10, 20, 30, 40 -> four posting sets.
        assert_eq!(results[0].results.len(), 4);
    }

    #[test]
    fn test_delete_row() {
        let mut index = tree_index();
        index.delete_row(&row(20), 2).unwrap();
        let results = index
            .select_key(&[KeyValue::Int(20)], CondType::Eq, 0, SelectHint::Optimal)
            .unwrap();
        assert_eq!(ids_of(&results), vec![3]);
    }

    #[test]
    fn test_force_comparator() {
        let index = tree_index();
        let results = index
            .select_key(&[KeyValue::Int(20)], CondType::Eq, 0, SelectHint::ForceComparator)
            .unwrap();
        assert!(results[0].results.is_empty());
        assert_eq!(results[0].comparators.len(), 1);
    }

    #[test]
    fn test_cached_union_admission() {
        let index = tree_index();
        let values = [KeyValue::Int(10), KeyValue::Int(40)];
        // First call registers interest, second call populates the cache.
        index
            .select_key(&values, CondType::Set, 0, SelectHint::Optimal)
            .unwrap();
        index
            .select_key(&values, CondType::Set, 0, SelectHint::Optimal)
            .unwrap();
        let results = index
            .select_key(&values, CondType::Set, 0, SelectHint::Optimal)
            .unwrap();
        assert_eq!(ids_of(&results), vec![1, 4]);
        assert!(index.cache.stats().hits() >= 1);
    }
}
