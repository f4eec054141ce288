//! The namespace selecter: query rewriting, access-path planning, the
//! selection loop and post-processing.
//!
//! A query runs in two phases against a read-locked namespace. `prepare`
//! rewrites the entries (index binding, type coercion, AND-merge,
//! composite substitution), deduces the sort order and decides whether a
//! commit is required; the namespace then commits under the write lock if
//! needed and re-prepares. `select` builds one [`SelectIterator`] per
//! surviving entry, orders them by cost, and drives the monomorphized
//! selection loop, integrating joins, distinct, aggregation and total
//! counting, followed by forced/general sorting and pagination.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use memdb_types::{
    CalcTotalMode, CollateOpts, CompositeValue, CondType, Error, FieldsSet, IdType, IndexNo,
    KeyValue, KeyValueType, OpType, Query, QueryEntry, Result,
};

use crate::cache::{CacheHit, QueryCache, TotalCount};
use crate::idset::AddMode;
use crate::index::{Index, SelectHint, SelectKeyResult, SingleSelectKeyResult};
use crate::namespace::{NsCommitContext, NsInner};
use crate::query::aggregator::Aggregator;
use crate::query::join::{JoinedSelector, PreResultState, PRERESULT_ITERATORS_THRESHOLD};
use crate::query::results::{ItemRef, QueryResults};
use crate::query::select_iterator::SelectIterator;

/// Sorted queries a namespace must see after its last write before a
/// commit builds real sort permutations; until then sorted queries run
/// the post-hoc general sort.
pub const SORTED_QUERIES_TO_BUILD_ORDERS: usize = 5;

/// Per-select execution context, threaded through by the namespace and
/// the join coordinator.
pub struct SelectCtx<'a, 'b> {
    pub pre_result: Option<&'a mut crate::query::join::PreResult>,
    pub joined_selectors: Option<&'a mut Vec<JoinedSelector<'b>>>,
    pub nsid: usize,
    /// Collect everything and paginate after post-processing.
    pub is_force_all: bool,
    /// Stop as soon as one candidate matches (existence checks).
    pub req_matched_once: bool,
    pub matched_at_least_once: bool,
    /// Register this namespace's rendering context in the results.
    pub add_ns_context: bool,
}

impl Default for SelectCtx<'_, '_> {
    fn default() -> Self {
        Self {
            pre_result: None,
            joined_selectors: None,
            nsid: 0,
            is_force_all: false,
            req_matched_once: false,
            matched_at_least_once: false,
            add_ns_context: true,
        }
    }
}

/// Rewritten query plus planning decisions, produced under the read lock.
pub(crate) struct PreparedQuery {
    pub entries: Vec<QueryEntry>,
    pub contains_fulltext: bool,
    pub sort_by: String,
    pub sort_idx: Option<usize>,
    pub commit: Option<NsCommitContext>,
}

pub struct NsSelecter<'a> {
    ns: &'a NsInner,
}

struct LoopCtx<'q, 'i> {
    qres: &'q mut Vec<SelectIterator>,
    sort_index: Option<&'i Index>,
    calc_total: bool,
}

impl<'a> NsSelecter<'a> {
    pub fn new(ns: &'a NsInner) -> Self {
        Self { ns }
    }

    /// Phase 1: rewrite the query and decide whether a commit is needed.
    pub(crate) fn prepare(
        &self,
        query: &Query,
        have_pre_result: bool,
        have_joins: bool,
    ) -> Result<PreparedQuery> {
        let mut entries = self.lookup_query_indexes(&query.entries)?;
        let contains_fulltext = self.contains_fulltext(&entries);
        if !contains_fulltext {
            entries = self.substitute_composite_indexes(entries)?;
            self.update_composite_values(&mut entries)?;
        }

        // Deduced sort order is off for explicit sorts, full-text queries,
        // merged queries and anything producing or consuming a join
        // pre-result.
        let disable_deduced =
            !query.sort_by.is_empty() || have_pre_result || !query.merge_queries.is_empty();
        let sort_by = if contains_fulltext || disable_deduced {
            query.sort_by.clone()
        } else {
            self.get_optimal_sort_order(&entries)
        };
        let sort_idx = if sort_by.is_empty() {
            None
        } else {
            Some(self.ns.index_by_name(&sort_by).ok_or_else(|| {
                Error::query_exec(format!("unknown sort field '{sort_by}'"))
            })?)
        };

        let needs_sort_orders = sort_idx.is_some()
            && !have_pre_result
            && (self.ns.sorted_queries_count.load(Ordering::Relaxed)
                > SORTED_QUERIES_TO_BUILD_ORDERS
                || have_joins);

        let commit = if !entries.is_empty() || needs_sort_orders {
            let mut interest: Vec<usize> = entries
                .iter()
                .filter_map(|e| e.idx_no.index())
                .collect();
            if let Some(si) = sort_idx {
                if !interest.contains(&si) {
                    interest.push(si);
                }
            }
            // Composite indexes whose members are all touched commit too.
            let touched = FieldsSet::from_fields(
                interest
                    .iter()
                    .flat_map(|&i| self.ns.indexes[i].fields().fields().iter().copied())
                    .collect(),
            );
            for (i, index) in self.ns.indexes.iter().enumerate() {
                if index.is_composite()
                    && !interest.contains(&i)
                    && !index.fields().is_empty()
                    && touched.contains(index.fields())
                {
                    interest.push(i);
                }
            }
            if self.ns.commit_is_noop(needs_sort_orders, &interest) {
                None
            } else {
                Some(NsCommitContext {
                    make_sort_orders: needs_sort_orders,
                    indexes: interest,
                })
            }
        } else {
            None
        };

        Ok(PreparedQuery {
            entries,
            contains_fulltext,
            sort_by,
            sort_idx,
            commit,
        })
    }

    /// Phase 2: execute a prepared query.
    pub(crate) fn select(
        &self,
        query: &Query,
        prep: &PreparedQuery,
        ctx: &mut SelectCtx<'_, '_>,
        result: &mut QueryResults,
        query_cache: &QueryCache,
    ) -> Result<()> {
        let mut need_calc_total = query.calc_total == CalcTotalMode::Accurate;
        let mut need_put_cached_total = false;
        let fingerprint = query.fingerprint();
        if query.calc_total == CalcTotalMode::Cached {
            match query_cache.get(&fingerprint) {
                CacheHit::Hit(total) => {
                    trace!(namespace = %self.ns.name, total = total.total_count,
                           "using total count from query cache");
                    result.total_count = total.total_count;
                }
                CacheHit::NeedPut => {
                    need_put_cached_total = true;
                    need_calc_total = true;
                }
                CacheHit::Miss => need_calc_total = true,
            }
        }

        let forced_sort = !query.forced_sort_order.is_empty();
        if forced_sort {
            // Bucket order is only meaningful over the full result set;
            // paginate after sorting.
            ctx.is_force_all = true;
        }

        let mut sort_idx = prep.sort_idx;
        let mut unordered_sort = false;
        let mut collate = CollateOpts::default();
        if let Some(si) = sort_idx {
            let index = &self.ns.indexes[si];
            if index.is_ordered() {
                self.ns.sorted_queries_count.fetch_add(1, Ordering::Relaxed);
            }
            let mut usable = index.is_ordered()
                && !prep.contains_fulltext
                && self.ns.sort_orders_built
                && index.sort_id() != 0
                && ctx.pre_result.is_none();
            if usable {
                // Every posting-backed entry must have rank projections
                // for this sort space.
                let sid = index.sort_id();
                usable = prep.entries.iter().all(|e| match e.idx_no {
                    IndexNo::Index(i) => {
                        let idx = &self.ns.indexes[i];
                        idx.opts().sparse || idx.is_fulltext() || idx.has_projection(sid)
                    }
                    _ => true,
                });
            }
            if !usable {
                ctx.is_force_all = true;
                unordered_sort = true;
                collate = *index.collate();
                sort_idx = None;
            }
        }
        let sort_id = sort_idx.map(|i| self.ns.indexes[i].sort_id()).unwrap_or(0);

        let mut qres: Vec<SelectIterator> = Vec::new();
        if let Some(pre) = ctx.pre_result.as_deref() {
            match &pre.state {
                PreResultState::Ids(ids) => {
                    let mut res = SelectKeyResult::default();
                    res.results.push(SingleSelectKeyResult::from_ids(ids.clone()));
                    qres.push(SelectIterator::new(res, OpType::And, false, "-preresult"));
                }
                PreResultState::Iterators(iterators) => {
                    qres.extend(iterators.iter().cloned());
                }
                PreResultState::Build(_) => {}
            }
        }

        self.select_where(&prep.entries, &mut qres, sort_id, prep.contains_fulltext)?;

        let building_pre = matches!(
            ctx.pre_result.as_deref().map(|p| &p.state),
            Some(PreResultState::Build(_))
        );
        if building_pre {
            let max_iters = qres.iter().map(|it| it.max_iterations()).max().unwrap_or(0);
            // Keep the iterators themselves when the plan is trivially
            // consumable or too wide to be worth materializing.
            if (qres.len() == 1 && qres[0].size() < 3)
                || max_iters >= PRERESULT_ITERATORS_THRESHOLD
            {
                debug!(namespace = %self.ns.name, iterators = qres.len(), max_iters,
                       "built iterators pre-result");
                if let Some(pre) = ctx.pre_result.as_deref_mut() {
                    pre.state = PreResultState::Iterators(std::mem::take(&mut qres));
                }
                return Ok(());
            }
        }

        let mut have_comparators = false;
        let mut have_idsets = false;
        for it in &qres {
            if it.has_comparators() {
                have_comparators = true;
            } else {
                have_idsets = true;
            }
        }

        let reverse = query.sort_dir_desc && sort_idx.is_some() && !prep.contains_fulltext;
        let scan_end = match sort_idx {
            Some(si) => self.ns.indexes[si].sorted_ids().len(),
            None => self.ns.items.len(),
        };

        let mut have_scan = false;
        if !prep.contains_fulltext {
            // Expected loop length: the smallest non-empty posting-backed
            // iterator bounds how many candidates the loop visits.
            let iters = qres
                .iter()
                .filter(|it| !it.is_comparator_only())
                .map(|it| it.max_iterations())
                .filter(|&c| c > 0)
                .min()
                .unwrap_or(usize::MAX);
            qres.sort_by_key(|it| it.cost(iters));

            // The leading iterator drives the loop: it must be a pure
            // posting iterator that is not negated. A mixed
            // idset-or-comparator union can't drive either, its posting
            // side only covers part of the OR.
            match qres
                .iter()
                .position(|it| it.op != OpType::Not && it.has_idsets() && !it.has_comparators())
            {
                Some(0) => {}
                Some(p) => qres.swap(0, p),
                None => {
                    qres.insert(0, SelectIterator::scan(0, scan_end, "-scan"));
                    // In rank space free slots are already excluded.
                    have_scan = sort_idx.is_none();
                }
            }
        } else if !have_idsets {
            return Err(Error::query_exec(
                "full-text query produced no driveable iterator",
            ));
        }
        debug_assert!(!qres.is_empty());

        for it in &mut qres {
            it.start(reverse);
        }

        if self.ns.queries_log_level > 0 {
            debug!(
                namespace = %self.ns.name,
                iterators = qres.len(),
                sort = %prep.sort_by,
                reverse,
                have_comparators,
                have_scan,
                "running selection loop"
            );
        }

        result.have_procent |= prep.contains_fulltext;

        let mut lctx = LoopCtx {
            qres: &mut qres,
            sort_index: sort_idx.map(|i| &self.ns.indexes[i]),
            calc_total: need_calc_total,
        };
        match (reverse, have_comparators, have_scan) {
            (true, true, true) => self.select_loop::<true, true, true>(&mut lctx, query, ctx, result)?,
            (true, true, false) => self.select_loop::<true, true, false>(&mut lctx, query, ctx, result)?,
            (true, false, true) => self.select_loop::<true, false, true>(&mut lctx, query, ctx, result)?,
            (true, false, false) => self.select_loop::<true, false, false>(&mut lctx, query, ctx, result)?,
            (false, true, true) => self.select_loop::<false, true, true>(&mut lctx, query, ctx, result)?,
            (false, true, false) => self.select_loop::<false, true, false>(&mut lctx, query, ctx, result)?,
            (false, false, true) => self.select_loop::<false, false, true>(&mut lctx, query, ctx, result)?,
            (false, false, false) => self.select_loop::<false, false, false>(&mut lctx, query, ctx, result)?,
        }

        if self.ns.queries_log_level > 1 {
            for it in qres.iter() {
                trace!(name = %it.name, sets = it.size(), cost = it.cost(1),
                       matched = it.matched_count(), "iterator stats");
            }
        }

        if unordered_sort {
            self.apply_general_sort(&mut result.items, query, &prep.sort_by, &collate)?;
        }
        if forced_sort {
            self.apply_forced_sort(&mut result.items, query)?;
        }
        if unordered_sort || ctx.is_force_all {
            set_limits_and_offset(&mut result.items, query);
        }

        if need_put_cached_total {
            trace!(namespace = %self.ns.name, total = result.total_count,
                   "storing total count in query cache");
            query_cache.put(fingerprint, TotalCount {
                total_count: result.total_count,
            });
        }

        if let Some(pre) = ctx.pre_result.as_deref_mut() {
            if let PreResultState::Build(ids) = &mut pre.state {
                let mut set = std::mem::take(ids);
                set.commit();
                debug!(namespace = %self.ns.name, ids = set.len(), "built idset pre-result");
                pre.state = PreResultState::Ids(Arc::new(set));
            }
        }
        Ok(())
    }

    /// Bind entry index names, coerce values to index key types, and
    /// merge consecutive And-entries on the same scalar index.
    fn lookup_query_indexes(&self, entries: &[QueryEntry]) -> Result<Vec<QueryEntry>> {
        let mut first_entry: Vec<isize> = vec![-1; self.ns.indexes.len()];
        let mut out: Vec<QueryEntry> = Vec::with_capacity(entries.len());
        for (n, entry) in entries.iter().enumerate() {
            let mut cur = entry.clone();
            if cur.idx_no == IndexNo::Unset {
                cur.idx_no = match self.ns.index_by_name(&cur.index) {
                    Some(i) => IndexNo::Index(i),
                    None => IndexNo::ByJsonPath,
                };
            }
            if let IndexNo::Index(i) = cur.idx_no {
                let key_type = self.ns.indexes[i].key_type();
                if key_type != KeyValueType::Composite {
                    for value in &mut cur.values {
                        value.convert(key_type)?;
                    }
                }
            }

            let next_is_and = entries.get(n + 1).map(|e| e.op == OpType::And).unwrap_or(true);
            if let IndexNo::Index(i) = cur.idx_no {
                if cur.op == OpType::And && next_is_and {
                    if first_entry[i] >= 0 && !self.ns.indexes[i].opts().array {
                        if merge_query_entries(&mut out[first_entry[i] as usize], &mut cur) {
                            continue;
                        }
                    } else {
                        first_entry[i] = out.len() as isize;
                    }
                }
            }
            out.push(cur);
        }
        Ok(out)
    }

    fn contains_fulltext(&self, entries: &[QueryEntry]) -> bool {
        entries.iter().any(|e| match e.idx_no {
            IndexNo::Index(i) => self.ns.indexes[i].is_fulltext(),
            _ => false,
        })
    }

    /// Replace contiguous `And`+`Eq` runs covering all members of a
    /// composite index by a single composite predicate; fields outside
    /// the composite survive as separate entries.
    fn substitute_composite_indexes(&self, entries: Vec<QueryEntry>) -> Result<Vec<QueryEntry>> {
        let mut out: Vec<QueryEntry> = Vec::with_capacity(entries.len());
        let mut run_start = 0;
        let mut fields = FieldsSet::default();
        for entry in entries {
            // Only scalar dense And+Eq entries participate in a run.
            let entry_field = entry.idx_no.index().and_then(|i| {
                let index = &self.ns.indexes[i];
                if entry.op == OpType::And
                    && entry.condition == CondType::Eq
                    && !entry.values.is_empty()
                    && !index.is_composite()
                    && !index.is_fulltext()
                    && !index.opts().sparse
                {
                    index.fields().fields().first().copied()
                } else {
                    None
                }
            });
            let Some(entry_field) = entry_field else {
                out.push(entry);
                run_start = out.len();
                fields.clear();
                continue;
            };
            fields.push(entry_field);
            out.push(entry);

            if let Some(found) = self.find_composite_index(&fields) {
                let composite = &self.ns.indexes[found];
                let mut payload =
                    memdb_types::PayloadValue::alloc(self.ns.payload_type.num_fields());
                let mut kept: Vec<QueryEntry> = Vec::new();
                for e in out.drain(run_start..) {
                    let i = e.idx_no.index().unwrap();
                    let field = self.ns.indexes[i].fields().fields()[0];
                    if composite.fields().contains_field(field) {
                        payload.set(field, vec![e.values[0].clone()]);
                    } else {
                        kept.push(e);
                    }
                }
                out.extend(kept);
                let mut composite_entry = QueryEntry::new(
                    OpType::And,
                    CondType::Eq,
                    composite.name(),
                    vec![KeyValue::Composite(CompositeValue {
                        value: Some(payload),
                        parts: Vec::new(),
                    })],
                );
                composite_entry.idx_no = IndexNo::Index(found);
                out.push(composite_entry);
                run_start = out.len();
                fields.clear();
            }
        }
        Ok(out)
    }

    /// First non-full-text composite index entirely covered by `fields`.
    fn find_composite_index(&self, fields: &FieldsSet) -> Option<usize> {
        if fields.has_tags_paths() {
            return None;
        }
        self.ns.indexes.iter().position(|index| {
            index.is_composite()
                && !index.is_fulltext()
                && !index.fields().is_empty()
                && fields.contains(index.fields())
        })
    }

    /// Materialize transient composite values of composite-index entries.
    fn update_composite_values(&self, entries: &mut [QueryEntry]) -> Result<()> {
        for entry in entries.iter_mut() {
            let Some(i) = entry.idx_no.index() else { continue };
            let index = &self.ns.indexes[i];
            if !index.is_composite() {
                continue;
            }
            for value in &mut entry.values {
                if matches!(value, KeyValue::Composite(c) if !c.is_materialized()) {
                    value.convert_to_composite(&self.ns.payload_type, index.fields())?;
                }
            }
        }
        Ok(())
    }

    /// Deduced sort: the largest ordered, non-distinct index carrying a
    /// range predicate.
    fn get_optimal_sort_order(&self, entries: &[QueryEntry]) -> String {
        let mut best: Option<&Index> = None;
        for entry in entries {
            let Some(i) = entry.idx_no.index() else { continue };
            if !entry.condition.is_range() || entry.distinct {
                continue;
            }
            let index = &self.ns.indexes[i];
            if index.is_ordered()
                && best.map(|b| index.size() > b.size()).unwrap_or(true)
            {
                best = Some(index);
            }
        }
        best.map(|b| b.name().to_string()).unwrap_or_default()
    }

    /// Build one iterator per entry; `Or` entries append to the previous
    /// iterator, `Not` starts a negated one.
    fn select_where(
        &self,
        entries: &[QueryEntry],
        qres: &mut Vec<SelectIterator>,
        sort_id: u32,
        is_fulltext: bool,
    ) -> Result<()> {
        for entry in entries {
            let mut fulltext_entry = false;
            let results = match entry.idx_no {
                IndexNo::ByJsonPath | IndexNo::Unset => {
                    let mut fields = FieldsSet::default();
                    fields.push_tags(
                        self.ns
                            .tags_matcher
                            .lookup_path(&entry.index)
                            .unwrap_or_else(|| vec![u32::MAX]),
                    );
                    vec![SelectKeyResult::from_comparator(
                        crate::query::comparator::Comparator::new(
                            entry.condition,
                            entry.values.clone(),
                            fields,
                            CollateOpts::default(),
                        ),
                    )]
                }
                IndexNo::Index(i) => {
                    let index = &self.ns.indexes[i];
                    fulltext_entry = index.is_fulltext();
                    if is_fulltext && entry.distinct {
                        return Err(Error::query_exec(
                            "distinct and full text - can't do it",
                        ));
                    }
                    let hint = if is_fulltext {
                        SelectHint::ForceComparator
                    } else if entry.distinct {
                        SelectHint::ForceIdset
                    } else {
                        SelectHint::Optimal
                    };
                    index.select_key(&entry.values, entry.condition, sort_id, hint)?
                }
            };

            for res in results {
                match entry.op {
                    OpType::Or => {
                        let last = qres.last_mut().ok_or_else(|| {
                            Error::query_exec("OR operator in first condition")
                        })?;
                        last.append(res);
                        last.distinct |= entry.distinct;
                        last.name = format!("{} or {}", last.name, entry.index);
                    }
                    OpType::And | OpType::Not => {
                        let mut it = SelectIterator::new(
                            res,
                            entry.op,
                            entry.distinct,
                            entry.index.clone(),
                        );
                        if fulltext_entry {
                            it.set_unsorted();
                        }
                        qres.push(it);
                    }
                }
            }
        }
        Ok(())
    }

    fn get_aggregators(&self, query: &Query) -> Result<Vec<Aggregator>> {
        let mut aggregators = Vec::with_capacity(query.aggregations.len());
        for agg in &query.aggregations {
            let idx = self.ns.index_by_name(&agg.index).ok_or_else(|| {
                Error::not_found(format!("aggregation field '{}' is not indexed", agg.index))
            })?;
            let index = &self.ns.indexes[idx];
            if index.is_composite() {
                return Err(Error::params(
                    "aggregation over composite indexes is not supported",
                ));
            }
            let field = index.fields().fields().first().copied().ok_or_else(|| {
                Error::params(format!("index '{}' has no payload field", agg.index))
            })?;
            aggregators.push(Aggregator::new(agg.agg_type, field));
        }
        Ok(aggregators)
    }

    /// The selection loop, monomorphized over scan direction, comparator
    /// presence and full-scan driving for branch elimination in the hot
    /// path.
    fn select_loop<const REVERSE: bool, const HAVE_COMPARATORS: bool, const HAVE_SCAN: bool>(
        &self,
        lctx: &mut LoopCtx<'_, '_>,
        query: &Query,
        sctx: &mut SelectCtx<'_, '_>,
        result: &mut QueryResults,
    ) -> Result<()> {
        let (mut start, mut count) = if sctx.is_force_all {
            (0, usize::MAX)
        } else {
            (query.start, query.count)
        };
        let mut aggregators = self.get_aggregators(query)?;

        // A single posting set answers the total without looping.
        let calc_total_by_loop = lctx.calc_total
            && (lctx.qres.len() > 1 || HAVE_COMPARATORS || lctx.qres[0].size() > 1);

        if lctx.qres.len() == 1 && lctx.qres[0].size() == 1 {
            result
                .items
                .reserve(lctx.qres[0].max_iterations().min(count));
        }

        let mut finish = count == 0 && !sctx.req_matched_once && !calc_total_by_loop;

        let have_inner_join = sctx
            .joined_selectors
            .as_deref()
            .map(|sel| {
                sel.iter().any(|js| {
                    matches!(
                        js.join_type,
                        memdb_types::JoinType::Inner | memdb_types::JoinType::OrInner
                    )
                })
            })
            .unwrap_or(false);

        let (first_slice, rest) = lctx.qres.split_at_mut(1);
        let first = &mut first_slice[0];

        if let Some(sort_index) = lctx.sort_index {
            debug_assert!(sort_index.is_ordered());
        }

        let mut hint: Option<IdType> = None;
        while !finish && first.next(hint) {
            hint = None;
            let Some(val) = first.current() else { break };
            let proc = first.current_proc();

            let real_val = match lctx.sort_index {
                Some(sort_index) => {
                    let sorted = sort_index.sorted_ids();
                    assert!(
                        val < sorted.len(),
                        "sort permutation is out of sync with the item vector"
                    );
                    sorted[val]
                }
                None => val,
            };
            if HAVE_SCAN && self.ns.items[real_val].is_free() {
                continue;
            }
            assert!(real_val < self.ns.items.len());
            let payload = &self.ns.items[real_val];

            let mut found = true;
            let mut i = 0;
            while i < rest.len() {
                let matched_by_comparator = {
                    let cur = &mut rest[i];
                    HAVE_COMPARATORS
                        && cur.has_comparators()
                        && cur.try_compare(payload, &self.ns.tags_matcher)
                };
                if !matched_by_comparator {
                    let cur = &mut rest[i];
                    if cur.is_comparator_only() {
                        found = false;
                    } else {
                        while cur.before(val) && cur.next(Some(val)) {}
                        if cur.is_end() {
                            finish = true;
                            found = false;
                        } else if cur.after(val) {
                            found = false;
                        }
                    }
                }

                let is_not = rest[i].op == OpType::Not;
                if is_not && !found {
                    found = true;
                    finish = false;
                } else if (is_not && found) || (!is_not && !found) {
                    found = false;
                    // Let the leading iterator skip to the nearest value
                    // the remaining And-iterators can still accept.
                    let mut tightened = val;
                    for cur in rest[i..].iter() {
                        if cur.has_comparators() || cur.op == OpType::Not || cur.is_end() {
                            continue;
                        }
                        if let Some(cv) = cur.current() {
                            tightened = if REVERSE {
                                tightened.min(cv)
                            } else {
                                tightened.max(cv)
                            };
                        }
                    }
                    if tightened != val {
                        hint = Some(tightened);
                    }
                    break;
                }
                i += 1;
            }

            if found {
                if let Some(selectors) = sctx.joined_selectors.as_deref_mut() {
                    if !selectors.is_empty() {
                        let join_match = start == 0 && count > 0;
                        let payload = self.ns.items[real_val].clone();
                        if have_inner_join {
                            for i in 0..selectors.len() {
                                let mut matched = false;
                                let mut invoked = false;
                                {
                                    let js = &mut selectors[i];
                                    match js.join_type {
                                        memdb_types::JoinType::Inner => {
                                            if found {
                                                invoked = true;
                                                js.called += 1;
                                                matched =
                                                    (js.func)(real_val, &payload, join_match)?;
                                                found &= matched;
                                            }
                                        }
                                        memdb_types::JoinType::OrInner => {
                                            if !found || !js.nodata {
                                                invoked = true;
                                                js.called += 1;
                                                matched =
                                                    (js.func)(real_val, &payload, join_match)?;
                                                found |= matched;
                                            }
                                        }
                                        _ => {}
                                    }
                                    if invoked && matched {
                                        js.matched += 1;
                                    }
                                }
                                // Without a following OrInner there is
                                // nothing left that could rescue this row.
                                if !found
                                    && !(i + 1 < selectors.len()
                                        && selectors[i + 1].join_type
                                            == memdb_types::JoinType::OrInner)
                                {
                                    break;
                                }
                            }
                        }
                        if join_match && found {
                            for js in selectors.iter_mut() {
                                if js.join_type == memdb_types::JoinType::Left {
                                    js.called += 1;
                                    if (js.func)(real_val, &payload, true)? {
                                        js.matched += 1;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if found {
                sctx.matched_at_least_once = true;
                // Exclude the posting sets that produced this candidate so
                // later duplicates of a distinct key are skipped.
                if first.distinct {
                    first.exclude_last_set();
                }
                for cur in rest.iter_mut() {
                    if cur.distinct {
                        cur.exclude_last_set();
                    }
                }

                if start > 0 {
                    start -= 1;
                } else if count > 0 {
                    count -= 1;
                    let building = matches!(
                        sctx.pre_result.as_deref().map(|p| &p.state),
                        Some(PreResultState::Build(_))
                    );
                    if !aggregators.is_empty() {
                        for aggregator in &mut aggregators {
                            aggregator.aggregate(&self.ns.items[real_val], real_val);
                        }
                    } else if building {
                        if let Some(pre) = sctx.pre_result.as_deref_mut() {
                            if let PreResultState::Build(ids) = &mut pre.state {
                                ids.add(real_val, AddMode::Unordered);
                            }
                        }
                    } else {
                        result.items.push(ItemRef {
                            id: real_val,
                            version: self.ns.items[real_val].version(),
                            value: self.ns.items[real_val].clone(),
                            proc,
                            nsid: sctx.nsid,
                        });
                    }
                }
                if count == 0 && !calc_total_by_loop {
                    break;
                }
                if calc_total_by_loop {
                    result.total_count += 1;
                }
            }
        }

        for aggregator in aggregators {
            result.aggregation_results.push(aggregator.result());
        }

        // Total for a single-idset plan comes straight from the set size.
        if lctx.calc_total && !calc_total_by_loop {
            result.total_count = if !query.entries.is_empty() {
                first.max_iterations()
            } else {
                self.ns.items.len() - self.ns.free.len()
            };
        }
        Ok(())
    }

    /// Post-hoc sort for unordered/unbuilt sort indexes: order the first
    /// `start + count` rows under the index collation.
    fn apply_general_sort(
        &self,
        items: &mut Vec<ItemRef>,
        query: &Query,
        sort_by: &str,
        collate: &CollateOpts,
    ) -> Result<()> {
        if !query.merge_queries.is_empty() {
            return Err(Error::logic("sorting cannot be applied to merged queries"));
        }
        let idx = self
            .ns
            .index_by_name(sort_by)
            .ok_or_else(|| Error::query_exec(format!("unknown sort field '{sort_by}'")))?;
        let index = &self.ns.indexes[idx];
        if index.opts().array {
            return Err(Error::query_exec(
                "sorting cannot be applied to an array field",
            ));
        }
        let fields = index.fields().clone();
        let asc = !query.sort_dir_desc;
        let limit = query.count.saturating_add(query.start).min(items.len());

        let mut cmp = |a: &ItemRef, b: &ItemRef| {
            let ord = a.value.compare(&b.value, &fields, collate);
            if asc {
                ord
            } else {
                ord.reverse()
            }
        };
        if limit > 0 && limit < items.len() {
            items.select_nth_unstable_by(limit - 1, &mut cmp);
            items[..limit].sort_by(&mut cmp);
        } else {
            items.sort_by(&mut cmp);
        }
        Ok(())
    }

    /// Explicit bucket order: rows whose sort-field value appears in
    /// `forced_sort_order` come first, in that order, stable within a
    /// bucket; the rest keep their relative order behind them.
    fn apply_forced_sort(&self, items: &mut Vec<ItemRef>, query: &Query) -> Result<()> {
        if !query.merge_queries.is_empty() {
            return Err(Error::logic(
                "force sort could not be applied to merged queries",
            ));
        }
        let idx = self.ns.index_by_name(&query.sort_by).ok_or_else(|| {
            Error::query_exec(format!("unknown sort field '{}'", query.sort_by))
        })?;
        let index = &self.ns.indexes[idx];
        if index.opts().array {
            return Err(Error::query_exec(
                "this type of sorting cannot be applied to a field of array type",
            ));
        }

        if index.is_composite() {
            let fields = index.fields().clone();
            let mut rank: std::collections::HashMap<Vec<u8>, usize> = std::collections::HashMap::new();
            for (cost, value) in query.forced_sort_order.iter().enumerate() {
                let mut value = value.clone();
                value.convert_to_composite(&self.ns.payload_type, &fields)?;
                if let KeyValue::Composite(c) = &value {
                    if let Some(pv) = &c.value {
                        rank.insert(pv.encode_key(&fields), cost);
                    }
                }
            }
            sort_by_rank(items, |item| rank.get(&item.value.encode_key(&fields)).copied());
        } else {
            let field = index.fields().fields().first().copied().ok_or_else(|| {
                Error::logic(format!("index '{}' has no payload field", query.sort_by))
            })?;
            let key_type = index.key_type();
            let mut rank: std::collections::HashMap<KeyValue, usize> = std::collections::HashMap::new();
            for (cost, value) in query.forced_sort_order.iter().enumerate() {
                let mut value = value.clone();
                value.convert(key_type)?;
                rank.insert(value, cost);
            }
            sort_by_rank(items, |item| {
                item.value.get(field).first().and_then(|v| rank.get(v).copied())
            });
        }
        Ok(())
    }
}

/// Stable-partition items with a rank to the front and order that prefix
/// by rank.
fn sort_by_rank(items: &mut Vec<ItemRef>, rank_of: impl Fn(&ItemRef) -> Option<usize>) {
    let mut ranked: Vec<(usize, ItemRef)> = Vec::new();
    let mut rest: Vec<ItemRef> = Vec::new();
    for item in items.drain(..) {
        match rank_of(&item) {
            Some(rank) => ranked.push((rank, item)),
            None => rest.push(item),
        }
    }
    ranked.sort_by_key(|(rank, _)| *rank);
    items.extend(ranked.into_iter().map(|(_, item)| item));
    items.extend(rest);
}

/// Slice `[start, start + count)` out of the collected rows.
fn set_limits_and_offset(items: &mut Vec<ItemRef>, query: &Query) {
    if query.start > 0 {
        let end = query.start.min(items.len());
        items.drain(..end);
    }
    if items.len() > query.count {
        items.truncate(query.count);
    }
}

/// Merge two And-entries on the same scalar index. `Eq`/`Set` pairs
/// intersect their value lists; `Any` is absorbed by the other side.
/// Returns whether the merge happened (the right entry is then dropped).
pub(crate) fn merge_query_entries(lhs: &mut QueryEntry, rhs: &mut QueryEntry) -> bool {
    let eqish = |c: CondType| matches!(c, CondType::Eq | CondType::Set);
    if eqish(lhs.condition) && eqish(rhs.condition) {
        lhs.values.sort();
        lhs.values.dedup();
        rhs.values.sort();
        rhs.values.dedup();
        let mut merged = Vec::with_capacity(lhs.values.len().min(rhs.values.len()));
        let (mut i, mut j) = (0, 0);
        while i < lhs.values.len() && j < rhs.values.len() {
            match lhs.values[i].cmp(&rhs.values[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    merged.push(lhs.values[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        lhs.values = merged;
        lhs.condition = if lhs.values.len() == 1 {
            CondType::Eq
        } else {
            CondType::Set
        };
        lhs.distinct |= rhs.distinct;
        true
    } else if rhs.condition == CondType::Any {
        lhs.distinct |= rhs.distinct;
        true
    } else if lhs.condition == CondType::Any {
        rhs.distinct |= lhs.distinct;
        *lhs = rhs.clone();
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cond: CondType, values: Vec<i32>) -> QueryEntry {
        QueryEntry::new(
            OpType::And,
            cond,
            "age",
            values.into_iter().map(KeyValue::Int).collect(),
        )
    }

    #[test]
    fn test_merge_eq_eq_disjoint_is_empty_set() {
        let mut lhs = entry(CondType::Eq, vec![20]);
        let mut rhs = entry(CondType::Eq, vec![30]);
        assert!(merge_query_entries(&mut lhs, &mut rhs));
        assert!(lhs.values.is_empty());
        assert_eq!(lhs.condition, CondType::Set);
    }

    #[test]
    fn test_merge_set_set_intersects() {
        let mut lhs = entry(CondType::Set, vec![10, 20]);
        let mut rhs = entry(CondType::Set, vec![20, 30]);
        assert!(merge_query_entries(&mut lhs, &mut rhs));
        assert_eq!(lhs.values, vec![KeyValue::Int(20)]);
        assert_eq!(lhs.condition, CondType::Eq);
    }

    #[test]
    fn test_merge_any_absorbed() {
        let mut lhs = entry(CondType::Any, vec![]);
        lhs.distinct = true;
        let mut rhs = entry(CondType::Gt, vec![5]);
        assert!(merge_query_entries(&mut lhs, &mut rhs));
        assert_eq!(lhs.condition, CondType::Gt);
        assert!(lhs.distinct);
    }

    #[test]
    fn test_merge_range_not_merged() {
        let mut lhs = entry(CondType::Gt, vec![5]);
        let mut rhs = entry(CondType::Lt, vec![10]);
        assert!(!merge_query_entries(&mut lhs, &mut rhs));
    }
}
