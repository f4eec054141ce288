//! Namespaces: schema-ful document collections with their own indexes,
//! lock and commit state.
//!
//! Reads run concurrently under the namespace read lock and observe the
//! snapshot taken at acquisition; writes are exclusive and reset the
//! commit state (prepared posting lists, sort permutations) and drop
//! every cache before the write lock is released. A query needing a
//! commit drops its read lock, commits under the write lock, downgrades
//! back to read and re-validates its plan against the refreshed state.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, trace};

use memdb_types::{
    CalcTotalMode, Error, IdType, IndexDef, KeyValue, KeyValueType, NamespaceDef,
    PayloadFieldType, PayloadType, PayloadValue, Query, Result,
};

use crate::cache::{JoinCache, LruCache, QueryCache, DEFAULT_CACHE_SIZE};
use crate::index::Index;
use crate::item::Item;
use crate::query::join::PreResultState;
use crate::query::results::{NsContext, QueryResults};
use crate::query::selecter::{NsSelecter, SelectCtx};
use crate::stats::{IndexMemStat, NamespaceMemStat, NamespacePerfStat, PerfStatCounter};
use crate::storage::NsStorage;
use crate::tagsmatcher::TagsMatcher;

/// Commit request: which phases to run over which indexes.
#[derive(Debug, Clone)]
pub(crate) struct NsCommitContext {
    pub make_sort_orders: bool,
    pub indexes: Vec<usize>,
}

/// Mutable namespace state guarded by the namespace lock.
pub(crate) struct NsInner {
    pub name: String,
    pub payload_type: PayloadType,
    pub indexes: Vec<Index>,
    pub index_defs: Vec<IndexDef>,
    pub indexes_by_name: HashMap<String, usize>,
    pub items: Vec<PayloadValue>,
    pub free: HashSet<IdType>,
    pub tags_matcher: TagsMatcher,
    pub storage: Option<NsStorage>,
    pub sort_orders_built: bool,
    pub sorted_queries_count: AtomicUsize,
    pub sort_id_counter: u32,
    pub prepared_indexes: HashSet<usize>,
    pub commited_indexes: HashSet<usize>,
    pub pk_index: Option<usize>,
    pub meta: HashMap<String, Vec<u8>>,
    pub version_counter: u64,
    pub queries_log_level: u8,
}

impl NsInner {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            payload_type: PayloadType::new(name),
            indexes: Vec::new(),
            index_defs: Vec::new(),
            indexes_by_name: HashMap::new(),
            items: Vec::new(),
            free: HashSet::new(),
            tags_matcher: TagsMatcher::new(),
            storage: None,
            sort_orders_built: false,
            sorted_queries_count: AtomicUsize::new(0),
            sort_id_counter: 0,
            prepared_indexes: HashSet::new(),
            commited_indexes: HashSet::new(),
            pk_index: None,
            meta: HashMap::new(),
            version_counter: 0,
            queries_log_level: 0,
        }
    }

    pub fn index_by_name(&self, name: &str) -> Option<usize> {
        self.indexes_by_name.get(name).copied()
    }

    /// Add an index per its definition; existing items are reindexed.
    fn add_index(&mut self, def: &IndexDef) -> Result<()> {
        if self.indexes_by_name.contains_key(&def.name) {
            return Err(Error::params(format!(
                "index '{}' already exists in namespace '{}'",
                def.name, self.name
            )));
        }

        let fields = if def.index_type.is_composite() {
            let mut fields = memdb_types::FieldsSet::default();
            for member in def.composite_fields() {
                let field = self.payload_type.field_index(member).ok_or_else(|| {
                    Error::params(format!(
                        "composite index '{}' references unknown field '{}'",
                        def.name, member
                    ))
                })?;
                fields.push(field);
            }
            fields
        } else if def.opts.sparse {
            let mut fields = memdb_types::FieldsSet::default();
            fields.push_tags(self.tags_matcher.path_to_tags(def.json_path()));
            fields
        } else {
            let field = match self.payload_type.field_index(&def.name) {
                Some(field) => field,
                None => {
                    let mut field_type = PayloadFieldType::new(&def.name, def.key_type);
                    field_type.is_array = def.opts.array;
                    field_type.json_paths = vec![def.json_path().to_string()];
                    let field = self.payload_type.add_field(field_type)?;
                    // Promote matching tail values of existing rows into
                    // the new slot so they become index-reachable.
                    let json_path = def.json_path().to_string();
                    for item in &mut self.items {
                        item.resize_fields(field + 1);
                        if item.is_free() || !item.get(field).is_empty() {
                            continue;
                        }
                        let promoted = item
                            .tail()
                            .get(&json_path)
                            .map(|v| crate::item::json_field_values(v, def.key_type))
                            .transpose()?
                            .unwrap_or_default();
                        let mut values = promoted;
                        for value in &mut values {
                            value.convert(def.key_type)?;
                        }
                        if values.is_empty() && !def.opts.array {
                            values.push(default_value(def.key_type));
                        }
                        item.set(field, values);
                    }
                    field
                }
            };
            memdb_types::FieldsSet::from_fields(vec![field])
        };

        let slot = self.indexes.len();
        let mut index = Index::new(def, fields);
        // Backfill postings from existing rows; values promoted from the
        // tail stay there for json-path reads.
        for (id, item) in self.items.iter().enumerate() {
            if !item.is_free() {
                index.upsert_row(item, id)?;
            }
        }
        if def.opts.pk {
            if self.pk_index.is_some() {
                return Err(Error::conflict(format!(
                    "namespace '{}' already has a PK index",
                    self.name
                )));
            }
            self.pk_index = Some(slot);
        }
        self.indexes.push(index);
        self.index_defs.push(def.clone());
        self.indexes_by_name.insert(def.name.clone(), slot);
        if let Some(storage) = &mut self.storage {
            storage.put_schema(&NamespaceDef {
                name: self.name.clone(),
                indexes: self.index_defs.clone(),
            })?;
        }
        self.mark_updated();
        Ok(())
    }

    fn drop_index(&mut self, name: &str) -> Result<()> {
        let slot = self
            .index_by_name(name)
            .ok_or_else(|| Error::not_found(format!("index '{name}' does not exist")))?;
        if self.pk_index == Some(slot) {
            return Err(Error::params("PK index can't be dropped"));
        }
        self.indexes.remove(slot);
        self.index_defs.remove(slot);
        self.indexes_by_name = self
            .index_defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        self.pk_index = self
            .pk_index
            .map(|pk| if pk > slot { pk - 1 } else { pk });
        if let Some(storage) = &mut self.storage {
            storage.put_schema(&NamespaceDef {
                name: self.name.clone(),
                indexes: self.index_defs.clone(),
            })?;
        }
        self.mark_updated();
        Ok(())
    }

    /// True when the commit would not change any state.
    pub fn commit_is_noop(&self, sort_orders: bool, interest: &[usize]) -> bool {
        if interest.iter().any(|i| !self.prepared_indexes.contains(i)) {
            return false;
        }
        if sort_orders {
            if !self.sort_orders_built {
                return false;
            }
            if interest.iter().any(|i| !self.commited_indexes.contains(i)) {
                return false;
            }
        }
        true
    }

    /// Lazily materialize posting lists and sort permutations for the
    /// indexes a query touches. No-op for already-prepared indexes.
    pub fn commit(&mut self, ctx: &NsCommitContext) -> Result<()> {
        trace!(namespace = %self.name, indexes = ?ctx.indexes,
               sort_orders = ctx.make_sort_orders, "commit");
        for &i in &ctx.indexes {
            if !self.prepared_indexes.contains(&i) {
                self.indexes[i].commit_idsets();
                self.prepared_indexes.insert(i);
            }
        }
        if ctx.make_sort_orders {
            let live = self.items.len() - self.free.len();
            let ordered: Vec<usize> = ctx
                .indexes
                .iter()
                .copied()
                .filter(|&i| self.indexes[i].is_ordered() && !self.indexes[i].opts().array)
                .collect();
            for &s in &ordered {
                if !self.commited_indexes.contains(&s) || self.indexes[s].sort_id() == 0 {
                    self.sort_id_counter += 1;
                    let sort_id = self.sort_id_counter;
                    self.indexes[s].make_sort_orders(self.items.len(), sort_id)?;
                    assert_eq!(
                        self.indexes[s].sorted_ids().len(),
                        live,
                        "sort permutation does not cover the live items"
                    );
                }
            }
            for &s in &ordered {
                let sort_id = self.indexes[s].sort_id();
                let ranks = self.indexes[s].sort_orders().to_vec();
                for &i in &ctx.indexes {
                    if !self.indexes[i].has_projection(sort_id) {
                        self.indexes[i].build_rank_projections(sort_id, &ranks);
                    }
                }
            }
            for &i in &ctx.indexes {
                self.commited_indexes.insert(i);
            }
            self.sort_orders_built = true;
        }
        Ok(())
    }

    /// Reset commit state after any mutation.
    fn mark_updated(&mut self) {
        self.sort_orders_built = false;
        self.sorted_queries_count.store(0, Ordering::Relaxed);
        self.prepared_indexes.clear();
        self.commited_indexes.clear();
        for index in &mut self.indexes {
            index.invalidate_sort();
            index.clear_cache();
        }
    }

    /// Fill defaulted values and coerce slots to their schema types, so
    /// every live row is reachable through every index over its fields.
    fn normalize_row(&self, payload: &mut PayloadValue) -> Result<()> {
        payload.resize_fields(self.payload_type.num_fields());
        for (i, field) in self.payload_type.fields().iter().enumerate() {
            if payload.get(i).is_empty() {
                if !field.is_array {
                    payload.set(i, vec![default_value(field.key_type)]);
                }
            } else {
                let mut values = payload.get(i).to_vec();
                for value in &mut values {
                    value.convert(field.key_type)?;
                }
                payload.set(i, values);
            }
        }
        Ok(())
    }

    fn register_tail_tags(&mut self, payload: &PayloadValue) {
        fn walk(tags: &mut TagsMatcher, value: &serde_json::Value) {
            if let serde_json::Value::Object(map) = value {
                for (key, nested) in map {
                    tags.name_to_tag(key);
                    walk(tags, nested);
                }
            }
        }
        walk(&mut self.tags_matcher, payload.tail());
    }

    fn find_by_pk(&self, payload: &PayloadValue) -> Result<Option<IdType>> {
        let pk = self
            .pk_index
            .ok_or_else(|| Error::params(format!("namespace '{}' has no PK index", self.name)))?;
        self.indexes[pk].find_row(payload)
    }

    fn check_unique(&self, payload: &PayloadValue, skip_id: Option<IdType>) -> Result<()> {
        for (slot, index) in self.indexes.iter().enumerate() {
            if !index.opts().unique || Some(slot) == self.pk_index {
                continue;
            }
            if let Some(existing) = index.find_row(payload)? {
                if Some(existing) != skip_id {
                    return Err(Error::conflict(format!(
                        "unique index '{}' violated by item {}",
                        index.name(),
                        existing
                    )));
                }
            }
        }
        Ok(())
    }

    fn do_insert(&mut self, mut payload: PayloadValue) -> Result<IdType> {
        self.version_counter += 1;
        payload.set_version(self.version_counter);
        let id = match self.free.iter().next().copied() {
            Some(id) => {
                self.free.remove(&id);
                self.items[id] = payload;
                id
            }
            None => {
                self.items.push(payload);
                self.items.len() - 1
            }
        };
        let row = self.items[id].clone();
        for index in &mut self.indexes {
            index.upsert_row(&row, id)?;
        }
        if let Some(storage) = &mut self.storage {
            storage.put_item(id, row.to_bytes()?)?;
        }
        Ok(id)
    }

    fn do_update(&mut self, id: IdType, mut payload: PayloadValue) -> Result<()> {
        let old = self.items[id].clone();
        for index in &mut self.indexes {
            index.delete_row(&old, id)?;
        }
        self.version_counter += 1;
        payload.set_version(self.version_counter);
        self.items[id] = payload;
        let row = self.items[id].clone();
        for index in &mut self.indexes {
            index.upsert_row(&row, id)?;
        }
        if let Some(storage) = &mut self.storage {
            storage.put_item(id, row.to_bytes()?)?;
        }
        Ok(())
    }

    fn do_delete(&mut self, id: IdType) -> Result<()> {
        let old = self.items[id].clone();
        for index in &mut self.indexes {
            index.delete_row(&old, id)?;
        }
        self.items[id] = PayloadValue::default();
        self.free.insert(id);
        if let Some(storage) = &mut self.storage {
            storage.remove_item(id)?;
        }
        Ok(())
    }
}

fn default_value(key_type: KeyValueType) -> KeyValue {
    match key_type {
        KeyValueType::Int => KeyValue::Int(0),
        KeyValueType::Int64 => KeyValue::Int64(0),
        KeyValueType::Double => KeyValue::Double(0.0),
        KeyValueType::Str => KeyValue::Str(String::new()),
        KeyValueType::Empty | KeyValueType::Composite => KeyValue::Empty,
    }
}

enum WriteMode {
    Insert,
    Update,
    Upsert,
}

/// A schema-ful document collection.
pub struct Namespace {
    inner: RwLock<NsInner>,
    query_cache: QueryCache,
    join_cache: JoinCache,
    select_perf: PerfStatCounter,
    update_perf: PerfStatCounter,
    perf_enabled: AtomicBool,
    cache_mode: AtomicU8,
}

impl Namespace {
    /// Create a namespace, optionally backed by sled storage at `path`.
    /// When the store already holds a schema, it wins over `def` and the
    /// stored items are loaded.
    pub fn open(def: &NamespaceDef, path: Option<&Path>) -> Result<Self> {
        let mut storage = match path {
            Some(path) => Some(NsStorage::open(path)?),
            None => None,
        };
        let effective = match &storage {
            Some(st) => st.load_schema()?.unwrap_or_else(|| def.clone()),
            None => def.clone(),
        };

        let mut inner = NsInner::empty(&effective.name);
        for index_def in &effective.indexes {
            inner.add_index(index_def)?;
        }

        if let Some(st) = &mut storage {
            if let Some(tags) = st.load_tags_matcher()? {
                inner.tags_matcher = tags;
            }
            for (id, bytes) in st.load_items()? {
                let payload = PayloadValue::from_bytes(&bytes)?;
                if inner.items.len() <= id {
                    inner.items.resize(id + 1, PayloadValue::default());
                }
                inner.items[id] = payload;
                inner.version_counter = inner.version_counter.max(inner.items[id].version());
            }
            let rows: Vec<(IdType, PayloadValue)> = inner
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| !item.is_free())
                .map(|(id, item)| (id, item.clone()))
                .collect();
            for (id, row) in rows {
                for index in &mut inner.indexes {
                    index.upsert_row(&row, id)?;
                }
            }
            inner.free = inner
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_free())
                .map(|(id, _)| id)
                .collect();
            for (name, data) in st.load_meta()? {
                inner.meta.insert(name, data);
            }
            if st.load_schema()?.is_none() {
                st.put_schema(&effective)?;
            }
        }
        inner.storage = storage;

        Ok(Self {
            inner: RwLock::new(inner),
            query_cache: LruCache::new(DEFAULT_CACHE_SIZE),
            join_cache: LruCache::new(DEFAULT_CACHE_SIZE),
            select_perf: PerfStatCounter::default(),
            update_perf: PerfStatCounter::default(),
            perf_enabled: AtomicBool::new(false),
            cache_mode: AtomicU8::new(0),
        })
    }

    /// Create an in-memory namespace from a definition.
    pub fn new(def: &NamespaceDef) -> Result<Self> {
        Self::open(def, None)
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn definition(&self) -> NamespaceDef {
        let inner = self.inner.read();
        NamespaceDef {
            name: inner.name.clone(),
            indexes: inner.index_defs.clone(),
        }
    }

    /// New detached item bound to the current schema.
    pub fn new_item(&self) -> Item {
        Item::new(self.inner.read().payload_type.clone())
    }

    pub fn add_index(&self, def: &IndexDef) -> Result<()> {
        let mut inner = self.inner.write();
        inner.add_index(def)?;
        self.invalidate_caches();
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.drop_index(name)?;
        self.invalidate_caches();
        Ok(())
    }

    /// Replace the stored options string of an index (full-text tuning).
    pub fn configure_index(&self, name: &str, config: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.index_by_name(name).is_none() {
            return Err(Error::not_found(format!("index '{name}' does not exist")));
        }
        inner
            .meta
            .insert(format!("index_config:{name}"), config.as_bytes().to_vec());
        Ok(())
    }

    pub fn insert(&self, item: &mut Item) -> Result<IdType> {
        self.modify(item, WriteMode::Insert)
    }

    pub fn update(&self, item: &mut Item) -> Result<IdType> {
        self.modify(item, WriteMode::Update)
    }

    pub fn upsert(&self, item: &mut Item) -> Result<IdType> {
        self.modify(item, WriteMode::Upsert)
    }

    fn modify(&self, item: &mut Item, mode: WriteMode) -> Result<IdType> {
        let started = Instant::now();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.normalize_row(item.payload_mut())?;
        inner.register_tail_tags(item.payload());

        let existing = inner.find_by_pk(item.payload())?;
        let id = match (mode, existing) {
            (WriteMode::Insert, Some(id)) => {
                return Err(Error::conflict(format!(
                    "item with this PK already exists as id {id}"
                )))
            }
            (WriteMode::Update, None) => {
                return Err(Error::not_found("item with this PK does not exist"))
            }
            (_, Some(id)) => {
                inner.check_unique(item.payload(), Some(id))?;
                inner.do_update(id, item.payload().clone())?;
                id
            }
            (_, None) => {
                inner.check_unique(item.payload(), None)?;
                inner.do_insert(item.payload().clone())?
            }
        };
        item.set_id(id);
        inner.mark_updated();
        self.invalidate_caches();
        drop(guard);
        if self.perf_enabled.load(Ordering::Relaxed) {
            self.update_perf.hit(started.elapsed());
        }
        Ok(id)
    }

    /// Delete by PK. Returns whether an item was removed.
    pub fn delete(&self, item: &mut Item) -> Result<bool> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.normalize_row(item.payload_mut())?;
        match inner.find_by_pk(item.payload())? {
            Some(id) => {
                inner.do_delete(id)?;
                inner.mark_updated();
                self.invalidate_caches();
                item.set_id(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete everything a query matches. Returns the removed count.
    pub fn delete_query(&self, query: &Query) -> Result<usize> {
        let results = self.select(query)?;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut removed = 0;
        for item in &results.items {
            // Re-validate against concurrent writes between the two locks.
            if item.id < inner.items.len()
                && !inner.items[item.id].is_free()
                && inner.items[item.id].version() == item.version
            {
                inner.do_delete(item.id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            inner.mark_updated();
            self.invalidate_caches();
        }
        Ok(removed)
    }

    /// Execute a query against this namespace.
    pub fn select(&self, query: &Query) -> Result<QueryResults> {
        if !query.join_queries.is_empty() || !query.merge_queries.is_empty() {
            return Err(Error::params(
                "joined and merged queries must run through Database::select",
            ));
        }
        let mut result = QueryResults::new();
        let mut ctx = SelectCtx::default();
        self.select_ctx(query, &mut ctx, &mut result)?;
        Ok(result)
    }

    /// Execute with an explicit context (pre-results, joined selectors).
    pub(crate) fn select_ctx(
        &self,
        query: &Query,
        ctx: &mut SelectCtx<'_, '_>,
        result: &mut QueryResults,
    ) -> Result<()> {
        let started = Instant::now();
        let have_joins = ctx
            .joined_selectors
            .as_deref()
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        let have_pre = ctx.pre_result.is_some();

        // With caching off, cached totals degrade to accurate ones.
        let downgraded;
        let query = if self.cache_mode.load(Ordering::Relaxed) != 0
            && query.calc_total == CalcTotalMode::Cached
        {
            downgraded = Query {
                calc_total: CalcTotalMode::Accurate,
                ..query.clone()
            };
            &downgraded
        } else {
            query
        };

        let mut guard = self.inner.read();
        loop {
            let prep = NsSelecter::new(&guard).prepare(query, have_pre, have_joins)?;
            match prep.commit {
                Some(commit_ctx) => {
                    // Drop-then-upgrade: commit briefly needs the write
                    // lock; the re-prepare observes the refreshed state.
                    drop(guard);
                    let mut write = self.inner.write();
                    write.commit(&commit_ctx)?;
                    guard = RwLockWriteGuard::downgrade(write);
                }
                None => {
                    let building_pre = matches!(
                        ctx.pre_result.as_deref().map(|p| &p.state),
                        Some(PreResultState::Build(_))
                    );
                    if ctx.add_ns_context && !building_pre {
                        ctx.nsid = result.add_ns_context(NsContext {
                            payload_type: guard.payload_type.clone(),
                            tags_matcher: guard.tags_matcher.clone(),
                            select_filter: query.select_filter.clone(),
                        });
                    }
                    NsSelecter::new(&guard).select(query, &prep, ctx, result, &self.query_cache)?;
                    break;
                }
            }
        }
        drop(guard);
        if self.perf_enabled.load(Ordering::Relaxed) {
            self.select_perf.hit(started.elapsed());
        }
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().meta.get(key).cloned()
    }

    pub fn put_meta(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        inner.meta.insert(key.to_string(), data.to_vec());
        if let Some(storage) = &mut inner.storage {
            storage.put_meta(key, data)?;
        }
        Ok(())
    }

    pub fn enum_meta(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().meta.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Apply pending storage writes and sync, also persisting the
    /// tagsmatcher snapshot.
    pub fn flush_storage(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let tags = inner.tags_matcher.clone();
        if let Some(storage) = &mut inner.storage {
            storage.put_tags_matcher(&tags)?;
            storage.flush()?;
        }
        Ok(())
    }

    pub fn enable_perf_counters(&self, enable: bool) {
        self.perf_enabled.store(enable, Ordering::Relaxed);
    }

    /// Persisted cache-mode byte (0 = on). Off drops and disables the
    /// total/join caches.
    pub fn set_cache_mode(&self, mode: u8) -> Result<()> {
        self.cache_mode.store(mode, Ordering::Relaxed);
        if mode != 0 {
            self.invalidate_caches();
        }
        let mut inner = self.inner.write();
        if let Some(storage) = &mut inner.storage {
            storage.put_cache_mode(mode)?;
        }
        Ok(())
    }

    pub fn cache_mode(&self) -> u8 {
        self.cache_mode.load(Ordering::Relaxed)
    }

    pub fn set_queries_log_level(&self, level: u8) {
        self.inner.write().queries_log_level = level;
    }

    pub fn mem_stat(&self) -> NamespaceMemStat {
        let inner = self.inner.read();
        NamespaceMemStat {
            name: inner.name.clone(),
            items_count: inner.items.len() - inner.free.len(),
            free_count: inner.free.len(),
            data_size: inner
                .items
                .iter()
                .filter(|i| !i.is_free())
                .map(|i| i.to_bytes().map(|b| b.len()).unwrap_or(0))
                .sum(),
            indexes: inner
                .indexes
                .iter()
                .map(|index| IndexMemStat {
                    name: index.name().to_string(),
                    unique_keys: index.size(),
                    data_size: index.mem_size(),
                })
                .collect(),
            query_cache_size: self.query_cache.total_size(),
            join_cache_size: self.join_cache.total_size(),
        }
    }

    pub fn perf_stat(&self) -> NamespacePerfStat {
        NamespacePerfStat {
            name: self.name(),
            selects: self.select_perf.snapshot(),
            updates: self.update_perf.snapshot(),
        }
    }

    pub(crate) fn join_cache(&self) -> &JoinCache {
        &self.join_cache
    }

    /// Rendering context snapshot for cross-namespace results.
    pub(crate) fn ns_context(&self, select_filter: Vec<String>) -> NsContext {
        let inner = self.inner.read();
        NsContext {
            payload_type: inner.payload_type.clone(),
            tags_matcher: inner.tags_matcher.clone(),
            select_filter,
        }
    }

    /// Payload type snapshot, for resolving join fields.
    pub(crate) fn payload_type(&self) -> PayloadType {
        self.inner.read().payload_type.clone()
    }

    /// Fetch live rows by id (join cache replay).
    pub(crate) fn fetch_items(&self, ids: &[IdType]) -> Vec<(IdType, u64, PayloadValue)> {
        let inner = self.inner.read();
        ids.iter()
            .filter_map(|&id| {
                inner.items.get(id).and_then(|item| {
                    if item.is_free() {
                        None
                    } else {
                        Some((id, item.version(), item.clone()))
                    }
                })
            })
            .collect()
    }

    fn invalidate_caches(&self) {
        self.query_cache.clear();
        self.join_cache.clear();
        debug!("caches invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::{CondType, IndexOpts, IndexType};

    fn users() -> Namespace {
        let def = NamespaceDef::new("users")
            .with_index(
                IndexDef::new("id", IndexType::Hash, KeyValueType::Int)
                    .with_opts(IndexOpts::pk()),
            )
            .with_index(IndexDef::new("age", IndexType::Tree, KeyValueType::Int))
            .with_index(IndexDef::new("name", IndexType::Hash, KeyValueType::Str));
        Namespace::new(&def).unwrap()
    }

    fn put(ns: &Namespace, id: i32, age: i32, name: &str) -> IdType {
        let mut item = ns.new_item();
        item.set_field("id", vec![KeyValue::Int(id)]).unwrap();
        item.set_field("age", vec![KeyValue::Int(age)]).unwrap();
        item.set_field("name", vec![KeyValue::Str(name.into())]).unwrap();
        ns.upsert(&mut item).unwrap()
    }

    #[test]
    fn test_insert_and_select_by_pk() {
        let ns = users();
        put(&ns, 1, 30, "ada");
        put(&ns, 2, 40, "grace");

        let res = ns
            .select(&Query::new("users").where_cond("id", CondType::Eq, vec![KeyValue::Int(2)]))
            .unwrap();
        assert_eq!(res.count(), 1);
        assert_eq!(res.items[0].value.get(2), &[KeyValue::Str("grace".into())]);
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let ns = users();
        let id1 = put(&ns, 1, 30, "ada");
        let id2 = put(&ns, 1, 31, "ada");
        assert_eq!(id1, id2);

        let res = ns
            .select(&Query::new("users").where_cond("age", CondType::Eq, vec![KeyValue::Int(31)]))
            .unwrap();
        assert_eq!(res.count(), 1);
        let stale = ns
            .select(&Query::new("users").where_cond("age", CondType::Eq, vec![KeyValue::Int(30)]))
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_insert_conflict_and_update_missing() {
        let ns = users();
        put(&ns, 1, 30, "ada");

        let mut dup = ns.new_item();
        dup.set_field("id", vec![KeyValue::Int(1)]).unwrap();
        assert_eq!(
            ns.insert(&mut dup).unwrap_err().code(),
            memdb_types::ErrorCode::Conflict
        );

        let mut missing = ns.new_item();
        missing.set_field("id", vec![KeyValue::Int(99)]).unwrap();
        assert_eq!(
            ns.update(&mut missing).unwrap_err().code(),
            memdb_types::ErrorCode::NotFound
        );
    }

    #[test]
    fn test_delete_frees_slot_and_excludes_from_results() {
        let ns = users();
        put(&ns, 1, 30, "ada");
        let victim = put(&ns, 2, 40, "grace");

        let mut item = ns.new_item();
        item.set_field("id", vec![KeyValue::Int(2)]).unwrap();
        assert!(ns.delete(&mut item).unwrap());

        let res = ns.select(&Query::new("users")).unwrap();
        assert_eq!(res.count(), 1);
        assert!(res.items.iter().all(|i| i.id != victim));

        // The freed slot is reused by the next insert.
        let reused = put(&ns, 3, 50, "linus");
        assert_eq!(reused, victim);
    }

    #[test]
    fn test_range_select_with_sort() {
        let ns = users();
        for (id, age) in [(1, 40), (2, 10), (3, 30), (4, 20)] {
            put(&ns, id, age, "x");
        }
        let res = ns
            .select(
                &Query::new("users")
                    .where_cond("age", CondType::Gt, vec![KeyValue::Int(5)])
                    .sort("age", false),
            )
            .unwrap();
        let ages: Vec<i32> = res
            .items
            .iter()
            .map(|i| i.value.get(1)[0].as_int().unwrap())
            .collect();
        assert_eq!(ages, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_sorted_iteration_after_orders_built() {
        let ns = users();
        for i in 0..20 {
            put(&ns, i, 100 - i, "x");
        }
        let query = Query::new("users")
            .where_cond("age", CondType::Gt, vec![KeyValue::Int(0)])
            .sort("age", false);
        // Push past the hit count so a commit builds real sort orders.
        for _ in 0..8 {
            let res = ns.select(&query).unwrap();
            let ages: Vec<i32> = res
                .items
                .iter()
                .map(|i| i.value.get(1)[0].as_int().unwrap())
                .collect();
            let mut expected = ages.clone();
            expected.sort_unstable();
            assert_eq!(ages, expected);
        }
        assert!(ns.inner.read().sort_orders_built);

        // Descending uses reverse iteration over the same permutation.
        let res = ns
            .select(
                &Query::new("users")
                    .where_cond("age", CondType::Gt, vec![KeyValue::Int(0)])
                    .sort("age", true),
            )
            .unwrap();
        let ages: Vec<i32> = res
            .items
            .iter()
            .map(|i| i.value.get(1)[0].as_int().unwrap())
            .collect();
        let mut expected = ages.clone();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(ages, expected);
    }

    #[test]
    fn test_meta_round_trip() {
        let ns = users();
        ns.put_meta("owner", b"core").unwrap();
        assert_eq!(ns.get_meta("owner"), Some(b"core".to_vec()));
        assert_eq!(ns.enum_meta(), vec!["owner".to_string()]);
    }

    #[test]
    fn test_writes_reset_commit_state() {
        let ns = users();
        for i in 0..10 {
            put(&ns, i, i, "x");
        }
        let query = Query::new("users")
            .where_cond("age", CondType::Ge, vec![KeyValue::Int(0)])
            .sort("age", false);
        for _ in 0..8 {
            ns.select(&query).unwrap();
        }
        assert!(ns.inner.read().sort_orders_built);
        put(&ns, 100, 1, "y");
        assert!(!ns.inner.read().sort_orders_built);
    }

    #[test]
    fn test_add_index_backfills() {
        let def = NamespaceDef::new("users").with_index(
            IndexDef::new("id", IndexType::Hash, KeyValueType::Int).with_opts(IndexOpts::pk()),
        );
        let ns = Namespace::new(&def).unwrap();
        let mut item = ns.new_item();
        item.set_field("id", vec![KeyValue::Int(1)]).unwrap();
        item.payload_mut().set_tail(serde_json::json!({"age": 33}));
        ns.upsert(&mut item).unwrap();

        ns.add_index(&IndexDef::new("age", IndexType::Tree, KeyValueType::Int))
            .unwrap();
        // The old item predates the index; its tail value is promoted
        // into the new slot and becomes index-reachable.
        let res = ns
            .select(&Query::new("users").where_cond("age", CondType::Eq, vec![KeyValue::Int(33)]))
            .unwrap();
        assert_eq!(res.count(), 1);
    }

    #[test]
    fn test_json_path_comparator_fallback() {
        let ns = users();
        let mut item = ns.new_item();
        item.from_json(r#"{"id": 1, "age": 20, "name": "ada", "city": "london"}"#)
            .unwrap();
        ns.upsert(&mut item).unwrap();
        let mut item = ns.new_item();
        item.from_json(r#"{"id": 2, "age": 30, "name": "bob", "city": "paris"}"#)
            .unwrap();
        ns.upsert(&mut item).unwrap();

        // "city" has no index: evaluated via json-path comparator.
        let res = ns
            .select(&Query::new("users").where_cond(
                "city",
                CondType::Eq,
                vec![KeyValue::Str("paris".into())],
            ))
            .unwrap();
        assert_eq!(res.count(), 1);
        assert_eq!(res.items[0].value.get(0), &[KeyValue::Int(2)]);
    }
}
