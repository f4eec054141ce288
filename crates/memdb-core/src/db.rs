//! Database: the namespace registry and the join/merge coordinator.
//!
//! Simple queries go straight to their namespace. Joined queries build a
//! pre-result for each inner side once (over its outer-independent
//! conditions), then drive the outer selection loop with per-row
//! callbacks that consume the pre-result and memoize verdicts in the
//! inner namespace's join cache. Merged queries run after the primary
//! and append their rows under their own namespace context.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use memdb_types::{
    Error, IdType, JoinType, NamespaceDef, PayloadValue, Query, QueryEntry, Result,
};

use crate::cache::{CacheHit, JoinCacheKey, JoinCacheVal};
use crate::namespace::Namespace;
use crate::query::join::{JoinedSelector, PreResult};
use crate::query::results::{ItemRef, JoinedRows, QueryResults};
use crate::query::selecter::SelectCtx;

/// Registry of namespaces plus the cross-namespace query entry point.
#[derive(Default)]
pub struct Database {
    namespaces: DashMap<String, Arc<Namespace>>,
    storage_root: Option<PathBuf>,
}

impl Database {
    /// Purely in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Database persisting each namespace under `root/<namespace>`.
    pub fn with_storage(root: impl Into<PathBuf>) -> Self {
        Self {
            namespaces: DashMap::new(),
            storage_root: Some(root.into()),
        }
    }

    /// Open (or return the already-open) namespace for a definition.
    pub fn open_namespace(&self, def: &NamespaceDef) -> Result<Arc<Namespace>> {
        if let Some(existing) = self.namespaces.get(&def.name) {
            return Ok(existing.clone());
        }
        let path = self.storage_root.as_ref().map(|root| root.join(&def.name));
        let ns = Arc::new(Namespace::open(def, path.as_deref())?);
        debug!(namespace = %def.name, "namespace opened");
        self.namespaces.insert(def.name.clone(), ns.clone());
        Ok(ns)
    }

    pub fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .map(|ns| ns.clone())
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' does not exist")))
    }

    /// Flush and detach a namespace; its storage stays on disk.
    pub fn close_namespace(&self, name: &str) -> Result<()> {
        let (_, ns) = self
            .namespaces
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' does not exist")))?;
        ns.flush_storage()
    }

    /// Detach a namespace without flushing pending writes.
    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        self.namespaces
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("namespace '{name}' does not exist")))
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Execute a query, wiring joined and merged sub-queries to their
    /// namespaces.
    pub fn select(&self, query: &Query) -> Result<QueryResults> {
        let ns = self.get_namespace(&query.namespace)?;
        let mut result = QueryResults::new();

        if !query.merge_queries.is_empty() {
            if !query.forced_sort_order.is_empty() {
                return Err(Error::logic(
                    "force sort could not be applied to merged queries",
                ));
            }
            if !query.sort_by.is_empty() {
                return Err(Error::logic("sorting cannot be applied to merged queries"));
            }
        }

        if query.join_queries.is_empty() {
            let mut ctx = SelectCtx::default();
            ns.select_ctx(query, &mut ctx, &mut result)?;
        } else {
            self.select_joined(&ns, query, &mut result)?;
        }

        for merged in &query.merge_queries {
            if !merged.join_queries.is_empty() || !merged.merge_queries.is_empty() {
                return Err(Error::params(
                    "merged queries can't carry joins or further merges",
                ));
            }
            let merge_ns = self.get_namespace(&merged.namespace)?;
            let mut ctx = SelectCtx::default();
            merge_ns.select_ctx(merged, &mut ctx, &mut result)?;
        }
        Ok(result)
    }

    fn select_joined(
        &self,
        ns: &Arc<Namespace>,
        query: &Query,
        result: &mut QueryResults,
    ) -> Result<()> {
        let outer_type = ns.payload_type();
        type Collector = Rc<RefCell<Vec<(IdType, JoinedRows)>>>;
        let mut collectors: Vec<Collector> = Vec::new();
        let mut selectors: Vec<JoinedSelector<'_>> = Vec::new();

        for joined in &query.join_queries {
            if joined.join_type == JoinType::Merge {
                return Err(Error::params("merge queries are added with merge()"));
            }
            let inner_ns = self.get_namespace(&joined.query.namespace)?;
            let inner_name = joined.query.namespace.clone();
            let inner_nsid =
                result.add_ns_context(inner_ns.ns_context(joined.query.select_filter.clone()));

            // Resolve the outer side of every ON equation up front.
            let mut on_entries = Vec::with_capacity(joined.on.len());
            for on in &joined.on {
                let left = outer_type.field_index(&on.left_field).ok_or_else(|| {
                    Error::query_exec(format!(
                        "join field '{}' is not part of namespace '{}'",
                        on.left_field, query.namespace
                    ))
                })?;
                on_entries.push((left, on.clone()));
            }

            // Build the pre-result once over the outer-independent
            // conditions of the inner query.
            let mut build_query = joined.query.clone();
            build_query.start = 0;
            build_query.count = usize::MAX;
            build_query.sort_by.clear();
            build_query.sort_dir_desc = false;
            let mut pre = PreResult::for_build();
            {
                let mut scratch = QueryResults::new();
                let mut ctx = SelectCtx {
                    pre_result: Some(&mut pre),
                    add_ns_context: false,
                    ..SelectCtx::default()
                };
                inner_ns.select_ctx(&build_query, &mut ctx, &mut scratch)?;
            }

            let nodata = joined.query.count == 0;
            let fingerprint = joined.query.fingerprint();
            let base_query = joined.query.clone();
            let collector: Collector = Rc::new(RefCell::new(Vec::new()));
            collectors.push(collector.clone());

            let func_ns = inner_ns.clone();
            let func = Box::new(
                move |outer_id: IdType, outer_payload: &PayloadValue, attach: bool| -> Result<bool> {
                    let mut row_query = base_query.clone();
                    let mut outer_values = Vec::new();
                    for (left, on) in &on_entries {
                        let values = outer_payload.get(*left).to_vec();
                        outer_values.extend(values.iter().cloned());
                        row_query.entries.push(QueryEntry::new(
                            on.op,
                            on.condition,
                            on.right_field.clone(),
                            values,
                        ));
                    }

                    let cache_key = JoinCacheKey {
                        fingerprint,
                        outer_values,
                    };
                    let mut need_put = false;
                    match func_ns.join_cache().get(&cache_key) {
                        CacheHit::Hit(cached) => {
                            if attach && cached.matched && !nodata {
                                let items = func_ns
                                    .fetch_items(&cached.ids)
                                    .into_iter()
                                    .map(|(id, version, value)| ItemRef {
                                        id,
                                        version,
                                        value,
                                        proc: 0,
                                        nsid: inner_nsid,
                                    })
                                    .collect();
                                collector.borrow_mut().push((
                                    outer_id,
                                    JoinedRows {
                                        namespace: inner_name.clone(),
                                        items,
                                    },
                                ));
                            }
                            return Ok(cached.matched);
                        }
                        CacheHit::NeedPut => need_put = true,
                        CacheHit::Miss => {}
                    }

                    if nodata {
                        row_query.start = 0;
                        row_query.count = 0;
                    }
                    let mut sub_result = QueryResults::new();
                    let mut ctx = SelectCtx {
                        pre_result: Some(&mut pre),
                        add_ns_context: false,
                        req_matched_once: nodata,
                        ..SelectCtx::default()
                    };
                    func_ns.select_ctx(&row_query, &mut ctx, &mut sub_result)?;
                    let matched = if nodata {
                        ctx.matched_at_least_once
                    } else {
                        !sub_result.items.is_empty()
                    };

                    if need_put {
                        func_ns.join_cache().put(
                            cache_key,
                            JoinCacheVal {
                                matched,
                                ids: sub_result.items.iter().map(|i| i.id).collect(),
                            },
                        );
                    }
                    if attach && matched && !nodata {
                        let items = sub_result
                            .items
                            .into_iter()
                            .map(|mut item| {
                                item.nsid = inner_nsid;
                                item
                            })
                            .collect();
                        collector.borrow_mut().push((
                            outer_id,
                            JoinedRows {
                                namespace: inner_name.clone(),
                                items,
                            },
                        ));
                    }
                    Ok(matched)
                },
            );

            selectors.push(JoinedSelector {
                join_type: joined.join_type,
                ns_name: joined.query.namespace.clone(),
                called: 0,
                matched: 0,
                nodata,
                func,
            });
        }

        {
            let mut ctx = SelectCtx {
                joined_selectors: Some(&mut selectors),
                ..SelectCtx::default()
            };
            ns.select_ctx(query, &mut ctx, result)?;
        }

        for selector in &selectors {
            debug!(
                join = %selector.ns_name,
                called = selector.called,
                matched = selector.matched,
                "join selector stats"
            );
        }

        for collector in collectors {
            for (outer_id, rows) in collector.take() {
                result.joined.entry(outer_id).or_default().push(rows);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::{
        CondType, IndexDef, IndexOpts, IndexType, JoinEntry, KeyValue, KeyValueType, OpType,
    };

    fn users_def() -> NamespaceDef {
        NamespaceDef::new("users")
            .with_index(
                IndexDef::new("id", IndexType::Hash, KeyValueType::Int).with_opts(IndexOpts::pk()),
            )
            .with_index(IndexDef::new("active", IndexType::Hash, KeyValueType::Int))
    }

    fn orders_def() -> NamespaceDef {
        NamespaceDef::new("orders")
            .with_index(
                IndexDef::new("id", IndexType::Hash, KeyValueType::Int).with_opts(IndexOpts::pk()),
            )
            .with_index(IndexDef::new("user_id", IndexType::Hash, KeyValueType::Int))
            .with_index(IndexDef::new("total", IndexType::Tree, KeyValueType::Int))
    }

    fn fill(db: &Database) {
        let users = db.open_namespace(&users_def()).unwrap();
        for (id, active) in [(1, 1), (2, 0), (3, 1)] {
            let mut item = users.new_item();
            item.set_field("id", vec![KeyValue::Int(id)]).unwrap();
            item.set_field("active", vec![KeyValue::Int(active)]).unwrap();
            users.upsert(&mut item).unwrap();
        }
        let orders = db.open_namespace(&orders_def()).unwrap();
        for (id, user_id, total) in [(10, 1, 100), (11, 2, 50), (12, 3, 70), (13, 1, 10)] {
            let mut item = orders.new_item();
            item.set_field("id", vec![KeyValue::Int(id)]).unwrap();
            item.set_field("user_id", vec![KeyValue::Int(user_id)]).unwrap();
            item.set_field("total", vec![KeyValue::Int(total)]).unwrap();
            orders.upsert(&mut item).unwrap();
        }
    }

    fn join_on_user() -> Vec<JoinEntry> {
        vec![JoinEntry {
            op: OpType::And,
            condition: CondType::Eq,
            left_field: "user_id".into(),
            right_field: "id".into(),
        }]
    }

    #[test]
    fn test_inner_join_filters_outer_rows() {
        let db = Database::new();
        fill(&db);

        // Orders joined to active users only.
        let query = Query::new("orders").inner_join(
            Query::new("users").where_cond("active", CondType::Eq, vec![KeyValue::Int(1)]),
            join_on_user(),
        );
        let res = db.select(&query).unwrap();
        let ids: Vec<IdType> = res.items.iter().map(|i| i.value.get(0)[0].as_int().unwrap() as IdType).collect();
        // Order 11 belongs to the inactive user 2.
        assert_eq!(ids, vec![10, 12, 13]);
        // Matched inner rows are attached.
        assert!(res.joined.values().all(|rows| !rows.is_empty()));
    }

    #[test]
    fn test_left_join_keeps_all_outer_rows() {
        let db = Database::new();
        fill(&db);

        let query = Query::new("orders").left_join(
            Query::new("users").where_cond("active", CondType::Eq, vec![KeyValue::Int(1)]),
            join_on_user(),
        );
        let res = db.select(&query).unwrap();
        assert_eq!(res.count(), 4);
        // Order 11's user is inactive: no attached rows for it.
        let id11 = res.items.iter().find(|i| i.value.get(0)[0] == KeyValue::Int(11)).unwrap();
        assert!(!res.joined.contains_key(&id11.id));
    }

    #[test]
    fn test_join_cache_memoizes_repeat_outer_rows() {
        let db = Database::new();
        fill(&db);

        let query = Query::new("orders").inner_join(
            Query::new("users").where_cond("active", CondType::Eq, vec![KeyValue::Int(1)]),
            join_on_user(),
        );
        // Same outer key values repeat across executions; the inner
        // namespace's join cache serves them after admission.
        db.select(&query).unwrap();
        db.select(&query).unwrap();
        db.select(&query).unwrap();
        let users = db.get_namespace("users").unwrap();
        assert!(users.join_cache().stats().hits() > 0);
    }

    #[test]
    fn test_merge_appends_rows() {
        let db = Database::new();
        fill(&db);

        let query = Query::new("orders")
            .where_cond("total", CondType::Gt, vec![KeyValue::Int(60)])
            .merge(Query::new("users").where_cond("active", CondType::Eq, vec![KeyValue::Int(0)]));
        let res = db.select(&query).unwrap();
        // Two orders over 60 plus one inactive user.
        assert_eq!(res.count(), 3);
        assert_eq!(res.contexts.len(), 2);
        let nsids: Vec<usize> = res.items.iter().map(|i| i.nsid).collect();
        assert_eq!(nsids.iter().filter(|&&n| n == 1).count(), 1);
    }

    #[test]
    fn test_merge_rejects_sort() {
        let db = Database::new();
        fill(&db);
        let query = Query::new("orders")
            .sort("total", false)
            .merge(Query::new("users"));
        assert_eq!(
            db.select(&query).unwrap_err().code(),
            memdb_types::ErrorCode::Logic
        );
    }

    #[test]
    fn test_unknown_namespace() {
        let db = Database::new();
        assert_eq!(
            db.select(&Query::new("missing")).unwrap_err().code(),
            memdb_types::ErrorCode::NotFound
        );
    }
}
