//! Result store and context-feed cache
//!
//! The store is the only shared mutable state of an execution, alongside the
//! scheduler's internal ready-queue. It maps output keys and action ids to
//! action outputs, holds execution-scoped variables set by internal actions,
//! and caches context-feed values. Discipline is single-writer-many-readers:
//! exactly one worker writes a given key (the one executing the action that
//! produced it) and readers only touch keys of completed actions, so a
//! read-write lock never contends in practice.
//!
//! Name resolution precedence, highest first: output-key bindings, action-id
//! bindings, context feeds, execution variables. The tiers are disjoint by
//! construction, so ties cannot occur.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// External source of context-feed values, consulted when a `$name` does not
/// match any action binding.
#[async_trait]
pub trait ContextFeedSource: Send + Sync {
    /// Resolve a feed by id; `None` means the feed does not exist.
    async fn resolve(&self, id: &str) -> Option<Value>;
}

/// Refresh behavior of a context feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// Re-evaluated through the source on each read unless an explicit
    /// value was bound
    OnDemand,
    /// Cached and re-evaluated when older than the interval
    Periodic { refresh_interval_ms: u64 },
}

#[derive(Debug, Clone)]
struct FeedEntry {
    kind: FeedKind,
    /// Explicitly bound values have no expiry; fetched periodic values
    /// carry their fetch time
    cached: Option<(Value, Option<DateTime<Utc>>)>,
}

#[derive(Default)]
struct StoreInner {
    by_key: HashMap<String, Value>,
    by_id: HashMap<String, Value>,
    variables: HashMap<String, Value>,
    feeds: HashMap<String, FeedEntry>,
}

/// Per-execution mapping of names to action outputs, feeds and variables
pub struct ResultStore {
    inner: RwLock<StoreInner>,
    source: Option<Arc<dyn ContextFeedSource>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            source: None,
        }
    }

    pub fn with_source(source: Arc<dyn ContextFeedSource>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            source: Some(source),
        }
    }

    /// Bind a completed action's output under its id and, when set, its
    /// output key. Called exactly once per tracked action.
    pub fn bind_result(&self, action_id: &str, output_key: Option<&str>, output: Value) {
        let mut inner = self.inner.write();
        if let Some(key) = output_key {
            inner.by_key.insert(key.to_string(), output.clone());
        }
        inner.by_id.insert(action_id.to_string(), output);
    }

    /// Bind null for a failed action whose dependents continue
    /// (`skip_on_error`).
    pub fn bind_null(&self, action_id: &str, output_key: Option<&str>) {
        self.bind_result(action_id, output_key, Value::Null);
    }

    // ------------------------------------------------------------------
    // Variables (internal actions)
    // ------------------------------------------------------------------

    pub fn set_variable(&self, name: &str, value: Value) {
        self.inner.write().variables.insert(name.to_string(), value);
    }

    pub fn delete_variable(&self, name: &str) -> bool {
        self.inner.write().variables.remove(name).is_some()
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.inner.read().variables.get(name).cloned()
    }

    // ------------------------------------------------------------------
    // Context feeds
    // ------------------------------------------------------------------

    /// Register a feed, optionally binding an explicit value.
    pub fn add_feed(&self, id: &str, kind: FeedKind, value: Option<Value>) {
        let mut inner = self.inner.write();
        inner.feeds.insert(
            id.to_string(),
            FeedEntry {
                kind,
                cached: value.map(|v| (v, None)),
            },
        );
    }

    /// Overwrite a feed's cached value (also how `<context_feed>` stream
    /// bindings land).
    pub fn update_feed(&self, id: &str, value: Value) {
        let mut inner = self.inner.write();
        match inner.feeds.get_mut(id) {
            Some(entry) => entry.cached = Some((value, None)),
            None => {
                inner.feeds.insert(
                    id.to_string(),
                    FeedEntry {
                        kind: FeedKind::OnDemand,
                        cached: Some((value, None)),
                    },
                );
            }
        }
    }

    pub fn remove_feed(&self, id: &str) -> bool {
        self.inner.write().feeds.remove(id).is_some()
    }

    pub fn list_feeds(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().feeds.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop execution-scoped variables and all feed state.
    pub fn clear_context(&self) {
        let mut inner = self.inner.write();
        inner.variables.clear();
        inner.feeds.clear();
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Materialize bindings for the given names, consulting the feed source
    /// where needed. The returned map is what one resolution pass sees;
    /// names absent from it are missing references.
    pub async fn bindings_for(&self, names: &BTreeSet<String>) -> HashMap<String, Value> {
        let mut bindings = HashMap::with_capacity(names.len());

        for name in names {
            if let Some(value) = self.action_binding(name) {
                bindings.insert(name.clone(), value);
                continue;
            }
            if let Some(value) = self.feed_value(name).await {
                bindings.insert(name.clone(), value);
                continue;
            }
            if let Some(value) = self.get_variable(name) {
                bindings.insert(name.clone(), value);
            }
        }

        bindings
    }

    fn action_binding(&self, name: &str) -> Option<Value> {
        let inner = self.inner.read();
        inner
            .by_key
            .get(name)
            .or_else(|| inner.by_id.get(name))
            .cloned()
    }

    async fn feed_value(&self, name: &str) -> Option<Value> {
        let (kind, cached) = {
            let inner = self.inner.read();
            match inner.feeds.get(name) {
                Some(entry) => (Some(entry.kind), entry.cached.clone()),
                None => (None, None),
            }
        };

        if let Some((value, fetched_at)) = cached {
            let fresh = match (kind, fetched_at) {
                // Explicit bindings never expire.
                (_, None) => true,
                (Some(FeedKind::Periodic { refresh_interval_ms }), Some(at)) => {
                    Utc::now() - at < Duration::milliseconds(refresh_interval_ms as i64)
                }
                (Some(FeedKind::OnDemand), Some(_)) | (None, Some(_)) => false,
            };
            if fresh {
                return Some(value);
            }
        }

        let source = self.source.as_ref()?;
        let value = source.resolve(name).await?;
        debug!(feed = name, "resolved context feed from source");

        // Periodic fetches are cached with their fetch time; on-demand
        // fetches are re-evaluated on the next read.
        if let Some(FeedKind::Periodic { .. }) = kind {
            let mut inner = self.inner.write();
            if let Some(entry) = inner.feeds.get_mut(name) {
                entry.cached = Some((value.clone(), Some(Utc::now())));
            }
        }

        Some(value)
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContextFeedSource for CountingSource {
        async fn resolve(&self, id: &str) -> Option<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match id {
                "counter" => Some(json!(n)),
                _ => None,
            }
        }
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_precedence_key_over_id() {
        let store = ResultStore::new();
        store.bind_result("a1", Some("result"), json!("by_key"));
        store.bind_result("result", None, json!("by_id"));

        let bindings = store.bindings_for(&names(&["result"])).await;
        assert_eq!(bindings["result"], json!("by_key"));
    }

    #[tokio::test]
    async fn test_precedence_binding_over_feed_and_variable() {
        let store = ResultStore::new();
        store.update_feed("x", json!("feed"));
        store.set_variable("x", json!("var"));

        let bindings = store.bindings_for(&names(&["x"])).await;
        assert_eq!(bindings["x"], json!("feed"));

        store.bind_result("a", Some("x"), json!("action"));
        let bindings = store.bindings_for(&names(&["x"])).await;
        assert_eq!(bindings["x"], json!("action"));
    }

    #[tokio::test]
    async fn test_variable_used_when_nothing_else_matches() {
        let store = ResultStore::new();
        store.set_variable("v", json!({"deep": true}));
        let bindings = store.bindings_for(&names(&["v"])).await;
        assert_eq!(bindings["v"], json!({"deep": true}));
    }

    #[tokio::test]
    async fn test_missing_name_absent_from_bindings() {
        let store = ResultStore::new();
        let bindings = store.bindings_for(&names(&["ghost"])).await;
        assert!(bindings.is_empty());
    }

    #[tokio::test]
    async fn test_on_demand_feed_refetches() {
        let store = ResultStore::with_source(Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        }));
        store.add_feed("counter", FeedKind::OnDemand, None);

        let first = store.bindings_for(&names(&["counter"])).await;
        let second = store.bindings_for(&names(&["counter"])).await;
        assert_eq!(first["counter"], json!(0));
        assert_eq!(second["counter"], json!(1));
    }

    #[tokio::test]
    async fn test_periodic_feed_cached_until_stale() {
        let store = ResultStore::with_source(Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        }));
        store.add_feed(
            "counter",
            FeedKind::Periodic {
                refresh_interval_ms: 60_000,
            },
            None,
        );

        let first = store.bindings_for(&names(&["counter"])).await;
        let second = store.bindings_for(&names(&["counter"])).await;
        assert_eq!(first["counter"], json!(0));
        assert_eq!(second["counter"], json!(0), "cached within the interval");
    }

    #[tokio::test]
    async fn test_periodic_feed_refetches_when_stale() {
        let store = ResultStore::with_source(Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        }));
        store.add_feed(
            "counter",
            FeedKind::Periodic {
                refresh_interval_ms: 0,
            },
            None,
        );

        store.bindings_for(&names(&["counter"])).await;
        let second = store.bindings_for(&names(&["counter"])).await;
        assert_eq!(second["counter"], json!(1));
    }

    #[tokio::test]
    async fn test_explicit_feed_binding_wins_over_source() {
        let store = ResultStore::with_source(Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        }));
        store.update_feed("counter", json!("pinned"));
        let bindings = store.bindings_for(&names(&["counter"])).await;
        assert_eq!(bindings["counter"], json!("pinned"));
    }

    #[tokio::test]
    async fn test_unregistered_name_still_queries_source() {
        let store = ResultStore::with_source(Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        }));
        let bindings = store.bindings_for(&names(&["counter"])).await;
        assert_eq!(bindings["counter"], json!(0));
    }

    #[test]
    fn test_variables_and_feed_management() {
        let store = ResultStore::new();
        store.set_variable("a", json!(1));
        assert_eq!(store.get_variable("a"), Some(json!(1)));
        assert!(store.delete_variable("a"));
        assert!(!store.delete_variable("a"));

        store.add_feed("f1", FeedKind::OnDemand, Some(json!("v")));
        store.update_feed("f2", json!("w"));
        assert_eq!(store.list_feeds(), vec!["f1".to_string(), "f2".to_string()]);
        assert!(store.remove_feed("f1"));

        store.set_variable("b", json!(2));
        store.clear_context();
        assert!(store.get_variable("b").is_none());
        assert!(store.list_feeds().is_empty());
    }

    #[test]
    fn test_bind_null() {
        let store = ResultStore::new();
        store.bind_null("a", Some("out"));
        assert_eq!(store.action_binding("a"), Some(Value::Null));
        assert_eq!(store.action_binding("out"), Some(Value::Null));
    }
}
