use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Context key the orchestrator writes the context's own identifier under.
pub const KEY_WORKFLOW_ID: &str = "workflow_id";
pub const KEY_EXECUTION_ID: &str = "execution_id";
pub const KEY_WORKFLOW_NAME: &str = "workflow_name";
pub const KEY_LAST_RESULT: &str = "last_result";
pub const KEY_FINAL_RESULT: &str = "final_result";
pub const KEY_CURRENT_ITEM: &str = "current_item";
pub const KEY_ITEM_INDEX: &str = "item_index";
pub const KEY_ERROR_CONTEXT: &str = "error_context";
pub const KEY_START_TIME: &str = "start_time";

/// Prefix for the per-step result key: `step_result_<sanitised name>`.
pub const STEP_RESULT_PREFIX: &str = "step_result_";

/// Replaces whitespace runs with `_` and lowercases. Two steps sharing a
/// sanitised name overwrite each other's `step_result_<name>` entry; the
/// later value wins.
pub fn sanitise_step_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = false;
    for ch in name.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push('_');
            }
            last_was_space = true;
        } else {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        }
    }
    out
}

#[derive(Debug, Default)]
struct ContextInner {
    store: HashMap<String, Value>,
    trace: Vec<(DateTime<Utc>, String)>,
    version: u64,
    step_results: HashMap<String, Value>,
    step_errors: HashMap<String, String>,
    executed_step_ids: HashSet<String>,
}

impl ContextInner {
    fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// A deep, independent copy of a [`Context`]'s data at a point in time.
/// Further mutation of the source `Context` never affects a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub workflow_id: Uuid,
    pub store: HashMap<String, Value>,
    pub trace: Vec<(DateTime<Utc>, String)>,
    pub version: u64,
    pub step_results: HashMap<String, Value>,
    pub step_errors: HashMap<String, String>,
    pub executed_step_ids: HashSet<String>,
}

/// Thread-safe key-value store shared by every step in a workflow
/// execution, plus the bookkeeping the engine needs: a trace log, a
/// version counter, and per-step result/error maps.
///
/// Values are `serde_json::Value` so a single heterogeneous step queue can
/// share one store without per-type storage — the same convention this
/// codebase already uses for saga/event payloads.
#[derive(Debug)]
pub struct Context {
    id: Uuid,
    created_at: DateTime<Utc>,
    inner: RwLock<ContextInner>,
}

impl Context {
    /// Creates a new, empty context with a freshly generated workflow id.
    /// `KEY_WORKFLOW_ID` is pre-populated in the store so steps can read
    /// their own workflow's id the same way they read any other key;
    /// this doesn't count as a mutation, so `version()` still starts at 0.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        let mut store = HashMap::new();
        store.insert(KEY_WORKFLOW_ID.to_string(), Value::String(id.to_string()));
        Self {
            id,
            created_at: Utc::now(),
            inner: RwLock::new(ContextInner {
                store,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Inserts or overwrites a value. An empty key is ignored with a
    /// warning rather than panicking.
    pub async fn put(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key.is_empty() {
            warn!("ignoring context.put with empty key");
            return;
        }
        let mut inner = self.inner.write().await;
        inner.store.insert(key, value);
        inner.bump_version();
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.write().await;
        let removed = inner.store.remove(key);
        inner.bump_version();
        removed
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.store.clear();
        inner.bump_version();
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.store.get(key).cloned()
    }

    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).await.unwrap_or(default)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.store.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.store.keys().cloned().collect()
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    /// Appends a timestamped message to the execution trace. Counts as a
    /// mutation: the version counter advances.
    pub async fn log_trace(&self, message: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.trace.push((Utc::now(), message.into()));
        inner.bump_version();
    }

    pub async fn trace(&self) -> Vec<(DateTime<Utc>, String)> {
        self.inner.read().await.trace.clone()
    }

    pub(crate) async fn record_step_result(&self, step_id: &str, value: Value) {
        let mut inner = self.inner.write().await;
        inner.step_results.insert(step_id.to_string(), value);
        inner.bump_version();
    }

    pub(crate) async fn record_step_error(&self, step_id: &str, message: String) {
        let mut inner = self.inner.write().await;
        inner.step_errors.insert(step_id.to_string(), message);
        inner.bump_version();
    }

    pub(crate) async fn mark_executed(&self, step_id: &str) {
        let mut inner = self.inner.write().await;
        inner.executed_step_ids.insert(step_id.to_string());
        inner.bump_version();
    }

    pub async fn step_result(&self, step_id: &str) -> Option<Value> {
        self.inner.read().await.step_results.get(step_id).cloned()
    }

    pub async fn step_error(&self, step_id: &str) -> Option<String> {
        self.inner.read().await.step_errors.get(step_id).cloned()
    }

    pub async fn executed_step_ids(&self) -> HashSet<String> {
        self.inner.read().await.executed_step_ids.clone()
    }

    /// A value-independent copy of the current state. Later mutation of
    /// `self` (or of the returned snapshot, which owns plain data) never
    /// affects the other.
    pub async fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.read().await;
        ContextSnapshot {
            workflow_id: self.id,
            store: inner.store.clone(),
            trace: inner.trace.clone(),
            version: inner.version,
            step_results: inner.step_results.clone(),
            step_errors: inner.step_errors.clone(),
            executed_step_ids: inner.executed_step_ids.clone(),
        }
    }

    /// Builds a brand-new, fully independent `Context` pre-populated with
    /// a copy of the current store. Used by the `parallel` combinator to
    /// isolate each branch: branch mutations never propagate back.
    pub async fn deep_copy(&self) -> Context {
        let snapshot = self.snapshot().await;
        Context {
            id: snapshot.workflow_id,
            created_at: self.created_at,
            inner: RwLock::new(ContextInner {
                store: snapshot.store,
                trace: snapshot.trace,
                version: snapshot.version,
                step_results: snapshot.step_results,
                step_errors: snapshot.step_errors,
                executed_step_ids: snapshot.executed_step_ids,
            }),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_collapses_whitespace_and_lowercases() {
        assert_eq!(sanitise_step_name("Persist   User"), "persist_user");
        assert_eq!(sanitise_step_name("already_lower"), "already_lower");
        assert_eq!(sanitise_step_name("Tab\tSeparated"), "tab_separated");
    }

    #[tokio::test]
    async fn version_increases_on_every_mutation() {
        let ctx = Context::new();
        assert_eq!(ctx.version().await, 0);
        ctx.put("a", Value::from(1)).await;
        assert_eq!(ctx.version().await, 1);
        ctx.remove("a").await;
        assert_eq!(ctx.version().await, 2);
        ctx.log_trace("hello").await;
        assert_eq!(ctx.version().await, 3);
        ctx.clear().await;
        assert_eq!(ctx.version().await, 4);
    }

    #[tokio::test]
    async fn empty_key_is_ignored() {
        let ctx = Context::new();
        ctx.put("", Value::from(1)).await;
        assert_eq!(ctx.version().await, 0);
        assert_eq!(ctx.keys().await, vec![KEY_WORKFLOW_ID.to_string()]);
    }

    #[tokio::test]
    async fn new_context_pre_populates_its_own_workflow_id() {
        let ctx = Context::new();
        assert_eq!(
            ctx.get(KEY_WORKFLOW_ID).await,
            Some(Value::String(ctx.id().to_string()))
        );
    }

    #[tokio::test]
    async fn snapshot_is_decoupled_from_later_mutation() {
        let ctx = Context::new();
        ctx.put("k", Value::from("v1")).await;
        let snap = ctx.snapshot().await;
        ctx.put("k", Value::from("v2")).await;

        assert_eq!(snap.store.get("k"), Some(&Value::from("v1")));
        assert_eq!(ctx.get("k").await, Some(Value::from("v2")));
    }

    #[tokio::test]
    async fn deep_copy_is_independent_of_source() {
        let ctx = Context::new();
        ctx.put("k", Value::from(1)).await;
        let copy = ctx.deep_copy().await;

        copy.put("k", Value::from(2)).await;
        ctx.put("k", Value::from(3)).await;

        assert_eq!(copy.get("k").await, Some(Value::from(2)));
        assert_eq!(ctx.get("k").await, Some(Value::from(3)));
    }

    #[tokio::test]
    async fn executed_step_ids_is_superset_of_step_results_keys() {
        let ctx = Context::new();
        ctx.record_step_result("s1", Value::from("a")).await;
        ctx.mark_executed("s1").await;
        ctx.mark_executed("s2").await;

        let executed = ctx.executed_step_ids().await;
        assert!(executed.contains("s1"));
        assert!(executed.contains("s2"));
    }
}
