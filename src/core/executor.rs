//! RW-007: Executor: one live document scope.
//!
//! document → graph → order → resolve → cache → pipe → context → live
//!
//! `run_all` runs bounded fixed-point passes over the dependency order. A
//! query whose filter still holds references is pending for the pass and is
//! retried on the next one; a cycle aborts the whole run. After the initial
//! load every resolved query is kept live through the shared subscription
//! registry. Live events for one scope are handled in arrival order by a
//! single task.

use super::config::EngineOptions;
use super::context::ResolutionContext;
use super::error::EngineError;
use super::graph::DependencyGraph;
use super::pipe;
use super::planner::{self, BatchPlanner, ProfileBatcher, Registration};
use super::resolver;
use super::types::{
    events_to_value, strip_sigil, DocumentSpec, Event, Filter, QuerySpec, QueryStatus, RunOutput,
};
use crate::cache::{hasher, DataLayer, Listener, SubscriptionHandle};
use crate::transport::Signer;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(0);

/// Called with `{query: value}` for every changed, de-duplicated update.
pub type UpdateCallback = Arc<dyn Fn(IndexMap<String, Value>) + Send + Sync>;

#[derive(Debug)]
pub(super) struct LiveUpdate {
    query: String,
    event: Event,
}

#[derive(Default)]
pub(super) struct ScopeState {
    pub(super) context: ResolutionContext,
    pub(super) status: IndexMap<String, QueryStatus>,
    pub(super) hashes: HashMap<String, String>,
    /// Last resolved (non-live) filter per query
    pub(super) filters: HashMap<String, Filter>,
    live: HashMap<String, SubscriptionHandle>,
    task: Option<JoinHandle<()>>,
}

pub(super) struct Scope {
    id: u64,
    pub(super) document: RwLock<DocumentSpec>,
    pub(super) layer: Arc<DataLayer>,
    pub(super) signer: Option<Arc<dyn Signer>>,
    planner: Option<Arc<BatchPlanner>>,
    profiles: Option<Arc<ProfileBatcher>>,
    pub(super) options: EngineOptions,
    pub(super) state: Mutex<ScopeState>,
    on_update: Mutex<Option<UpdateCallback>>,
    live_tx: UnboundedSender<LiveUpdate>,
    live_rx: Mutex<Option<UnboundedReceiver<LiveUpdate>>>,
    torn_down: AtomicBool,
}

impl Scope {
    fn release_all(&self) {
        let (handles, task) = {
            let mut st = self.state.lock();
            let handles: Vec<SubscriptionHandle> = st.live.drain().map(|(_, h)| h).collect();
            (handles, st.task.take())
        };
        for handle in &handles {
            self.layer.subscriptions.release(handle);
        }
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Configures an [`Executor`].
pub struct ExecutorBuilder {
    document: DocumentSpec,
    layer: Arc<DataLayer>,
    signer: Option<Arc<dyn Signer>>,
    planner: Option<Arc<BatchPlanner>>,
    profiles: Option<Arc<ProfileBatcher>>,
    context: ResolutionContext,
    options: EngineOptions,
    on_update: Option<UpdateCallback>,
}

impl ExecutorBuilder {
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Route query fetches through a shared batching planner. Child scopes
    /// inherit it.
    pub fn planner(mut self, planner: Arc<BatchPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Serve [`Executor::profile`] lookups through a shared batcher.
    pub fn profiles(mut self, profiles: Arc<ProfileBatcher>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn context(mut self, context: ResolutionContext) -> Self {
        self.context = context;
        self
    }

    /// Shorthand for a context signed in as `pubkey`.
    pub fn user(mut self, pubkey: impl Into<String>) -> Self {
        self.context.user_pubkey = Some(pubkey.into());
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_update(
        mut self,
        callback: impl Fn(IndexMap<String, Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Executor {
        let mut context = self.context;
        if context.now == 0 {
            context.touch();
        }
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Executor {
            inner: Arc::new(Scope {
                id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
                document: RwLock::new(self.document.normalized()),
                layer: self.layer,
                signer: self.signer,
                planner: self.planner,
                profiles: self.profiles,
                options: self.options,
                state: Mutex::new(ScopeState {
                    context,
                    ..Default::default()
                }),
                on_update: Mutex::new(self.on_update),
                live_tx,
                live_rx: Mutex::new(Some(live_rx)),
                torn_down: AtomicBool::new(false),
            }),
        }
    }
}

/// Handle to a document scope. Clones share the scope.
#[derive(Clone)]
pub struct Executor {
    pub(super) inner: Arc<Scope>,
}

impl Executor {
    pub fn builder(document: DocumentSpec, layer: Arc<DataLayer>) -> ExecutorBuilder {
        ExecutorBuilder {
            document,
            layer,
            signer: None,
            planner: None,
            profiles: None,
            context: ResolutionContext::default(),
            options: EngineOptions::default(),
            on_update: None,
        }
    }

    /// A nested scope sharing this scope's data layer, signer, planner and
    /// options, resolving `target.*` against `target`.
    pub fn child_scope(&self, document: DocumentSpec, target: Value) -> Executor {
        let mut builder = Executor::builder(document, Arc::clone(&self.inner.layer))
            .context(self.context().derive_for_target(target))
            .options(self.inner.options.clone());
        if let Some(signer) = &self.inner.signer {
            builder = builder.signer(Arc::clone(signer));
        }
        if let Some(planner) = &self.inner.planner {
            builder = builder.planner(Arc::clone(planner));
        }
        if let Some(profiles) = &self.inner.profiles {
            builder = builder.profiles(Arc::clone(profiles));
        }
        builder.build()
    }

    /// Profile metadata of `pubkey` (parsed kind-0 content plus `pubkey`),
    /// batched when the scope has a profile batcher.
    pub async fn profile(&self, pubkey: &str) -> Option<Value> {
        let record = match &self.inner.profiles {
            Some(profiles) => profiles.resolve(pubkey).await,
            None => {
                let filter = Filter {
                    kinds: Some(vec![0]),
                    authors: Some(vec![pubkey.to_string()]),
                    ..Default::default()
                };
                match self.inner.layer.cache.get_or_fetch(&filter).await {
                    Ok(events) => events.into_iter().max_by_key(|e| e.created_at),
                    Err(err) => {
                        tracing::warn!(pubkey, error = %err, "profile fetch failed");
                        None
                    }
                }
            }
        };
        record.as_ref().map(planner::profile_metadata)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn set_update_callback(
        &self,
        callback: impl Fn(IndexMap<String, Value>) + Send + Sync + 'static,
    ) {
        *self.inner.on_update.lock() = Some(Arc::new(callback));
    }

    /// Copy of the current resolution context.
    pub fn context(&self) -> ResolutionContext {
        self.inner.state.lock().context.clone()
    }

    pub fn status(&self, query: &str) -> Option<QueryStatus> {
        self.inner.state.lock().status.get(query).cloned()
    }

    /// Current value of `query`; `[]` while pending, failed or unknown.
    pub fn query_result(&self, query: &str) -> Value {
        self.inner
            .state
            .lock()
            .context
            .query_results
            .get(query)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    /// Dependency graph of the current document.
    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::from_document(&self.inner.document.read())
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    /// Resolve every query, then keep results live if enabled.
    pub async fn run_all(&self) -> Result<RunOutput, EngineError> {
        self.inner.state.lock().context.touch();
        let everything: HashSet<String> =
            self.inner.document.read().queries.keys().cloned().collect();
        if let Err(err) = self.run_passes(everything).await {
            tracing::error!(error = %err, "run aborted");
            return Err(err);
        }
        if self.inner.options.live {
            self.ensure_live_all().await;
        }
        let output = self.snapshot();
        tracing::info!(
            queries = output.query_results.len(),
            pending = output.pending.len(),
            "run complete"
        );
        Ok(output)
    }

    /// Current results without running anything.
    pub fn snapshot(&self) -> RunOutput {
        let names: Vec<String> = self.inner.document.read().queries.keys().cloned().collect();
        let st = self.inner.state.lock();
        let query_results = names
            .iter()
            .map(|name| {
                let value = st
                    .context
                    .query_results
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new()));
                (name.clone(), value)
            })
            .collect();
        let pending = names
            .iter()
            .filter(|name| matches!(st.status.get(*name), Some(QueryStatus::Pending { .. })))
            .cloned()
            .collect();
        RunOutput {
            query_results,
            extracted_variables: st.context.extracted_variables(),
            pending,
        }
    }

    /// Add (or replace) a query mid-session and resolve it, running any
    /// unresolved ancestors first.
    pub async fn add_query(&self, name: &str, spec: QuerySpec) -> Result<Value, EngineError> {
        let name = strip_sigil(name, '$');
        let mut spec = spec;
        spec.triggers = spec.triggers.map(|t| strip_sigil(&t, '@'));
        self.inner
            .document
            .write()
            .queries
            .insert(name.clone(), spec);

        let order = self.graph().order_for(&[name.as_str()])?;
        for query in &order {
            let resolved = matches!(self.status(query), Some(QueryStatus::Resolved));
            if *query == name || !resolved {
                self.execute_query(query).await;
            }
        }
        if self.inner.options.live {
            self.ensure_live_all().await;
        }
        Ok(self.query_result(&name))
    }

    /// Drop a query and its live subscription.
    pub fn remove_query(&self, name: &str) -> bool {
        let name = strip_sigil(name, '$');
        let removed = self
            .inner
            .document
            .write()
            .queries
            .shift_remove(&name)
            .is_some();
        let handle = {
            let mut st = self.inner.state.lock();
            st.status.shift_remove(&name);
            st.hashes.remove(&name);
            st.filters.remove(&name);
            st.context.query_results.shift_remove(&name);
            st.live.remove(&name)
        };
        if let Some(handle) = handle {
            self.inner.layer.subscriptions.release(&handle);
        }
        removed
    }

    /// Release every live subscription this scope owns. Nothing is delivered
    /// to the scope afterwards.
    pub fn teardown(&self) {
        self.inner.torn_down.store(true, Ordering::SeqCst);
        self.inner.release_all();
        tracing::debug!("scope torn down");
    }

    /// Execute every query that is stale, not yet resolved, or downstream
    /// of a query that changed in this run. Returns the changed values.
    pub(super) async fn run_passes(
        &self,
        mut stale: HashSet<String>,
    ) -> Result<IndexMap<String, Value>, EngineError> {
        let graph = self.graph();
        let order = graph.execution_order()?;
        let mut changed: IndexMap<String, Value> = IndexMap::new();
        let mut done: HashSet<String> = HashSet::new();

        for pass in 1..=self.inner.options.max_passes {
            let mut progressed = false;
            let mut pending = 0usize;

            for name in &order {
                if done.contains(name) {
                    continue;
                }
                let forced = stale.remove(name);
                let upstream_changed = graph
                    .dependencies(name)
                    .iter()
                    .any(|dep| changed.contains_key(dep));
                let resolved = matches!(self.status(name), Some(QueryStatus::Resolved));
                if resolved && !forced && !upstream_changed {
                    continue;
                }

                let before = self.hash_of(name);
                match self.execute_query(name).await {
                    QueryStatus::Resolved => {
                        done.insert(name.clone());
                        progressed = true;
                        if self.hash_of(name) != before {
                            changed.insert(name.clone(), self.query_result(name));
                        }
                    }
                    QueryStatus::Pending { .. } => {
                        pending += 1;
                        if before.is_some() {
                            changed.insert(name.clone(), Value::Array(Vec::new()));
                        }
                    }
                    QueryStatus::Failed { .. } => {
                        done.insert(name.clone());
                        if before.is_some() {
                            changed.insert(name.clone(), Value::Array(Vec::new()));
                        }
                    }
                }
            }

            tracing::debug!(pass, pending, changed = changed.len(), "pass complete");
            if pending == 0 || !progressed {
                break;
            }
        }
        Ok(changed)
    }

    fn hash_of(&self, query: &str) -> Option<String> {
        self.inner.state.lock().hashes.get(query).cloned()
    }

    /// Resolve, fetch and pipe one query, recording the outcome.
    async fn execute_query(&self, name: &str) -> QueryStatus {
        let Some(spec) = self.inner.document.read().queries.get(name).cloned() else {
            return QueryStatus::Failed {
                error: EngineError::UnknownQuery(name.to_string()).to_string(),
            };
        };
        let context = self.context();
        let map = match resolver::resolve(&spec.filter_value(), &context) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let filter = match Filter::from_resolved(name, &map) {
            Ok(filter) => filter,
            Err(EngineError::UnresolvedReference { token, .. }) => {
                tracing::debug!(query = name, token = %token, "query pending");
                let status = QueryStatus::Pending { unresolved: token };
                self.record(name, status.clone(), None);
                return status;
            }
            Err(err) => {
                tracing::warn!(query = name, error = %err, "invalid filter");
                let status = QueryStatus::Failed {
                    error: err.to_string(),
                };
                self.record(name, status.clone(), None);
                return status;
            }
        };

        let fetched = match &self.inner.planner {
            Some(planner) => {
                let registration = Registration {
                    query_id: name.to_string(),
                    owner_id: format!("scope-{}", self.inner.id),
                    filter: filter.clone(),
                    pipe: spec.pipe.clone(),
                };
                planner.fetch(registration).await
            }
            None => self
                .inner
                .layer
                .cache
                .get_or_fetch(&filter)
                .await
                .map(|events| pipe::apply(events_to_value(&events), &spec.pipe)),
        };
        match fetched {
            Ok(value) => {
                tracing::debug!(query = name, batched = self.inner.planner.is_some(), "query resolved");
                self.record(name, QueryStatus::Resolved, Some((filter, value)));
                QueryStatus::Resolved
            }
            Err(err) => {
                let status = QueryStatus::Failed {
                    error: err.to_string(),
                };
                self.record(name, status.clone(), None);
                status
            }
        }
    }

    fn record(&self, name: &str, status: QueryStatus, result: Option<(Filter, Value)>) {
        let mut st = self.inner.state.lock();
        match result {
            Some((filter, value)) => {
                st.hashes
                    .insert(name.to_string(), hasher::hash_value(&value));
                st.context.query_results.insert(name.to_string(), value);
                st.filters.insert(name.to_string(), filter);
            }
            None => {
                st.hashes.remove(name);
                st.context.query_results.shift_remove(name);
                st.filters.remove(name);
            }
        }
        st.status.insert(name.to_string(), status);
    }

    /// Subscribe every resolved query; drop subscriptions of queries that
    /// are no longer resolved.
    pub(super) async fn ensure_live_all(&self) {
        if self.is_torn_down() {
            return;
        }
        let orphaned: Vec<SubscriptionHandle> = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let filters = &st.filters;
            let dead: Vec<String> = st
                .live
                .keys()
                .filter(|query| !filters.contains_key(*query))
                .cloned()
                .collect();
            dead.iter().filter_map(|query| st.live.remove(query)).collect()
        };
        for handle in &orphaned {
            self.inner.layer.subscriptions.release(handle);
        }

        self.start_live_task();
        let names: Vec<String> = self.inner.document.read().queries.keys().cloned().collect();
        for name in &names {
            self.ensure_live(name).await;
        }
    }

    async fn ensure_live(&self, name: &str) {
        let Some(live_filter) = self.inner.state.lock().filters.get(name).map(Filter::live) else {
            return;
        };
        let key = live_filter.canonical_key();
        let previous = {
            let mut st = self.inner.state.lock();
            match st.live.get(name).map(|handle| handle.key == key) {
                Some(true) => return,
                Some(false) => st.live.remove(name),
                None => None,
            }
        };
        if let Some(old) = previous {
            tracing::debug!(query = name, "filter changed, resubscribing");
            self.inner.layer.subscriptions.release(&old);
        }

        let tx = self.inner.live_tx.clone();
        let query = name.to_string();
        let listener: Listener = Arc::new(move |event: Event| {
            let _ = tx.send(LiveUpdate {
                query: query.clone(),
                event,
            });
        });

        match self
            .inner
            .layer
            .subscriptions
            .ensure_subscription(&live_filter, listener)
            .await
        {
            Ok(handle) => {
                let leftover = {
                    let mut st = self.inner.state.lock();
                    if self.is_torn_down() {
                        Some(handle)
                    } else {
                        st.live.insert(name.to_string(), handle)
                    }
                };
                if let Some(handle) = leftover {
                    self.inner.layer.subscriptions.release(&handle);
                }
            }
            Err(err) => {
                tracing::warn!(query = name, error = %err, "live subscription failed");
            }
        }
    }

    fn start_live_task(&self) {
        let Some(rx) = self.inner.live_rx.lock().take() else {
            return;
        };
        let scope = Arc::downgrade(&self.inner);
        let task = tokio::spawn(live_loop(scope, rx));
        self.inner.state.lock().task = Some(task);
    }

    fn handle_live(self, update: LiveUpdate) -> BoxFuture<'static, ()> {
        async move { self.apply_live(update).await }.boxed()
    }

    async fn apply_live(&self, update: LiveUpdate) {
        if self.is_torn_down() {
            return;
        }
        let LiveUpdate { query, event } = update;
        let Some(spec) = self.inner.document.read().queries.get(&query).cloned() else {
            return;
        };
        let Some(filter) = self.inner.state.lock().filters.get(&query).cloned() else {
            return;
        };
        if !filter.matches(&event) {
            return;
        }

        let mut changed = IndexMap::new();
        let fire = if spec.pipe.is_empty() {
            let Some(value) = self.prepend_live(&query, &event, filter.limit) else {
                tracing::trace!(query = %query, id = %event.id, "known record ignored");
                return;
            };
            self.inner.layer.cache.prepend(&filter, event);
            changed.insert(query.clone(), value);
            true
        } else {
            self.inner.layer.cache.invalidate(&filter);
            let events = match self.inner.layer.cache.get_or_fetch(&filter).await {
                Ok(events) => events,
                Err(err) => {
                    tracing::warn!(query = %query, error = %err, "live refetch failed");
                    return;
                }
            };
            let value = pipe::apply(events_to_value(&events), &spec.pipe);
            let hash = hasher::hash_value(&value);
            let unchanged = {
                let mut st = self.inner.state.lock();
                if st.hashes.get(&query) == Some(&hash) {
                    true
                } else {
                    st.hashes.insert(query.clone(), hash);
                    st.context.query_results.insert(query.clone(), value.clone());
                    false
                }
            };
            if unchanged {
                tracing::trace!(query = %query, "live update left result unchanged");
                return;
            }
            let fire = !is_blank(&value);
            changed.insert(query.clone(), value);
            fire
        };
        tracing::debug!(query = %query, "live update");

        let dependents = self.graph().dependents(&query).unwrap_or_default();
        if !dependents.is_empty() {
            match self.run_passes(dependents.into_iter().collect()).await {
                Ok(more) => changed.extend(more),
                Err(err) => tracing::warn!(error = %err, "dependent refresh failed"),
            }
            self.ensure_live_all().await;
        }
        self.emit(changed);

        if let Some(action) = spec.triggers.filter(|_| fire) {
            tracing::info!(query = %query, action = %action, "live update triggers action");
            let outcome = self.execute_action(&action, Map::new()).await;
            if let Some(err) = &outcome.error {
                tracing::warn!(action = %action, error = %err, "triggered action failed");
            }
        }
    }

    /// Prepend a live record to an unpiped result after an id identity
    /// check, keeping at most `limit` records. Returns the new value, or
    /// `None` for a known record.
    fn prepend_live(&self, query: &str, event: &Event, limit: Option<usize>) -> Option<Value> {
        let mut st = self.inner.state.lock();
        let value = match st.context.query_results.get_mut(query) {
            Some(Value::Array(items)) => {
                let known = items
                    .iter()
                    .any(|item| item.get("id").and_then(Value::as_str) == Some(event.id.as_str()));
                if known {
                    return None;
                }
                items.insert(0, event.to_value());
                if let Some(limit) = limit {
                    items.truncate(limit);
                }
                Value::Array(items.clone())
            }
            _ => return None,
        };
        st.hashes
            .insert(query.to_string(), hasher::hash_value(&value));
        Some(value)
    }

    pub(super) fn emit(&self, changed: IndexMap<String, Value>) {
        if changed.is_empty() || self.is_torn_down() {
            return;
        }
        let callback = self.inner.on_update.lock().clone();
        if let Some(callback) = callback {
            callback(changed);
        }
    }
}

async fn live_loop(scope: Weak<Scope>, mut rx: UnboundedReceiver<LiveUpdate>) {
    while let Some(update) = rx.recv().await {
        let Some(inner) = scope.upgrade() else {
            break;
        };
        Executor { inner }.handle_live(update).await;
    }
}

/// Empty, zero or false.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Bool(b) => !b,
        other => resolver::is_empty(other),
    }
}
