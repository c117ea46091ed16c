//! RW-009: Query planner: batch many per-instance queries into few fetches.
//!
//! Two phases. Planning: components `register` `(query, owner, filter,
//! pipe)` and get a receiver; nothing runs. Executing: on `execute()` (or
//! after a quiet debounce window in `run_debounced`) registrations that
//! share every filter field except `authors`/`ids`/`limit` are merged into
//! one filter with the union of authors/ids. The merged result is filtered
//! back per registration, newest first, cut to its own limit and piped
//! through its own pipe. Executors sharing a planner go through
//! [`BatchPlanner::fetch`], which schedules the debounced flush itself.
//!
//! [`ProfileBatcher`] does the same for kind-0 profile lookups and keeps a
//! short-lived pubkey → profile cache.

use super::config::EngineOptions;
use super::context::ResolutionContext;
use super::error::{EngineError, TransportError};
use super::pipe;
use super::resolver;
use super::types::{events_to_value, Event, Filter, PipeOp, QuerySpec};
use crate::cache::DataLayer;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

/// One query registered by a component instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub query_id: String,
    pub owner_id: String,
    pub filter: Filter,
    pub pipe: Vec<PipeOp>,
}

/// What a registration receives: its own piped slice, or the error of the
/// batched fetch it rode on.
pub type BatchReply = Result<Value, TransportError>;

/// One planned fetch and the registrations it serves (by index).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchGroup {
    pub filter: Filter,
    pub members: Vec<usize>,
}

/// Summary of one execution phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub queries: usize,
    pub fetches: usize,
    pub failed_fetches: usize,
}

/// Group registrations by shape and merge each group's filter.
///
/// Pure: no I/O. Groups come out in first-registration order.
pub fn plan(registrations: &[Registration]) -> Vec<BatchGroup> {
    let mut groups: Vec<BatchGroup> = Vec::new();
    let mut by_shape: FxHashMap<String, usize> = FxHashMap::default();

    for (index, registration) in registrations.iter().enumerate() {
        let shape = shape_key(&registration.filter);
        match by_shape.get(&shape) {
            Some(&group) => groups[group].members.push(index),
            None => {
                by_shape.insert(shape, groups.len());
                groups.push(BatchGroup {
                    filter: registration.filter.clone(),
                    members: vec![index],
                });
            }
        }
    }

    for group in &mut groups {
        if group.members.len() > 1 {
            group.filter = merge(group.members.iter().map(|&i| &registrations[i].filter));
        }
    }
    groups
}

/// Canonical key with authors/ids reduced to presence markers and no limit.
fn shape_key(filter: &Filter) -> String {
    Filter {
        authors: filter.authors.as_ref().map(|_| Vec::new()),
        ids: filter.ids.as_ref().map(|_| Vec::new()),
        limit: None,
        ..filter.clone()
    }
    .canonical_key()
}

fn merge<'a>(filters: impl Iterator<Item = &'a Filter>) -> Filter {
    let mut merged: Option<Filter> = None;
    let mut authors: BTreeSet<String> = BTreeSet::new();
    let mut ids: BTreeSet<String> = BTreeSet::new();
    for filter in filters {
        authors.extend(filter.authors.iter().flatten().cloned());
        ids.extend(filter.ids.iter().flatten().cloned());
        merged.get_or_insert_with(|| filter.clone());
    }
    let mut merged = merged.unwrap_or_default();
    if merged.authors.is_some() {
        merged.authors = Some(authors.into_iter().collect());
    }
    if merged.ids.is_some() {
        merged.ids = Some(ids.into_iter().collect());
    }
    merged.limit = None;
    merged
}

/// The slice of a merged result that belongs to one registration.
fn distribute(registration: &Registration, events: &[Event]) -> Value {
    let mut own: Vec<Event> = events
        .iter()
        .filter(|e| registration.filter.matches(e))
        .cloned()
        .collect();
    own.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    if let Some(limit) = registration.filter.limit {
        own.truncate(limit);
    }
    pipe::apply(events_to_value(&own), &registration.pipe)
}

struct Waiting {
    registration: Registration,
    reply: oneshot::Sender<BatchReply>,
}

pub struct BatchPlanner {
    layer: Arc<DataLayer>,
    debounce: Duration,
    waiting: Mutex<Vec<Waiting>>,
    registered: Notify,
    scheduled: AtomicBool,
}

impl BatchPlanner {
    pub fn new(layer: Arc<DataLayer>, debounce: Duration) -> Self {
        Self {
            layer,
            debounce,
            waiting: Mutex::new(Vec::new()),
            registered: Notify::new(),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Planner using the configured debounce window.
    pub fn from_options(layer: Arc<DataLayer>, options: &EngineOptions) -> Self {
        Self::new(layer, options.batch_debounce())
    }

    /// Planning phase: queue a query. The receiver yields its piped value
    /// once the batch executes, or the batch's fetch error.
    pub fn register(&self, registration: Registration) -> oneshot::Receiver<BatchReply> {
        let (reply, rx) = oneshot::channel();
        tracing::trace!(query = %registration.query_id, owner = %registration.owner_id, "registered");
        self.waiting.lock().push(Waiting {
            registration,
            reply,
        });
        self.registered.notify_one();
        rx
    }

    /// Resolve a query spec against `context` and register it.
    pub fn register_spec(
        &self,
        query_id: &str,
        owner_id: &str,
        spec: &QuerySpec,
        context: &ResolutionContext,
    ) -> Result<oneshot::Receiver<BatchReply>, EngineError> {
        let map = match resolver::resolve(&spec.filter_value(), context) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let filter = Filter::from_resolved(query_id, &map)?;
        Ok(self.register(Registration {
            query_id: query_id.to_string(),
            owner_id: owner_id.to_string(),
            filter,
            pipe: spec.pipe.clone(),
        }))
    }

    /// Register and wait for the batch carrying this query. The first
    /// caller of a window spawns the debounced flush.
    pub async fn fetch(self: &Arc<Self>, registration: Registration) -> BatchReply {
        let rx = self.register(registration);
        self.schedule();
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let planner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                planner.run_debounced().await;
                planner.scheduled.store(false, Ordering::SeqCst);
                // late registrations whose caller saw the flag still set
                if planner.pending_count() == 0 || planner.scheduled.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        });
    }

    pub fn pending_count(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Execution phase: plan, fetch once per group, fan results out.
    pub async fn execute(&self) -> BatchReport {
        let waiting = std::mem::take(&mut *self.waiting.lock());
        let (registrations, replies): (Vec<Registration>, Vec<oneshot::Sender<BatchReply>>) = waiting
            .into_iter()
            .map(|w| (w.registration, w.reply))
            .unzip();
        let mut replies: Vec<Option<oneshot::Sender<BatchReply>>> =
            replies.into_iter().map(Some).collect();

        let groups = plan(&registrations);
        let mut report = BatchReport {
            queries: registrations.len(),
            fetches: groups.len(),
            failed_fetches: 0,
        };

        for group in &groups {
            let events = self.layer.cache.get_or_fetch(&group.filter).await;
            if let Err(err) = &events {
                tracing::warn!(filter = %group.filter, error = %err, "batched fetch failed");
                report.failed_fetches += 1;
            }
            for &member in &group.members {
                let value = match &events {
                    Ok(events) => Ok(distribute(&registrations[member], events)),
                    Err(err) => Err(err.clone()),
                };
                if let Some(reply) = replies[member].take() {
                    // receiver dropped: the owner went away
                    let _ = reply.send(value);
                }
            }
        }

        tracing::debug!(
            queries = report.queries,
            fetches = report.fetches,
            "batch executed"
        );
        report
    }

    /// Wait until no registration arrives for one debounce window, then
    /// execute.
    pub async fn run_debounced(&self) -> BatchReport {
        while tokio::time::timeout(self.debounce, self.registered.notified())
            .await
            .is_ok()
        {}
        self.execute().await
    }
}

/// Coalesces kind-0 profile lookups issued within one window.
pub struct ProfileBatcher {
    layer: Arc<DataLayer>,
    window: Duration,
    ttl: Duration,
    profiles: Mutex<FxHashMap<String, (Option<Event>, Instant)>>,
    waiting: Mutex<FxHashMap<String, Vec<oneshot::Sender<Option<Event>>>>>,
}

impl ProfileBatcher {
    pub fn new(layer: Arc<DataLayer>, window: Duration, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            layer,
            window,
            ttl,
            profiles: Mutex::new(FxHashMap::default()),
            waiting: Mutex::new(FxHashMap::default()),
        })
    }

    /// Batcher using the configured debounce window and profile TTL.
    pub fn from_options(layer: Arc<DataLayer>, options: &EngineOptions) -> Arc<Self> {
        Self::new(layer, options.batch_debounce(), options.profile_ttl())
    }

    /// Newest profile record of `pubkey`, or `None` if it has none.
    pub async fn resolve(self: &Arc<Self>, pubkey: &str) -> Option<Event> {
        if let Some(profile) = self.cached(pubkey) {
            return profile;
        }
        let (tx, rx) = oneshot::channel();
        let opens_window = {
            let mut waiting = self.waiting.lock();
            let opens = waiting.is_empty();
            waiting.entry(pubkey.to_string()).or_default().push(tx);
            opens
        };
        if opens_window {
            let batcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(batcher.window).await;
                batcher.flush().await;
            });
        }
        rx.await.ok().flatten()
    }

    fn cached(&self, pubkey: &str) -> Option<Option<Event>> {
        let profiles = self.profiles.lock();
        profiles
            .get(pubkey)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(profile, _)| profile.clone())
    }

    /// Fetch every pubkey waiting in the current window. Returns how many.
    pub async fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.waiting.lock());
        if batch.is_empty() {
            return 0;
        }
        let mut authors: Vec<String> = batch.keys().cloned().collect();
        authors.sort();
        let filter = Filter {
            kinds: Some(vec![0]),
            authors: Some(authors),
            ..Default::default()
        };

        let fetched = self.layer.cache.get_or_fetch(&filter).await;
        if let Err(err) = &fetched {
            tracing::warn!(error = %err, "profile batch failed");
        }
        let mut newest: FxHashMap<&str, &Event> = FxHashMap::default();
        for event in fetched.as_deref().unwrap_or_default() {
            let slot = newest.entry(event.pubkey.as_str()).or_insert(event);
            if event.created_at > slot.created_at {
                *slot = event;
            }
        }

        let count = batch.len();
        let now = Instant::now();
        for (pubkey, waiters) in batch {
            let profile = newest.get(pubkey.as_str()).map(|e| (*e).clone());
            if fetched.is_ok() {
                self.profiles
                    .lock()
                    .insert(pubkey.clone(), (profile.clone(), now));
            }
            for waiter in waiters {
                let _ = waiter.send(profile.clone());
            }
        }
        tracing::debug!(pubkeys = count, "profile batch resolved");
        count
    }
}

/// Parsed profile metadata (`content` JSON) with the pubkey folded in.
pub fn profile_metadata(profile: &Event) -> Value {
    let mut metadata = match serde_json::from_str::<Value>(&profile.content) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    metadata.insert("pubkey".to_string(), Value::String(profile.pubkey.clone()));
    Value::Object(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::tests::event;
    use crate::transport::MemoryRelay;
    use serde_json::json;

    fn layer(relay: &MemoryRelay) -> Arc<DataLayer> {
        DataLayer::new(Arc::new(relay.clone()), &EngineOptions::default())
    }

    fn reg(query: &str, filter: Value, pipe: Value) -> Registration {
        Registration {
            query_id: query.to_string(),
            owner_id: format!("owner-{query}"),
            filter: Filter::from_resolved(query, filter.as_object().unwrap()).unwrap(),
            pipe: serde_json::from_value(pipe).unwrap(),
        }
    }

    fn profile(pubkey: &str, created_at: u64, name: &str) -> Event {
        let mut e = event(&format!("{pubkey}-{created_at}"), pubkey, 0, created_at);
        e.content = json!({ "name": name }).to_string();
        e
    }

    #[test]
    fn test_rw009_plan_groups_by_shape() {
        let regs = vec![
            reg("a", json!({"kinds": [0], "authors": ["x"]}), json!([])),
            reg("b", json!({"kinds": [0], "authors": ["y"], "limit": 1}), json!([])),
            reg("c", json!({"kinds": [1], "authors": ["x"]}), json!([])),
            reg("d", json!({"kinds": [0], "authors": ["x"]}), json!([])),
            reg("e", json!({"kinds": [0], "ids": ["i1"]}), json!([])),
        ];
        let groups = plan(&regs);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].members, vec![0, 1, 3]);
        assert_eq!(
            groups[0].filter.authors,
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(groups[0].filter.limit, None);
        assert_eq!(groups[1].members, vec![2]);
        assert_eq!(groups[2].filter.ids, Some(vec!["i1".to_string()]));
    }

    #[test]
    fn test_rw009_single_member_keeps_its_limit() {
        let regs = vec![reg("a", json!({"kinds": [1], "limit": 5}), json!([]))];
        assert_eq!(plan(&regs)[0].filter.limit, Some(5));
    }

    #[test]
    fn test_rw009_distribute_filters_limits_and_pipes() {
        let events = vec![
            event("1", "x", 1, 10),
            event("2", "y", 1, 30),
            event("3", "x", 1, 20),
        ];
        let r = reg(
            "x",
            json!({"kinds": [1], "authors": ["x"], "limit": 1}),
            json!([{"op": "first"}, {"op": "get", "field": "id"}]),
        );
        assert_eq!(distribute(&r, &events), json!("3"));
    }

    #[tokio::test]
    async fn test_rw009_fifty_profiles_one_fetch() {
        let relay = MemoryRelay::with_events((0..50).map(|i| profile(&format!("p{i}"), 1, &format!("n{i}"))));
        let planner = BatchPlanner::new(layer(&relay), Duration::from_millis(5));
        let receivers: Vec<_> = (0..50)
            .map(|i| {
                planner.register(reg(
                    &format!("profile{i}"),
                    json!({"kinds": [0], "authors": [format!("p{i}")]}),
                    json!([]),
                ))
            })
            .collect();
        assert_eq!(planner.pending_count(), 50);

        let report = planner.execute().await;
        assert_eq!(report, BatchReport { queries: 50, fetches: 1, failed_fetches: 0 });
        assert_eq!(relay.fetch_count(), 1);
        assert_eq!(relay.fetch_log()[0].authors.as_ref().unwrap().len(), 50);

        for (i, rx) in receivers.into_iter().enumerate() {
            let value = rx.await.unwrap().unwrap();
            let records = value.as_array().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0]["pubkey"], json!(format!("p{i}")));
        }
        assert_eq!(planner.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rw009_duplicate_authors_deduplicated() {
        let relay = MemoryRelay::new();
        let planner = BatchPlanner::from_options(layer(&relay), &EngineOptions::default());
        for owner in 0..3 {
            planner.register(reg(&format!("q{owner}"), json!({"kinds": [0], "authors": ["same"]}), json!([])));
        }
        planner.execute().await;
        assert_eq!(relay.fetch_log()[0].authors, Some(vec!["same".to_string()]));
    }

    #[tokio::test]
    async fn test_rw009_failed_fetch_reaches_every_member() {
        let relay = MemoryRelay::new();
        relay.set_fail_fetch(true);
        let planner = BatchPlanner::new(layer(&relay), Duration::from_millis(5));
        let rx = planner.register(reg("a", json!({"kinds": [0], "authors": ["x"]}), json!([{"op": "count"}])));
        let report = planner.execute().await;
        assert_eq!(report.failed_fetches, 1);
        assert!(matches!(rx.await.unwrap(), Err(TransportError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_rw009_run_debounced_waits_for_quiet() {
        let relay = MemoryRelay::with_events([profile("a", 1, "A"), profile("b", 1, "B")]);
        let planner = Arc::new(BatchPlanner::new(layer(&relay), Duration::from_millis(40)));

        let late = {
            let planner = Arc::clone(&planner);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                planner.register(reg("b", json!({"kinds": [0], "authors": ["b"]}), json!([])))
            })
        };
        let early = planner.register(reg("a", json!({"kinds": [0], "authors": ["a"]}), json!([])));
        let report = planner.run_debounced().await;
        assert_eq!(report.queries, 2);
        assert_eq!(relay.fetch_count(), 1);
        assert_eq!(early.await.unwrap().unwrap().as_array().unwrap().len(), 1);
        assert_eq!(late.await.unwrap().await.unwrap().unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rw009_fetch_schedules_its_own_flush() {
        let relay = MemoryRelay::with_events([profile("a", 1, "A"), profile("b", 1, "B")]);
        let planner = Arc::new(BatchPlanner::new(layer(&relay), Duration::from_millis(10)));

        let (a, b) = tokio::join!(
            planner.fetch(reg("a", json!({"kinds": [0], "authors": ["a"]}), json!([{"op": "count"}]))),
            planner.fetch(reg("b", json!({"kinds": [0], "authors": ["b"]}), json!([]))),
        );
        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap()[0]["pubkey"], json!("b"));
        assert_eq!(relay.fetch_count(), 1);

        // a later window flushes on its own
        let c = planner
            .fetch(reg("c", json!({"kinds": [0], "authors": ["a"]}), json!([])))
            .await
            .unwrap();
        assert_eq!(c.as_array().unwrap().len(), 1);
        assert_eq!(planner.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rw009_register_spec_resolves_target() {
        let relay = MemoryRelay::with_events([profile("bob", 1, "Bob")]);
        let planner = BatchPlanner::new(layer(&relay), Duration::from_millis(5));
        let spec: QuerySpec = serde_json::from_value(json!({
            "kinds": [0],
            "authors": ["target.pubkey"],
            "pipe": [{"op": "first"}, {"op": "get", "field": "content"}, {"op": "parseJson"}, {"op": "get", "field": "name"}]
        }))
        .unwrap();
        let ctx = ResolutionContext::default().derive_for_target(json!({"pubkey": "bob"}));
        let rx = planner.register_spec("profile", "card-1", &spec, &ctx).unwrap();
        planner.execute().await;
        assert_eq!(rx.await.unwrap().unwrap(), json!("Bob"));

        let err = planner
            .register_spec("profile", "card-2", &spec, &ResolutionContext::default())
            .unwrap_err();
        assert!(err.is_pending());
    }

    #[tokio::test]
    async fn test_rw009_profile_batcher_coalesces_and_caches() {
        let relay = MemoryRelay::with_events([
            profile("a", 1, "old"),
            profile("a", 5, "new"),
            profile("b", 1, "B"),
        ]);
        let batcher = ProfileBatcher::from_options(layer(&relay), &EngineOptions::default());

        let lookups = ["a", "b", "a", "c", "b"].map(|pk| {
            let batcher = Arc::clone(&batcher);
            tokio::spawn(async move { batcher.resolve(pk).await })
        });
        let mut results = Vec::new();
        for lookup in lookups {
            results.push(lookup.await.unwrap());
        }
        assert_eq!(relay.fetch_count(), 1);
        assert_eq!(profile_metadata(results[0].as_ref().unwrap())["name"], json!("new"));
        assert_eq!(results[1].as_ref().unwrap().pubkey, "b");
        assert!(results[3].is_none());

        // served from the profile cache
        assert!(batcher.resolve("b").await.is_some());
        assert!(batcher.resolve("c").await.is_none());
        assert_eq!(relay.fetch_count(), 1);
    }

    #[test]
    fn test_rw009_profile_metadata_tolerates_bad_json() {
        let mut e = event("1", "pk", 0, 1);
        e.content = "not json".into();
        assert_eq!(profile_metadata(&e), json!({"pubkey": "pk"}));
    }
}
