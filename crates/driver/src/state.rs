//! Synchronous core of the change-stream driver.
//!
//! [`DriverState`] owns the published and buffer windows, the pending-fetch
//! set and the phase. Its methods never block: anything that needs I/O is
//! recorded as an [`Effect`] for the owning task to run, and the result comes
//! back through another method call. A mutator that decides the windows can
//! no longer be trusted switches to [`Phase::Querying`] and returns
//! `Err(SwitchedToQuery)`, which every caller propagates with `?` until the
//! handler boundary drops it.

use std::sync::Arc;

use metrics::counter;
use oplive_core::{
    changed_fields, doc_id, ChangeEntry, DocId, Document, EntryOp, FieldDelta, Json, Namespace, QueryDescriptor, UpdatePayload, ID_FIELD,
};
use oplive_selector::{Matcher, Projection, SelectorError, Sorter};
use oplive_store::{ResyncReason, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::heap::{Comparator, IdHeap, MinMaxHeap};
use crate::multiplexer::ResultSink;
use crate::stats::DriverStats;
use crate::{DriverConfig, DriverError, WriteToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Querying,
    Fetching,
    Steady,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Querying => "querying",
            Phase::Fetching => "fetching",
            Phase::Steady => "steady",
        }
    }
}

/// The windows were abandoned in favour of a full re-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchedToQuery;

pub type Step<T = ()> = Result<T, SwitchedToQuery>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeryReason {
    Gap,
    Failover,
    Drop,
    InvariantBreach,
    FetchError,
    Requested,
}

impl RequeryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RequeryReason::Gap => "gap",
            RequeryReason::Failover => "failover",
            RequeryReason::Drop => "drop",
            RequeryReason::InvariantBreach => "invariant_breach",
            RequeryReason::FetchError => "fetch_error",
            RequeryReason::Requested => "requested",
        }
    }
}

/// Work the owning task must perform on the state's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Run the full query; `initial` failures are terminal, others retry.
    RunQuery { generation: u64, initial: bool },
    /// Report back once the tailer has dispatched everything appended so far.
    AwaitCaughtUp { generation: u64 },
    /// Start the next fetch round on a later turn.
    FetchRound,
    Fetch { generation: u64, id: DocId, ts: u64 },
}

/// Point-in-time copy of the windows, sorted under the query order.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub phase: Phase,
    pub generation: u64,
    pub published: Vec<Document>,
    pub buffer: Vec<Document>,
    pub safe_append_to_buffer: bool,
    pub pending_fetch: usize,
    pub stopped: bool,
}

impl WindowSnapshot {
    pub fn empty() -> Self {
        Self {
            phase: Phase::Querying,
            generation: 0,
            published: Vec::new(),
            buffer: Vec::new(),
            safe_append_to_buffer: false,
            pending_fetch: 0,
            stopped: false,
        }
    }

    pub fn published_ids(&self) -> Vec<&str> { self.published.iter().filter_map(doc_id).collect() }
    pub fn buffer_ids(&self) -> Vec<&str> { self.buffer.iter().filter_map(doc_id).collect() }
}

/// Compiled form of a query descriptor.
pub struct QueryPlan {
    pub ns: Namespace,
    pub matcher: Matcher,
    pub sorter: Sorter,
    /// What observers see.
    pub client: Projection,
    /// What the windows keep: client fields plus everything the selector and
    /// sort read.
    pub shared: Projection,
    pub limit: Option<usize>,
}

impl QueryPlan {
    pub fn compile(db: &str, desc: &QueryDescriptor) -> Result<Self, SelectorError> {
        let matcher = Matcher::compile(&desc.selector)?;
        let sorter = Sorter::compile(desc.sort.as_deref())?;
        let client = Projection::compile(desc.fields.as_ref())?;
        let shared = client.with_required(matcher.paths().iter().chain(sorter.paths()));
        Ok(Self { ns: Namespace::new(db, desc.collection.clone()), matcher, sorter, client, shared, limit: desc.effective_limit() })
    }
}

pub struct DriverState {
    plan: QueryPlan,
    cmp: Comparator,
    sink: Arc<dyn ResultSink>,
    stats: Arc<DriverStats>,
    strict: bool,

    phase: Phase,
    published: IdHeap,
    buffer: MinMaxHeap,
    safe_append_to_buffer: bool,
    need_to_fetch: FxHashMap<DocId, u64>,
    currently_fetching: FxHashMap<DocId, u64>,
    fetch_generation: u64,
    requery_when_done: bool,
    initial_done: bool,
    stopped: bool,
    writes_when_steady: Vec<WriteToken>,
    effects: Vec<Effect>,
}

impl DriverState {
    pub fn new(plan: QueryPlan, sink: Arc<dyn ResultSink>, stats: Arc<DriverStats>, cfg: &DriverConfig) -> Self {
        let sorter = plan.sorter.clone();
        let cmp: Comparator = Arc::new(move |a, b| sorter.compare(a, b));
        Self {
            published: IdHeap::new(Arc::clone(&cmp)),
            buffer: MinMaxHeap::new(Arc::clone(&cmp)),
            cmp,
            plan,
            sink,
            stats,
            strict: cfg.strict_invariants,
            phase: Phase::Querying,
            safe_append_to_buffer: false,
            need_to_fetch: FxHashMap::default(),
            currently_fetching: FxHashMap::default(),
            fetch_generation: 0,
            requery_when_done: false,
            initial_done: false,
            stopped: false,
            writes_when_steady: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Kick off the initial query.
    pub fn start(&mut self) {
        self.effects.push(Effect::RunQuery { generation: self.fetch_generation, initial: true });
    }

    pub fn take_effects(&mut self) -> Vec<Effect> { std::mem::take(&mut self.effects) }
    pub fn phase(&self) -> Phase { self.phase }
    pub fn generation(&self) -> u64 { self.fetch_generation }
    pub fn is_stopped(&self) -> bool { self.stopped }
    pub fn limit(&self) -> Option<usize> { self.plan.limit }
    pub fn namespace(&self) -> &Namespace { &self.plan.ns }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            phase: self.phase,
            generation: self.fetch_generation,
            published: self.published.sorted(),
            buffer: self.buffer.sorted(),
            safe_append_to_buffer: self.safe_append_to_buffer,
            pending_fetch: self.need_to_fetch.len(),
            stopped: self.stopped,
        }
    }

    /// Tear down: commit every queued write so no fence waits on us.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for w in self.writes_when_steady.drain(..) {
            w.committed();
        }
        self.effects.clear();
    }

    // ----- handler boundaries -----

    pub fn on_resync(&mut self, reason: ResyncReason) {
        if self.stopped {
            return;
        }
        let reason = match reason {
            ResyncReason::Gap => RequeryReason::Gap,
            ResyncReason::Failover => RequeryReason::Failover,
        };
        info!(ns = %self.plan.ns, reason = reason.as_str(), "change stream resync");
        let _ = self.need_to_poll_query(reason);
    }

    pub fn on_entry(&mut self, entry: &ChangeEntry) {
        if self.stopped {
            return;
        }
        self.stats.entry();
        counter!("driver_entries_total", 1u64, "op" => entry.op.kind().to_owned());
        match &entry.op {
            EntryOp::Other { kind } => {
                return self.fail(DriverError::UnknownOperation(kind.clone()));
            }
            EntryOp::Command { .. } => {
                if entry.drops(&self.plan.ns) {
                    info!(ns = %self.plan.ns, ts = entry.ts, "collection dropped; re-querying");
                    let _ = self.need_to_poll_query(RequeryReason::Drop);
                }
                return;
            }
            op if op.id().is_none() => {
                return self.fail(DriverError::MalformedEntry(format!("{} at ts {} has no _id", op.kind(), entry.ts)));
            }
            _ => {}
        }
        let _ = if self.phase == Phase::Querying {
            self.record_while_querying(entry);
            Ok(())
        } else {
            self.apply_entry(entry)
        };
    }

    pub fn on_query_done(&mut self, generation: u64, result: Result<Vec<Document>, StoreError>) {
        if self.stopped || generation != self.fetch_generation || self.phase != Phase::Querying {
            trace!(generation, current = self.fetch_generation, "stale query result dropped");
            return;
        }
        let docs = match result {
            Ok(docs) => docs,
            Err(e) if !self.initial_done => {
                return self.fail(DriverError::InitialQuery(e));
            }
            Err(e) => {
                warn!(ns = %self.plan.ns, error = %e, "re-query failed; retrying");
                self.effects.push(Effect::RunQuery { generation, initial: false });
                return;
            }
        };
        self.stats.query();
        let (results, buffered) = match self.plan.limit {
            Some(limit) => {
                let mut docs = docs;
                let rest = docs.split_off(limit.min(docs.len()));
                (docs, rest)
            }
            None => (docs, Vec::new()),
        };
        let _ = self.publish_new_results(results, buffered);
        if !self.initial_done {
            self.initial_done = true;
            self.sink.ready();
        }
        self.effects.push(Effect::AwaitCaughtUp { generation: self.fetch_generation });
    }

    /// The tailer has dispatched every entry appended before the query ended.
    pub fn on_caught_up(&mut self, generation: u64) {
        if self.stopped || generation != self.fetch_generation || self.phase != Phase::Querying {
            return;
        }
        if self.requery_when_done {
            self.requery_when_done = false;
            self.poll_query(RequeryReason::Requested);
        } else if self.need_to_fetch.is_empty() {
            self.be_steady();
        } else {
            self.fetch_modified_documents();
        }
    }

    pub fn on_fetch_round(&mut self) {
        if self.stopped || self.phase != Phase::Fetching || !self.currently_fetching.is_empty() {
            return;
        }
        if self.need_to_fetch.is_empty() {
            self.be_steady();
            return;
        }
        self.fetch_generation += 1;
        self.currently_fetching = std::mem::take(&mut self.need_to_fetch);
        debug!(ns = %self.plan.ns, generation = self.fetch_generation, ids = self.currently_fetching.len(), "fetch round");
        for (id, ts) in self.currently_fetching.iter() {
            self.stats.fetch();
            counter!("driver_fetches_total", 1u64);
            self.effects.push(Effect::Fetch { generation: self.fetch_generation, id: id.clone(), ts: *ts });
        }
    }

    pub fn on_fetch_done(&mut self, generation: u64, id: &str, result: Result<Option<Document>, StoreError>) {
        if self.stopped || generation != self.fetch_generation {
            trace!(id, generation, "stale fetch dropped");
            return;
        }
        self.currently_fetching.remove(id);
        match result {
            Err(e) => {
                warn!(ns = %self.plan.ns, id, error = %e, "fetch failed; re-querying");
                if self.phase != Phase::Querying {
                    let _ = self.need_to_poll_query(RequeryReason::FetchError);
                }
            }
            Ok(doc) => {
                if self.phase == Phase::Fetching {
                    let _ = self.handle_doc(id, doc);
                }
            }
        }
        if self.phase == Phase::Fetching && generation == self.fetch_generation && self.currently_fetching.is_empty() {
            if self.need_to_fetch.is_empty() {
                self.be_steady();
            } else {
                self.effects.push(Effect::FetchRound);
            }
        }
    }

    /// Release `token` once everything processed so far reaches observers.
    pub fn commit_when_steady(&mut self, token: WriteToken) {
        if self.stopped {
            token.committed();
        } else if self.phase == Phase::Steady {
            self.sink.on_flush(Box::new(move || token.committed()));
        } else {
            self.writes_when_steady.push(token);
        }
    }

    // ----- phase transitions -----

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(ns = %self.plan.ns, from = self.phase.as_str(), to = phase.as_str(), "phase change");
            self.stats.phase_change();
        }
        self.phase = phase;
    }

    fn be_steady(&mut self) {
        self.set_phase(Phase::Steady);
        let writes = std::mem::take(&mut self.writes_when_steady);
        if !writes.is_empty() {
            self.sink.on_flush(Box::new(move || writes.into_iter().for_each(WriteToken::committed)));
        }
    }

    fn fetch_modified_documents(&mut self) {
        self.set_phase(Phase::Fetching);
        self.effects.push(Effect::FetchRound);
    }

    fn need_to_poll_query(&mut self, reason: RequeryReason) -> Step {
        if self.stopped {
            return Ok(());
        }
        if self.phase != Phase::Querying {
            self.poll_query(reason);
            return Err(SwitchedToQuery);
        }
        self.requery_when_done = true;
        Ok(())
    }

    fn poll_query(&mut self, reason: RequeryReason) {
        self.fetch_generation += 1;
        self.need_to_fetch.clear();
        self.currently_fetching.clear();
        self.set_phase(Phase::Querying);
        self.stats.requery();
        counter!("driver_requeries_total", 1u64, "reason" => reason.as_str());
        info!(ns = %self.plan.ns, reason = reason.as_str(), generation = self.fetch_generation, "re-querying");
        self.effects.push(Effect::RunQuery { generation: self.fetch_generation, initial: false });
    }

    fn breach(&mut self, what: &str) -> Step {
        self.stats.invariant_breach();
        counter!("driver_invariant_breaches_total", 1u64);
        error!(ns = %self.plan.ns, phase = self.phase.as_str(), "invariant breach: {}", what);
        if self.strict {
            panic!("live query invariant breach on {}: {}", self.plan.ns, what);
        }
        self.need_to_poll_query(RequeryReason::InvariantBreach)?;
        Err(SwitchedToQuery)
    }

    fn fail(&mut self, err: DriverError) {
        error!(ns = %self.plan.ns, error = %err, "live query stopped");
        self.sink.query_error(err.to_string());
        self.stop();
    }

    // ----- change entries -----

    fn record_while_querying(&mut self, entry: &ChangeEntry) {
        if let Some(id) = entry.op.id() {
            self.need_to_fetch.insert(id.to_string(), entry.ts);
        }
    }

    fn need_fetch(&mut self, id: &str, ts: u64) {
        self.need_to_fetch.insert(id.to_string(), ts);
        if self.phase == Phase::Steady {
            self.fetch_modified_documents();
        }
    }

    fn is_cached(&self, id: &str) -> bool {
        self.published.has(id) || (self.plan.limit.is_some() && self.buffer.has(id))
    }

    fn apply_entry(&mut self, entry: &ChangeEntry) -> Step {
        let Some(id) = entry.op.id() else { return Ok(()); };
        if self.phase == Phase::Fetching && (self.currently_fetching.contains_key(id) || self.need_to_fetch.contains_key(id)) {
            self.need_to_fetch.insert(id.to_string(), entry.ts);
            return Ok(());
        }
        match &entry.op {
            EntryOp::Delete { .. } => {
                if self.is_cached(id) {
                    self.remove_matching(id)?;
                }
                Ok(())
            }
            EntryOp::Insert { doc } => {
                if self.published.has(id) {
                    return self.breach("insert for an id already published");
                }
                if self.plan.limit.is_some() && self.buffer.has(id) {
                    return self.breach("insert for an id already buffered");
                }
                if self.plan.matcher.matches(doc).matched {
                    self.add_matching(doc.clone())?;
                }
                Ok(())
            }
            EntryOp::Update { payload: UpdatePayload::Replace(doc), .. } => {
                let mut doc = doc.clone();
                doc.insert(ID_FIELD.to_string(), Json::String(id.to_string()));
                self.handle_doc(id, Some(doc))
            }
            EntryOp::Update { payload: UpdatePayload::Modifier(modifier), .. } => self.apply_modifier(id, entry.ts, modifier),
            EntryOp::Command { .. } | EntryOp::Other { .. } => Ok(()),
        }
    }

    fn apply_modifier(&mut self, id: &str, ts: u64, modifier: &Json) -> Step {
        let delta = match FieldDelta::from_modifier(modifier) {
            Ok(d) if d.touches_opaque() => None,
            Ok(d) => Some(d),
            Err(e) => {
                warn!(ns = %self.plan.ns, id, error = %e, "unsupported update encoding; fetching");
                None
            }
        };
        let Some(delta) = delta else {
            self.need_fetch(id, ts);
            return Ok(());
        };
        let cached = self.published.get(id).or_else(|| self.buffer.get(id)).cloned();
        if let Some(mut doc) = cached {
            doc.insert(ID_FIELD.to_string(), Json::String(id.to_string()));
            return match delta.apply_to(&mut doc) {
                Ok(()) => {
                    self.stats.direct_patch();
                    counter!("driver_direct_patches_total", 1u64);
                    let doc = self.plan.shared.apply(&doc);
                    self.handle_doc(id, Some(doc))
                }
                Err(e) => {
                    debug!(ns = %self.plan.ns, id, error = %e, "in-place update failed; fetching");
                    self.need_fetch(id, ts);
                    Ok(())
                }
            };
        }
        if self.plan.matcher.can_become_match_by_delta(&delta) || self.plan.sorter.affected_by_delta(&delta) {
            self.need_fetch(id, ts);
        }
        Ok(())
    }

    // ----- window management -----

    fn client_fields(&self, doc: &Document) -> Document {
        let mut fields = self.plan.client.apply(doc);
        fields.remove(ID_FIELD);
        fields
    }

    fn cmp(&self, a: &Document, b: &Document) -> std::cmp::Ordering { (self.cmp)(a, b) }

    fn add_published(&mut self, id: &str, doc: Document) -> Step {
        let doc = self.plan.shared.apply(&doc);
        self.sink.added(id, self.client_fields(&doc));
        self.published.set(id.to_string(), doc);
        let Some(limit) = self.plan.limit else { return Ok(()); };
        if self.published.len() > limit {
            let Some(over_id) = self.published.max_id().cloned() else { return Ok(()); };
            if over_id == id {
                return self.breach("the document just published is the worst published");
            }
            if let Some(over_doc) = self.published.remove(&over_id) {
                self.sink.removed(&over_id);
                self.add_buffered(&over_id, over_doc);
            }
        }
        Ok(())
    }

    fn remove_published(&mut self, id: &str) -> Step {
        self.published.remove(id);
        self.sink.removed(id);
        let Some(limit) = self.plan.limit else { return Ok(()); };
        if self.published.len() == limit {
            return Ok(());
        }
        if self.published.len() > limit {
            return self.breach("published window over limit");
        }
        if let Some(next_id) = self.buffer.min_id().cloned() {
            if let Some(next_doc) = self.buffer.remove(&next_id) {
                self.remove_buffered_bookkeeping()?;
                return self.add_published(&next_id, next_doc);
            }
        }
        if self.phase == Phase::Querying || self.safe_append_to_buffer {
            return Ok(());
        }
        // Unseen matches may exist beyond the windows.
        self.need_to_poll_query(RequeryReason::Requested)
    }

    fn change_published(&mut self, id: &str, old_doc: &Document, new_doc: Document) {
        let new_doc = self.plan.shared.apply(&new_doc);
        let diff = changed_fields(&self.client_fields(&new_doc), &self.client_fields(old_doc));
        self.published.set(id.to_string(), new_doc);
        if !diff.is_empty() {
            self.sink.changed(id, diff);
        }
    }

    fn add_buffered(&mut self, id: &str, doc: Document) {
        let doc = self.plan.shared.apply(&doc);
        self.buffer.set(id.to_string(), doc);
        let Some(limit) = self.plan.limit else { return; };
        if self.buffer.len() > limit {
            if let Some(worst) = self.buffer.max_id().cloned() {
                self.buffer.remove(&worst);
            }
            self.safe_append_to_buffer = false;
        }
    }

    fn remove_buffered(&mut self, id: &str) -> Step {
        self.buffer.remove(id);
        self.remove_buffered_bookkeeping()
    }

    fn remove_buffered_bookkeeping(&mut self) -> Step {
        if self.buffer.is_empty() && !self.safe_append_to_buffer {
            return self.need_to_poll_query(RequeryReason::Requested);
        }
        Ok(())
    }

    fn add_matching(&mut self, doc: Document) -> Step {
        let Some(id) = doc_id(&doc).map(str::to_string) else {
            return self.breach("matching document without _id");
        };
        if self.published.has(&id) {
            return self.breach("adding an id that is already published");
        }
        if self.plan.limit.is_some() && self.buffer.has(&id) {
            return self.breach("adding an id that is already buffered");
        }
        let Some(limit) = self.plan.limit else {
            return self.add_published(&id, doc);
        };
        let max_published = self.published.max_id().and_then(|m| self.published.get(m));
        let max_buffered = self.buffer.max_id().and_then(|m| self.buffer.get(m));
        let to_publish = self.published.len() < limit
            || max_published.map_or(true, |m| self.cmp(&doc, m).is_lt());
        let can_append = !to_publish && self.safe_append_to_buffer && self.buffer.len() < limit;
        let can_insert = !to_publish && max_buffered.map_or(false, |m| self.cmp(&doc, m).is_le());
        if to_publish {
            self.add_published(&id, doc)
        } else if can_append || can_insert {
            self.add_buffered(&id, doc);
            Ok(())
        } else {
            self.safe_append_to_buffer = false;
            Ok(())
        }
    }

    fn remove_matching(&mut self, id: &str) -> Step {
        if self.published.has(id) {
            self.remove_published(id)
        } else if self.plan.limit.is_some() && self.buffer.has(id) {
            self.remove_buffered(id)
        } else if self.plan.limit.is_none() {
            self.breach("removing an id that is not cached")
        } else {
            Ok(())
        }
    }

    /// Reconcile `id` with its current version (`None` when deleted).
    fn handle_doc(&mut self, id: &str, new_doc: Option<Document>) -> Step {
        let matches_now = new_doc.as_ref().map_or(false, |d| self.plan.matcher.matches(d).matched);
        let published_before = self.published.has(id);
        let buffered_before = self.plan.limit.is_some() && self.buffer.has(id);
        let cached_before = published_before || buffered_before;

        let new_doc = match new_doc {
            Some(doc) if matches_now => doc,
            _ => {
                if cached_before {
                    self.remove_matching(id)?;
                }
                return Ok(());
            }
        };
        if !cached_before {
            return self.add_matching(new_doc);
        }

        let new_doc = self.plan.shared.apply(&new_doc);
        let min_buffered = self.buffer.min_id().and_then(|m| self.buffer.get(m)).cloned();

        if published_before {
            let Some(old_doc) = self.published.get(id).cloned() else { return Ok(()); };
            let stays = self.plan.limit.is_none()
                || min_buffered.as_ref().map_or(true, |m| self.cmp(&new_doc, m).is_le());
            if stays {
                self.change_published(id, &old_doc, new_doc);
                return Ok(());
            }
            // Moves past the best buffered document.
            self.remove_published(id)?;
            let max_buffered = self.buffer.max_id().and_then(|m| self.buffer.get(m));
            let to_buffer = self.safe_append_to_buffer || max_buffered.map_or(false, |m| self.cmp(&new_doc, m).is_le());
            if to_buffer {
                self.add_buffered(id, new_doc);
            } else {
                self.safe_append_to_buffer = false;
            }
            return Ok(());
        }

        // Buffered before.
        self.buffer.remove(id);
        let max_published = self.published.max_id().and_then(|m| self.published.get(m));
        let to_publish = max_published.map_or(true, |m| self.cmp(&new_doc, m).is_lt());
        if to_publish {
            return self.add_published(id, new_doc);
        }
        let max_buffered = self.buffer.max_id().and_then(|m| self.buffer.get(m));
        let to_buffer = self.safe_append_to_buffer || max_buffered.map_or(false, |m| self.cmp(&new_doc, m).is_le());
        if to_buffer {
            self.buffer.set(id.to_string(), new_doc);
            return Ok(());
        }
        self.safe_append_to_buffer = false;
        if self.buffer.is_empty() {
            return self.need_to_poll_query(RequeryReason::Requested);
        }
        Ok(())
    }

    fn publish_new_results(&mut self, results: Vec<Document>, buffered: Vec<Document>) -> Step {
        if self.plan.limit.is_some() {
            self.buffer.clear();
        }
        let fresh: FxHashSet<DocId> = results.iter().filter_map(doc_id).map(str::to_string).collect();
        for id in self.published.ids() {
            if !fresh.contains(&id) {
                self.remove_published(&id)?;
            }
        }
        let fresh_len = results.len();
        for doc in results {
            let Some(id) = doc_id(&doc).map(str::to_string) else {
                warn!(ns = %self.plan.ns, "query returned a document without a string _id");
                continue;
            };
            self.handle_doc(&id, Some(doc))?;
        }
        if fresh_len != self.published.len() {
            counter!("driver_invariant_breaches_total", 1u64);
            error!(
                ns = %self.plan.ns,
                fresh = fresh_len,
                published = self.published.len(),
                "store and selector disagree on how many documents match",
            );
        }
        if let Some(stray) = self.published.ids().into_iter().find(|id| !fresh.contains(id)) {
            return self.breach(&format!("published holds {} which the fresh result does not", stray));
        }
        let buffered_len = buffered.len();
        for doc in buffered {
            if let Some(id) = doc_id(&doc).map(str::to_string) {
                self.add_buffered(&id, doc);
            }
        }
        self.safe_append_to_buffer = match self.plan.limit {
            Some(limit) => buffered_len < limit,
            None => true,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    use oplive_core::{ChangedFields, Command, SortOrder};
    use serde_json::json;

    use crate::WriteFence;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Added(String, Document),
        Changed(String, ChangedFields),
        Removed(String),
        Ready,
        Error(String),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Ev>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Ev> { std::mem::take(&mut *self.events.lock().unwrap()) }
        fn push(&self, ev: Ev) { self.events.lock().unwrap().push(ev); }
    }

    impl ResultSink for Recorder {
        fn added(&self, id: &str, fields: Document) { self.push(Ev::Added(id.into(), fields)); }
        fn changed(&self, id: &str, fields: ChangedFields) { self.push(Ev::Changed(id.into(), fields)); }
        fn removed(&self, id: &str) { self.push(Ev::Removed(id.into())); }
        fn ready(&self) { self.push(Ev::Ready); }
        fn query_error(&self, message: String) { self.push(Ev::Error(message)); }
        fn on_flush(&self, f: Box<dyn FnOnce() + Send>) { f(); }
    }

    fn doc(v: Json) -> Document { v.as_object().cloned().unwrap() }

    fn by_a(limit: Option<usize>) -> QueryDescriptor {
        let mut q = QueryDescriptor::new("items", json!({})).sort_by("a", SortOrder::Asc);
        q.limit = limit;
        q
    }

    fn setup(desc: &QueryDescriptor) -> (DriverState, Arc<Recorder>) {
        let plan = QueryPlan::compile("db", desc).unwrap();
        let rec = Arc::new(Recorder::default());
        let mut st = DriverState::new(plan, rec.clone(), Arc::new(DriverStats::default()), &DriverConfig::default());
        st.start();
        (st, rec)
    }

    fn entry(ts: u64, op: EntryOp) -> ChangeEntry {
        ChangeEntry { ts, ns: Namespace::new("db", "items"), op }
    }

    fn insert(ts: u64, d: Json) -> ChangeEntry { entry(ts, EntryOp::Insert { doc: doc(d) }) }

    fn modify(ts: u64, id: &str, m: Json) -> ChangeEntry {
        entry(ts, EntryOp::Update { id: id.into(), payload: UpdatePayload::Modifier(m) })
    }

    fn delete(ts: u64, id: &str) -> ChangeEntry { entry(ts, EntryOp::Delete { id: id.into() }) }

    /// Answer effects from `model` until the state goes quiet.
    fn drive(st: &mut DriverState, desc: &QueryDescriptor, model: &BTreeMap<String, Document>) {
        let mut queue: VecDeque<Effect> = st.take_effects().into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::RunQuery { generation, .. } => st.on_query_done(generation, Ok(run_query(desc, model))),
                Effect::AwaitCaughtUp { generation } => st.on_caught_up(generation),
                Effect::FetchRound => st.on_fetch_round(),
                Effect::Fetch { generation, id, .. } => st.on_fetch_done(generation, &id, Ok(model.get(&id).cloned())),
            }
            queue.extend(st.take_effects());
        }
    }

    fn run_query(desc: &QueryDescriptor, model: &BTreeMap<String, Document>) -> Vec<Document> {
        let matcher = Matcher::compile(&desc.selector).unwrap();
        let sorter = Sorter::compile(desc.sort.as_deref()).unwrap();
        let mut docs: Vec<Document> = model.values().filter(|d| matcher.matches(d).matched).cloned().collect();
        docs.sort_by(|a, b| sorter.compare(a, b));
        docs.truncate(desc.effective_limit().map_or(usize::MAX, |l| l * 2));
        docs
    }

    fn ids(docs: &[Document]) -> Vec<String> {
        docs.iter().filter_map(doc_id).map(str::to_string).collect()
    }

    #[test]
    fn initial_query_fills_windows_and_marks_ready() {
        let desc = by_a(Some(2));
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("p", 1), ("q", 2), ("r", 3)]
            .into_iter()
            .map(|(id, a)| (id.to_string(), doc(json!({"_id": id, "a": a}))))
            .collect();
        drive(&mut st, &desc, &model);
        let snap = st.snapshot();
        assert_eq!(snap.phase, Phase::Steady);
        assert_eq!(snap.published_ids(), vec!["p", "q"]);
        assert_eq!(snap.buffer_ids(), vec!["r"]);
        assert!(snap.safe_append_to_buffer);
        let evs = rec.take();
        assert_eq!(evs.last(), Some(&Ev::Ready));
        assert_eq!(evs.iter().filter(|e| matches!(e, Ev::Added(..))).count(), 2);
    }

    #[test]
    fn limit_two_inserts_keep_a_full_lookahead() {
        let desc = by_a(Some(2));
        let (mut st, rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());
        rec.take();

        for (ts, (id, a)) in [("p", 5), ("q", 3), ("r", 9), ("s", 1)].into_iter().enumerate() {
            st.on_entry(&insert(ts as u64 + 1, json!({"_id": id, "a": a})));
        }
        assert!(st.take_effects().is_empty());
        let snap = st.snapshot();
        assert_eq!(snap.published_ids(), vec!["s", "q"]);
        assert_eq!(snap.buffer_ids(), vec!["p", "r"]);
        assert!(snap.safe_append_to_buffer);
        assert_eq!(
            rec.take(),
            vec![
                Ev::Added("p".into(), doc(json!({"a": 5}))),
                Ev::Added("q".into(), doc(json!({"a": 3}))),
                Ev::Added("s".into(), doc(json!({"a": 1}))),
                Ev::Removed("p".into()),
            ]
        );

        // Overflowing the buffer evicts its worst entry and loses completeness.
        st.on_entry(&insert(5, json!({"_id": "t", "a": 7})));
        let snap = st.snapshot();
        assert_eq!(snap.buffer_ids(), vec!["p", "t"]);
        assert!(!snap.safe_append_to_buffer);
        assert!(rec.take().is_empty());
    }

    #[test]
    fn limit_two_after_a_full_page_drops_inserts_beyond_the_buffer() {
        let desc = by_a(Some(2));
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("s", 1), ("q", 3), ("p", 5), ("t", 6)]
            .into_iter()
            .map(|(id, a)| (id.to_string(), doc(json!({"_id": id, "a": a}))))
            .collect();
        drive(&mut st, &desc, &model);
        let snap = st.snapshot();
        assert_eq!(snap.published_ids(), vec!["s", "q"]);
        assert_eq!(snap.buffer_ids(), vec!["p", "t"]);
        assert!(!snap.safe_append_to_buffer);
        rec.take();

        st.on_entry(&delete(1, "t"));
        st.on_entry(&insert(2, json!({"_id": "r", "a": 9})));
        assert!(st.take_effects().is_empty());
        let snap = st.snapshot();
        assert_eq!(snap.phase, Phase::Steady);
        assert_eq!(snap.published_ids(), vec!["s", "q"]);
        assert_eq!(snap.buffer_ids(), vec!["p"]);
        assert!(!snap.safe_append_to_buffer);
        assert!(rec.take().is_empty());
    }

    #[test]
    fn limit_zero_means_unlimited() {
        let desc = by_a(Some(0));
        let (mut st, rec) = setup(&desc);
        assert_eq!(st.limit(), None);
        drive(&mut st, &desc, &BTreeMap::new());
        assert_eq!(rec.take(), vec![Ev::Ready]);

        st.on_entry(&insert(1, json!({"_id": "x", "a": 1})));
        st.on_entry(&insert(2, json!({"_id": "y", "a": 2})));
        assert!(st.take_effects().is_empty());
        assert_eq!(st.phase(), Phase::Steady);
        assert_eq!(st.snapshot().published_ids(), vec!["x", "y"]);
        assert_eq!(st.stats.snapshot().invariant_breaches, 0);
        assert_eq!(st.stats.snapshot().requeries, 0);
        assert_eq!(
            rec.take(),
            vec![Ev::Added("x".into(), doc(json!({"a": 1}))), Ev::Added("y".into(), doc(json!({"a": 2})))]
        );
    }

    #[test]
    fn deleting_a_published_doc_promotes_from_buffer() {
        let desc = by_a(Some(2));
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("p", 1), ("q", 2), ("r", 3)]
            .into_iter()
            .map(|(id, a)| (id.to_string(), doc(json!({"_id": id, "a": a}))))
            .collect();
        drive(&mut st, &desc, &model);
        rec.take();

        st.on_entry(&delete(10, "p"));
        assert!(st.take_effects().is_empty(), "no re-query");
        assert_eq!(rec.take(), vec![Ev::Removed("p".into()), Ev::Added("r".into(), doc(json!({"a": 3})))]);
        assert_eq!(st.snapshot().published_ids(), vec!["q", "r"]);
        assert!(st.snapshot().buffer.is_empty());
    }

    #[test]
    fn emptying_an_incomplete_buffer_forces_a_requery() {
        let desc = by_a(Some(1));
        let (mut st, _rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("p", 1), ("q", 2), ("r", 3)]
            .into_iter()
            .map(|(id, a)| (id.to_string(), doc(json!({"_id": id, "a": a}))))
            .collect();
        drive(&mut st, &desc, &model);
        // Query fetched 2 of 3 matches: buffer is full, so not known complete.
        assert!(!st.snapshot().safe_append_to_buffer);

        st.on_entry(&delete(10, "q"));
        assert_eq!(st.phase(), Phase::Querying);
        assert!(matches!(st.take_effects().as_slice(), [Effect::RunQuery { initial: false, .. }]));
    }

    #[test]
    fn field_update_outside_selector_and_sort_is_patched_in_place() {
        let desc = QueryDescriptor::new("items", json!({"a": {"$gt": 0}}));
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("x".to_string(), doc(json!({"_id": "x", "a": 1, "b": 1})))].into_iter().collect();
        drive(&mut st, &desc, &model);
        rec.take();

        st.on_entry(&modify(5, "x", json!({"$v": 2, "diff": {"u": {"b": 2}}})));
        assert!(st.take_effects().is_empty());
        assert_eq!(st.phase(), Phase::Steady);
        let mut expect = ChangedFields::new();
        expect.insert("b".into(), Some(json!(2)));
        assert_eq!(rec.take(), vec![Ev::Changed("x".into(), expect)]);
        assert_eq!(st.stats.snapshot().direct_patches, 1);
        assert_eq!(st.stats.snapshot().fetches, 0);

        // Same value again: patched, but nothing to report.
        st.on_entry(&modify(6, "x", json!({"$set": {"b": 2}})));
        assert!(rec.take().is_empty());
    }

    /// Update cached doc `x` with `m`; the state must skip the in-place patch
    /// and fetch, then reconcile to `stored`, the store's copy after the write.
    fn assert_fetched_not_patched(m: Json, stored: Json, expect: Vec<Ev>) {
        let desc = QueryDescriptor::new("items", json!({"a": {"$gt": 0}}));
        let (mut st, rec) = setup(&desc);
        let before = doc(json!({"_id": "x", "a": 1, "n": 5, "tags": [1, 2]}));
        let mut model: BTreeMap<_, _> = [("x".to_string(), before)].into_iter().collect();
        drive(&mut st, &desc, &model);
        rec.take();

        st.on_entry(&modify(5, "x", m.clone()));
        assert_eq!(st.take_effects(), vec![Effect::FetchRound], "{}", m);
        assert_eq!(st.phase(), Phase::Fetching, "{}", m);
        assert_eq!(st.stats.snapshot().direct_patches, 0, "{}", m);
        assert!(rec.take().is_empty(), "{}", m);

        st.on_fetch_round();
        model.insert("x".to_string(), doc(stored.clone()));
        drive(&mut st, &desc, &model);
        let snap = st.snapshot();
        assert_eq!(snap.phase, Phase::Steady, "{}", m);
        assert_eq!(snap.published, vec![doc(stored)], "{}", m);
        assert_eq!(st.stats.snapshot().direct_patches, 0, "{}", m);
        assert_eq!(rec.take(), expect, "{}", m);
    }

    fn changed(field: &str, v: Json) -> Vec<Ev> {
        let mut fields = ChangedFields::new();
        fields.insert(field.into(), Some(v));
        vec![Ev::Changed("x".into(), fields)]
    }

    #[test]
    fn opaque_values_and_keys_are_fetched_not_patched() {
        assert_fetched_not_patched(
            json!({"$set": {"when": {"$date": 5}}}),
            json!({"_id": "x", "a": 1, "n": 5, "tags": [1, 2], "when": {"$date": 5}}),
            changed("when", json!({"$date": 5})),
        );
        assert_fetched_not_patched(
            json!({"$set": {"meta.EJSON$type": "oid"}}),
            json!({"_id": "x", "a": 1, "n": 5, "tags": [1, 2], "meta": {"EJSON$type": "oid"}}),
            changed("meta", json!({"EJSON$type": "oid"})),
        );
    }

    #[test]
    fn modifiers_without_a_field_delta_are_fetched_not_patched() {
        assert_fetched_not_patched(
            json!({"$inc": {"n": 1}}),
            json!({"_id": "x", "a": 1, "n": 6, "tags": [1, 2]}),
            changed("n", json!(6)),
        );
        assert_fetched_not_patched(
            json!({"$v": 2, "diff": {"stags": {"a": true, "l": 1}}}),
            json!({"_id": "x", "a": 1, "n": 5, "tags": [1]}),
            changed("tags", json!([1])),
        );
    }

    #[test]
    fn deltas_that_fail_to_apply_are_fetched_not_patched() {
        // `n` is a scalar in the cached copy; the store holds whatever it settled on.
        assert_fetched_not_patched(
            json!({"$set": {"n.x": 1}}),
            json!({"_id": "x", "a": 1, "n": {"x": 1}, "tags": [1, 2]}),
            changed("n", json!({"x": 1})),
        );
        // The store refused the write, so the fetched copy is unchanged.
        assert_fetched_not_patched(
            json!({"$set": {"tags.18446744073709551615": 1}}),
            json!({"_id": "x", "a": 1, "n": 5, "tags": [1, 2]}),
            vec![],
        );
    }

    #[test]
    fn update_that_unmatches_a_cached_doc_removes_it() {
        let desc = QueryDescriptor::new("items", json!({"a": {"$gt": 0}}));
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("x".to_string(), doc(json!({"_id": "x", "a": 1})))].into_iter().collect();
        drive(&mut st, &desc, &model);
        rec.take();
        st.on_entry(&modify(5, "x", json!({"$set": {"a": -1}})));
        assert_eq!(rec.take(), vec![Ev::Removed("x".into())]);
    }

    #[test]
    fn insert_then_delete_nets_to_nothing() {
        let desc = by_a(None);
        let (mut st, rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());
        rec.take();
        st.on_entry(&insert(1, json!({"_id": "n", "a": 1})));
        st.on_entry(&delete(2, "n"));
        let mut live = std::collections::BTreeSet::new();
        for ev in rec.take() {
            match ev {
                Ev::Added(id, _) => assert!(live.insert(id)),
                Ev::Removed(id) => assert!(live.remove(&id)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(live.is_empty());
        assert!(st.snapshot().published.is_empty());
    }

    #[test]
    fn drop_collection_requery_replaces_published_set() {
        let desc = by_a(None);
        let (mut st, rec) = setup(&desc);
        let mut model: BTreeMap<_, _> = [("x", 1), ("y", 2)]
            .into_iter()
            .map(|(id, a)| (id.to_string(), doc(json!({"_id": id, "a": a}))))
            .collect();
        drive(&mut st, &desc, &model);
        rec.take();

        let drop = ChangeEntry {
            ts: 9,
            ns: Namespace::new("db", "$cmd"),
            op: EntryOp::Command { command: Command::DropCollection { name: "items".into() } },
        };
        st.on_entry(&drop);
        assert_eq!(st.phase(), Phase::Querying);
        model.clear();
        model.insert("y".into(), doc(json!({"_id": "y", "a": 2})));
        model.insert("z".into(), doc(json!({"_id": "z", "a": 3})));
        drive(&mut st, &desc, &model);
        assert_eq!(rec.take(), vec![Ev::Removed("x".into()), Ev::Added("z".into(), doc(json!({"a": 3})))]);
        assert_eq!(st.snapshot().published_ids(), vec!["y", "z"]);
        assert_eq!(st.phase(), Phase::Steady);
    }

    #[test]
    fn repeated_entries_for_one_id_fetch_it_once() {
        let desc = QueryDescriptor::new("items", json!({"a": 1}));
        let (mut st, _rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());

        st.on_entry(&modify(1, "x", json!({"$set": {"a": 1}})));
        st.on_entry(&modify(2, "x", json!({"$set": {"a": 1, "b": 2}})));
        assert_eq!(st.phase(), Phase::Fetching);
        assert_eq!(st.take_effects(), vec![Effect::FetchRound]);
        st.on_fetch_round();
        let effects = st.take_effects();
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], Effect::Fetch { id, ts: 2, .. } if id == "x"));
    }

    #[test]
    fn entries_for_an_id_being_fetched_wait_for_the_next_round() {
        let desc = QueryDescriptor::new("items", json!({"a": 1}));
        let (mut st, rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());

        st.on_entry(&modify(1, "x", json!({"$set": {"a": 1}})));
        st.take_effects();
        st.on_fetch_round();
        let gen = st.generation();
        st.take_effects();
        st.on_entry(&modify(2, "x", json!({"$set": {"c": 1}})));
        st.on_fetch_done(gen, "x", Ok(Some(doc(json!({"_id": "x", "a": 1})))));
        assert_eq!(st.take_effects(), vec![Effect::FetchRound]);
        st.on_fetch_round();
        let gen = st.generation();
        assert_eq!(st.take_effects().len(), 1);
        st.on_fetch_done(gen, "x", Ok(Some(doc(json!({"_id": "x", "a": 1, "c": 1})))));
        assert_eq!(st.phase(), Phase::Steady);
        let evs = rec.take();
        assert!(matches!(&evs[0], Ev::Added(id, _) if id == "x"));
        assert!(matches!(&evs[1], Ev::Changed(id, _) if id == "x"));
    }

    #[test]
    fn stale_fetch_results_are_discarded() {
        let desc = QueryDescriptor::new("items", json!({"a": 1}));
        let (mut st, rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());
        rec.take();

        st.on_entry(&modify(1, "x", json!({"$set": {"a": 1}})));
        st.take_effects();
        st.on_fetch_round();
        let old = st.generation();
        st.take_effects();
        st.on_resync(ResyncReason::Gap);
        assert_eq!(st.phase(), Phase::Querying);
        st.on_fetch_done(old, "x", Ok(Some(doc(json!({"_id": "x", "a": 1})))));
        assert!(rec.take().is_empty());
        assert!(st.snapshot().published.is_empty());
    }

    #[test]
    fn fetch_error_forces_requery() {
        let desc = QueryDescriptor::new("items", json!({"a": 1}));
        let (mut st, _rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());
        st.on_entry(&modify(1, "x", json!({"$set": {"a": 1}})));
        st.take_effects();
        st.on_fetch_round();
        let gen = st.generation();
        st.take_effects();
        st.on_fetch_done(gen, "x", Err(StoreError::Unavailable("down".into())));
        assert_eq!(st.phase(), Phase::Querying);
        assert!(matches!(st.take_effects().as_slice(), [Effect::RunQuery { .. }]));
    }

    #[test]
    fn requery_requested_while_querying_runs_after_it() {
        let desc = by_a(None);
        let (mut st, _rec) = setup(&desc);
        let g = st.generation();
        st.take_effects();
        st.on_resync(ResyncReason::Failover);
        st.on_query_done(g, Ok(Vec::new()));
        assert_eq!(st.take_effects(), vec![Effect::AwaitCaughtUp { generation: g }]);
        st.on_caught_up(g);
        assert_eq!(st.phase(), Phase::Querying);
        assert!(matches!(st.take_effects().as_slice(), [Effect::RunQuery { initial: false, .. }]));
    }

    #[test]
    fn entries_during_query_are_fetched_afterwards() {
        let desc = by_a(None);
        let (mut st, rec) = setup(&desc);
        let g = st.generation();
        st.take_effects();
        st.on_entry(&insert(1, json!({"_id": "late", "a": 4})));
        st.on_query_done(g, Ok(Vec::new()));
        st.take_effects();
        st.on_caught_up(g);
        assert_eq!(st.phase(), Phase::Fetching);
        let model: BTreeMap<_, _> = [("late".to_string(), doc(json!({"_id": "late", "a": 4})))].into_iter().collect();
        drive(&mut st, &desc, &model);
        assert_eq!(st.phase(), Phase::Steady);
        assert!(rec.take().contains(&Ev::Added("late".into(), doc(json!({"a": 4})))));
    }

    #[test]
    fn failed_initial_query_is_terminal() {
        let desc = by_a(None);
        let (mut st, rec) = setup(&desc);
        let g = st.generation();
        st.take_effects();
        st.on_query_done(g, Err(StoreError::Unavailable("down".into())));
        assert!(st.is_stopped());
        assert!(matches!(rec.take().as_slice(), [Ev::Error(msg)] if msg.contains("initial query")));
        assert!(st.take_effects().is_empty());
    }

    #[test]
    fn unknown_operation_is_fatal() {
        let desc = by_a(None);
        let (mut st, rec) = setup(&desc);
        drive(&mut st, &desc, &BTreeMap::new());
        rec.take();
        st.on_entry(&entry(3, EntryOp::Other { kind: "n".into() }));
        assert!(st.is_stopped());
        assert!(matches!(rec.take().as_slice(), [Ev::Error(_)]));
    }

    #[test]
    fn duplicate_insert_is_an_invariant_breach() {
        let desc = by_a(None);
        let (mut st, _rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("x".to_string(), doc(json!({"_id": "x", "a": 1})))].into_iter().collect();
        drive(&mut st, &desc, &model);
        st.on_entry(&insert(4, json!({"_id": "x", "a": 1})));
        assert_eq!(st.phase(), Phase::Querying);
        assert_eq!(st.stats.snapshot().invariant_breaches, 1);
        drive(&mut st, &desc, &model);
        assert_eq!(st.snapshot().published_ids(), vec!["x"]);
    }

    #[test]
    fn replacement_can_move_a_buffered_doc_into_published() {
        let desc = by_a(Some(2));
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> = [("p", 1), ("q", 2), ("r", 3)]
            .into_iter()
            .map(|(id, a)| (id.to_string(), doc(json!({"_id": id, "a": a}))))
            .collect();
        drive(&mut st, &desc, &model);
        rec.take();
        st.on_entry(&entry(7, EntryOp::Update { id: "r".into(), payload: UpdatePayload::Replace(doc(json!({"a": 0}))) }));
        assert_eq!(rec.take(), vec![Ev::Added("r".into(), doc(json!({"a": 0}))), Ev::Removed("q".into())]);
        let snap = st.snapshot();
        assert_eq!(snap.published_ids(), vec!["r", "p"]);
        assert_eq!(snap.buffer_ids(), vec!["q"]);
    }

    #[test]
    fn observers_see_client_projection_without_id() {
        let mut desc = QueryDescriptor::new("items", json!({"a": {"$gt": 0}}));
        desc.fields = json!({"title": 1}).as_object().cloned();
        let (mut st, rec) = setup(&desc);
        let model: BTreeMap<_, _> =
            [("x".to_string(), doc(json!({"_id": "x", "a": 1, "title": "t", "body": "long"})))].into_iter().collect();
        drive(&mut st, &desc, &model);
        assert_eq!(rec.take()[0], Ev::Added("x".into(), doc(json!({"title": "t"}))));
        assert_eq!(Json::Object(st.snapshot().published[0].clone()), json!({"_id": "x", "a": 1, "title": "t"}));

        // Selector field change is evaluated against the cached copy.
        st.on_entry(&modify(3, "x", json!({"$set": {"a": 5}})));
        assert!(rec.take().is_empty());
        assert!(st.take_effects().is_empty());
    }

    #[test]
    fn writes_wait_for_steady() {
        let desc = by_a(None);
        let (mut st, _rec) = setup(&desc);
        let fence = WriteFence::new();
        st.commit_when_steady(fence.begin_write().unwrap());
        fence.arm();
        assert!(!fence.fired());
        drive(&mut st, &desc, &BTreeMap::new());
        assert!(fence.fired());
    }

    #[test]
    fn stopping_commits_queued_writes() {
        let desc = by_a(None);
        let (mut st, _rec) = setup(&desc);
        let fence = WriteFence::new();
        st.commit_when_steady(fence.begin_write().unwrap());
        fence.arm();
        st.stop();
        assert!(fence.fired());
    }

    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
        fn below(&mut self, n: u64) -> u64 { self.next() % n }
    }

    fn check_against_requery(limit: Option<usize>, seed: u64) {
        let mut desc = QueryDescriptor::new("items", json!({"a": {"$gte": 10}})).sort_by("a", SortOrder::Asc);
        desc.limit = limit;
        let (mut st, _rec) = setup(&desc);
        let mut model: BTreeMap<String, Document> = BTreeMap::new();
        let mut rng = Rng(seed);
        let mut next_id = 0;
        drive(&mut st, &desc, &model);

        for step in 0..400u64 {
            // Sometimes let several entries pile up before answering effects.
            let burst = 1 + rng.below(3);
            for k in 0..burst {
                let ts = step * 4 + k + 1;
                let pick = rng.below(10);
                let existing: Vec<String> = model.keys().cloned().collect();
                let e = if existing.is_empty() || pick < 4 {
                    next_id += 1;
                    let id = format!("d{:03}", next_id);
                    let d = doc(json!({"_id": id, "a": rng.below(40), "b": 0}));
                    model.insert(id, d.clone());
                    entry(ts, EntryOp::Insert { doc: d })
                } else {
                    let id = existing[rng.below(existing.len() as u64) as usize].clone();
                    match pick {
                        4 | 5 => {
                            let m = json!({"$set": {"a": rng.below(40)}});
                            FieldDelta::from_modifier(&m).unwrap().apply_to(model.get_mut(&id).unwrap()).unwrap();
                            modify(ts, &id, m)
                        }
                        6 | 7 => {
                            let m = json!({"$v": 2, "diff": {"u": {"b": rng.below(5)}}});
                            FieldDelta::from_modifier(&m).unwrap().apply_to(model.get_mut(&id).unwrap()).unwrap();
                            modify(ts, &id, m)
                        }
                        _ => {
                            model.remove(&id);
                            delete(ts, &id)
                        }
                    }
                };
                st.on_entry(&e);
            }
            drive(&mut st, &desc, &model);

            let snap = st.snapshot();
            assert_eq!(snap.phase, Phase::Steady, "step {}", step);
            let expected = ids(&run_query(&QueryDescriptor { limit: None, ..desc.clone() }, &model));
            let published = ids(&snap.published);
            let buffered = ids(&snap.buffer);
            match limit {
                Some(l) => {
                    assert!(published.len() <= l && buffered.len() <= l, "step {}", step);
                    let n = expected.len().min(l);
                    assert_eq!(published, expected[..n].to_vec(), "step {}", step);
                    assert_eq!(buffered, expected[n..n + buffered.len()].to_vec(), "step {}", step);
                    if !snap.safe_append_to_buffer || buffered.len() == l {
                        continue;
                    }
                    assert_eq!(buffered.len(), expected.len() - n, "step {}: safe buffer must hold every other match", step);
                }
                None => assert_eq!(published, expected, "step {}", step),
            }
        }
    }

    #[test]
    fn windows_equal_a_fresh_requery_after_every_step() {
        check_against_requery(Some(3), 0x2545_F491_4F6C_DD1D);
        check_against_requery(Some(1), 0x9E37_79B9_7F4A_7C15);
        check_against_requery(None, 0xD1B5_4A32_D192_ED03);
    }
}
