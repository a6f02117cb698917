//! In-RAM document store. Every committed write is appended to the tailer
//! while the store lock is held, so change positions follow commit order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use oplive_core::{doc_id, Command, DocId, Document, EntryOp, FieldDelta, FieldPath, Json, Namespace, QueryDescriptor, UpdatePayload, ID_FIELD};
use oplive_selector::{Matcher, Sorter};
use rustc_hash::FxHashMap;
use serde_json::Map;
use tracing::debug;

use crate::tailer::Tailer;
use crate::{DocumentSource, StoreError};

/// How modifier updates are encoded in the change entries this store emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateEncoding {
    /// `{$set, $unset}`
    Classic,
    /// `{"$v": 2, "diff": {...}}`
    #[default]
    Diff,
}

type Collection = BTreeMap<DocId, Document>;

pub struct MemoryDb {
    name: String,
    tailer: Tailer,
    encoding: UpdateEncoding,
    collections: Mutex<FxHashMap<String, Collection>>,
    fail_queries: AtomicUsize,
    fail_fetches: AtomicUsize,
    fetch_delay_ms: AtomicU64,
    queries: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryDb {
    pub fn new(name: impl Into<String>, tailer: Tailer) -> Self {
        Self::with_encoding(name, tailer, UpdateEncoding::default())
    }

    pub fn with_encoding(name: impl Into<String>, tailer: Tailer, encoding: UpdateEncoding) -> Self {
        Self {
            name: name.into(),
            tailer,
            encoding,
            collections: Mutex::new(FxHashMap::default()),
            fail_queries: AtomicUsize::new(0),
            fail_fetches: AtomicUsize::new(0),
            fetch_delay_ms: AtomicU64::new(0),
            queries: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn tailer(&self) -> &Tailer { &self.tailer }

    fn ns(&self, collection: &str) -> Namespace { Namespace::new(self.name.clone(), collection) }

    pub fn insert(&self, collection: &str, doc: Document) -> Result<DocId, StoreError> {
        let id = doc_id(&doc).ok_or(StoreError::MissingId)?.to_string();
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        let col = cols.entry(collection.to_string()).or_default();
        if col.contains_key(&id) {
            return Err(StoreError::DuplicateKey(id));
        }
        col.insert(id.clone(), doc.clone());
        self.tailer.append(self.ns(collection), EntryOp::Insert { doc });
        Ok(id)
    }

    /// Apply a `$set` / `$unset` / `$inc` modifier. Returns whether a document
    /// was modified; no-op updates emit no entry.
    pub fn update(&self, collection: &str, id: &str, modifier: &Json) -> Result<bool, StoreError> {
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = cols.get(collection).and_then(|c| c.get(id)) else { return Ok(false); };
        let delta = resolve_modifier(current, modifier)?;
        let mut next = current.clone();
        delta.apply_to(&mut next).map_err(|e| StoreError::Write(e.to_string()))?;
        if &next == current {
            return Ok(false);
        }
        let payload = match self.encoding {
            UpdateEncoding::Classic => classic_modifier(&delta),
            UpdateEncoding::Diff => diff_modifier(&delta, &next),
        };
        if let Some(col) = cols.get_mut(collection) {
            col.insert(id.to_string(), next);
        }
        self.tailer.append(self.ns(collection), EntryOp::Update { id: id.to_string(), payload: UpdatePayload::Modifier(payload) });
        Ok(true)
    }

    pub fn replace(&self, collection: &str, id: &str, mut doc: Document) -> Result<bool, StoreError> {
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(col) = cols.get_mut(collection) else { return Ok(false); };
        if !col.contains_key(id) {
            return Ok(false);
        }
        doc.insert(ID_FIELD.to_string(), Json::String(id.to_string()));
        col.insert(id.to_string(), doc.clone());
        self.tailer.append(self.ns(collection), EntryOp::Update { id: id.to_string(), payload: UpdatePayload::Replace(doc) });
        Ok(true)
    }

    pub fn remove(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = cols.get_mut(collection).and_then(|c| c.remove(id)).is_some();
        if removed {
            self.tailer.append(self.ns(collection), EntryOp::Delete { id: id.to_string() });
        }
        Ok(removed)
    }

    pub fn drop_collection(&self, collection: &str) {
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        cols.remove(collection);
        self.tailer.append(self.ns("$cmd"), EntryOp::Command { command: Command::DropCollection { name: collection.to_string() } });
    }

    pub fn drop_database(&self) {
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        cols.clear();
        self.tailer.append(self.ns("$cmd"), EntryOp::Command { command: Command::DropDatabase });
    }

    /// Load a document without emitting a change entry.
    pub fn seed(&self, collection: &str, doc: Document) -> Result<(), StoreError> {
        let id = doc_id(&doc).ok_or(StoreError::MissingId)?.to_string();
        let mut cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        cols.entry(collection.to_string()).or_default().insert(id, doc);
        Ok(())
    }

    pub fn fail_next_queries(&self, n: usize) { self.fail_queries.store(n, Ordering::Release); }
    pub fn fail_next_fetches(&self, n: usize) { self.fail_fetches.store(n, Ordering::Release); }
    pub fn set_fetch_delay(&self, d: Duration) { self.fetch_delay_ms.store(d.as_millis() as u64, Ordering::Release); }
    pub fn query_count(&self) -> usize { self.queries.load(Ordering::Acquire) }
    pub fn fetch_count(&self) -> usize { self.fetches.load(Ordering::Acquire) }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait::async_trait]
impl DocumentSource for MemoryDb {
    fn database(&self) -> &str { &self.name }

    async fn find(&self, query: &QueryDescriptor, limit: Option<usize>) -> Result<Vec<Document>, StoreError> {
        self.queries.fetch_add(1, Ordering::AcqRel);
        if Self::take_fault(&self.fail_queries) {
            return Err(StoreError::Unavailable("injected query failure".into()));
        }
        let matcher = Matcher::compile(&query.selector).map_err(|e| StoreError::Query(e.to_string()))?;
        let sorter = Sorter::compile(query.sort.as_deref()).map_err(|e| StoreError::Query(e.to_string()))?;
        let mut out: Vec<Document> = {
            let cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
            match cols.get(&query.collection) {
                Some(col) => col.values().filter(|d| matcher.matches(d).matched).cloned().collect(),
                None => Vec::new(),
            }
        };
        out.sort_by(|a, b| sorter.compare(a, b));
        let out: Vec<Document> = out.into_iter().skip(query.skip).take(limit.unwrap_or(usize::MAX)).collect();
        debug!(collection = %query.collection, returned = out.len(), "memory find");
        Ok(out)
    }

    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        let delay = self.fetch_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if Self::take_fault(&self.fail_fetches) {
            return Err(StoreError::Unavailable("injected fetch failure".into()));
        }
        let cols = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cols.get(collection).and_then(|c| c.get(id)).cloned())
    }
}

fn resolve_modifier(current: &Document, modifier: &Json) -> Result<FieldDelta, StoreError> {
    let obj = modifier.as_object().ok_or_else(|| StoreError::Write("modifier must be an object".into()))?;
    let bad_path = |e: oplive_core::PathError| StoreError::Write(e.to_string());
    let mut delta = FieldDelta::default();
    for (op, fields) in obj.iter() {
        let fields = fields.as_object().ok_or_else(|| StoreError::Write(format!("{} expects an object", op)))?;
        for (k, v) in fields.iter() {
            let path = FieldPath::parse(k).map_err(bad_path)?;
            match op.as_str() {
                "$set" => delta.set.push((path, v.clone())),
                "$unset" => delta.unset.push(path),
                "$inc" => {
                    let by = v.as_f64().ok_or_else(|| StoreError::Write(format!("$inc on {} expects a number", k)))?;
                    let cur = oplive_core::doc::get_path(current, &path);
                    let next = match cur {
                        None | Some(Json::Null) => v.clone(),
                        Some(Json::Number(n)) => match (n.as_i64(), v.as_i64()) {
                            (Some(a), Some(b)) => Json::from(a + b),
                            _ => Json::from(n.as_f64().unwrap_or(0.0) + by),
                        },
                        Some(_) => return Err(StoreError::Write(format!("$inc on non-numeric field {}", k))),
                    };
                    delta.set.push((path, next));
                }
                other => return Err(StoreError::Write(format!("unsupported update operator {}", other))),
            }
        }
    }
    Ok(delta)
}

fn classic_modifier(delta: &FieldDelta) -> Json {
    let mut out = Map::new();
    if !delta.set.is_empty() {
        let set: Map<String, Json> = delta.set.iter().map(|(p, v)| (p.to_string(), v.clone())).collect();
        out.insert("$set".into(), Json::Object(set));
    }
    if !delta.unset.is_empty() {
        let unset: Map<String, Json> = delta.unset.iter().map(|p| (p.to_string(), Json::Bool(true))).collect();
        out.insert("$unset".into(), Json::Object(unset));
    }
    Json::Object(out)
}

// Nested v2 diff; `next` tells which intermediate containers are arrays.
fn diff_modifier(delta: &FieldDelta, next: &Document) -> Json {
    let mut root = Map::new();
    let top = Json::Object(next.clone());
    for (path, value) in delta.set.iter() {
        insert_diff(&mut root, Some(&top), path.segments(), Some(value.clone()));
    }
    for path in delta.unset.iter() {
        insert_diff(&mut root, Some(&top), path.segments(), None);
    }
    serde_json::json!({ "$v": 2, "diff": Json::Object(root) })
}

fn insert_diff(node: &mut Map<String, Json>, container: Option<&Json>, segs: &[String], value: Option<Json>) {
    let Some((seg, rest)) = segs.split_first() else { return; };
    let in_array = node.get("a") == Some(&Json::Bool(true));
    if rest.is_empty() {
        if in_array {
            node.insert(format!("u{}", seg), value.unwrap_or(Json::Null));
            return;
        }
        let (bucket, v) = match value {
            Some(v) => ("u", v),
            None => ("d", Json::Bool(false)),
        };
        if let Json::Object(fields) = node.entry(bucket).or_insert_with(|| Json::Object(Map::new())) {
            fields.insert(seg.clone(), v);
        }
        return;
    }
    let child_container = container.and_then(|c| match c {
        Json::Object(m) => m.get(seg),
        Json::Array(a) => seg.parse::<usize>().ok().and_then(|i| a.get(i)),
        _ => None,
    });
    let child = node.entry(format!("s{}", seg)).or_insert_with(|| Json::Object(Map::new()));
    if let Json::Object(child) = child {
        if matches!(child_container, Some(Json::Array(_))) {
            child.insert("a".into(), Json::Bool(true));
        }
        insert_diff(child, child_container, rest, value);
    }
}
