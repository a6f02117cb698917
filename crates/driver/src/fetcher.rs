//! Deduplicating document fetcher shared by every driver on a source.

use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use oplive_core::Document;
use oplive_store::{DocumentSource, StoreError};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::trace;

type FetchResult = Result<Option<Document>, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchKey {
    collection: String,
    id: String,
    ts: u64,
}

type Waiters = FxHashMap<FetchKey, Vec<oneshot::Sender<FetchResult>>>;

/// Concurrent fetches of the same `(collection, id, ts)` share one
/// `find_one`; every caller receives its own copy of the document.
#[derive(Clone)]
pub struct DocFetcher {
    source: Arc<dyn DocumentSource>,
    inflight: Arc<Mutex<Waiters>>,
}

impl DocFetcher {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source, inflight: Arc::new(Mutex::new(FxHashMap::default())) }
    }

    /// Fetch the current version of `id`. `ts` is the change position that
    /// made the fetch necessary; it only scopes deduplication.
    pub async fn fetch(&self, collection: &str, id: &str, ts: u64) -> FetchResult {
        let key = FetchKey { collection: collection.to_string(), id: id.to_string(), ts };
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    inflight.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };
        if first {
            let source = Arc::clone(&self.source);
            let inflight = Arc::clone(&self.inflight);
            tokio::spawn(async move {
                let result = source.find_one(&key.collection, &key.id).await;
                let waiters = inflight.lock().unwrap_or_else(PoisonError::into_inner).remove(&key).unwrap_or_default();
                trace!(collection = %key.collection, id = %key.id, waiters = waiters.len(), "fetch done");
                for w in waiters {
                    let _ = w.send(result.clone());
                }
            });
        } else {
            counter!("doc_fetcher_collapsed_total", 1u64);
        }
        rx.await.unwrap_or_else(|_| Err(StoreError::Unavailable("fetch task dropped".into())))
    }

    pub fn inflight(&self) -> usize {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
