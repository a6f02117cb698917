//! Result sink and observer fan-out.
//!
//! A driver reports changes through [`ResultSink`]. The [`Multiplexer`]
//! implementation forwards them to a worker task that keeps a cache of the
//! current result set, so observers attaching late receive `Added` for every
//! cached document and then `Ready`. Each observer has its own queue.

use std::collections::BTreeMap;

use oplive_core::{ChangedFields, DocId, Document, Json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiver of a driver's notifications, called in processing order.
pub trait ResultSink: Send + Sync {
    fn added(&self, id: &str, fields: Document);
    fn changed(&self, id: &str, fields: ChangedFields);
    fn removed(&self, id: &str);
    /// The initial result set has been delivered.
    fn ready(&self);
    /// The query failed for good; no further notifications follow.
    fn query_error(&self, message: String);
    /// Run `f` once every notification issued so far has been delivered.
    fn on_flush(&self, f: Box<dyn FnOnce() + Send>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    Added { id: DocId, fields: Document },
    Changed { id: DocId, fields: ChangedFields },
    Removed { id: DocId },
    Ready,
    Error(String),
}

enum Msg {
    Added(DocId, Document),
    Changed(DocId, ChangedFields),
    Removed(DocId),
    Ready,
    QueryError(String),
    Flush(Box<dyn FnOnce() + Send>),
    Attach(mpsc::UnboundedSender<ObserverEvent>),
}

#[derive(Clone)]
pub struct Multiplexer {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Multiplexer {
    /// Spawn the fan-out worker on the current runtime.
    pub fn spawn(label: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        tokio::spawn(async move {
            let mut cache: BTreeMap<DocId, Document> = BTreeMap::new();
            let mut observers: Vec<mpsc::UnboundedSender<ObserverEvent>> = Vec::new();
            let mut ready = false;
            let mut error: Option<String> = None;
            let mut flushes: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Added(id, fields) => {
                        cache.insert(id.clone(), fields.clone());
                        fan_out(&mut observers, ObserverEvent::Added { id, fields });
                    }
                    Msg::Changed(id, fields) => {
                        match cache.get_mut(&id) {
                            Some(doc) => apply_changed(doc, &fields),
                            None => warn!(query = %label, id = %id, "changed for an id the multiplexer never saw"),
                        }
                        fan_out(&mut observers, ObserverEvent::Changed { id, fields });
                    }
                    Msg::Removed(id) => {
                        cache.remove(&id);
                        fan_out(&mut observers, ObserverEvent::Removed { id });
                    }
                    Msg::Ready => {
                        ready = true;
                        fan_out(&mut observers, ObserverEvent::Ready);
                        flushes.drain(..).for_each(|f| f());
                    }
                    Msg::QueryError(message) => {
                        fan_out(&mut observers, ObserverEvent::Error(message.clone()));
                        error = Some(message);
                        // Never becoming ready; release pending flushes now.
                        flushes.drain(..).for_each(|f| f());
                    }
                    Msg::Flush(f) => {
                        if ready || error.is_some() {
                            f();
                        } else {
                            flushes.push(f);
                        }
                    }
                    Msg::Attach(obs) => {
                        let mut ok = true;
                        for (id, fields) in cache.iter() {
                            ok &= obs.send(ObserverEvent::Added { id: id.clone(), fields: fields.clone() }).is_ok();
                        }
                        if ready {
                            ok &= obs.send(ObserverEvent::Ready).is_ok();
                        }
                        if let Some(e) = &error {
                            ok &= obs.send(ObserverEvent::Error(e.clone())).is_ok();
                        }
                        if ok {
                            observers.push(obs);
                        }
                    }
                }
            }
            flushes.drain(..).for_each(|f| f());
            debug!(query = %label, "multiplexer stopped");
        });
        Self { tx }
    }

    /// Register a new observer; it first receives the cached result set.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<ObserverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(Msg::Attach(tx));
        rx
    }

    fn send(&self, msg: Msg) {
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(msg) {
            // Worker gone: still honour flush callbacks.
            if let Msg::Flush(f) = msg {
                f();
            }
        }
    }
}

fn fan_out(observers: &mut Vec<mpsc::UnboundedSender<ObserverEvent>>, ev: ObserverEvent) {
    observers.retain(|o| o.send(ev.clone()).is_ok());
}

fn apply_changed(doc: &mut Document, fields: &ChangedFields) {
    for (k, v) in fields.iter() {
        match v {
            Some(v) => {
                doc.insert(k.clone(), Json::clone(v));
            }
            None => {
                doc.remove(k);
            }
        }
    }
}

impl ResultSink for Multiplexer {
    fn added(&self, id: &str, fields: Document) { self.send(Msg::Added(id.to_string(), fields)); }
    fn changed(&self, id: &str, fields: ChangedFields) { self.send(Msg::Changed(id.to_string(), fields)); }
    fn removed(&self, id: &str) { self.send(Msg::Removed(id.to_string())); }
    fn ready(&self) { self.send(Msg::Ready); }
    fn query_error(&self, message: String) { self.send(Msg::QueryError(message)); }
    fn on_flush(&self, f: Box<dyn FnOnce() + Send>) { self.send(Msg::Flush(f)); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fields(v: Json) -> Document { v.as_object().cloned().unwrap() }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ObserverEvent>) -> ObserverEvent {
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn late_observers_get_the_cached_set() {
        let mux = Multiplexer::spawn("t".into());
        let mut early = mux.attach();
        mux.added("a", fields(json!({"x": 1})));
        mux.added("b", fields(json!({"x": 2})));
        mux.ready();
        let mut changed = ChangedFields::new();
        changed.insert("x".into(), Some(json!(5)));
        mux.changed("a", changed);
        mux.removed("b");

        let mut late = mux.attach();
        assert_eq!(next(&mut late).await, ObserverEvent::Added { id: "a".into(), fields: fields(json!({"x": 5})) });
        assert_eq!(next(&mut late).await, ObserverEvent::Ready);

        assert!(matches!(next(&mut early).await, ObserverEvent::Added { .. }));
        assert!(matches!(next(&mut early).await, ObserverEvent::Added { .. }));
        assert_eq!(next(&mut early).await, ObserverEvent::Ready);
        assert!(matches!(next(&mut early).await, ObserverEvent::Changed { .. }));
        assert_eq!(next(&mut early).await, ObserverEvent::Removed { id: "b".into() });
    }

    #[tokio::test]
    async fn flush_waits_for_ready() {
        let mux = Multiplexer::spawn("t".into());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let flushed = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flushed);
        mux.on_flush(Box::new(move || {
            f.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        tokio::task::yield_now().await;
        assert!(!flushed.load(Ordering::SeqCst));
        mux.ready();
        rx.await.unwrap();
        assert!(flushed.load(Ordering::SeqCst));
    }
}
