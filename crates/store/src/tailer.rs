//! Change tailer: ordered fan-out of change entries to per-namespace listeners.
//!
//! Appends are stamped with a strictly increasing position and queued; a
//! single ingest loop dispatches them in order and publishes the last
//! processed position, which is what [`Tailer::wait_until_caught_up`] waits
//! on. When the undispatched backlog grows past `too_far_behind`, the loop
//! drops it and tells every listener to resynchronize instead.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use metrics::counter;
use oplive_core::{ChangeEntry, Command, EntryOp, Namespace};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// Entries were skipped; listeners cannot trust their incremental state.
    Gap,
    /// Upstream primary changed.
    Failover,
}

#[derive(Debug, Clone)]
pub enum TailEvent {
    Entry(Arc<ChangeEntry>),
    Resync(ResyncReason),
}

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    pub too_far_behind: usize,
}

impl Default for TailerConfig {
    fn default() -> Self { Self { too_far_behind: 2000 } }
}

impl TailerConfig {
    pub fn from_env() -> Self {
        let too_far_behind = std::env::var("OPLIVE_TAIL_TOO_FAR_BEHIND")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2000);
        Self { too_far_behind }
    }
}

enum Ingest {
    Entry(ChangeEntry),
    Failover,
    Gap,
}

type ListenerTx = mpsc::UnboundedSender<TailEvent>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_ns: FxHashMap<Namespace, Vec<(u64, ListenerTx)>>,
}

struct Inner {
    // Held while stamping and queueing so queue order equals position order.
    seq: Mutex<u64>,
    ingest_tx: mpsc::UnboundedSender<Ingest>,
    backlog: AtomicUsize,
    last_appended: AtomicU64,
    processed_rx: watch::Receiver<u64>,
    listeners: Mutex<Listeners>,
}

/// Cheap to clone; all clones share one ingest loop.
#[derive(Clone)]
pub struct Tailer {
    inner: Arc<Inner>,
}

/// Registration returned by [`Tailer::listen`]; dropping it unregisters.
pub struct ListenerHandle {
    inner: Arc<Inner>,
    ns: Namespace,
    id: u64,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let mut ls = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = ls.by_ns.get_mut(&self.ns) {
            v.retain(|(id, _)| *id != self.id);
            if v.is_empty() {
                ls.by_ns.remove(&self.ns);
            }
        }
    }
}

impl Tailer {
    /// Spawn the ingest loop on the current tokio runtime.
    pub fn spawn(cfg: TailerConfig) -> Self {
        let (ingest_tx, mut rx) = mpsc::unbounded_channel::<Ingest>();
        let (processed_tx, processed_rx) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            seq: Mutex::new(0),
            ingest_tx,
            backlog: AtomicUsize::new(0),
            last_appended: AtomicU64::new(0),
            processed_rx,
            listeners: Mutex::new(Listeners::default()),
        });
        let weak = Arc::downgrade(&inner);
        let too_far_behind = cfg.too_far_behind.max(1);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break; };
                match msg {
                    Ingest::Entry(entry) => {
                        let remaining = inner.backlog.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                        if remaining >= too_far_behind {
                            let mut last = entry.ts;
                            let mut skipped = 1usize;
                            let mut failover = false;
                            while let Ok(next) = rx.try_recv() {
                                match next {
                                    Ingest::Entry(e) => {
                                        inner.backlog.fetch_sub(1, Ordering::AcqRel);
                                        last = e.ts;
                                        skipped += 1;
                                    }
                                    Ingest::Failover => failover = true,
                                    Ingest::Gap => {}
                                }
                            }
                            warn!(skipped, last_ts = last, "tailer fell too far behind; skipping entries");
                            counter!("tailer_gap_total", 1u64);
                            inner.broadcast(TailEvent::Resync(ResyncReason::Gap));
                            if failover {
                                inner.broadcast(TailEvent::Resync(ResyncReason::Failover));
                            }
                            processed_tx.send_replace(last);
                            continue;
                        }
                        let ts = entry.ts;
                        inner.dispatch(entry);
                        processed_tx.send_replace(ts);
                    }
                    Ingest::Failover => {
                        info!("tailer: failover signalled");
                        inner.broadcast(TailEvent::Resync(ResyncReason::Failover));
                    }
                    Ingest::Gap => {
                        warn!("tailer: gap signalled");
                        counter!("tailer_gap_total", 1u64);
                        inner.broadcast(TailEvent::Resync(ResyncReason::Gap));
                    }
                }
            }
            debug!("tailer ingest loop stopped");
        });

        Self { inner }
    }

    /// Stamp and queue a committed change; returns its position.
    pub fn append(&self, ns: Namespace, op: EntryOp) -> u64 {
        let mut seq = self.inner.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq += 1;
        let ts = *seq;
        self.inner.backlog.fetch_add(1, Ordering::AcqRel);
        self.inner.last_appended.store(ts, Ordering::Release);
        if self.inner.ingest_tx.send(Ingest::Entry(ChangeEntry { ts, ns, op })).is_err() {
            self.inner.backlog.fetch_sub(1, Ordering::AcqRel);
            warn!(ts, "tailer ingest loop gone; entry dropped");
        }
        counter!("tailer_entries_total", 1u64);
        ts
    }

    /// Tell every listener the upstream changed primaries.
    pub fn signal_failover(&self) {
        let _ = self.inner.ingest_tx.send(Ingest::Failover);
    }

    /// Tell every listener that entries were lost, as if the tailer had
    /// fallen too far behind. Queued entries are still delivered.
    pub fn signal_gap(&self) {
        let _ = self.inner.ingest_tx.send(Ingest::Gap);
    }

    /// Register for entries on `ns`, plus drop-database entries for its database
    /// and resync signals.
    pub fn listen(&self, ns: Namespace, tx: mpsc::UnboundedSender<TailEvent>) -> ListenerHandle {
        let mut ls = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        ls.next_id += 1;
        let id = ls.next_id;
        ls.by_ns.entry(ns.clone()).or_default().push((id, tx));
        ListenerHandle { inner: Arc::clone(&self.inner), ns, id }
    }

    pub fn last_appended(&self) -> u64 {
        self.inner.last_appended.load(Ordering::Acquire)
    }

    /// Resolves once every entry appended before the call has been dispatched.
    pub async fn wait_until_caught_up(&self) {
        let target = self.last_appended();
        let mut rx = self.inner.processed_rx.clone();
        while *rx.borrow_and_update() < target {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Inner {
    fn dispatch(&self, entry: ChangeEntry) {
        let entry = Arc::new(entry);
        let mut ls = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let db = entry.ns.db.clone();
        let matches = |ns: &Namespace| match &entry.op {
            EntryOp::Command { command: Command::DropDatabase } => ns.db == db,
            EntryOp::Command { command: Command::DropCollection { name } } => ns.db == db && &ns.collection == name,
            _ => ns == &entry.ns,
        };
        for (ns, txs) in ls.by_ns.iter_mut() {
            if !matches(ns) { continue; }
            txs.retain(|(_, tx)| tx.send(TailEvent::Entry(Arc::clone(&entry))).is_ok());
        }
        ls.by_ns.retain(|_, v| !v.is_empty());
    }

    fn broadcast(&self, ev: TailEvent) {
        let mut ls = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for txs in ls.by_ns.values_mut() {
            txs.retain(|(_, tx)| tx.send(ev.clone()).is_ok());
        }
        ls.by_ns.retain(|_, v| !v.is_empty());
    }
}
