//! Driver task: runs a [`DriverState`] and performs its effects.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::histogram;
use oplive_core::{DocId, Document, QueryDescriptor};
use oplive_selector::{Matcher, Projection, Sorter};
use oplive_store::{DocumentSource, StoreError, TailEvent, Tailer};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::fetcher::DocFetcher;
use crate::multiplexer::ResultSink;
use crate::state::{DriverState, Effect, QueryPlan, WindowSnapshot};
use crate::stats::{DriverStats, StatsSnapshot};
use crate::{DriverConfig, LiveQueryError, WriteToken};

/// Everything a driver needs from its surroundings.
#[derive(Clone)]
pub struct DriverContext {
    pub source: Arc<dyn DocumentSource>,
    pub tailer: Tailer,
    pub fetcher: DocFetcher,
    pub config: DriverConfig,
}

impl DriverContext {
    pub fn new(source: Arc<dyn DocumentSource>, tailer: Tailer, config: DriverConfig) -> Self {
        let fetcher = DocFetcher::new(Arc::clone(&source));
        Self { source, tailer, fetcher, config }
    }
}

enum DriverCmd {
    Tail(TailEvent),
    QueryDone { generation: u64, result: Result<Vec<Document>, StoreError> },
    CaughtUp { generation: u64 },
    FetchRound,
    FetchDone { generation: u64, id: DocId, result: Result<Option<Document>, StoreError> },
    CommitWhenSteady(WriteToken),
    Stop,
}

struct Shared {
    cmd_tx: mpsc::UnboundedSender<DriverCmd>,
    snap: Arc<ArcSwap<WindowSnapshot>>,
    stats: Arc<DriverStats>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(DriverCmd::Stop);
    }
}

/// Handle to a running driver. Clones share the task; it stops on
/// [`OplogDriver::stop`] or when the last clone is dropped.
#[derive(Clone)]
pub struct OplogDriver {
    shared: Arc<Shared>,
    epoch_rx: watch::Receiver<u64>,
}

impl OplogDriver {
    /// Whether `desc` can be kept current from the change stream alone.
    pub fn supports(desc: &QueryDescriptor, matcher: &Matcher) -> bool {
        Self::unsupported_reason(desc, matcher).is_none()
    }

    pub fn unsupported_reason(desc: &QueryDescriptor, matcher: &Matcher) -> Option<&'static str> {
        if desc.skip > 0 {
            return Some("skip is not supported");
        }
        if desc.effective_limit().is_some() && desc.sort.as_ref().map_or(true, |s| s.is_empty()) {
            return Some("limit requires a sort");
        }
        if Projection::compile(desc.fields.as_ref()).is_err() {
            return Some("unsupported field projection");
        }
        if Sorter::compile(desc.sort.as_deref()).is_err() {
            return Some("unsupported sort specification");
        }
        if matcher.has_where() {
            return Some("$where selectors are not supported");
        }
        if matcher.has_text() {
            return Some("$text selectors are not supported");
        }
        if matcher.has_geo_query() {
            return Some("geo selectors are not supported");
        }
        None
    }

    /// Spawn a driver for `desc` reporting into `sink`.
    pub fn start(ctx: &DriverContext, desc: &QueryDescriptor, sink: Arc<dyn ResultSink>) -> Result<Self, LiveQueryError> {
        let plan = QueryPlan::compile(ctx.source.database(), desc)?;
        if let Some(reason) = Self::unsupported_reason(desc, &plan.matcher) {
            return Err(LiveQueryError::Unsupported(reason.to_string()));
        }
        let ns = plan.ns.clone();
        let (tail_tx, mut tail_rx) = mpsc::unbounded_channel();
        let listener = ctx.tailer.listen(ns.clone(), tail_tx);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(DriverStats::default());
        let snap = Arc::new(ArcSwap::from_pointee(WindowSnapshot::empty()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);

        let mut state = DriverState::new(plan, sink, Arc::clone(&stats), &ctx.config);
        let runner = Runner { ctx: ctx.clone(), desc: desc.clone(), cmd_tx: cmd_tx.clone() };
        let snap_task = Arc::clone(&snap);
        info!(ns = %ns, limit = ?desc.effective_limit(), "live query starting");

        tokio::spawn(async move {
            let _listener = listener;
            let mut epoch = 0u64;
            state.start();
            runner.run_effects(&mut state);
            loop {
                let cmd = tokio::select! {
                    biased;
                    ev = tail_rx.recv() => match ev {
                        Some(ev) => DriverCmd::Tail(ev),
                        None => break,
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };
                match cmd {
                    DriverCmd::Stop => break,
                    DriverCmd::Tail(TailEvent::Entry(entry)) => state.on_entry(&entry),
                    DriverCmd::Tail(TailEvent::Resync(reason)) => state.on_resync(reason),
                    DriverCmd::QueryDone { generation, result } => state.on_query_done(generation, result),
                    DriverCmd::CaughtUp { generation } => state.on_caught_up(generation),
                    DriverCmd::FetchRound => state.on_fetch_round(),
                    DriverCmd::FetchDone { generation, id, result } => state.on_fetch_done(generation, &id, result),
                    DriverCmd::CommitWhenSteady(token) => state.commit_when_steady(token),
                }
                runner.run_effects(&mut state);
                epoch += 1;
                snap_task.store(Arc::new(state.snapshot()));
                epoch_tx.send_replace(epoch);
                if state.is_stopped() {
                    break;
                }
            }
            state.stop();
            snap_task.store(Arc::new(state.snapshot()));
            epoch_tx.send_replace(epoch + 1);
            debug!(ns = %ns, "live query stopped");
        });

        Ok(Self { shared: Arc::new(Shared { cmd_tx, snap, stats }), epoch_rx })
    }

    pub fn snapshot(&self) -> Arc<WindowSnapshot> { self.shared.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
    pub fn stats(&self) -> StatsSnapshot { self.shared.stats.snapshot() }

    /// Resolve once a snapshot satisfies `pred`, or the driver has stopped.
    pub async fn wait_until(&self, pred: impl Fn(&WindowSnapshot) -> bool) -> Arc<WindowSnapshot> {
        let mut rx = self.epoch_rx.clone();
        loop {
            rx.borrow_and_update();
            let snap = self.snapshot();
            if pred(&snap) || snap.stopped {
                return snap;
            }
            if rx.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }

    /// Commit `token` once this driver has processed everything before it and
    /// delivered it to observers. A stopped driver drops (and so commits) it.
    pub fn commit_when_steady(&self, token: WriteToken) {
        let _ = self.shared.cmd_tx.send(DriverCmd::CommitWhenSteady(token));
    }

    pub fn stop(&self) {
        let _ = self.shared.cmd_tx.send(DriverCmd::Stop);
    }
}

struct Runner {
    ctx: DriverContext,
    desc: QueryDescriptor,
    cmd_tx: mpsc::UnboundedSender<DriverCmd>,
}

impl Runner {
    fn run_effects(&self, state: &mut DriverState) {
        for effect in state.take_effects() {
            match effect {
                Effect::RunQuery { generation, initial } => self.spawn_query(generation, initial),
                Effect::AwaitCaughtUp { generation } => {
                    let tailer = self.ctx.tailer.clone();
                    let tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        tailer.wait_until_caught_up().await;
                        let _ = tx.send(DriverCmd::CaughtUp { generation });
                    });
                }
                Effect::FetchRound => {
                    let _ = self.cmd_tx.send(DriverCmd::FetchRound);
                }
                Effect::Fetch { generation, id, ts } => {
                    let fetcher = self.ctx.fetcher.clone();
                    let collection = self.desc.collection.clone();
                    let tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        let result = fetcher.fetch(&collection, &id, ts).await;
                        let _ = tx.send(DriverCmd::FetchDone { generation, id, result });
                    });
                }
            }
        }
    }

    fn spawn_query(&self, generation: u64, initial: bool) {
        let source = Arc::clone(&self.ctx.source);
        let desc = self.desc.clone();
        let tx = self.cmd_tx.clone();
        let delay = self.ctx.config.requery_retry_delay;
        // Seed both windows in one round trip.
        let limit = desc.effective_limit().map(|l| l.saturating_mul(2));
        tokio::spawn(async move {
            loop {
                let t0 = Instant::now();
                match source.find(&desc, limit).await {
                    Ok(docs) => {
                        histogram!("driver_query_ms", t0.elapsed().as_secs_f64() * 1000.0);
                        let _ = tx.send(DriverCmd::QueryDone { generation, result: Ok(docs) });
                        return;
                    }
                    Err(e) if initial => {
                        let _ = tx.send(DriverCmd::QueryDone { generation, result: Err(e) });
                        return;
                    }
                    Err(e) => {
                        warn!(collection = %desc.collection, error = %e, retry_ms = delay.as_millis() as u64, "query failed; retrying");
                        tokio::time::sleep(delay).await;
                        if tx.is_closed() {
                            return;
                        }
                    }
                }
            }
        });
    }
}
