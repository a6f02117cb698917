//! Live query registry: one driver per distinct query, shared by every
//! observer of that query.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::stream::{self, Stream};
use metrics::gauge;
use oplive_core::QueryDescriptor;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::driver::{DriverContext, OplogDriver};
use crate::fence::{FenceError, WriteFence};
use crate::multiplexer::{Multiplexer, ObserverEvent};
use crate::LiveQueryError;

struct LiveEntry {
    collection: String,
    driver: OplogDriver,
    mux: Multiplexer,
    observers: usize,
}

type Drivers = FxHashMap<String, LiveEntry>;

#[derive(Clone)]
pub struct LiveQueries {
    ctx: DriverContext,
    drivers: Arc<Mutex<Drivers>>,
}

impl LiveQueries {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx, drivers: Arc::new(Mutex::new(FxHashMap::default())) }
    }

    pub fn context(&self) -> &DriverContext { &self.ctx }

    /// Attach an observer to `desc`, starting a driver if none runs for an
    /// identical descriptor yet. The observer first receives `Added` for the
    /// current result set, then `Ready`.
    pub fn observe_changes(&self, desc: QueryDescriptor) -> Result<ObserveHandle, LiveQueryError> {
        let key = desc.dedup_key();
        let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = drivers.get_mut(&key) {
            entry.observers += 1;
            debug!(collection = %entry.collection, observers = entry.observers, "observer joined live query");
            return Ok(ObserveHandle::new(entry.mux.attach(), entry.driver.clone(), key, &self.drivers));
        }
        let mux = Multiplexer::spawn(key.clone());
        let driver = OplogDriver::start(&self.ctx, &desc, Arc::new(mux.clone()))?;
        let events = mux.attach();
        drivers.insert(key.clone(), LiveEntry { collection: desc.collection.clone(), driver: driver.clone(), mux, observers: 1 });
        gauge!("live_queries", drivers.len() as f64);
        info!(collection = %desc.collection, live = drivers.len(), "live query registered");
        Ok(ObserveHandle::new(events, driver, key, &self.drivers))
    }

    /// Tie the writes just made to `collection` to `fence`: it will not fire
    /// before every live query on the collection has delivered them.
    pub fn notify_write(&self, collection: &str, fence: &WriteFence) -> Result<(), FenceError> {
        let targets: Vec<OplogDriver> = {
            let drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
            drivers.values().filter(|e| e.collection == collection).map(|e| e.driver.clone()).collect()
        };
        for driver in targets {
            let token = fence.begin_write()?;
            let tailer = self.ctx.tailer.clone();
            tokio::spawn(async move {
                tailer.wait_until_caught_up().await;
                driver.commit_when_steady(token);
            });
        }
        Ok(())
    }

    /// Number of running drivers.
    pub fn len(&self) -> usize {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// One observer's view of a live query. Dropping it detaches the observer;
/// the last detach stops the driver.
pub struct ObserveHandle {
    events: mpsc::UnboundedReceiver<ObserverEvent>,
    driver: OplogDriver,
    key: String,
    drivers: Weak<Mutex<Drivers>>,
    detached: bool,
}

impl ObserveHandle {
    fn new(events: mpsc::UnboundedReceiver<ObserverEvent>, driver: OplogDriver, key: String, drivers: &Arc<Mutex<Drivers>>) -> Self {
        Self { events, driver, key, drivers: Arc::downgrade(drivers), detached: false }
    }

    pub async fn recv(&mut self) -> Option<ObserverEvent> { self.events.recv().await }

    pub fn try_recv(&mut self) -> Option<ObserverEvent> { self.events.try_recv().ok() }

    /// Events as a stream; the observer stays attached until the stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = ObserverEvent> + Send + 'static {
        stream::unfold(self, |mut h| async move { h.recv().await.map(|ev| (ev, h)) })
    }

    /// The shared driver behind this observer.
    pub fn driver(&self) -> &OplogDriver { &self.driver }

    pub fn stop(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let Some(drivers) = self.drivers.upgrade() else { return; };
        let mut drivers = drivers.lock().unwrap_or_else(PoisonError::into_inner);
        let last = match drivers.get_mut(&self.key) {
            Some(entry) => {
                entry.observers -= 1;
                entry.observers == 0
            }
            None => false,
        };
        if last {
            if let Some(entry) = drivers.remove(&self.key) {
                entry.driver.stop();
                info!(collection = %entry.collection, live = drivers.len(), "live query stopped");
            }
            gauge!("live_queries", drivers.len() as f64);
        }
    }
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
