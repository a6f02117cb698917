//! Write fences.
//!
//! A writer opens a fence, performs its writes, lets every live query
//! affected by them take a [`WriteToken`], then arms the fence and waits.
//! The fence fires once it is armed and every token has been committed,
//! which means every affected query has delivered the write to its
//! observers.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FenceError {
    #[error("fence has already fired")]
    AlreadyFired,
}

#[derive(Default)]
struct FenceState {
    outstanding: usize,
    armed: bool,
    fired: bool,
    before_fire: Vec<Callback>,
    all_committed: Vec<Callback>,
}

struct Inner {
    state: Mutex<FenceState>,
    fired_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct WriteFence {
    inner: Arc<Inner>,
}

/// One outstanding write. Dropping an uncommitted token commits it, so a
/// query torn down mid-write cannot wedge the fence.
pub struct WriteToken {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for WriteToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteToken").field("committed", &self.inner.is_none()).finish()
    }
}

impl Default for WriteFence {
    fn default() -> Self { Self::new() }
}

impl WriteFence {
    pub fn new() -> Self {
        let (fired_tx, _) = watch::channel(false);
        Self { inner: Arc::new(Inner { state: Mutex::new(FenceState::default()), fired_tx }) }
    }

    pub fn begin_write(&self) -> Result<WriteToken, FenceError> {
        let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.fired {
            return Err(FenceError::AlreadyFired);
        }
        st.outstanding += 1;
        Ok(WriteToken { inner: Some(Arc::clone(&self.inner)) })
    }

    /// Run `f` right before the fence fires. Callbacks may begin further
    /// writes; the fence then waits for those too.
    pub fn on_before_fire(&self, f: impl FnOnce() + Send + 'static) -> Result<(), FenceError> {
        let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.fired {
            return Err(FenceError::AlreadyFired);
        }
        st.before_fire.push(Box::new(f));
        Ok(())
    }

    /// Run `f` once the fence fires (immediately if it already has).
    pub fn on_all_committed(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut st = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !st.fired {
                st.all_committed.push(Box::new(f));
                return;
            }
        }
        f();
    }

    pub fn arm(&self) {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).armed = true;
        self.inner.maybe_fire();
    }

    pub async fn arm_and_wait(&self) {
        let mut rx = self.inner.fired_tx.subscribe();
        self.arm();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn fired(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).fired
    }

    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner).outstanding
    }
}

impl WriteToken {
    pub fn committed(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.state.lock().unwrap_or_else(PoisonError::into_inner).outstanding -= 1;
            inner.maybe_fire();
        }
    }
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.commit();
    }
}

impl Inner {
    fn maybe_fire(&self) {
        loop {
            let before = {
                let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if st.fired || !st.armed || st.outstanding > 0 {
                    return;
                }
                std::mem::take(&mut st.before_fire)
            };
            if !before.is_empty() {
                for f in before {
                    f();
                }
                continue;
            }
            let committed = {
                let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if st.outstanding > 0 || !st.before_fire.is_empty() {
                    continue;
                }
                st.fired = true;
                std::mem::take(&mut st.all_committed)
            };
            for f in committed {
                f();
            }
            self.fired_tx.send_replace(true);
            return;
        }
    }
}
