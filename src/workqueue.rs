use crate::error::TtmResult;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct WorkState {
    /// When the queued run is due. `None` when nothing is queued.
    due: Option<Instant>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WorkState>,
    cond: Condvar,
}

/// A background thread running one job after a delay, at most once per
/// scheduling.
#[derive(Debug)]
pub(crate) struct DelayedWork {
    shared: Arc<Shared>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedWork {
    /// Starts the worker thread. `work` runs on it each time a scheduled delay
    /// expires.
    pub(crate) fn spawn(name: &str, work: impl Fn() + Send + 'static) -> TtmResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Self::worker_loop(&worker_shared, &work))?;
        debug!(name, "Started worker");

        Ok(Self {
            shared,
            worker_handle: Mutex::new(Some(handle)),
        })
    }

    /// A queue with no thread behind it. Scheduled work never runs.
    pub(crate) fn idle() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            worker_handle: Mutex::new(None),
        }
    }

    fn worker_loop(shared: &Shared, work: &dyn Fn()) {
        loop {
            {
                let mut st = shared.state.lock();
                loop {
                    if st.stopped {
                        return;
                    }
                    match st.due {
                        None => shared.cond.wait(&mut st),
                        Some(at) if Instant::now() >= at => {
                            st.due = None;
                            break;
                        }
                        Some(at) => {
                            shared.cond.wait_until(&mut st, at);
                        }
                    }
                }
            }
            trace!("Running delayed work");
            work();
        }
    }

    /// Queues a run `delay` from now. Returns `false` if one is already
    /// queued or the worker stopped.
    pub(crate) fn schedule(&self, delay: Duration) -> bool {
        let mut st = self.shared.state.lock();
        if st.stopped || st.due.is_some() {
            return false;
        }
        st.due = Some(Instant::now() + delay);
        self.shared.cond.notify_all();
        true
    }

    /// Drops a queued run. Returns whether one was pending.
    pub(crate) fn cancel(&self) -> bool {
        self.shared.state.lock().due.take().is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.shared.state.lock().due.is_some()
    }

    /// Stops the worker and joins it, unless called from the worker itself.
    pub(crate) fn stop(&self) {
        {
            let mut st = self.shared.state.lock();
            st.stopped = true;
            st.due = None;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker_handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.stop();
    }
}
