//! Serialized delivery of callbacks
//!
//! Work finishing on background tasks hands its callbacks to a [`Dispatcher`].
//! The application decides where they run by driving the matching
//! [`DispatchPump`], either on each tick of its own loop with
//! [`drain`][DispatchPump::drain] or as a dedicated task with
//! [`run`][DispatchPump::run]. Jobs run one at a time in the order they were
//! enqueued.

use std::fmt;

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Creates a connected dispatcher and pump
pub fn channel() -> (Dispatcher, DispatchPump) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { tx }, DispatchPump { rx })
}

/// Enqueues jobs from any thread or task
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Dispatcher {
    /// Enqueues a job to be run by the pump
    ///
    /// Returns `false` if the pump has been dropped, in which case the job is
    /// discarded.
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::warn!("dispatch pump is gone; discarding job");
            false
        } else {
            true
        }
    }
}

/// Runs enqueued jobs
///
/// A job never runs inside another job; jobs enqueued while a job runs are
/// run after it returns.
pub struct DispatchPump {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl fmt::Debug for DispatchPump {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DispatchPump").finish_non_exhaustive()
    }
}

impl DispatchPump {
    /// Runs every job currently queued, including any enqueued while draining
    ///
    /// Returns the number of jobs run.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(jobs = ran, "drained dispatch queue");
        }
        ran
    }

    /// Runs jobs as they arrive until every dispatcher has been dropped
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job();
        }
        tracing::debug!("all dispatchers dropped; dispatch pump stopping");
    }
}
