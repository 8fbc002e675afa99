//! Periodic registry update thread
//!
//! Drives [`Registry::update_listeners`] on a fixed interval from a dedicated
//! thread, so listener callbacks run off the application's threads.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ APPLICATION THREADS                          │
//! │   visit_line() / add_visits()   (wait-free)  │
//! └──────────────────────────────────────────────┘
//!                     │ counters
//!                     ▼
//! ┌──────────────────────────────────────────────┐
//! │ UPDATE THREAD                                │
//! │   loop {                                     │
//! │     wait(interval) or stop signal            │
//! │     registry.update_listeners(&mut buffer)   │
//! │   }                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Stopping wakes the thread immediately; a cycle already running completes
//! first.

use crate::registry::{Registry, SourceCounts};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Handle to a running update thread; stops the thread when dropped
pub struct UpdateLoop {
    handle: Option<JoinHandle<()>>,
    stop: Option<Sender<()>>,
    cycles: Arc<AtomicU64>,
}

impl UpdateLoop {
    /// Start updating `registry` every `interval`
    ///
    /// The first cycle runs one interval after the start.
    pub fn spawn(registry: Arc<Registry>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let cycles = Arc::new(AtomicU64::new(0));

        let worker_cycles = cycles.clone();
        let handle = thread::Builder::new()
            .name("linescope-update".to_string())
            .spawn(move || {
                let mut delta = SourceCounts::new();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let changed = registry.update_listeners(&mut delta);
                            worker_cycles.fetch_add(1, Ordering::Relaxed);
                            trace!(lines = changed, "update cycle");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Update loop stopped");
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "Update loop started");
        Ok(Self {
            handle: Some(handle),
            stop: Some(stop_tx),
            cycles,
        })
    }

    /// Number of completed update cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UpdateLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
