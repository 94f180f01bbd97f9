//! Bounded worker pool for listener notifications
//!
//! Listener callbacks are synchronous and may block, so they run on the
//! blocking pool of a private tokio runtime. Shutdown first waits for
//! in-flight notifications to finish, then abandons whatever is still stuck.
//! It may be called from plain threads or from inside another tokio runtime.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::{info, warn};

use crate::error::{BookError, Result};

/// Count of notifications handed to the pool but not yet finished
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn exit(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Wait until nothing is in flight; false on timeout
    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Decrements the in-flight count even if the task is dropped unrun
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

pub struct NotificationPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    in_flight: Arc<InFlight>,
    accepting: AtomicBool,
    drain_timeout: Duration,
    force_timeout: Duration,
}

impl NotificationPool {
    pub fn new(workers: usize, drain_timeout: Duration, force_timeout: Duration) -> Result<Self> {
        if workers == 0 {
            return Err(BookError::ConfigError(
                "notification pool needs at least one worker".to_string(),
            ));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("book-notify")
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            in_flight: Arc::new(InFlight::default()),
            accepting: AtomicBool::new(true),
            drain_timeout,
            force_timeout,
        })
    }

    /// Queue a notification; returns false once the pool is shutting down
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }

        self.in_flight.enter();
        let guard = InFlightGuard(self.in_flight.clone());
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            task();
        });
        true
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting work, drain in-flight notifications, then force the rest
    ///
    /// Blocks for at most the drain plus force timeouts. Inside a
    /// multi-threaded runtime the wait moves off the async worker with
    /// `block_in_place`; inside a current-thread runtime the private runtime
    /// is released in the background after the drain. Safe to call twice.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);

        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        match Handle::try_current() {
            Err(_) => {
                self.drain();
                runtime.shutdown_timeout(self.force_timeout);
            }
            Ok(caller) if caller.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    self.drain();
                    runtime.shutdown_timeout(self.force_timeout);
                });
            }
            Ok(_) => {
                self.drain();
                runtime.shutdown_background();
            }
        }
    }

    fn drain(&self) {
        if self.in_flight.wait_idle(self.drain_timeout) {
            info!("Notification pool drained");
        } else {
            warn!(
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                pending = *self.in_flight.count.lock(),
                "Notification pool did not drain in time, forcing shutdown"
            );
        }
    }
}

impl Drop for NotificationPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}
