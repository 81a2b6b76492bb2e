//! Threads and runtimes of a backplane instance.
//!
//! Each consume loop runs on its own [`DedicatedLoop`]: a named OS thread
//! that lives for the whole process and never shares a scheduler with other
//! work, because a blocking poll would otherwise starve a task pool or be
//! starved by it. A small tokio runtime (the control runtime) serves the
//! health surface and session channels.
//!
//! # Example
//!
//! ```rust,no_run
//! use chat_backplane::runtime::{BackplaneRuntime, RuntimeConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut runtime = BackplaneRuntime::new(RuntimeConfig::default())?;
//!     runtime.spawn_loop("receivers", |cancel| {
//!         while !cancel.is_cancelled() {
//!             // poll, process, commit
//!         }
//!         Ok(())
//!     })?;
//!     runtime.cancel_token().cancel();
//!     runtime.join_loops();
//!     Ok(())
//! }
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backplane::producer::EnvelopeProducer;
use crate::error::{Error, Result};
use crate::metrics;

/// Health flags of one dedicated loop.
#[derive(Debug)]
pub struct LoopHealth {
    name: String,
    started: AtomicBool,
    healthy: AtomicBool,
    rebalancing: AtomicBool,
}

/// Point-in-time copy of a [`LoopHealth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub name: String,
    pub started: bool,
    pub healthy: bool,
    pub rebalancing: bool,
}

impl LoopStatus {
    pub fn is_ready(&self) -> bool {
        self.started && self.healthy && !self.rebalancing
    }
}

impl LoopHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            rebalancing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
        metrics::set_loop_healthy(&self.name, true);
    }

    /// Once stopped a loop stays unhealthy; loops are never restarted in process.
    pub fn mark_stopped(&self) {
        self.healthy.store(false, Ordering::Release);
        metrics::set_loop_healthy(&self.name, false);
    }

    pub fn set_rebalancing(&self, rebalancing: bool) {
        self.rebalancing.store(rebalancing, Ordering::Release);
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::Acquire)
    }

    /// Started, still running and not in the middle of a rebalance.
    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            name: self.name.clone(),
            started: self.has_started(),
            healthy: self.is_healthy(),
            rebalancing: self.is_rebalancing(),
        }
    }
}

/// All loops of the process, read by the health surface.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    loops: RwLock<Vec<Arc<LoopHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>) -> Arc<LoopHealth> {
        let health = Arc::new(LoopHealth::new(name));
        self.loops.write().push(Arc::clone(&health));
        health
    }

    pub fn statuses(&self) -> Vec<LoopStatus> {
        self.loops.read().iter().map(|h| h.status()).collect()
    }

    /// Ready when at least one loop is registered and every loop is ready.
    pub fn is_ready(&self) -> bool {
        let loops = self.loops.read();
        !loops.is_empty() && loops.iter().all(|h| h.is_ready())
    }

    /// Live unless a loop that started has since stopped.
    pub fn is_live(&self) -> bool {
        self.loops
            .read()
            .iter()
            .all(|h| !h.has_started() || h.is_healthy())
    }
}

/// Flips the loop unhealthy when its thread exits, including by panic.
struct StopGuard<'a>(&'a LoopHealth);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(loop_name = self.0.name(), "Dedicated loop panicked; not ready until restart");
        }
        self.0.mark_stopped();
    }
}

/// A long-lived worker thread running one loop body.
pub struct DedicatedLoop {
    health: Arc<LoopHealth>,
    handle: Option<JoinHandle<()>>,
}

impl DedicatedLoop {
    /// Start `body` on a new thread named after the loop.
    ///
    /// An error returned by `body` is logged and ends the loop. There is no
    /// in-process restart.
    pub fn spawn<F>(health: Arc<LoopHealth>, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let thread_health = Arc::clone(&health);
        let handle = thread::Builder::new()
            .name(health.name().to_string())
            .spawn(move || {
                let _guard = StopGuard(&thread_health);
                thread_health.mark_started();
                info!(loop_name = thread_health.name(), "Dedicated loop started");
                match body() {
                    Ok(()) => info!(loop_name = thread_health.name(), "Dedicated loop exited"),
                    Err(e) => error!(
                        loop_name = thread_health.name(),
                        error = %e,
                        "Dedicated loop failed; not ready until restart"
                    ),
                }
            })?;

        Ok(Self {
            health,
            handle: Some(handle),
        })
    }

    pub fn health(&self) -> &Arc<LoopHealth> {
        &self.health
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the thread to exit. Returns false if it panicked.
    pub fn join(mut self) -> bool {
        match self.handle.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

/// Configuration of the control runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads of the control runtime.
    ///
    /// Default: 1
    pub control_threads: usize,

    /// Thread name prefix for control runtime threads.
    ///
    /// Default: "ctrl"
    pub control_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_threads: crate::constants::DEFAULT_CONTROL_THREADS,
            control_thread_name: "ctrl".to_string(),
        }
    }
}

/// Owns the control runtime, the dedicated loops and their shutdown signal.
pub struct BackplaneRuntime {
    control: Runtime,
    cancel: CancellationToken,
    health: Arc<HealthRegistry>,
    loops: Vec<DedicatedLoop>,
}

impl BackplaneRuntime {
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let control = Builder::new_multi_thread()
            .worker_threads(config.control_threads)
            .thread_name(&config.control_thread_name)
            .enable_all()
            .build()?;

        Ok(Self {
            control,
            cancel: CancellationToken::new(),
            health: Arc::new(HealthRegistry::new()),
            loops: Vec::new(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.control.handle().clone()
    }

    pub fn block_on_control<F: std::future::Future>(&self, future: F) -> F::Output {
        self.control.block_on(future)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        Arc::clone(&self.health)
    }

    /// Register loop health for `name` without starting anything yet.
    ///
    /// Used when the loop body needs its health handle before it is spawned.
    pub fn register_loop(&self, name: &str) -> Arc<LoopHealth> {
        self.health.register(name)
    }

    /// Register and start a loop. The body receives the shared cancellation
    /// token.
    pub fn spawn_loop<F>(&mut self, name: &str, body: F) -> Result<Arc<LoopHealth>>
    where
        F: FnOnce(CancellationToken) -> Result<()> + Send + 'static,
    {
        let health = self.health.register(name);
        self.spawn_registered(Arc::clone(&health), body)?;
        Ok(health)
    }

    /// Start a loop whose health was obtained from [`register_loop`](Self::register_loop).
    pub fn spawn_registered<F>(&mut self, health: Arc<LoopHealth>, body: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Result<()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let cancel = self.cancel.clone();
        self.loops.push(DedicatedLoop::spawn(health, move || body(cancel))?);
        Ok(())
    }

    /// Wait for every loop thread to exit.
    pub fn join_loops(&mut self) {
        for worker in self.loops.drain(..) {
            let name = worker.health().name().to_string();
            if !worker.join() {
                warn!(loop_name = %name, "Dedicated loop thread panicked");
            }
        }
    }

    /// Cancel every loop, wait for them, then flush `producer` before the
    /// control runtime is released.
    pub fn shutdown(mut self, producer: &dyn EnvelopeProducer, flush_timeout: Duration) {
        info!(loops = self.loops.len(), "Shutting down backplane");
        self.cancel.cancel();
        self.join_loops();
        // Failures are logged by flush_pending.
        let _ = producer.flush_pending(flush_timeout);
        self.control.shutdown_timeout(Duration::from_secs(1));
        info!("Backplane stopped");
    }
}
