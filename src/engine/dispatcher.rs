//! Reconcile dispatcher: pulls keys from a work queue and drives a
//! [`Reconciler`] toward convergence.
//!
//! Per key the state machine is Idle -> Queued -> Processing -> Idle on
//! success (forget) or Queued-with-backoff on error/explicit requeue. The
//! queue's dirty/processing bookkeeping guarantees at most one in-flight
//! invocation per key regardless of the worker count, so reconcilers may rely
//! on single-flight-per-key as a contract, not an accident of configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::cache::ObjectKey;
use crate::engine::queue::WorkQueue;
use crate::error::Error;

/// A request to reconcile one resource.
///
/// Carries only the key: reconcilers must re-read current state from their
/// cache or the API, never from the event that triggered the dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileRequest {
    /// Key of the resource to converge
    pub key: ObjectKey,
}

impl ReconcileRequest {
    /// Namespace component of the key
    pub fn namespace(&self) -> Option<&str> {
        self.key.namespace.as_deref()
    }

    /// Name component of the key
    pub fn name(&self) -> &str {
        &self.key.name
    }
}

/// Outcome of one reconcile invocation, consumed immediately by the
/// dispatcher to decide the key's next queue placement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue with rate-limited backoff even though no error occurred
    pub requeue: bool,
    /// Requeue after a fixed delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Converged: forget the key's backoff and go idle
    pub fn ok() -> Self {
        Self::default()
    }

    /// Ask for redelivery with backoff
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Ask for redelivery after a fixed delay
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// A pure convergence function bound to one controller.
///
/// Contract: at most one invocation per key is in flight at any time.
/// Invocations must be idempotent; the same key may be redelivered at any
/// time (resync, coalesced events, retries) with no observable drift.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the resource named by `req` toward its desired state
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error>;
}

/// One controller: a work queue, a reconciler, and the worker loop gluing
/// them together.
pub struct Controller {
    name: String,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    ready_gates: Vec<watch::Receiver<bool>>,
}

impl Controller {
    /// Create a controller with a single worker (the default everywhere in
    /// this operator; reconciliation within a controller is serialized)
    pub fn new(
        name: impl Into<String>,
        queue: Arc<WorkQueue>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            reconciler,
            workers: 1,
            ready_gates: Vec::new(),
        }
    }

    /// Set the worker count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Add a readiness gate; the controller will not dispatch any work until
    /// every gate reads true (e.g. all source caches have completed their
    /// initial sync).
    pub fn wait_for(mut self, gate: watch::Receiver<bool>) -> Self {
        self.ready_gates.push(gate);
        self
    }

    /// Add readiness gates for several source caches at once
    pub fn wait_for_all(mut self, gates: impl IntoIterator<Item = watch::Receiver<bool>>) -> Self {
        self.ready_gates.extend(gates);
        self
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// On shutdown the queue stops accepting work, in-flight reconciles
    /// drain to completion, and the workers exit.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let name = self.name.clone();

        for mut gate in self.ready_gates {
            let mut shutdown = shutdown.clone();
            tokio::select! {
                res = gate.wait_for(|ready| *ready) => {
                    if res.is_err() {
                        warn!(controller = %name, "readiness gate closed, not starting");
                        return;
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
        }
        info!(controller = %name, workers = self.workers, "starting workers");

        // Relay shutdown into the queue so blocked workers wake and drain
        {
            let queue = Arc::clone(&self.queue);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                queue.shut_down();
            });
        }

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(&name, queue, reconciler).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(controller = %name, "workers stopped");
    }
}

async fn worker_loop(name: &str, queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconciler>) {
    while let Some(key) = queue.get().await {
        let req = ReconcileRequest { key: key.clone() };
        match reconciler.reconcile(req).await {
            Err(e) => {
                warn!(
                    controller = %name,
                    key = %key,
                    error = %e,
                    retries = queue.retries(&key),
                    "reconcile failed, requeueing with backoff"
                );
                queue.add_rate_limited(key.clone());
            }
            Ok(result) => {
                if let Some(delay) = result.requeue_after {
                    debug!(controller = %name, key = %key, delay_ms = delay.as_millis() as u64, "requeue after delay");
                    queue.add_after(key.clone(), delay);
                } else if result.requeue {
                    queue.add_rate_limited(key.clone());
                } else {
                    queue.forget(&key);
                }
            }
        }
        queue.done(&key);
    }
}
