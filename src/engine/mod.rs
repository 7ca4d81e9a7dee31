//! Level-triggered reconciliation engine shared by every controller.
//!
//! Each controller owns one [`Cache`] (a watch-backed mirror of a resource
//! collection), one [`WorkQueue`] (deduplicated pending keys with per-key
//! backoff), and one [`Controller`] dispatch loop binding the queue to a
//! [`Reconciler`]. Controllers share no locks with each other; the remote
//! API clients they use are safe for concurrent use and enforce optimistic
//! concurrency through object versioning, so lost version races surface as
//! write errors handled purely by the retry path.

mod cache;
mod dispatcher;
mod queue;

pub use cache::{Cache, ObjectKey, Store, DEFAULT_RESYNC};
pub use dispatcher::{Controller, ReconcileRequest, ReconcileResult, Reconciler};
pub use queue::{WorkQueue, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
