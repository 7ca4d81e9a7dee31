//! Hosted control plane operator.
//!
//! Runs the control-plane-side reconciliation loops for one hosted cluster:
//! the operator watches resources on the hosted (target) cluster and keeps
//! dependent state converged across both the hosted cluster and the
//! management cluster's control-plane namespace.
//!
//! # Architecture
//!
//! Every loop is the same three-piece machine:
//! - a [`engine::Cache`] mirrors one watched resource collection and turns
//!   every change into a key notification,
//! - a [`engine::WorkQueue`] deduplicates notifications and rate-limits
//!   failing keys,
//! - a [`engine::Controller`] dispatches keys to a [`engine::Reconciler`],
//!   which reads cached state and writes the converged result.
//!
//! Reconcilers are level-triggered: they receive only a key, never the event
//! that produced it, and must converge from observed state alone.
//!
//! # Modules
//!
//! - [`engine`] - cache, work queue, and dispatcher shared by every loop
//! - [`controllers`] - the reconcilers themselves
//! - [`pki`] - certificate authority operations for serving cert rotation
//! - [`error`] - error types for the operator

pub mod controllers;
pub mod engine;
pub mod error;
pub mod pki;

pub use error::Error;

/// Convenience alias used throughout the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;
