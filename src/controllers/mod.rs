//! Reconcilers for the hosted control plane.
//!
//! Each module binds one resource watch to one converge function behind the
//! [`Reconciler`](crate::engine::Reconciler) contract. The node label and
//! oauth certificate loops carry their full business rules; the remaining
//! loops own control flow only and take their rules as injected traits.

pub mod cluster_operator;
pub mod config_observer;
pub mod csr_approval;
pub mod managed_ca;
pub mod node_labels;
pub mod oauth_cert;
pub mod route_sync;

pub use cluster_operator::ClusterOperatorSyncer;
pub use config_observer::{ConfigObserver, ConfigSources};
pub use csr_approval::CsrApprover;
pub use managed_ca::ManagedCaObserver;
pub use node_labels::NodeLabelEnforcer;
pub use oauth_cert::OAuthCertRotator;
pub use route_sync::RouteMirror;
