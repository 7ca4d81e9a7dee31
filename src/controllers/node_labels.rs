//! Node label enforcement.
//!
//! Every node in the hosted cluster must carry the worker and master role
//! labels. This reconciler is additive-only: it adds whichever required
//! labels are missing and never removes or overwrites an existing value,
//! even when the value differs from the expected one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::engine::{ReconcileRequest, ReconcileResult, Reconciler, Store};
use crate::error::Error;

/// The required labels applied to every hosted-cluster node
pub fn default_required_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("node-role.kubernetes.io/worker".to_string(), String::new()),
        ("node-role.kubernetes.io/master".to_string(), String::new()),
    ])
}

/// Write path for node updates.
///
/// A trait seam so tests can assert exactly which update calls happen.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeWriter: Send + Sync {
    /// Full-object update with optimistic concurrency via the node's
    /// resource version
    async fn update_node(&self, node: &Node) -> Result<(), Error>;
}

/// Real node writer against the hosted cluster
pub struct NodeWriterImpl {
    client: Client,
}

impl NodeWriterImpl {
    /// Create a writer using the given hosted-cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeWriter for NodeWriterImpl {
    async fn update_node(&self, node: &Node) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.replace(&node.name_any(), &PostParams::default(), node)
            .await?;
        Ok(())
    }
}

/// Reconciler that enforces the required label set on hosted-cluster nodes
pub struct NodeLabelEnforcer {
    nodes: Store<Node>,
    writer: Arc<dyn NodeWriter>,
    required: BTreeMap<String, String>,
}

impl NodeLabelEnforcer {
    /// Create an enforcer over the given node cache and writer.
    ///
    /// The required label table is injected so it can vary per test case;
    /// production wiring passes [`default_required_labels`].
    pub fn new(
        nodes: Store<Node>,
        writer: Arc<dyn NodeWriter>,
        required: BTreeMap<String, String>,
    ) -> Self {
        Self {
            nodes,
            writer,
            required,
        }
    }

    fn missing_labels<'a>(&'a self, node: &Node) -> Vec<(&'a str, &'a str)> {
        let labels = node.metadata.labels.as_ref();
        self.required
            .iter()
            .filter(|(key, _)| !labels.is_some_and(|l| l.contains_key(*key)))
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }
}

#[async_trait]
impl Reconciler for NodeLabelEnforcer {
    #[instrument(skip(self), fields(node = %req.key))]
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error> {
        let node = self
            .nodes
            .get(&req.key)
            .ok_or_else(|| Error::not_found(&req.key))?;

        let missing = self.missing_labels(&node);
        if missing.is_empty() {
            return Ok(ReconcileResult::ok());
        }

        let mut updated = Node::clone(&node);
        let labels = updated.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in missing {
            labels.insert(key.to_string(), value.to_string());
        }

        info!("adding missing role labels");
        if let Err(e) = self.writer.update_node(&updated).await {
            error!(error = %e, "failed to update node labels");
            return Err(e);
        }
        Ok(ReconcileResult::ok())
    }
}
