//! Observation of the hosted cluster's managed CA config maps.
//!
//! Only two sources in `openshift-config-managed` matter, the router CA and
//! the service CA. Notifications for any other config map in the namespace
//! pass through untouched. How the source certificates combine with the
//! control plane's own initial CA is an injected merge, and publishing the
//! combined bundle is a writer seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::engine::{ObjectKey, ReconcileRequest, ReconcileResult, Reconciler, Store};
use crate::error::Error;

/// Namespace holding the managed CA config maps on the hosted cluster
pub const MANAGED_CA_NAMESPACE: &str = "openshift-config-managed";
/// The watched CA sources, by config map name
pub const MANAGED_CA_SOURCES: [&str; 2] = ["router-ca", "service-ca"];
/// Key under which each source publishes its certificate
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Combines the initial CA with the currently observed source certificates.
///
/// `sources` maps source config map name to its certificate payload; sources
/// that are absent from the cluster are absent from the map.
#[cfg_attr(test, automock)]
pub trait CaMerger: Send + Sync {
    fn merge(&self, initial_ca: &str, sources: &BTreeMap<String, String>) -> String;
}

/// Publishes the combined CA bundle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaBundleWriter: Send + Sync {
    async fn publish(&self, bundle: &str) -> Result<(), Error>;
}

/// Writer that patches the bundle into a control-plane config map
pub struct CaBundleWriterImpl {
    client: Client,
    namespace: String,
    config_map: String,
}

impl CaBundleWriterImpl {
    pub fn new(client: Client, namespace: impl Into<String>, config_map: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config_map: config_map.into(),
        }
    }
}

#[async_trait]
impl CaBundleWriter for CaBundleWriterImpl {
    async fn publish(&self, bundle: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = json!({ "data": { CA_BUNDLE_KEY: bundle } });
        api.patch(
            &self.config_map,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Default merge: initial CA first, then each source bundle in name order
pub struct ConcatMerger;

impl CaMerger for ConcatMerger {
    fn merge(&self, initial_ca: &str, sources: &BTreeMap<String, String>) -> String {
        let mut bundle = String::from(initial_ca.trim_end());
        for cert in sources.values() {
            if !bundle.is_empty() {
                bundle.push('\n');
            }
            bundle.push_str(cert.trim_end());
        }
        bundle
    }
}

/// Reconciler that republishes the combined CA bundle when a source changes
pub struct ManagedCaObserver {
    config_maps: Store<ConfigMap>,
    initial_ca: String,
    merger: Arc<dyn CaMerger>,
    writer: Arc<dyn CaBundleWriter>,
}

impl ManagedCaObserver {
    pub fn new(
        config_maps: Store<ConfigMap>,
        initial_ca: impl Into<String>,
        merger: Arc<dyn CaMerger>,
        writer: Arc<dyn CaBundleWriter>,
    ) -> Self {
        Self {
            config_maps,
            initial_ca: initial_ca.into(),
            merger,
            writer,
        }
    }

    fn is_source(key: &ObjectKey) -> bool {
        key.namespace.as_deref() == Some(MANAGED_CA_NAMESPACE)
            && MANAGED_CA_SOURCES.contains(&key.name.as_str())
    }

    fn observed_sources(&self) -> BTreeMap<String, String> {
        let mut sources = BTreeMap::new();
        for name in MANAGED_CA_SOURCES {
            let key = ObjectKey::namespaced(MANAGED_CA_NAMESPACE, name);
            let Some(cm) = self.config_maps.get(&key) else {
                continue;
            };
            if let Some(cert) = cm.data.as_ref().and_then(|d| d.get(CA_BUNDLE_KEY)) {
                sources.insert(name.to_string(), cert.clone());
            }
        }
        sources
    }
}

#[async_trait]
impl Reconciler for ManagedCaObserver {
    #[instrument(skip(self), fields(config_map = %req.key))]
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error> {
        if !Self::is_source(&req.key) {
            return Ok(ReconcileResult::ok());
        }

        // A deleted source simply drops out of the merge input
        let sources = self.observed_sources();
        let bundle = self.merger.merge(&self.initial_ca, &sources);
        self.writer.publish(&bundle).await?;
        info!(sources = sources.len(), "published combined CA bundle");
        Ok(ReconcileResult::ok())
    }
}
