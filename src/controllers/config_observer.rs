//! Multi-source observation of hosted-cluster configuration.
//!
//! Several cluster-scoped configuration kinds plus a set of config maps feed
//! one observed-config document. The merge logic for each concern is an
//! injected observer; the reconciler runs every observer over the current
//! caches and publishes the combined document. Because a partially-synced
//! source would make observers drop configuration they simply have not seen
//! yet, the controller running this reconciler must gate on every source
//! cache (see [`ConfigObserver::ready_gates`]).

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::engine::{ReconcileRequest, ReconcileResult, Reconciler, Store};
use crate::error::Error;

/// API coordinates for a cluster-scoped `config.openshift.io/v1` kind
pub fn config_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: "config.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "config.openshift.io/v1".to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Read handles over every source cache feeding the observed config
pub struct ConfigSources {
    pub images: Store<DynamicObject>,
    pub builds: Store<DynamicObject>,
    pub networks: Store<DynamicObject>,
    pub config_maps: Store<ConfigMap>,
}

/// Merges one configuration concern into the observed document
#[cfg_attr(test, automock)]
pub trait Observer: Send + Sync {
    fn observe(&self, sources: &ConfigSources, observed: &mut Value) -> Result<(), Error>;
}

/// Publishes the combined observed config
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObservedConfigWriter: Send + Sync {
    async fn write(&self, config: &Value) -> Result<(), Error>;
}

/// Writer that patches the document into a control-plane config map
pub struct ObservedConfigWriterImpl {
    client: Client,
    namespace: String,
    config_map: String,
    key: String,
}

impl ObservedConfigWriterImpl {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config_map: config_map.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl ObservedConfigWriter for ObservedConfigWriterImpl {
    async fn write(&self, config: &Value) -> Result<(), Error> {
        let serialized =
            serde_json::to_string(config).map_err(|e| Error::serialization(e.to_string()))?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = json!({ "data": { &self.key: serialized } });
        api.patch(
            &self.config_map,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Observer for the cluster image configuration's internal registry hostname
pub struct RegistryHostnameObserver;

impl Observer for RegistryHostnameObserver {
    fn observe(&self, sources: &ConfigSources, observed: &mut Value) -> Result<(), Error> {
        use crate::engine::ObjectKey;

        // The image config is a singleton named "cluster"
        let Some(image_config) = sources.images.get(&ObjectKey::cluster_scoped("cluster")) else {
            return Ok(());
        };
        let Some(hostname) = image_config
            .data
            .pointer("/status/internalRegistryHostname")
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        observed["imageConfig"] = json!({ "internalRegistryHostname": hostname });
        Ok(())
    }
}

/// Reconciler that rebuilds the observed config from all sources
pub struct ConfigObserver {
    sources: ConfigSources,
    observers: Vec<Arc<dyn Observer>>,
    writer: Arc<dyn ObservedConfigWriter>,
}

impl ConfigObserver {
    pub fn new(
        sources: ConfigSources,
        observers: Vec<Arc<dyn Observer>>,
        writer: Arc<dyn ObservedConfigWriter>,
    ) -> Self {
        Self {
            sources,
            observers,
            writer,
        }
    }

    /// One readiness gate per source cache.
    ///
    /// Wire all of these into the controller so no observer runs over a
    /// cache that has not completed its initial list.
    pub fn ready_gates(&self) -> Vec<watch::Receiver<bool>> {
        vec![
            self.sources.images.synced(),
            self.sources.builds.synced(),
            self.sources.networks.synced(),
            self.sources.config_maps.synced(),
        ]
    }
}

#[async_trait]
impl Reconciler for ConfigObserver {
    #[instrument(skip(self), fields(source = %req.key))]
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error> {
        let mut observed = Value::Object(Map::new());
        for observer in &self.observers {
            observer.observe(&self.sources, &mut observed)?;
        }
        self.writer.write(&observed).await?;
        info!("published observed configuration");
        Ok(ReconcileResult::ok())
    }
}
