//! Mirroring of hosted-cluster routes into the control-plane namespace.
//!
//! Routes come through [`DynamicObject`] since the kind lives outside the
//! core API groups. The shape of the mirrored copy is an injected transform;
//! the reconciler handles the lifecycle (create or update on change, delete
//! of the mirror when the source route disappears).

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::engine::{ObjectKey, ReconcileRequest, ReconcileResult, Reconciler, Store};
use crate::error::Error;

/// API coordinates of the `route.openshift.io/v1 Route` kind
pub fn route_resource() -> ApiResource {
    ApiResource {
        group: "route.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "route.openshift.io/v1".to_string(),
        kind: "Route".to_string(),
        plural: "routes".to_string(),
    }
}

/// Produces the mirrored copy of a source route.
///
/// Returning `None` declines the route; its mirror, if any, is removed.
#[cfg_attr(test, automock)]
pub trait RouteTransform: Send + Sync {
    fn transform(&self, route: &DynamicObject) -> Option<DynamicObject>;
}

/// Applies and removes mirrored routes on the host cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteWriter: Send + Sync {
    async fn apply(&self, route: &DynamicObject) -> Result<(), Error>;
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;
}

/// Writer over the control-plane namespace on the host cluster
pub struct RouteWriterImpl {
    client: Client,
    namespace: String,
}

impl RouteWriterImpl {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &route_resource())
    }
}

#[async_trait]
impl RouteWriter for RouteWriterImpl {
    async fn apply(&self, route: &DynamicObject) -> Result<(), Error> {
        self.api()
            .patch(
                &route.name_any(),
                &PatchParams::apply("hcp-operator").force(),
                &Patch::Apply(route),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        match self.api().delete(&key.name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Default transform: same route, rehomed into the mirror namespace.
///
/// Cluster-assigned metadata is cleared so the copy applies cleanly on the
/// host cluster; the route status stays behind on the source.
pub struct NamespaceRewriteTransform {
    namespace: String,
}

impl NamespaceRewriteTransform {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl RouteTransform for NamespaceRewriteTransform {
    fn transform(&self, route: &DynamicObject) -> Option<DynamicObject> {
        let mut mirrored = route.clone();
        mirrored.metadata.namespace = Some(self.namespace.clone());
        mirrored.metadata.resource_version = None;
        mirrored.metadata.uid = None;
        mirrored.metadata.managed_fields = None;
        mirrored.metadata.owner_references = None;
        if let Some(map) = mirrored.data.as_object_mut() {
            map.remove("status");
        }
        Some(mirrored)
    }
}

/// Reconciler that keeps one mirrored route per source route
pub struct RouteMirror {
    routes: Store<DynamicObject>,
    transform: Arc<dyn RouteTransform>,
    writer: Arc<dyn RouteWriter>,
}

impl RouteMirror {
    pub fn new(
        routes: Store<DynamicObject>,
        transform: Arc<dyn RouteTransform>,
        writer: Arc<dyn RouteWriter>,
    ) -> Self {
        Self {
            routes,
            transform,
            writer,
        }
    }
}

#[async_trait]
impl Reconciler for RouteMirror {
    #[instrument(skip(self), fields(route = %req.key))]
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error> {
        let Some(route) = self.routes.get(&req.key) else {
            // Source route is gone, remove its mirror
            self.writer.delete(&req.key).await?;
            info!("removed mirrored route");
            return Ok(ReconcileResult::ok());
        };

        let Some(mirrored) = self.transform.transform(&route) else {
            return Ok(ReconcileResult::ok());
        };
        self.writer.apply(&mirrored).await?;
        info!("applied mirrored route");
        Ok(ReconcileResult::ok())
    }
}
