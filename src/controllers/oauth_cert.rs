//! Hash-gated rotation of the oauth server's serving certificate.
//!
//! The hosted cluster's router certificate secret is the source of truth for
//! the ingress CA. Whenever its content hash stops matching the hash
//! annotation on the oauth deployment's pod template, this reconciler derives
//! a CA from the secret, issues a fresh serving certificate for the oauth
//! external address, rewrites the serving secret, and finally stamps the new
//! hash onto the pod template - the pod-template change is what makes the
//! rollout controller restart the oauth server with the new certificate.
//!
//! The serving secret is written before the deployment on purpose: a crash
//! between the two writes leaves the annotation stale, so the next reconcile
//! regenerates and rewrites the certificate until the deployment write lands.
//! The consumer only needs some certificate signed by the current CA, so the
//! repeated regeneration is wasted work, not a correctness problem.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::engine::{ObjectKey, ReconcileRequest, ReconcileResult, Reconciler, Store};
use crate::error::Error;
use crate::pki::CertificateAuthority;

/// Namespace holding the router certificate secret on the hosted cluster
pub const INGRESS_NAMESPACE: &str = "openshift-ingress";
/// The one secret this reconciler acts on
pub const ROUTER_CERTS_SECRET: &str = "router-certs-default";
/// Deployment whose pod template carries the hash annotation
pub const OAUTH_DEPLOYMENT: &str = "oauth-openshift";
/// ConfigMap holding the oauth server's external address
pub const OAUTH_CONFIG_MAP: &str = "oauth-openshift";
/// Secret receiving the generated serving certificate
pub const OAUTH_SERVING_SECRET: &str = "oauth-openshift";
/// Pod-template annotation carrying the router cert content hash
pub const CERT_HASH_ANNOTATION: &str = "hypershift.openshift.io/router-cert-hash";
/// ConfigMap key naming the externally reachable oauth address
pub const EXTERNAL_ADDRESS_KEY: &str = "externalAddress";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const SERVER_CERT_KEY: &str = "server.crt";
const SERVER_KEY_KEY: &str = "server.key";

/// Content hash over the full raw key/value byte map of a secret.
///
/// The map is a `BTreeMap`, so serialization order is key-sorted and the
/// digest is canonical: equal content always yields an equal hash.
pub fn content_hash(data: &BTreeMap<String, ByteString>) -> Result<String, Error> {
    let bytes = serde_json::to_vec(data).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Management-cluster API access scoped to the control-plane namespace.
///
/// A trait seam so tests can script reads and assert write ordering.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Read a secret from the control-plane namespace
    async fn get_secret(&self, name: &str) -> Result<Secret, Error>;
    /// Full-object secret update
    async fn update_secret(&self, secret: &Secret) -> Result<(), Error>;
    /// Read a config map from the control-plane namespace
    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, Error>;
    /// Read a deployment from the control-plane namespace
    async fn get_deployment(&self, name: &str) -> Result<Deployment, Error>;
    /// Full-object deployment update
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error>;
}

/// Real management-cluster client bound to one control-plane namespace
pub struct ControlPlaneClientImpl {
    client: Client,
    namespace: String,
}

impl ControlPlaneClientImpl {
    /// Create a client for the given control-plane namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ControlPlaneClient for ControlPlaneClientImpl {
    async fn get_secret(&self, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get(name).await?)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        api.replace(&secret.name_any(), &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get(name).await?)
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get(name).await?)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        api.replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?;
        Ok(())
    }
}

/// Reconciler that rotates the oauth serving certificate when the router
/// certificate secret changes
pub struct OAuthCertRotator {
    router_secrets: Store<Secret>,
    client: Arc<dyn ControlPlaneClient>,
}

impl OAuthCertRotator {
    /// Create a rotator over the hosted-cluster secret cache and the
    /// management-cluster client
    pub fn new(router_secrets: Store<Secret>, client: Arc<dyn ControlPlaneClient>) -> Self {
        Self {
            router_secrets,
            client,
        }
    }

    fn router_secret_key() -> ObjectKey {
        ObjectKey::namespaced(INGRESS_NAMESPACE, ROUTER_CERTS_SECRET)
    }
}

#[async_trait]
impl Reconciler for OAuthCertRotator {
    #[instrument(skip(self), fields(secret = %req.key))]
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error> {
        // The watch covers the whole namespace; processing scope is just the
        // router certificate secret.
        if req.key != Self::router_secret_key() {
            return Ok(ReconcileResult::ok());
        }

        // Not present yet means nothing to converge, not an error
        let Some(secret) = self.router_secrets.get(&req.key) else {
            return Ok(ReconcileResult::ok());
        };
        let data = secret.data.clone().unwrap_or_default();
        let hash = content_hash(&data)?;

        let mut deployment = self.client.get_deployment(OAUTH_DEPLOYMENT).await?;
        let current = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.annotations.as_ref())
            .and_then(|annotations| annotations.get(CERT_HASH_ANNOTATION));
        if current == Some(&hash) {
            // Downstream cert already derives from this exact secret content
            return Ok(ReconcileResult::ok());
        }
        info!(hash = %hash, "router certificate content changed, rotating serving cert");

        let tls_cert = secret_field(&data, TLS_CERT_KEY)?;
        let tls_key = secret_field(&data, TLS_KEY_KEY)?;
        let ca = CertificateAuthority::from_pem(&tls_cert, &tls_key)?;

        let config = self.client.get_config_map(OAUTH_CONFIG_MAP).await?;
        let external_address = config
            .data
            .as_ref()
            .and_then(|d| d.get(EXTERNAL_ADDRESS_KEY))
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "config map {} has no {}",
                    OAUTH_CONFIG_MAP, EXTERNAL_ADDRESS_KEY
                ))
            })?;
        let hostnames = BTreeSet::from([external_address.clone()]);

        // Validity hint 0: the CA capability's own expiry policy governs
        let cert = ca.issue_server_cert(&hostnames, 0)?;
        let (cert_pem, key_pem) = cert.encode();

        // Secret first, deployment second: if we crash in between, the stale
        // annotation makes the next reconcile repeat the rotation.
        let mut serving = self.client.get_secret(OAUTH_SERVING_SECRET).await?;
        let serving_data = serving.data.get_or_insert_with(BTreeMap::new);
        serving_data.insert(
            SERVER_CERT_KEY.to_string(),
            ByteString(cert_pem.as_bytes().to_vec()),
        );
        serving_data.insert(
            SERVER_KEY_KEY.to_string(),
            ByteString(key_pem.as_bytes().to_vec()),
        );
        self.client.update_secret(&serving).await?;
        info!(address = %external_address, "updated oauth serving secret");

        let spec = deployment
            .spec
            .as_mut()
            .ok_or_else(|| Error::configuration("oauth deployment has no spec"))?;
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CERT_HASH_ANNOTATION.to_string(), hash.clone());
        self.client.update_deployment(&deployment).await?;
        info!(hash = %hash, "stamped router cert hash onto oauth pod template");

        Ok(ReconcileResult::ok())
    }
}

fn secret_field(data: &BTreeMap<String, ByteString>, key: &str) -> Result<String, Error> {
    let bytes = data
        .get(key)
        .ok_or_else(|| Error::configuration(format!("router certificate secret has no {}", key)))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::configuration(format!("router certificate secret {} is not PEM", key)))
}
