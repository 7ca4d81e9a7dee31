//! Automatic approval of certificate signing requests.
//!
//! The approval rules themselves are pluggable: the reconciler only owns the
//! control flow (skip requests that already carry a terminal condition, ask
//! the policy, record the approval). Policies are pure functions of the
//! request, so the whole loop is testable without an API server.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::engine::{ReconcileRequest, ReconcileResult, Reconciler, Store};
use crate::error::Error;

const APPROVED_CONDITION: &str = "Approved";
const DENIED_CONDITION: &str = "Denied";

/// Decides whether a pending signing request should be auto-approved
#[cfg_attr(test, automock)]
pub trait ApprovalPolicy: Send + Sync {
    fn should_approve(&self, csr: &CertificateSigningRequest) -> bool;
}

/// Records an approval on the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrWriter: Send + Sync {
    async fn approve(&self, csr: &CertificateSigningRequest) -> Result<(), Error>;
}

/// Writer that patches the approval subresource
pub struct CsrWriterImpl {
    client: Client,
}

impl CsrWriterImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CsrWriter for CsrWriterImpl {
    async fn approve(&self, csr: &CertificateSigningRequest) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let patch = json!({
            "status": {
                "conditions": [{
                    "type": APPROVED_CONDITION,
                    "status": "True",
                    "reason": "AutoApproved",
                    "message": "approved by the control plane operator",
                }],
            },
        });
        api.patch_approval(
            &csr.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Policy that approves every pending request.
///
/// On a hosted cluster the only requesters are the cluster's own nodes, so
/// the default deployment runs with blanket approval.
pub struct ApproveAllPolicy;

impl ApprovalPolicy for ApproveAllPolicy {
    fn should_approve(&self, _csr: &CertificateSigningRequest) -> bool {
        true
    }
}

fn has_terminal_condition(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c: &CertificateSigningRequestCondition| {
                c.type_ == APPROVED_CONDITION || c.type_ == DENIED_CONDITION
            })
        })
}

/// Reconciler that approves pending signing requests the policy accepts
pub struct CsrApprover {
    requests: Store<CertificateSigningRequest>,
    policy: Arc<dyn ApprovalPolicy>,
    writer: Arc<dyn CsrWriter>,
}

impl CsrApprover {
    pub fn new(
        requests: Store<CertificateSigningRequest>,
        policy: Arc<dyn ApprovalPolicy>,
        writer: Arc<dyn CsrWriter>,
    ) -> Self {
        Self {
            requests,
            policy,
            writer,
        }
    }
}

#[async_trait]
impl Reconciler for CsrApprover {
    #[instrument(skip(self), fields(csr = %req.key))]
    async fn reconcile(&self, req: ReconcileRequest) -> Result<ReconcileResult, Error> {
        // Deleted between notification and processing: nothing to approve
        let Some(csr) = self.requests.get(&req.key) else {
            return Ok(ReconcileResult::ok());
        };
        if has_terminal_condition(&csr) {
            return Ok(ReconcileResult::ok());
        }
        if !self.policy.should_approve(&csr) {
            return Ok(ReconcileResult::ok());
        }

        self.writer.approve(&csr).await?;
        info!("approved certificate signing request");
        Ok(ReconcileResult::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Cache, ObjectKey};
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn csr(name: &str, condition: Option<&str>) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: condition.map(|type_| CertificateSigningRequestStatus {
                conditions: Some(vec![CertificateSigningRequestCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn store_with(csrs: Vec<CertificateSigningRequest>) -> Store<CertificateSigningRequest> {
        let cache = Cache::new();
        let store = cache.store();
        for csr in csrs {
            store.insert(ObjectKey::from_object(&csr), csr);
        }
        store
    }

    fn request(name: &str) -> ReconcileRequest {
        ReconcileRequest {
            key: ObjectKey::cluster_scoped(name),
        }
    }

    #[tokio::test]
    async fn pending_csr_accepted_by_policy_is_approved() {
        let store = store_with(vec![csr("node-csr-1", None)]);
        let mut policy = MockApprovalPolicy::new();
        policy.expect_should_approve().times(1).return_const(true);
        let mut writer = MockCsrWriter::new();
        writer.expect_approve().times(1).returning(|_| Ok(()));

        let approver = CsrApprover::new(store, Arc::new(policy), Arc::new(writer));
        approver.reconcile(request("node-csr-1")).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_by_policy_is_left_pending() {
        let store = store_with(vec![csr("node-csr-1", None)]);
        let mut policy = MockApprovalPolicy::new();
        policy.expect_should_approve().times(1).return_const(false);
        // No approve expectation: a write would panic the mock
        let writer = MockCsrWriter::new();

        let approver = CsrApprover::new(store, Arc::new(policy), Arc::new(writer));
        approver.reconcile(request("node-csr-1")).await.unwrap();
    }

    #[tokio::test]
    async fn already_approved_csr_is_not_reprocessed() {
        let store = store_with(vec![csr("node-csr-1", Some(APPROVED_CONDITION))]);
        let policy = MockApprovalPolicy::new();
        let writer = MockCsrWriter::new();

        let approver = CsrApprover::new(store, Arc::new(policy), Arc::new(writer));
        approver.reconcile(request("node-csr-1")).await.unwrap();
    }

    #[tokio::test]
    async fn denied_csr_is_not_reprocessed() {
        let store = store_with(vec![csr("node-csr-1", Some(DENIED_CONDITION))]);
        let policy = MockApprovalPolicy::new();
        let writer = MockCsrWriter::new();

        let approver = CsrApprover::new(store, Arc::new(policy), Arc::new(writer));
        approver.reconcile(request("node-csr-1")).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_csr_is_a_noop() {
        let store = store_with(vec![]);
        let policy = MockApprovalPolicy::new();
        let writer = MockCsrWriter::new();

        let approver = CsrApprover::new(store, Arc::new(policy), Arc::new(writer));
        let result = approver.reconcile(request("gone")).await.unwrap();
        assert_eq!(result, ReconcileResult::ok());
    }

    #[tokio::test]
    async fn writer_failure_propagates_for_retry() {
        let store = store_with(vec![csr("node-csr-1", None)]);
        let mut policy = MockApprovalPolicy::new();
        policy.expect_should_approve().return_const(true);
        let mut writer = MockCsrWriter::new();
        writer
            .expect_approve()
            .times(1)
            .returning(|_| Err(Error::configuration("conflict")));

        let approver = CsrApprover::new(store, Arc::new(policy), Arc::new(writer));
        assert!(approver.reconcile(request("node-csr-1")).await.is_err());
    }
}
