//! Hosted control plane operator binary.
//!
//! Wires one cache + queue + controller per reconciliation loop. The node
//! label, CSR approval, cluster operator, managed CA, route, and config
//! observation loops watch the hosted (target) cluster; writes land on
//! whichever cluster owns the converged state. All loops run as independent
//! tasks and drain on ctrl-c.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::{Api, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hcp_operator::controllers::cluster_operator::{
    cluster_operator_resource, StatusWriterImpl, VersionProjector,
};
use hcp_operator::controllers::config_observer::{
    config_resource, ObservedConfigWriterImpl, RegistryHostnameObserver,
};
use hcp_operator::controllers::csr_approval::{ApproveAllPolicy, CsrWriterImpl};
use hcp_operator::controllers::managed_ca::{
    CaBundleWriterImpl, ConcatMerger, MANAGED_CA_NAMESPACE,
};
use hcp_operator::controllers::node_labels::{default_required_labels, NodeWriterImpl};
use hcp_operator::controllers::oauth_cert::{ControlPlaneClientImpl, INGRESS_NAMESPACE};
use hcp_operator::controllers::route_sync::{
    route_resource, NamespaceRewriteTransform, RouteWriterImpl,
};
use hcp_operator::controllers::{
    ClusterOperatorSyncer, ConfigObserver, ConfigSources, CsrApprover, ManagedCaObserver,
    NodeLabelEnforcer, OAuthCertRotator, RouteMirror,
};
use hcp_operator::engine::{Cache, Controller, Store, WorkQueue};

/// Control plane operator for one hosted cluster
#[derive(Parser, Debug)]
#[command(name = "hcp-operator", version, about, long_about = None)]
struct Args {
    /// Control-plane namespace on the management cluster
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Kubeconfig for the management cluster (in-cluster config if unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the hosted cluster
    #[arg(long)]
    target_kubeconfig: PathBuf,

    /// Cache resync interval in seconds
    #[arg(long, default_value_t = 600)]
    resync: u64,

    /// Worker count per controller
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Release version stamped into hosted cluster operator statuses
    #[arg(long, env = "RELEASE_VERSION", default_value = "")]
    release_version: String,

    /// File holding the control plane's initial CA bundle
    #[arg(long)]
    initial_ca_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    info!(namespace = %args.namespace, "starting hosted control plane operator");

    let host = client_for(args.kubeconfig.as_deref())
        .await
        .context("building management cluster client")?;
    let target = client_for(Some(args.target_kubeconfig.as_path()))
        .await
        .context("building hosted cluster client")?;

    let initial_ca = match &args.initial_ca_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading initial CA from {}", path.display()))?,
        None => String::new(),
    };

    let resync = Duration::from_secs(args.resync);
    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received, draining controllers");
        let _ = shutdown_tx.send(true);
    });

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Node labels: hosted-cluster nodes, written back to the hosted cluster
    {
        let queue = Arc::new(WorkQueue::default());
        let nodes = watch_into(
            Api::<Node>::all(target.clone()),
            &queue,
            resync,
            &shutdown,
            &mut tasks,
        );
        let enforcer = NodeLabelEnforcer::new(
            nodes.clone(),
            Arc::new(NodeWriterImpl::new(target.clone())),
            default_required_labels(),
        );
        let controller = Controller::new("node-labels", queue, Arc::new(enforcer))
            .workers(args.workers)
            .wait_for(nodes.synced());
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    // CSR auto-approval on the hosted cluster
    {
        let queue = Arc::new(WorkQueue::default());
        let csrs = watch_into(
            Api::<CertificateSigningRequest>::all(target.clone()),
            &queue,
            resync,
            &shutdown,
            &mut tasks,
        );
        let approver = CsrApprover::new(
            csrs.clone(),
            Arc::new(ApproveAllPolicy),
            Arc::new(CsrWriterImpl::new(target.clone())),
        );
        let controller = Controller::new("auto-approver", queue, Arc::new(approver))
            .workers(args.workers)
            .wait_for(csrs.synced());
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    // OAuth serving cert rotation: watches hosted-cluster ingress secrets,
    // writes to the control-plane namespace
    {
        let queue = Arc::new(WorkQueue::default());
        let secrets = watch_into(
            Api::<Secret>::namespaced(target.clone(), INGRESS_NAMESPACE),
            &queue,
            resync,
            &shutdown,
            &mut tasks,
        );
        let rotator = OAuthCertRotator::new(
            secrets.clone(),
            Arc::new(ControlPlaneClientImpl::new(host.clone(), &args.namespace)),
        );
        let controller = Controller::new("oauth-cert", queue, Arc::new(rotator))
            .workers(args.workers)
            .wait_for(secrets.synced());
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    // Cluster operator status sync on the hosted cluster
    {
        let queue = Arc::new(WorkQueue::default());
        let operators = watch_into(
            Api::<DynamicObject>::all_with(target.clone(), &cluster_operator_resource()),
            &queue,
            resync,
            &shutdown,
            &mut tasks,
        );
        let syncer = ClusterOperatorSyncer::new(
            operators.clone(),
            Arc::new(VersionProjector::new(&args.release_version)),
            Arc::new(StatusWriterImpl::new(target.clone())),
        );
        let controller = Controller::new("cluster-operator-syncer", queue, Arc::new(syncer))
            .workers(args.workers)
            .wait_for(operators.synced());
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    // Managed CA observation: hosted-cluster CA config maps combined into
    // the control plane's additional CA bundle
    {
        let queue = Arc::new(WorkQueue::default());
        let config_maps = watch_into(
            Api::<ConfigMap>::namespaced(target.clone(), MANAGED_CA_NAMESPACE),
            &queue,
            resync,
            &shutdown,
            &mut tasks,
        );
        let observer = ManagedCaObserver::new(
            config_maps.clone(),
            initial_ca,
            Arc::new(ConcatMerger),
            Arc::new(CaBundleWriterImpl::new(
                host.clone(),
                &args.namespace,
                "controller-manager-additional-ca",
            )),
        );
        let controller = Controller::new("ca-configmap-observer", queue, Arc::new(observer))
            .workers(args.workers)
            .wait_for(config_maps.synced());
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    // Route mirroring: hosted-cluster routes copied into the control-plane
    // namespace
    {
        let queue = Arc::new(WorkQueue::default());
        let routes = watch_into(
            Api::<DynamicObject>::all_with(target.clone(), &route_resource()),
            &queue,
            resync,
            &shutdown,
            &mut tasks,
        );
        let mirror = RouteMirror::new(
            routes.clone(),
            Arc::new(NamespaceRewriteTransform::new(&args.namespace)),
            Arc::new(RouteWriterImpl::new(host.clone(), &args.namespace)),
        );
        let controller = Controller::new("route-sync", queue, Arc::new(mirror))
            .workers(args.workers)
            .wait_for(routes.synced());
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    // Config observation: four hosted-cluster sources feed one queue; the
    // controller gates on every source cache before dispatching
    {
        let queue = Arc::new(WorkQueue::default());
        let sources = ConfigSources {
            images: watch_into(
                Api::<DynamicObject>::all_with(target.clone(), &config_resource("Image", "images")),
                &queue,
                resync,
                &shutdown,
                &mut tasks,
            ),
            builds: watch_into(
                Api::<DynamicObject>::all_with(target.clone(), &config_resource("Build", "builds")),
                &queue,
                resync,
                &shutdown,
                &mut tasks,
            ),
            networks: watch_into(
                Api::<DynamicObject>::all_with(
                    target.clone(),
                    &config_resource("Network", "networks"),
                ),
                &queue,
                resync,
                &shutdown,
                &mut tasks,
            ),
            config_maps: watch_into(
                Api::<ConfigMap>::namespaced(
                    target.clone(),
                    "openshift-controller-manager-operator",
                ),
                &queue,
                resync,
                &shutdown,
                &mut tasks,
            ),
        };
        let observer = ConfigObserver::new(
            sources,
            vec![Arc::new(RegistryHostnameObserver)],
            Arc::new(ObservedConfigWriterImpl::new(
                host.clone(),
                &args.namespace,
                "openshift-controller-manager",
                "observedConfig",
            )),
        );
        let gates = observer.ready_gates();
        let controller = Controller::new("config-observer", queue, Arc::new(observer))
            .workers(args.workers)
            .wait_for_all(gates);
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));
    }

    for task in tasks {
        let _ = task.await;
    }
    info!("all controllers stopped");
    Ok(())
}

/// Start a cache over one watched collection, feeding the given queue.
///
/// Returns the read handle; the cache loop itself runs as a spawned task
/// until shutdown.
fn watch_into<K>(
    api: Api<K>,
    queue: &Arc<WorkQueue>,
    resync: Duration,
    shutdown: &watch::Receiver<bool>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let cache = Cache::<K>::new();
    let store = cache.store();
    let events = watcher(api, WatcherConfig::default()).boxed();
    tasks.push(tokio::spawn(cache.run(
        events,
        Arc::clone(queue),
        resync,
        shutdown.clone(),
    )));
    store
}

async fn client_for(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => Config::infer().await.context("inferring cluster config")?,
    };
    Ok(Client::try_from(config)?)
}
