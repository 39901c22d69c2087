//! Process entry point
//!
//! Parses the command line, initializes tracing, elects a leader and runs the
//! Service controller against a concrete [`CloudApi`] supplied by the binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cloud::{CloudApi, GovernedCloud, HttpMetadataService, RateGovernor, SelfInstance};
use crate::config::CloudConfig;
use crate::controller::{self, ControllerState, NodeCache};
use crate::instances::{InstanceLookup, NodeLookup};
use crate::loadbalancer::LoadBalancerManager;
use crate::telemetry;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the cloud config file
    #[arg(long, env = "CLOUD_CONFIG")]
    pub cloud_config: Option<PathBuf>,

    /// Cluster ID used in ownership tags; overrides the config file
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    pub namespace: String,

    /// Listen address for health and metrics endpoints
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// Version line printed by the `version` subcommand
pub fn version_info() -> String {
    format!(
        "cloud-lb-controller v{}\nBuild Date: {}\nGit SHA: {}\nRust Version: {}",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_DATE"),
        env!("GIT_SHA"),
        env!("RUST_VERSION"),
    )
}

/// Run the parsed command line against the given provider API
pub async fn run(cli: Cli, api: Arc<dyn CloudApi>) -> anyhow::Result<()> {
    match cli.command {
        Commands::Version => {
            println!("{}", version_info());
            Ok(())
        }
        Commands::Run(args) => run_controller(args, api).await,
    }
}

/// Initialize tracing with optional OpenTelemetry export
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if json {
        fmt::layer().with_target(true).json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    match telemetry::otlp_endpoint() {
        Some(endpoint) => match telemetry::init_telemetry(&endpoint) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        },
        None => {
            registry.init();
            info!(
                "OpenTelemetry tracing disabled ({} not set)",
                telemetry::OTLP_ENDPOINT_ENV
            );
        }
    }
}

/// Load the config file and fill placement gaps from the metadata service
async fn resolve_config(args: &RunArgs) -> anyhow::Result<CloudConfig> {
    let mut config = match &args.cloud_config {
        Some(path) => CloudConfig::load(path)
            .with_context(|| format!("loading cloud config {}", path.display()))?,
        None => CloudConfig::default(),
    };

    let placement_missing =
        config.region.is_none() || config.zone.is_none() || config.vpc_id.is_none();
    if placement_missing {
        let metadata = HttpMetadataService::new(config.metadata_endpoint())?;
        match SelfInstance::discover(&metadata).await {
            Ok(self_instance) => config.fill_from_self_instance(&self_instance),
            // A configured region is enough to run without the metadata service
            Err(e) if config.region().is_ok() => {
                warn!("Instance metadata unavailable, using configured placement: {}", e);
            }
            Err(e) => return Err(e).context("discovering instance placement"),
        }
    }

    Ok(config)
}

async fn run_controller(args: RunArgs, api: Arc<dyn CloudApi>) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    info!("Starting cloud-lb-controller v{}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args).await?;
    let region = config.region()?;
    let tagging = config.tagging(args.cluster_name.as_deref());
    if tagging.cluster_id.is_empty() {
        warn!("No cluster ID configured; ownership tags will not be scoped to a cluster");
    }

    let governor = Arc::new(RateGovernor::new(config.governor.clone()));
    let governed: Arc<dyn CloudApi> = Arc::new(GovernedCloud::new(api, governor, region.clone()));
    let manager = LoadBalancerManager::new(Arc::clone(&governed), &config, tagging);
    info!(region = %region, "Cloud API ready");

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });
    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    {
        let lease_client = client.clone();
        let lease_ns = args.namespace.clone();
        let identity = holder_identity.clone();
        let is_leader_bg = Arc::clone(&is_leader);

        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let nodes = NodeCache::start(client.clone());
    let instances = InstanceLookup::new(governed, Arc::clone(&nodes) as Arc<dyn NodeLookup>);
    let state = Arc::new(ControllerState::new(
        client,
        manager,
        nodes,
        instances,
        Arc::clone(&is_leader),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::clone(&state);
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = crate::rest_api::run_server(api_state, addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    // Run the main controller loop
    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result.map_err(Into::into)
}

const LEASE_NAME: &str = "cloud-lb-controller-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.load(Ordering::Relaxed) {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

/// True if a lease last renewed at `renew` has run out at `now`
fn lease_expired(spec: Option<&LeaseSpec>, now: chrono::DateTime<Utc>) -> bool {
    spec.and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true)
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            if lease_expired(spec, now) {
                info!(
                    "Lease held by {:?} has expired, taking over",
                    current_holder
                );
                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": identity,
                        "acquireTime": MicroTime(now),
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", LEASE_NAME, identity);
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
