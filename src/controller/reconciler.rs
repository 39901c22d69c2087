//! Main reconciler for LoadBalancer Services
//!
//! Implements the controller pattern using kube-rs runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Node, Service};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::{ObjectRef, Store},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::finalizers::{self, FIELD_MANAGER};
use super::nodes::NodeCache;
use crate::error::{Error, Result};
use crate::instances::InstanceLookup;
use crate::loadbalancer::{LoadBalancerManager, LoadBalancerStatus, ServiceLoadBalancerSpec};

/// Label value for this controller's metrics
pub const CONTROLLER_NAME: &str = "service";

/// Periodic resync, which also catches node removals
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const NOT_LEADER_RETRY: Duration = Duration::from_secs(15);
/// Backend-only passes allowed before the next full pass, which also
/// repairs listener, attribute and security group drift
pub const UPDATES_BETWEEN_FULL_PASSES: u32 = 5;

/// A Service's last fully converged spec
#[derive(Debug, Clone)]
pub struct AppliedSpec {
    spec: ServiceLoadBalancerSpec,
    updates: u32,
}

impl AppliedSpec {
    pub fn new(spec: ServiceLoadBalancerSpec) -> Self {
        Self { spec, updates: 0 }
    }

    /// Whether a pass for `spec` may take the backend-only update path.
    /// Counts the pass when it does.
    pub fn take_update(&mut self, spec: &ServiceLoadBalancerSpec) -> bool {
        if self.spec != *spec || self.updates >= UPDATES_BETWEEN_FULL_PASSES {
            return false;
        }
        self.updates += 1;
        true
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub manager: LoadBalancerManager,
    pub nodes: Arc<NodeCache>,
    /// Node lifecycle queries against the compute API
    pub instances: InstanceLookup,
    /// Set while this replica holds the leader lease
    pub is_leader: Arc<AtomicBool>,
    /// Last spec fully converged per Service; node-only changes take the
    /// cheaper update path while it still matches
    applied: RwLock<HashMap<String, AppliedSpec>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        manager: LoadBalancerManager,
        nodes: Arc<NodeCache>,
        instances: InstanceLookup,
        is_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            manager,
            nodes,
            instances,
            is_leader,
            applied: RwLock::new(HashMap::new()),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let services: Api<Service> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);

    info!("Starting Service load balancer controller");

    let controller = Controller::new(services, Config::default());
    let service_store = controller.store();
    let node_cache = Arc::clone(&state.nodes);

    controller
        // Re-run every load balancer when the set of eligible backends changes
        .watches(nodes, Config::default(), move |node| {
            if !node_cache.eligibility_changed(&node) {
                return Vec::new();
            }
            load_balancer_services(&service_store)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// References to every Service currently asking for a load balancer
pub fn load_balancer_services(store: &Store<Service>) -> Vec<ObjectRef<Service>> {
    store
        .state()
        .iter()
        .filter(|s| finalizers::wants_load_balancer(s))
        .map(|s| ObjectRef::from_obj(s.as_ref()))
        .collect()
}

pub fn service_key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_else(|| "default".to_string()),
        service.name_any()
    )
}

/// Hostnames currently published in the Service status
pub fn ingress_hostnames(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.hostname.clone()).collect())
        .unwrap_or_default()
}

fn desired_hostnames(status: Option<&LoadBalancerStatus>) -> Vec<String> {
    status
        .filter(|s| !s.hostname.is_empty())
        .map(|s| vec![s.hostname.clone()])
        .unwrap_or_default()
}

/// Merge patch publishing the load balancer in the Service status, or
/// clearing it
pub fn status_patch(status: Option<&LoadBalancerStatus>) -> serde_json::Value {
    let ingress: Vec<serde_json::Value> = desired_hostnames(status)
        .into_iter()
        .map(|hostname| json!({ "hostname": hostname }))
        .collect();
    json!({
        "status": {
            "loadBalancer": {
                "ingress": ingress
            }
        }
    })
}

/// Helper to emit a Kubernetes Event; failures are logged only
async fn emit_event(
    client: &Client,
    service: &Service,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", service.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: service.object_ref(&()),
        reporting_component: Some(FIELD_MANAGER.to_string()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    if let Err(e) = events.create(&PostParams::default(), &event).await {
        warn!("Failed to emit {} event for {}: {:?}", reason, service.name_any(), e);
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A Service is created, updated, or deleted
/// - The set of eligible backend nodes changes
/// - The requeue timer expires
#[instrument(
    skip(service, ctx),
    fields(name = %service.name_any(), namespace = service.namespace())
)]
async fn reconcile(service: Arc<Service>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping {}", service.name_any());
        return Ok(Action::requeue(NOT_LEADER_RETRY));
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = if finalizers::needs_cleanup(&service) {
        cleanup_load_balancer(&ctx, &service).await
    } else if finalizers::wants_load_balancer(&service) {
        apply_load_balancer(&ctx, &service).await
    } else {
        Ok(Action::await_change())
    };

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        started.elapsed().as_secs_f64(),
    );

    result
}

/// Converge the load balancer of a LoadBalancer Service
async fn apply_load_balancer(ctx: &ControllerState, service: &Service) -> Result<Action> {
    let key = service_key(service);

    let spec = match ServiceLoadBalancerSpec::from_service(service) {
        Ok(spec) => spec,
        Err(e) => {
            warn!("Validation failed for {}: {}", key, e);
            emit_event(&ctx.client, service, "Warning", "SyncLoadBalancerFailed", &e.to_string())
                .await;
            return Err(e);
        }
    };

    finalizers::add_finalizer(&ctx.client, service).await?;
    let nodes = ctx.nodes.nodes()?;

    let update_only = ctx
        .applied
        .write()
        .await
        .get_mut(&key)
        .is_some_and(|applied| applied.take_update(&spec));
    if update_only {
        match ctx.manager.update_load_balancer(&spec, &nodes).await {
            Ok(()) => {
                debug!("Updated backends of load balancer for {}", key);
                return Ok(Action::requeue(RESYNC_INTERVAL));
            }
            Err(e) => {
                warn!("Updating load balancer for {} failed, running a full pass: {}", key, e);
            }
        }
    }

    info!("Ensuring load balancer for {}", key);
    emit_event(
        &ctx.client,
        service,
        "Normal",
        "EnsuringLoadBalancer",
        "Ensuring load balancer",
    )
    .await;

    let status = match ctx.manager.ensure_load_balancer(&spec, &nodes).await {
        Ok(status) => status,
        Err(e) => {
            emit_event(
                &ctx.client,
                service,
                "Warning",
                "SyncLoadBalancerFailed",
                &format!("Error syncing load balancer: {e}"),
            )
            .await;
            return Err(e);
        }
    };

    update_status(&ctx.client, service, Some(&status)).await?;

    let previous = ctx
        .applied
        .write()
        .await
        .insert(key.clone(), AppliedSpec::new(spec));
    #[cfg(feature = "metrics")]
    if previous.is_none() {
        super::metrics::inc_managed_load_balancers();
    }
    #[cfg(not(feature = "metrics"))]
    let _ = previous;

    emit_event(
        &ctx.client,
        service,
        "Normal",
        "EnsuredLoadBalancer",
        "Ensured load balancer",
    )
    .await;
    info!("Load balancer for {} available at {}", key, status.hostname);

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Delete the load balancer of a Service that is going away or changed type
async fn cleanup_load_balancer(ctx: &ControllerState, service: &Service) -> Result<Action> {
    let key = service_key(service);
    let spec = ServiceLoadBalancerSpec::for_deletion(service)?;

    info!("Deleting load balancer for {}", key);
    emit_event(
        &ctx.client,
        service,
        "Normal",
        "DeletingLoadBalancer",
        "Deleting load balancer",
    )
    .await;

    if let Err(e) = ctx.manager.ensure_load_balancer_deleted(&spec).await {
        emit_event(
            &ctx.client,
            service,
            "Warning",
            "SyncLoadBalancerFailed",
            &format!("Error deleting load balancer: {e}"),
        )
        .await;
        return Err(e);
    }

    if !finalizers::is_being_deleted(service) {
        update_status(&ctx.client, service, None).await?;
    }
    finalizers::remove_finalizer(&ctx.client, service).await?;

    if ctx.applied.write().await.remove(&key).is_some() {
        #[cfg(feature = "metrics")]
        super::metrics::dec_managed_load_balancers();
    }

    emit_event(
        &ctx.client,
        service,
        "Normal",
        "DeletedLoadBalancer",
        "Deleted load balancer",
    )
    .await;
    Ok(Action::await_change())
}

/// Publish (or clear) the load balancer hostname in the Service status
async fn update_status(
    client: &Client,
    service: &Service,
    status: Option<&LoadBalancerStatus>,
) -> Result<()> {
    if ingress_hostnames(service) == desired_hostnames(status) {
        return Ok(());
    }
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    api.patch_status(
        &service.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&status_patch(status)),
    )
    .await
    .map_err(Error::KubeError)?;

    Ok(())
}

/// Error policy for the controller
fn error_policy(service: Arc<Service>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", service.name_any(), error);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
