//! Finalizer handling for LoadBalancer Services
//!
//! The cleanup finalizer keeps a Service around until its load balancer and the
//! security groups created for it are gone, including when the Service changes
//! to a type that no longer needs a load balancer.

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};

/// Finalizer shared with the in-tree service controller, so Services move
/// between controllers without losing cleanup
pub const LOAD_BALANCER_CLEANUP_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Field manager for every patch this controller makes
pub const FIELD_MANAGER: &str = "cloud-lb-controller";

fn service_api(client: &Client, service: &Service) -> Api<Service> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    Api::namespaced(client.clone(), &namespace)
}

fn finalizer_patch(finalizers: Vec<String>) -> serde_json::Value {
    json!({
        "metadata": {
            "finalizers": finalizers
        }
    })
}

/// Add the cleanup finalizer if not present
pub async fn add_finalizer(client: &Client, service: &Service) -> Result<()> {
    if has_finalizer(service) {
        return Ok(());
    }
    let mut finalizers: Vec<String> = service.finalizers().to_vec();
    finalizers.push(LOAD_BALANCER_CLEANUP_FINALIZER.to_string());

    service_api(client, service)
        .patch(
            &service.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&finalizer_patch(finalizers)),
        )
        .await
        .map_err(|e| {
            Error::FinalizerError(format!("adding finalizer to {}: {e}", service.name_any()))
        })?;
    info!("Added finalizer to Service: {}", service.name_any());
    Ok(())
}

/// Remove the cleanup finalizer once the cloud resources are gone
pub async fn remove_finalizer(client: &Client, service: &Service) -> Result<()> {
    if !has_finalizer(service) {
        return Ok(());
    }
    let finalizers: Vec<String> = service
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != LOAD_BALANCER_CLEANUP_FINALIZER)
        .cloned()
        .collect();

    service_api(client, service)
        .patch(
            &service.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&finalizer_patch(finalizers)),
        )
        .await
        .map_err(|e| {
            Error::FinalizerError(format!("removing finalizer from {}: {e}", service.name_any()))
        })?;
    info!("Removed finalizer from Service: {}", service.name_any());
    Ok(())
}

pub fn is_being_deleted(service: &Service) -> bool {
    service.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(service: &Service) -> bool {
    service
        .finalizers()
        .iter()
        .any(|f| f == LOAD_BALANCER_CLEANUP_FINALIZER)
}

/// True if the Service currently asks for a load balancer
pub fn wants_load_balancer(service: &Service) -> bool {
    !is_being_deleted(service)
        && service
            .spec
            .as_ref()
            .and_then(|s| s.type_.as_deref())
            == Some("LoadBalancer")
}

/// True if cloud resources may exist for the Service that nobody wants anymore
pub fn needs_cleanup(service: &Service) -> bool {
    has_finalizer(service) && !wants_load_balancer(service)
}
