//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use k8s_openapi::api::core::v1::NodeAddress;
use serde::Serialize;
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::Error;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub leader: bool,
    pub nodes_synced: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// What the compute API reports about the instance behind a node
#[derive(Debug, Serialize)]
pub struct NodeInstanceResponse {
    pub node: String,
    pub instance_id: String,
    pub exists: bool,
    pub shutdown: bool,
    pub addresses: Vec<NodeAddress>,
}

fn health_response(state: &ControllerState) -> HealthResponse {
    let nodes_synced = state.nodes.is_synced();
    HealthResponse {
        status: if nodes_synced { "healthy" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
        nodes_synced,
    }
}

/// Liveness endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(health_response(&state))
}

/// Readiness endpoint; not ready until the node informer has synced
#[instrument(skip(state))]
pub async fn ready(
    State(state): State<Arc<ControllerState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let response = health_response(&state);
    let code = if response.nodes_synced {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

fn lookup_failed(e: Error) -> (StatusCode, Json<ErrorResponse>) {
    let code = match &e {
        Error::InformerNotSynced => StatusCode::SERVICE_UNAVAILABLE,
        Error::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    };
    error!("Instance lookup failed: {:?}", e);
    (code, Json(ErrorResponse::new("lookup_failed", &e.to_string())))
}

/// Instance lifecycle of a node: existence, shutdown state and addresses
#[instrument(skip(state))]
pub async fn node_instance(
    State(state): State<Arc<ControllerState>>,
    Path(name): Path<String>,
) -> Result<Json<NodeInstanceResponse>, (StatusCode, Json<ErrorResponse>)> {
    let lookup = &state.instances;
    let Some(id) = lookup
        .instance_id_by_node_name(&name)
        .await
        .map_err(lookup_failed)?
    else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("No instance found for node {}", name),
            )),
        ));
    };

    let exists = lookup
        .instance_exists_by_provider_id(id.as_str())
        .await
        .map_err(lookup_failed)?;
    let (shutdown, addresses) = if exists {
        let shutdown = lookup
            .instance_shutdown_by_provider_id(id.as_str())
            .await
            .map_err(lookup_failed)?;
        let addresses = lookup
            .node_addresses_by_provider_id(id.as_str())
            .await
            .map_err(lookup_failed)?;
        (shutdown, addresses)
    } else {
        (false, Vec::new())
    };

    Ok(Json(NodeInstanceResponse {
        node: name,
        instance_id: id.to_string(),
        exists,
        shutdown,
        addresses,
    }))
}

/// Metrics endpoint handler
pub async fn metrics() -> Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_errors_map_to_status_codes() {
        let (code, _) = lookup_failed(Error::InformerNotSynced);
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        let (code, body) = lookup_failed(Error::ValidationError("invalid provider ID".into()));
        assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.0.error, "lookup_failed");
    }
}
