//! Desired health check for a load balancer

use crate::cloud::HealthCheck;
use crate::error::{Error, Result};

use super::annotations::{HealthCheckPort, ServiceLoadBalancerSpec, LOCAL_TRAFFIC_HEALTH_PATH};

const DEFAULT_HTTP_PATH: &str = "/";

/// Compute the health check the load balancer should have.
///
/// The probe targets the first listener's backend port over TCP (SSL when the
/// backend speaks TLS). With `externalTrafficPolicy: Local` it instead probes
/// the node proxy's HTTP health endpoint. Annotations override protocol, port
/// and path.
pub fn expected_health_check(spec: &ServiceLoadBalancerSpec) -> Result<HealthCheck> {
    let traffic_port = spec
        .listeners
        .first()
        .map(|l| l.instance_port)
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "service {} has no ports to health check",
                spec.service_name()
            ))
        })?;

    let settings = &spec.health_check;
    let (mut protocol, mut port, mut path) = match spec.local_traffic_health_check_port {
        Some(node_port) => {
            let port = match settings.port {
                Some(HealthCheckPort::TrafficPort) => traffic_port,
                _ => node_port,
            };
            ("HTTP".to_string(), port, Some(LOCAL_TRAFFIC_HEALTH_PATH.to_string()))
        }
        None => {
            let protocol = match spec.backend_protocol.as_deref() {
                Some("https") | Some("ssl") => "SSL",
                _ => "TCP",
            };
            (protocol.to_string(), traffic_port, None)
        }
    };

    if let Some(p) = &settings.protocol {
        protocol = p.to_ascii_uppercase();
    }
    if let Some(HealthCheckPort::Port(p)) = settings.port {
        port = p;
    }
    match protocol.as_str() {
        "HTTP" | "HTTPS" => {
            if let Some(p) = &settings.path {
                path = Some(p.clone());
            }
            if path.is_none() {
                path = Some(DEFAULT_HTTP_PATH.to_string());
            }
        }
        // TCP and SSL targets carry no path
        _ => path = None,
    }

    let health_check = HealthCheck {
        target: format!("{protocol}:{port}{}", path.unwrap_or_default()),
        healthy_threshold: settings.healthy_threshold,
        unhealthy_threshold: settings.unhealthy_threshold,
        timeout: settings.timeout,
        interval: settings.interval,
    };
    validate(&health_check)?;
    Ok(health_check)
}

fn validate(hc: &HealthCheck) -> Result<()> {
    let invalid = |what: &str, value: i32| {
        Error::ValidationError(format!("invalid health check {what}: {value}"))
    };
    if hc.healthy_threshold < 2 {
        return Err(invalid("healthy threshold", hc.healthy_threshold));
    }
    if hc.unhealthy_threshold < 2 {
        return Err(invalid("unhealthy threshold", hc.unhealthy_threshold));
    }
    if hc.timeout < 1 {
        return Err(invalid("timeout", hc.timeout));
    }
    if hc.interval < 1 {
        return Err(invalid("interval", hc.interval));
    }
    Ok(())
}

/// Field-by-field comparison, so fields added to the provider's health check
/// later do not cause endless updates
pub fn health_check_matches(actual: Option<&HealthCheck>, expected: &HealthCheck) -> bool {
    actual.is_some_and(|actual| {
        actual.target == expected.target
            && actual.healthy_threshold == expected.healthy_threshold
            && actual.unhealthy_threshold == expected.unhealthy_threshold
            && actual.timeout == expected.timeout
            && actual.interval == expected.interval
    })
}
