//! Service annotations and their typed resolution
//!
//! Everything the engine needs from a Service is resolved once, up front, into
//! a [`ServiceLoadBalancerSpec`]. Invalid values fail here, before any cloud
//! API call is made.

use std::collections::BTreeMap;

use ipnet::IpNet;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::warn;

use super::listeners::{build_listener, ListenerOptions, SslPorts};
use crate::cloud::{AccessLog, ConnectionDraining, Listener, LoadBalancerAttributes};
use crate::error::{Error, Result};

pub const ANNOTATION_INTERNAL: &str = "service.beta.kubernetes.io/aws-load-balancer-internal";
pub const ANNOTATION_PROXY_PROTOCOL: &str =
    "service.beta.kubernetes.io/aws-load-balancer-proxy-protocol";
pub const ANNOTATION_CERTIFICATE: &str = "service.beta.kubernetes.io/aws-load-balancer-ssl-cert";
pub const ANNOTATION_SSL_PORTS: &str = "service.beta.kubernetes.io/aws-load-balancer-ssl-ports";
pub const ANNOTATION_SSL_NEGOTIATION_POLICY: &str =
    "service.beta.kubernetes.io/aws-load-balancer-ssl-negotiation-policy";
pub const ANNOTATION_BACKEND_PROTOCOL: &str =
    "service.beta.kubernetes.io/aws-load-balancer-backend-protocol";
pub const ANNOTATION_SECURITY_GROUPS: &str =
    "service.beta.kubernetes.io/aws-load-balancer-security-groups";
pub const ANNOTATION_EXTRA_SECURITY_GROUPS: &str =
    "service.beta.kubernetes.io/aws-load-balancer-extra-security-groups";
pub const ANNOTATION_SUBNETS: &str = "service.beta.kubernetes.io/aws-load-balancer-subnets";
pub const ANNOTATION_ADDITIONAL_TAGS: &str =
    "service.beta.kubernetes.io/aws-load-balancer-additional-resource-tags";
pub const ANNOTATION_TARGET_NODE_LABELS: &str =
    "service.beta.kubernetes.io/aws-load-balancer-target-node-labels";

pub const ANNOTATION_HC_HEALTHY_THRESHOLD: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-healthy-threshold";
pub const ANNOTATION_HC_UNHEALTHY_THRESHOLD: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-unhealthy-threshold";
pub const ANNOTATION_HC_TIMEOUT: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-timeout";
pub const ANNOTATION_HC_INTERVAL: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-interval";
pub const ANNOTATION_HC_PORT: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-port";
pub const ANNOTATION_HC_PATH: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-path";
pub const ANNOTATION_HC_PROTOCOL: &str =
    "service.beta.kubernetes.io/aws-load-balancer-healthcheck-protocol";

pub const ANNOTATION_ACCESS_LOG_ENABLED: &str =
    "service.beta.kubernetes.io/aws-load-balancer-access-log-enabled";
pub const ANNOTATION_ACCESS_LOG_EMIT_INTERVAL: &str =
    "service.beta.kubernetes.io/aws-load-balancer-access-log-emit-interval";
pub const ANNOTATION_ACCESS_LOG_BUCKET_NAME: &str =
    "service.beta.kubernetes.io/aws-load-balancer-access-log-s3-bucket-name";
pub const ANNOTATION_ACCESS_LOG_BUCKET_PREFIX: &str =
    "service.beta.kubernetes.io/aws-load-balancer-access-log-s3-bucket-prefix";
pub const ANNOTATION_CONNECTION_DRAINING_ENABLED: &str =
    "service.beta.kubernetes.io/aws-load-balancer-connection-draining-enabled";
pub const ANNOTATION_CONNECTION_DRAINING_TIMEOUT: &str =
    "service.beta.kubernetes.io/aws-load-balancer-connection-draining-timeout";
pub const ANNOTATION_CONNECTION_IDLE_TIMEOUT: &str =
    "service.beta.kubernetes.io/aws-load-balancer-connection-idle-timeout";
pub const ANNOTATION_CROSS_ZONE: &str =
    "service.beta.kubernetes.io/aws-load-balancer-cross-zone-load-balancing-enabled";

pub const ANNOTATION_SOURCE_RANGES: &str = "service.beta.kubernetes.io/load-balancer-source-ranges";

/// Health check port value meaning "the listener's backend port"
pub const HEALTH_CHECK_TRAFFIC_PORT: &str = "traffic-port";

pub const DEFAULT_SOURCE_RANGE: &str = "0.0.0.0/0";
pub const DEFAULT_HC_HEALTHY_THRESHOLD: i32 = 2;
pub const DEFAULT_HC_UNHEALTHY_THRESHOLD: i32 = 6;
pub const DEFAULT_HC_TIMEOUT: i32 = 5;
pub const DEFAULT_HC_INTERVAL: i32 = 10;
pub const DEFAULT_CONNECTION_DRAINING_TIMEOUT: i32 = 300;
pub const DEFAULT_IDLE_TIMEOUT: i32 = 60;

/// Path and port the node proxy serves health on for `Local` traffic policy
pub const LOCAL_TRAFFIC_HEALTH_PATH: &str = "/healthz";

/// Parse a `Key1=Val1,Key2=Val2` list.
///
/// `Key=` and a bare `Key` both map to an empty value. Keys and values are
/// trimmed; entries with an empty key or more than one `=` are dropped.
pub fn parse_key_value_list(value: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for item in value.split(',') {
        let parts: Vec<&str> = item.split('=').map(str::trim).collect();
        let (key, value) = match parts.as_slice() {
            [key] => (*key, ""),
            [key, value] => (*key, *value),
            _ => continue,
        };
        if !key.is_empty() {
            out.insert(key.to_string(), value.to_string());
        }
    }
    out
}

/// Split a comma separated list, trimming and dropping empty entries
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Where the health check probes, when overridden
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthCheckPort {
    TrafficPort,
    Port(i32),
}

/// Health check settings, defaults already filled in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    pub timeout: i32,
    pub interval: i32,
    pub port: Option<HealthCheckPort>,
    pub path: Option<String>,
    pub protocol: Option<String>,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            healthy_threshold: DEFAULT_HC_HEALTHY_THRESHOLD,
            unhealthy_threshold: DEFAULT_HC_UNHEALTHY_THRESHOLD,
            timeout: DEFAULT_HC_TIMEOUT,
            interval: DEFAULT_HC_INTERVAL,
            port: None,
            path: None,
            protocol: None,
        }
    }
}

/// Default attribute block for a load balancer
pub fn default_attributes() -> LoadBalancerAttributes {
    LoadBalancerAttributes {
        access_log: AccessLog::default(),
        connection_draining: ConnectionDraining {
            enabled: false,
            timeout: DEFAULT_CONNECTION_DRAINING_TIMEOUT,
        },
        idle_timeout: DEFAULT_IDLE_TIMEOUT,
        cross_zone_load_balancing: false,
    }
}

/// Everything the engine needs from one LoadBalancer Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceLoadBalancerSpec {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub listeners: Vec<Listener>,
    pub internal: bool,
    pub proxy_protocol: bool,
    pub backend_protocol: Option<String>,
    pub ssl_negotiation_policy: Option<String>,
    pub health_check: HealthCheckSettings,
    /// `externalTrafficPolicy: Local` health check node port
    pub local_traffic_health_check_port: Option<i32>,
    pub attributes: LoadBalancerAttributes,
    pub source_ranges: Vec<String>,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub extra_security_groups: Vec<String>,
    pub additional_tags: BTreeMap<String, String>,
    pub target_node_labels: BTreeMap<String, String>,
}

struct Annotations<'a>(&'a BTreeMap<String, String>);

impl<'a> Annotations<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).map(String::as_str)
    }

    fn non_empty(&self, key: &str) -> Option<&'a str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        self.non_empty(key)
            .map(|v| {
                v.parse::<bool>().map_err(|_| {
                    Error::ValidationError(format!("annotation {key}={v:?} is not a boolean"))
                })
            })
            .transpose()
    }

    fn int(&self, key: &str) -> Result<Option<i32>> {
        self.non_empty(key)
            .map(|v| {
                v.parse::<i32>().map_err(|_| {
                    Error::ValidationError(format!("annotation {key}={v:?} is not an integer"))
                })
            })
            .transpose()
    }
}

impl ServiceLoadBalancerSpec {
    /// The namespaced name, `namespace/name`
    pub fn service_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Resolve a Service into a load balancer spec, validating it
    pub fn from_service(service: &Service) -> Result<Self> {
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let uid = service
            .uid()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::ValidationError(format!("service {namespace}/{name} has no UID"))
            })?;
        let empty = BTreeMap::new();
        let annotations = Annotations(service.metadata.annotations.as_ref().unwrap_or(&empty));
        let spec = service
            .spec
            .as_ref()
            .ok_or_else(|| {
                Error::ValidationError(format!("service {namespace}/{name} has no spec"))
            })?;

        let affinity = spec.session_affinity.as_deref().unwrap_or("None");
        if !affinity.is_empty() && affinity != "None" {
            return Err(Error::ValidationError(format!(
                "unsupported load balancer affinity: {affinity}"
            )));
        }

        let ports = spec.ports.as_deref().unwrap_or_default();
        if ports.is_empty() {
            return Err(Error::ValidationError(
                "requested load balancer with no ports".to_string(),
            ));
        }

        if spec
            .load_balancer_ip
            .as_deref()
            .is_some_and(|ip| !ip.is_empty())
        {
            return Err(Error::ValidationError(
                "loadBalancerIP cannot be specified for this load balancer".to_string(),
            ));
        }

        let backend_protocol = annotations
            .non_empty(ANNOTATION_BACKEND_PROTOCOL)
            .map(str::to_ascii_lowercase);
        let listener_options = ListenerOptions {
            certificate_id: annotations.non_empty(ANNOTATION_CERTIFICATE).map(String::from),
            backend_protocol: backend_protocol.clone(),
            ssl_ports: SslPorts::parse(annotations.get(ANNOTATION_SSL_PORTS)),
        };

        let mut listeners = Vec::with_capacity(ports.len());
        for port in ports {
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            if protocol != "TCP" {
                return Err(Error::ValidationError(format!(
                    "only TCP load balancers are supported, port {} uses {protocol}",
                    port.port
                )));
            }
            let Some(node_port) = port.node_port.filter(|p| *p != 0) else {
                warn!(service = %name, port = port.port, "Ignoring port without NodePort defined");
                continue;
            };
            listeners.push(build_listener(
                port.port,
                port.name.as_deref(),
                node_port,
                protocol,
                &listener_options,
            )?);
        }

        let internal = matches!(
            annotations.get(ANNOTATION_INTERNAL),
            Some(v) if !v.is_empty() && v != "false"
        );

        let proxy_protocol = match annotations.non_empty(ANNOTATION_PROXY_PROTOCOL) {
            None => false,
            Some("*") => true,
            Some(other) => {
                return Err(Error::ValidationError(format!(
                    "annotation {ANNOTATION_PROXY_PROTOCOL}={other:?} is not supported, only '*' is"
                )))
            }
        };

        let health_check = HealthCheckSettings {
            healthy_threshold: annotations
                .int(ANNOTATION_HC_HEALTHY_THRESHOLD)?
                .unwrap_or(DEFAULT_HC_HEALTHY_THRESHOLD),
            unhealthy_threshold: annotations
                .int(ANNOTATION_HC_UNHEALTHY_THRESHOLD)?
                .unwrap_or(DEFAULT_HC_UNHEALTHY_THRESHOLD),
            timeout: annotations
                .int(ANNOTATION_HC_TIMEOUT)?
                .unwrap_or(DEFAULT_HC_TIMEOUT),
            interval: annotations
                .int(ANNOTATION_HC_INTERVAL)?
                .unwrap_or(DEFAULT_HC_INTERVAL),
            port: match annotations.non_empty(ANNOTATION_HC_PORT) {
                None => None,
                Some(HEALTH_CHECK_TRAFFIC_PORT) => Some(HealthCheckPort::TrafficPort),
                Some(_) => annotations.int(ANNOTATION_HC_PORT)?.map(HealthCheckPort::Port),
            },
            path: annotations.non_empty(ANNOTATION_HC_PATH).map(String::from),
            protocol: annotations.non_empty(ANNOTATION_HC_PROTOCOL).map(String::from),
        };

        let local_traffic_health_check_port = if spec.external_traffic_policy.as_deref()
            == Some("Local")
        {
            spec.health_check_node_port.filter(|p| *p != 0)
        } else {
            None
        };

        let mut attributes = default_attributes();
        if let Some(enabled) = annotations.bool(ANNOTATION_ACCESS_LOG_ENABLED)? {
            attributes.access_log.enabled = enabled;
        }
        attributes.access_log.emit_interval = annotations.int(ANNOTATION_ACCESS_LOG_EMIT_INTERVAL)?;
        attributes.access_log.s3_bucket_name = annotations
            .non_empty(ANNOTATION_ACCESS_LOG_BUCKET_NAME)
            .map(String::from);
        attributes.access_log.s3_bucket_prefix = annotations
            .non_empty(ANNOTATION_ACCESS_LOG_BUCKET_PREFIX)
            .map(String::from);
        if let Some(enabled) = annotations.bool(ANNOTATION_CONNECTION_DRAINING_ENABLED)? {
            attributes.connection_draining.enabled = enabled;
        }
        if let Some(timeout) = annotations.int(ANNOTATION_CONNECTION_DRAINING_TIMEOUT)? {
            attributes.connection_draining.timeout = timeout;
        }
        if let Some(idle) = annotations.int(ANNOTATION_CONNECTION_IDLE_TIMEOUT)? {
            attributes.idle_timeout = idle;
        }
        if let Some(cross_zone) = annotations.bool(ANNOTATION_CROSS_ZONE)? {
            attributes.cross_zone_load_balancing = cross_zone;
        }

        let source_ranges = resolve_source_ranges(
            spec.load_balancer_source_ranges.as_deref().unwrap_or_default(),
            annotations.get(ANNOTATION_SOURCE_RANGES),
        )?;

        Ok(ServiceLoadBalancerSpec {
            namespace,
            name,
            uid,
            listeners,
            internal,
            proxy_protocol,
            backend_protocol,
            ssl_negotiation_policy: annotations
                .non_empty(ANNOTATION_SSL_NEGOTIATION_POLICY)
                .map(String::from),
            health_check,
            local_traffic_health_check_port,
            attributes,
            source_ranges,
            subnets: annotations
                .get(ANNOTATION_SUBNETS)
                .map(parse_list)
                .unwrap_or_default(),
            security_groups: annotations
                .get(ANNOTATION_SECURITY_GROUPS)
                .map(parse_list)
                .unwrap_or_default(),
            extra_security_groups: annotations
                .get(ANNOTATION_EXTRA_SECURITY_GROUPS)
                .map(parse_list)
                .unwrap_or_default(),
            additional_tags: annotations
                .get(ANNOTATION_ADDITIONAL_TAGS)
                .map(parse_key_value_list)
                .unwrap_or_default(),
            target_node_labels: annotations
                .get(ANNOTATION_TARGET_NODE_LABELS)
                .map(parse_key_value_list)
                .unwrap_or_default(),
        })
    }

    /// The parts of a Service needed to tear its load balancer down.
    ///
    /// Never rejects a Service on its ports or annotation values: one that
    /// changed type or is being deleted may no longer validate.
    pub fn for_deletion(service: &Service) -> Result<Self> {
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let uid = service
            .uid()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::ValidationError(format!("service {namespace}/{name} has no UID"))
            })?;
        let empty = BTreeMap::new();
        let annotations = Annotations(service.metadata.annotations.as_ref().unwrap_or(&empty));

        Ok(ServiceLoadBalancerSpec {
            namespace,
            name,
            uid,
            listeners: Vec::new(),
            internal: false,
            proxy_protocol: false,
            backend_protocol: None,
            ssl_negotiation_policy: None,
            health_check: HealthCheckSettings::default(),
            local_traffic_health_check_port: None,
            attributes: default_attributes(),
            source_ranges: Vec::new(),
            subnets: Vec::new(),
            security_groups: annotations
                .get(ANNOTATION_SECURITY_GROUPS)
                .map(parse_list)
                .unwrap_or_default(),
            extra_security_groups: annotations
                .get(ANNOTATION_EXTRA_SECURITY_GROUPS)
                .map(parse_list)
                .unwrap_or_default(),
            additional_tags: BTreeMap::new(),
            target_node_labels: BTreeMap::new(),
        })
    }
}

/// Allowed client CIDRs: `spec.loadBalancerSourceRanges` wins over the annotation; the default
/// allows everyone
pub fn resolve_source_ranges(
    spec_ranges: &[String],
    annotation: Option<&str>,
) -> Result<Vec<String>> {
    let raw: Vec<String> = if !spec_ranges.is_empty() {
        spec_ranges.iter().map(|r| r.trim().to_string()).collect()
    } else {
        annotation.map(parse_list).unwrap_or_default()
    };
    if raw.is_empty() {
        return Ok(vec![DEFAULT_SOURCE_RANGE.to_string()]);
    }

    let mut ranges = Vec::with_capacity(raw.len());
    for cidr in raw {
        let net: IpNet = cidr.parse().map_err(|_| {
            Error::ValidationError(format!("invalid load balancer source range {cidr:?}"))
        })?;
        let normalized = net.trunc().to_string();
        if !ranges.contains(&normalized) {
            ranges.push(normalized);
        }
    }
    Ok(ranges)
}
