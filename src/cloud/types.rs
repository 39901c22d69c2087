//! Request and response types for the load balancer and compute APIs
//!
//! These mirror the shapes of the classic elastic load balancing and EC2 APIs,
//! with absent values expressed as `Option` rather than zero-valued structs.

use std::fmt;

/// A key/value resource tag
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Look up a tag value by key
pub fn find_tag<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key == key)
        .map(|t| t.value.as_str())
}

/// A describe filter, e.g. `vpc-id = [vpc-123]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Load balancers
// ---------------------------------------------------------------------------

/// A load balancer listener: front-end port/protocol to back-end port/protocol
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Listener {
    /// Load-balancer-facing protocol (HTTP, HTTPS, TCP, SSL)
    pub protocol: String,
    pub load_balancer_port: i32,
    /// Instance-facing protocol
    pub instance_protocol: String,
    pub instance_port: i32,
    /// Certificate reference for TLS listeners
    pub ssl_certificate_id: Option<String>,
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.protocol, self.load_balancer_port, self.instance_protocol, self.instance_port
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerDescription {
    pub listener: Listener,
    pub policy_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheck {
    /// e.g. "TCP:30080" or "HTTP:30080/healthz"
    pub target: String,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    /// Seconds
    pub timeout: i32,
    /// Seconds
    pub interval: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendServerDescription {
    pub instance_port: i32,
    pub policy_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerDescription {
    pub load_balancer_name: String,
    pub dns_name: String,
    /// "internet-facing" or "internal"
    pub scheme: String,
    pub vpc_id: Option<String>,
    pub listener_descriptions: Vec<ListenerDescription>,
    pub security_groups: Vec<String>,
    pub subnets: Vec<String>,
    pub availability_zones: Vec<String>,
    /// Registered backend instance IDs
    pub instances: Vec<String>,
    pub health_check: Option<HealthCheck>,
    pub backend_server_descriptions: Vec<BackendServerDescription>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateLoadBalancerRequest {
    pub load_balancer_name: String,
    pub listeners: Vec<Listener>,
    /// `Some("internal")` for internal load balancers
    pub scheme: Option<String>,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    /// Only used outside a VPC, where subnets are not available
    pub availability_zones: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessLog {
    pub enabled: bool,
    /// Minutes (5 or 60)
    pub emit_interval: Option<i32>,
    pub s3_bucket_name: Option<String>,
    pub s3_bucket_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionDraining {
    pub enabled: bool,
    /// Seconds
    pub timeout: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerAttributes {
    pub access_log: AccessLog,
    pub connection_draining: ConnectionDraining,
    /// Seconds
    pub idle_timeout: i32,
    pub cross_zone_load_balancing: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyAttribute {
    pub name: String,
    pub value: String,
}

impl PolicyAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyDescription {
    pub policy_name: String,
    pub policy_type_name: String,
    pub attributes: Vec<PolicyAttribute>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreatePolicyRequest {
    pub load_balancer_name: String,
    pub policy_name: String,
    pub policy_type_name: String,
    pub attributes: Vec<PolicyAttribute>,
}

// ---------------------------------------------------------------------------
// Security groups
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpRange {
    pub cidr_ip: String,
    pub description: Option<String>,
}

impl IpRange {
    pub fn new(cidr_ip: impl Into<String>) -> Self {
        Self {
            cidr_ip: cidr_ip.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A reference to another security group as a traffic source
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserIdGroupPair {
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub description: Option<String>,
}

impl UserIdGroupPair {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }
}

/// One (possibly compound) ingress rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPermission {
    /// "tcp", "udp", "icmp" or "-1" for all protocols
    pub ip_protocol: String,
    pub from_port: Option<i32>,
    pub to_port: Option<i32>,
    pub ip_ranges: Vec<IpRange>,
    pub user_id_group_pairs: Vec<UserIdGroupPair>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityGroup {
    pub group_id: String,
    pub group_name: String,
    pub description: String,
    pub vpc_id: Option<String>,
    pub ip_permissions: Vec<IpPermission>,
    pub tags: Vec<Tag>,
}

// ---------------------------------------------------------------------------
// Networking
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subnet {
    pub subnet_id: String,
    pub availability_zone: String,
    pub vpc_id: String,
    pub tags: Vec<Tag>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTableAssociation {
    pub subnet_id: Option<String>,
    /// True for the VPC's main route table association
    pub main: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    pub destination_cidr_block: Option<String>,
    /// "local", "igw-…", "vgw-…", "pcx-…"
    pub gateway_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub route_table_id: String,
    pub associations: Vec<RouteTableAssociation>,
    pub routes: Vec<Route>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    #[default]
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupIdentifier {
    pub group_id: String,
    pub group_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub state: InstanceState,
    pub availability_zone: String,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub private_dns_name: Option<String>,
    pub private_ip_address: Option<String>,
    pub public_dns_name: Option<String>,
    pub public_ip_address: Option<String>,
    pub security_groups: Vec<GroupIdentifier>,
    pub tags: Vec<Tag>,
}
