//! Cloud provider API boundary
//!
//! The convergence engine talks to the provider exclusively through the
//! [`CloudApi`] trait. Every implementation used in production is wrapped in a
//! [`GovernedCloud`] so that each outbound call passes through the shared
//! per-region [`RateGovernor`].

pub mod error;
pub mod governor;
pub mod metadata;
pub mod tags;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;

pub use error::CloudError;
pub use governor::{GovernedCloud, GovernorConfig, RateGovernor};
pub use metadata::{HttpMetadataService, MetadataService, SelfInstance};
pub use tags::{ClusterTagging, ResourceLifecycle};
pub use types::*;

/// Result alias for cloud API calls
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Describe filter names understood by the compute API
pub mod filters {
    pub const VPC_ID: &str = "vpc-id";
    pub const GROUP_NAME: &str = "group-name";
    pub const GROUP_ID: &str = "group-id";
    pub const IP_PERMISSION_GROUP_ID: &str = "ip-permission.group-id";
    pub const SUBNET_ID: &str = "subnet-id";
    pub const INSTANCE_ID: &str = "instance-id";
    pub const INSTANCE_STATE_NAME: &str = "instance-state-name";
    pub const PRIVATE_DNS_NAME: &str = "private-dns-name";
    pub const TAG_KEY: &str = "tag-key";
    pub const ASSOCIATION_SUBNET_ID: &str = "association.subnet-id";
    pub const ASSOCIATION_MAIN: &str = "association.main";

    /// Filter on the value of a specific tag, e.g. `tag:KubernetesCluster`
    pub fn tag(key: &str) -> String {
        format!("tag:{key}")
    }
}

/// Load balancer and compute operations consumed by the convergence engine
///
/// Calls are expected to be idempotent where the provider allows it. A missing
/// load balancer is reported as `Ok(None)` from [`CloudApi::describe_load_balancer`];
/// every other not-found condition is a [`CloudError`] whose code the caller
/// classifies.
#[async_trait]
pub trait CloudApi: Send + Sync {
    // -- load balancers -----------------------------------------------------

    async fn describe_load_balancer(
        &self,
        name: &str,
    ) -> CloudResult<Option<LoadBalancerDescription>>;

    /// Create a load balancer, returning its DNS name
    async fn create_load_balancer(&self, request: &CreateLoadBalancerRequest)
        -> CloudResult<String>;

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()>;

    async fn create_load_balancer_listeners(
        &self,
        name: &str,
        listeners: &[Listener],
    ) -> CloudResult<()>;

    async fn delete_load_balancer_listeners(&self, name: &str, ports: &[i32]) -> CloudResult<()>;

    async fn apply_security_groups_to_load_balancer(
        &self,
        name: &str,
        group_ids: &[String],
    ) -> CloudResult<()>;

    async fn configure_health_check(&self, name: &str, health_check: &HealthCheck)
        -> CloudResult<()>;

    async fn describe_load_balancer_attributes(
        &self,
        name: &str,
    ) -> CloudResult<LoadBalancerAttributes>;

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> CloudResult<()>;

    async fn register_instances_with_load_balancer(
        &self,
        name: &str,
        instance_ids: &[String],
    ) -> CloudResult<()>;

    async fn deregister_instances_from_load_balancer(
        &self,
        name: &str,
        instance_ids: &[String],
    ) -> CloudResult<()>;

    async fn describe_load_balancer_policies(
        &self,
        name: &str,
        policy_names: &[String],
    ) -> CloudResult<Vec<PolicyDescription>>;

    async fn create_load_balancer_policy(&self, request: &CreatePolicyRequest) -> CloudResult<()>;

    async fn set_load_balancer_policies_for_backend_server(
        &self,
        name: &str,
        instance_port: i32,
        policy_names: &[String],
    ) -> CloudResult<()>;

    async fn set_load_balancer_policies_of_listener(
        &self,
        name: &str,
        load_balancer_port: i32,
        policy_names: &[String],
    ) -> CloudResult<()>;

    async fn add_load_balancer_tags(&self, name: &str, tags: &[Tag]) -> CloudResult<()>;

    // -- compute ------------------------------------------------------------

    async fn describe_instances(&self, filters: &[Filter]) -> CloudResult<Vec<Instance>>;

    async fn describe_security_groups(&self, filters: &[Filter])
        -> CloudResult<Vec<SecurityGroup>>;

    /// Create a security group, returning its ID
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> CloudResult<String>;

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()>;

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> CloudResult<()>;

    async fn revoke_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> CloudResult<()>;

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> CloudResult<()>;

    async fn describe_subnets(&self, filters: &[Filter]) -> CloudResult<Vec<Subnet>>;

    async fn describe_route_tables(&self, filters: &[Filter]) -> CloudResult<Vec<RouteTable>>;
}
