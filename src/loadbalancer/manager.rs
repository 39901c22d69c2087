//! Load balancer reconciliation
//!
//! [`LoadBalancerManager`] runs one linear convergence pass per call. Every step
//! reads the actual state, compares it with the desired state and only calls a
//! mutating API when they differ, so a pass interrupted by an error is simply
//! repeated.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::annotations::ServiceLoadBalancerSpec;
use super::attributes::attributes_match;
use super::health_check::{expected_health_check, health_check_matches};
use super::listeners::diff_listeners;
use super::load_balancer_name;
use super::rules::{rule_description, IpPermissionSet, CLIENT_RULE_MARKER, MTU_RULE_MARKER};
use super::security_groups::SecurityGroupReconciler;
use super::subnets::{SubnetSelector, SubnetTieBreak};
use crate::cloud::{
    error::codes, filters, CloudApi, CloudError, ClusterTagging, CreateLoadBalancerRequest,
    CreatePolicyRequest, Filter, Instance, IpPermission, IpRange, Listener,
    LoadBalancerDescription, PolicyAttribute, ResourceLifecycle, Tag,
};
use crate::config::{CloudConfig, DeletionSettings};
use crate::error::{Error, Result};
use crate::instances::{instance_ids_for_nodes, select_target_nodes, CacheCriteria, InstanceCache};

pub const PROXY_PROTOCOL_POLICY_NAME: &str = "k8s-proxyprotocol-enabled";
const PROXY_PROTOCOL_POLICY_TYPE: &str = "ProxyProtocolPolicyType";
const SSL_NEGOTIATION_POLICY_TYPE: &str = "SSLNegotiationPolicyType";
const SSL_REFERENCE_POLICY_ATTRIBUTE: &str = "Reference-Security-Policy";

/// Tag naming the Service a load balancer was created for
pub const SERVICE_NAME_TAG: &str = "kubernetes.io/service-name";

const SCHEME_INTERNAL: &str = "internal";

pub fn ssl_negotiation_policy_name(predefined: &str) -> String {
    format!("k8s-SSLNegotiationPolicy-{predefined}")
}

fn security_group_name(load_balancer_name: &str) -> String {
    format!("k8s-elb-{load_balancer_name}")
}

/// Desired ingress of a load balancer's own security group: every listener
/// port from every source range, plus ICMP "fragmentation needed" for path MTU
/// discovery
pub fn primary_group_rules(
    load_balancer_name: &str,
    listeners: &[Listener],
    source_ranges: &[String],
) -> IpPermissionSet {
    let ranges = |marker: &str| -> Vec<IpRange> {
        let description = rule_description(marker, load_balancer_name);
        source_ranges
            .iter()
            .map(|cidr| IpRange::new(cidr.as_str()).with_description(description.as_str()))
            .collect()
    };

    let mut rules = IpPermissionSet::new();
    for listener in listeners {
        rules.insert(IpPermission {
            ip_protocol: "tcp".to_string(),
            from_port: Some(listener.load_balancer_port),
            to_port: Some(listener.load_balancer_port),
            ip_ranges: ranges(CLIENT_RULE_MARKER),
            user_id_group_pairs: Vec::new(),
        });
    }
    rules.insert(IpPermission {
        ip_protocol: "icmp".to_string(),
        from_port: Some(3),
        to_port: Some(4),
        ip_ranges: ranges(MTU_RULE_MARKER),
        user_id_group_pairs: Vec::new(),
    });
    rules
}

/// Order a load balancer's groups: override groups first (in annotation
/// order), then groups we chose, then extra groups. The first one is the
/// primary group that instances admit traffic from.
pub fn sort_security_groups(groups: &mut [String], overrides: &[String], extras: &[String]) {
    let rank = |id: &String| -> usize {
        if let Some(i) = overrides.iter().position(|g| g == id) {
            i
        } else if let Some(j) = extras.iter().position(|g| g == id) {
            overrides.len() + 1 + j
        } else {
            overrides.len()
        }
    };
    groups.sort_by_key(rank);
}

fn is_tls_protocol(protocol: &str) -> bool {
    protocol.eq_ignore_ascii_case("ssl") || protocol.eq_ignore_ascii_case("https")
}

/// What a Service's status should report for its load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerStatus {
    pub name: String,
    /// DNS name clients connect to
    pub hostname: String,
}

impl LoadBalancerStatus {
    fn from_description(lb: &LoadBalancerDescription) -> Self {
        Self {
            name: lb.load_balancer_name.clone(),
            hostname: lb.dns_name.clone(),
        }
    }
}

pub struct LoadBalancerManager {
    api: Arc<dyn CloudApi>,
    tagging: ClusterTagging,
    vpc_id: Option<String>,
    fallback_subnet_id: Option<String>,
    elb_security_group: Option<String>,
    disable_security_group_ingress: bool,
    subnet_tie_break: SubnetTieBreak,
    deletion: DeletionSettings,
    instances: InstanceCache,
}

impl LoadBalancerManager {
    pub fn new(api: Arc<dyn CloudApi>, config: &CloudConfig, tagging: ClusterTagging) -> Self {
        let instances = InstanceCache::new(Arc::clone(&api), tagging.clone());
        Self {
            api,
            tagging,
            vpc_id: config.vpc_id.clone().filter(|v| !v.is_empty()),
            fallback_subnet_id: config.subnet_id.clone().filter(|s| !s.is_empty()),
            elb_security_group: config.elb_security_group.clone().filter(|g| !g.is_empty()),
            disable_security_group_ingress: config.disable_security_group_ingress,
            subnet_tie_break: config.subnet_tie_break,
            deletion: config.deletion.clone(),
            instances,
        }
    }

    pub fn tagging(&self) -> &ClusterTagging {
        &self.tagging
    }

    fn security_groups(&self) -> SecurityGroupReconciler<'_> {
        SecurityGroupReconciler {
            api: self.api.as_ref(),
            tagging: &self.tagging,
            protected_group: self.elb_security_group.as_deref(),
        }
    }

    /// Instances behind the Service's target nodes; unknown instances are
    /// dropped
    async fn find_instances(
        &self,
        spec: &ServiceLoadBalancerSpec,
        nodes: &[Node],
    ) -> Result<Vec<Instance>> {
        let targets = select_target_nodes(nodes, &spec.target_node_labels);
        let ids = instance_ids_for_nodes(targets);
        let snapshot = self
            .instances
            .describe(&CacheCriteria {
                // Instance security groups do not change, so age does not matter
                max_age: None,
                has_instances: ids.clone(),
            })
            .await?;
        let instances = snapshot.find_instances(&ids);
        if instances.len() < ids.len() {
            warn!(
                service = %spec.service_name(),
                wanted = ids.len(),
                found = instances.len(),
                "Some target instances were not found and will not be registered"
            );
        }
        Ok(instances)
    }

    async fn resolve_subnets(&self, spec: &ServiceLoadBalancerSpec) -> Result<Vec<String>> {
        let Some(vpc_id) = self.vpc_id.as_deref() else {
            warn!(
                service = %spec.service_name(),
                "No VPC configured, creating load balancer without subnets"
            );
            return Ok(Vec::new());
        };
        let selector = SubnetSelector {
            api: self.api.as_ref(),
            vpc_id,
            tagging: &self.tagging,
            fallback_subnet_id: self.fallback_subnet_id.as_deref(),
            tie_break: self.subnet_tie_break,
        };
        let subnets = if spec.subnets.is_empty() {
            selector.find_subnets(spec.internal).await?
        } else {
            selector.explicit_subnets(&spec.subnets).await?
        };
        if subnets.is_empty() {
            return Err(Error::ConfigError(format!(
                "could not find any suitable subnets in {vpc_id} for the load balancer of {}",
                spec.service_name()
            )));
        }
        Ok(subnets)
    }

    /// Security groups for the load balancer, and whether the first one is a
    /// group we own and should manage the ingress of
    async fn resolve_security_groups(
        &self,
        spec: &ServiceLoadBalancerSpec,
        load_balancer_name: &str,
    ) -> Result<(Vec<String>, bool)> {
        let mut groups = spec.security_groups.clone();
        let mut owned = false;
        if groups.is_empty() {
            match self.elb_security_group.as_deref() {
                Some(shared) => groups.push(shared.to_string()),
                None => {
                    let description = format!(
                        "Security group for Kubernetes ELB {load_balancer_name} ({})",
                        spec.service_name()
                    );
                    let id = self
                        .security_groups()
                        .ensure_security_group(
                            &security_group_name(load_balancer_name),
                            &description,
                            self.vpc_id.as_deref(),
                            &spec.additional_tags,
                        )
                        .await?;
                    groups.push(id);
                    owned = true;
                }
            }
        }
        for extra in &spec.extra_security_groups {
            if !groups.contains(extra) {
                groups.push(extra.clone());
            }
        }
        Ok((groups, owned))
    }

    /// Create or converge the load balancer for a Service
    #[instrument(skip(self, spec, nodes), fields(service = %spec.service_name()))]
    pub async fn ensure_load_balancer(
        &self,
        spec: &ServiceLoadBalancerSpec,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus> {
        if spec.listeners.is_empty() {
            return Err(Error::ValidationError(format!(
                "service {} has no ports with a NodePort to balance",
                spec.service_name()
            )));
        }
        let health_check = expected_health_check(spec)?;
        let name = load_balancer_name(&spec.uid);

        let instances = self.find_instances(spec, nodes).await?;
        let subnets = self.resolve_subnets(spec).await?;

        let (groups, owned_group) = if self.vpc_id.is_some() {
            self.resolve_security_groups(spec, &name).await?
        } else {
            (Vec::new(), false)
        };

        if owned_group && !subnets.is_empty() {
            let desired = primary_group_rules(&name, &spec.listeners, &spec.source_ranges);
            self.security_groups()
                .set_owned_ingress(&groups[0], &desired, &name)
                .await?;
        }

        let mut dirty = false;
        match self.api.describe_load_balancer(&name).await? {
            None => {
                self.create_load_balancer(spec, &name, &subnets, &groups, &instances)
                    .await?;
                dirty = true;
            }
            Some(existing) => {
                dirty |= self
                    .update_existing(spec, &existing, &subnets, &groups)
                    .await?;
            }
        }

        let current_attributes = self.api.describe_load_balancer_attributes(&name).await?;
        if !attributes_match(&current_attributes, &spec.attributes) {
            info!(load_balancer = %name, "Updating load balancer attributes");
            self.api
                .modify_load_balancer_attributes(&name, &spec.attributes)
                .await?;
        }

        let mut lb = self.describe_required(&name).await?;
        if let Some(policy) = spec.ssl_negotiation_policy.as_deref() {
            if self.ensure_ssl_negotiation_policy(&lb, policy).await? {
                dirty = true;
            }
        }
        if dirty {
            lb = self.describe_required(&name).await?;
        }

        if !health_check_matches(lb.health_check.as_ref(), &health_check) {
            info!(load_balancer = %name, target = %health_check.target, "Configuring health check");
            self.api.configure_health_check(&name, &health_check).await?;
        }

        self.update_instance_security_groups(&lb, spec, &instances)
            .await?;
        self.ensure_instances_registered(&name, &lb.instances, &instances)
            .await?;

        info!(load_balancer = %name, hostname = %lb.dns_name, "Load balancer converged");
        Ok(LoadBalancerStatus::from_description(&lb))
    }

    async fn describe_required(&self, name: &str) -> Result<LoadBalancerDescription> {
        self.api.describe_load_balancer(name).await?.ok_or_else(|| {
            Error::CloudError(CloudError::new(
                "DescribeLoadBalancers",
                codes::LOAD_BALANCER_NOT_FOUND,
                format!("load balancer {name} disappeared during reconciliation"),
            ))
        })
    }

    async fn create_load_balancer(
        &self,
        spec: &ServiceLoadBalancerSpec,
        name: &str,
        subnets: &[String],
        groups: &[String],
        instances: &[Instance],
    ) -> Result<()> {
        let mut tags: BTreeMap<String, String> = self
            .tagging
            .build_tags(ResourceLifecycle::Owned, &spec.additional_tags)
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect();
        tags.insert(SERVICE_NAME_TAG.to_string(), spec.service_name());

        let availability_zones = if subnets.is_empty() {
            instances
                .iter()
                .map(|i| i.availability_zone.clone())
                .filter(|z| !z.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            Vec::new()
        };
        if subnets.is_empty() && availability_zones.is_empty() {
            return Err(Error::ConfigError(format!(
                "no subnets or availability zones available for the load balancer of {}",
                spec.service_name()
            )));
        }

        let request = CreateLoadBalancerRequest {
            load_balancer_name: name.to_string(),
            listeners: spec.listeners.clone(),
            scheme: spec.internal.then(|| SCHEME_INTERNAL.to_string()),
            subnets: subnets.to_vec(),
            security_groups: groups.to_vec(),
            availability_zones,
            tags: tags.into_iter().map(|(k, v)| Tag::new(k, v)).collect(),
        };
        info!(load_balancer = name, internal = spec.internal, "Creating load balancer");
        self.api.create_load_balancer(&request).await?;

        if spec.proxy_protocol {
            self.ensure_proxy_protocol_policy(name).await?;
            let policies = [PROXY_PROTOCOL_POLICY_NAME.to_string()];
            for listener in &spec.listeners {
                debug!(
                    load_balancer = name,
                    port = listener.instance_port,
                    "Enabling proxy protocol on backend"
                );
                self.api
                    .set_load_balancer_policies_for_backend_server(
                        name,
                        listener.instance_port,
                        &policies,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Converge an existing load balancer; returns whether anything changed
    async fn update_existing(
        &self,
        spec: &ServiceLoadBalancerSpec,
        lb: &LoadBalancerDescription,
        subnets: &[String],
        groups: &[String],
    ) -> Result<bool> {
        let name = lb.load_balancer_name.as_str();
        let mut dirty = false;

        let expected_subnets: BTreeSet<&String> = subnets.iter().collect();
        let actual_subnets: BTreeSet<&String> = lb.subnets.iter().collect();
        if !subnets.is_empty() && expected_subnets != actual_subnets {
            warn!(
                load_balancer = name,
                expected = ?expected_subnets,
                actual = ?actual_subnets,
                "Load balancer subnets differ from the selected subnets; keeping existing subnets"
            );
        }

        let expected_groups: BTreeSet<&String> = groups.iter().collect();
        let actual_groups: BTreeSet<&String> = lb.security_groups.iter().collect();
        if !groups.is_empty() && expected_groups != actual_groups {
            info!(
                load_balancer = name,
                groups = ?groups,
                "Applying security groups to load balancer"
            );
            self.api
                .apply_security_groups_to_load_balancer(name, groups)
                .await?;
            dirty = true;
        }

        let diff = diff_listeners(name, &spec.listeners, &lb.listener_descriptions);
        if !diff.to_delete.is_empty() {
            info!(
                load_balancer = name,
                ports = ?diff.to_delete,
                "Deleting load balancer listeners"
            );
            self.api
                .delete_load_balancer_listeners(name, &diff.to_delete)
                .await?;
            dirty = true;
        }
        if !diff.to_create.is_empty() {
            info!(
                load_balancer = name,
                count = diff.to_create.len(),
                "Creating load balancer listeners"
            );
            self.api
                .create_load_balancer_listeners(name, &diff.to_create)
                .await?;
            dirty = true;
        }

        dirty |= self.sync_proxy_protocol(spec, lb).await?;

        if !spec.additional_tags.is_empty() {
            let tags: Vec<Tag> = spec
                .additional_tags
                .iter()
                .map(|(k, v)| Tag::new(k.as_str(), v.as_str()))
                .collect();
            debug!(load_balancer = name, "Adding additional load balancer tags");
            self.api.add_load_balancer_tags(name, &tags).await?;
        }
        Ok(dirty)
    }

    /// Set or clear the proxy protocol policy on every backend port
    async fn sync_proxy_protocol(
        &self,
        spec: &ServiceLoadBalancerSpec,
        lb: &LoadBalancerDescription,
    ) -> Result<bool> {
        let name = lb.load_balancer_name.as_str();
        let mut policies = Vec::new();
        if spec.proxy_protocol {
            self.ensure_proxy_protocol_policy(name).await?;
            policies.push(PROXY_PROTOCOL_POLICY_NAME.to_string());
        }

        // instance port -> whether proxy protocol is currently on
        let current: HashMap<i32, bool> = lb
            .backend_server_descriptions
            .iter()
            .map(|b| {
                let enabled = b.policy_names.iter().any(|p| p == PROXY_PROTOCOL_POLICY_NAME);
                (b.instance_port, enabled)
            })
            .collect();
        let mut in_use = HashSet::new();
        let mut changed = false;

        for listener in &spec.listeners {
            let port = listener.instance_port;
            if !in_use.insert(port) {
                continue;
            }
            let set_policy = match current.get(&port) {
                None => spec.proxy_protocol,
                Some(enabled) => *enabled != spec.proxy_protocol,
            };
            if set_policy {
                info!(
                    load_balancer = name,
                    port,
                    enabled = spec.proxy_protocol,
                    "Adjusting proxy protocol on backend port"
                );
                self.api
                    .set_load_balancer_policies_for_backend_server(name, port, &policies)
                    .await?;
                changed = true;
            }
        }

        // Backend policies outlive their listeners
        for port in current.keys().filter(|p| !in_use.contains(*p)) {
            info!(load_balancer = name, port = *port, "Clearing policies of unused backend port");
            self.api
                .set_load_balancer_policies_for_backend_server(name, *port, &[])
                .await?;
            changed = true;
        }
        Ok(changed)
    }

    /// Create a policy on the load balancer unless it already exists
    async fn ensure_policy(&self, request: CreatePolicyRequest) -> Result<bool> {
        match self
            .api
            .describe_load_balancer_policies(
                &request.load_balancer_name,
                std::slice::from_ref(&request.policy_name),
            )
            .await
        {
            Ok(found) if !found.is_empty() => return Ok(false),
            Ok(_) => {}
            Err(e) if e.code == codes::POLICY_NOT_FOUND => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            load_balancer = %request.load_balancer_name,
            policy = %request.policy_name,
            "Creating load balancer policy"
        );
        self.api.create_load_balancer_policy(&request).await?;
        Ok(true)
    }

    async fn ensure_proxy_protocol_policy(&self, load_balancer_name: &str) -> Result<bool> {
        self.ensure_policy(CreatePolicyRequest {
            load_balancer_name: load_balancer_name.to_string(),
            policy_name: PROXY_PROTOCOL_POLICY_NAME.to_string(),
            policy_type_name: PROXY_PROTOCOL_POLICY_TYPE.to_string(),
            attributes: vec![PolicyAttribute::new("ProxyProtocol", "true")],
        })
        .await
    }

    /// Ensure the negotiation policy exists and is set on every TLS listener
    async fn ensure_ssl_negotiation_policy(
        &self,
        lb: &LoadBalancerDescription,
        predefined: &str,
    ) -> Result<bool> {
        let name = lb.load_balancer_name.as_str();
        let policy_name = ssl_negotiation_policy_name(predefined);
        let mut changed = self
            .ensure_policy(CreatePolicyRequest {
                load_balancer_name: name.to_string(),
                policy_name: policy_name.clone(),
                policy_type_name: SSL_NEGOTIATION_POLICY_TYPE.to_string(),
                attributes: vec![PolicyAttribute::new(SSL_REFERENCE_POLICY_ATTRIBUTE, predefined)],
            })
            .await?;

        for description in &lb.listener_descriptions {
            if !is_tls_protocol(&description.listener.protocol)
                || description.policy_names.contains(&policy_name)
            {
                continue;
            }
            let port = description.listener.load_balancer_port;
            info!(
                load_balancer = name,
                port,
                policy = %policy_name,
                "Setting SSL negotiation policy on listener"
            );
            self.api
                .set_load_balancer_policies_of_listener(
                    name,
                    port,
                    std::slice::from_ref(&policy_name),
                )
                .await?;
            changed = true;
        }
        Ok(changed)
    }

    async fn update_instance_security_groups(
        &self,
        lb: &LoadBalancerDescription,
        spec: &ServiceLoadBalancerSpec,
        instances: &[Instance],
    ) -> Result<()> {
        if self.disable_security_group_ingress {
            return Ok(());
        }
        let mut groups = lb.security_groups.clone();
        if groups.is_empty() {
            if self.vpc_id.is_some() {
                return Err(Error::ConfigError(format!(
                    "could not determine security group for load balancer {}",
                    lb.load_balancer_name
                )));
            }
            // Load balancers outside a VPC have no groups to admit traffic from
            return Ok(());
        }
        sort_security_groups(&mut groups, &spec.security_groups, &spec.extra_security_groups);
        self.security_groups()
            .update_instance_ingress(&groups[0], instances)
            .await
    }

    async fn ensure_instances_registered(
        &self,
        name: &str,
        registered: &[String],
        instances: &[Instance],
    ) -> Result<()> {
        let expected: BTreeSet<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        let actual: BTreeSet<&str> = registered.iter().map(String::as_str).collect();

        let additions: Vec<String> = expected.difference(&actual).map(|s| s.to_string()).collect();
        let removals: Vec<String> = actual.difference(&expected).map(|s| s.to_string()).collect();

        if !additions.is_empty() {
            info!(
                load_balancer = name,
                instances = ?additions,
                "Registering instances with load balancer"
            );
            self.api
                .register_instances_with_load_balancer(name, &additions)
                .await?;
        }
        if !removals.is_empty() {
            info!(
                load_balancer = name,
                instances = ?removals,
                "Deregistering instances from load balancer"
            );
            self.api
                .deregister_instances_from_load_balancer(name, &removals)
                .await?;
        }
        Ok(())
    }

    /// Refresh backend registration and instance ingress after the node set
    /// changed
    #[instrument(skip(self, spec, nodes), fields(service = %spec.service_name()))]
    pub async fn update_load_balancer(
        &self,
        spec: &ServiceLoadBalancerSpec,
        nodes: &[Node],
    ) -> Result<()> {
        let name = load_balancer_name(&spec.uid);
        let lb = self.api.describe_load_balancer(&name).await?.ok_or_else(|| {
            Error::CloudError(CloudError::new(
                "DescribeLoadBalancers",
                codes::LOAD_BALANCER_NOT_FOUND,
                format!("load balancer {name} not found"),
            ))
        })?;
        let instances = self.find_instances(spec, nodes).await?;

        if let Some(policy) = spec.ssl_negotiation_policy.as_deref() {
            self.ensure_ssl_negotiation_policy(&lb, policy).await?;
        }
        self.ensure_instances_registered(&name, &lb.instances, &instances)
            .await?;
        self.update_instance_security_groups(&lb, spec, &instances)
            .await
    }

    /// Current status of the Service's load balancer, if it exists
    pub async fn get_load_balancer(
        &self,
        spec: &ServiceLoadBalancerSpec,
    ) -> Result<Option<LoadBalancerStatus>> {
        let name = load_balancer_name(&spec.uid);
        Ok(self
            .api
            .describe_load_balancer(&name)
            .await?
            .as_ref()
            .map(LoadBalancerStatus::from_description))
    }

    /// Remove the load balancer and every security group created for it
    #[instrument(skip(self, spec), fields(service = %spec.service_name()))]
    pub async fn ensure_load_balancer_deleted(&self, spec: &ServiceLoadBalancerSpec) -> Result<()> {
        let name = load_balancer_name(&spec.uid);
        let Some(lb) = self.api.describe_load_balancer(&name).await? else {
            debug!(load_balancer = %name, "Load balancer already deleted");
            return Ok(());
        };

        if !lb.instances.is_empty() {
            info!(load_balancer = %name, count = lb.instances.len(), "Deregistering all instances");
            self.api
                .deregister_instances_from_load_balancer(&name, &lb.instances)
                .await?;
        }

        self.update_instance_security_groups(&lb, spec, &[]).await?;

        info!(load_balancer = %name, "Deleting load balancer");
        self.api.delete_load_balancer(&name).await?;

        let groups = self.deletable_security_groups(spec, &lb).await?;
        self.delete_security_groups(&name, groups).await
    }

    /// Groups of the load balancer that this cluster created and may delete
    async fn deletable_security_groups(
        &self,
        spec: &ServiceLoadBalancerSpec,
        lb: &LoadBalancerDescription,
    ) -> Result<BTreeSet<String>> {
        if lb.security_groups.is_empty() {
            return Ok(BTreeSet::new());
        }
        let annotated: HashSet<&String> = spec
            .security_groups
            .iter()
            .chain(spec.extra_security_groups.iter())
            .collect();

        let described = self
            .api
            .describe_security_groups(&[Filter::new(filters::GROUP_ID, lb.security_groups.iter())])
            .await?;

        let mut deletable = BTreeSet::new();
        for group in described {
            if group.group_id.is_empty() {
                warn!(service = %spec.service_name(), "Ignoring empty security group");
                continue;
            }
            if self.elb_security_group.as_deref() == Some(group.group_id.as_str()) {
                continue;
            }
            if !self.tagging.has_cluster_tag(&group.tags) {
                warn!(
                    group_id = %group.group_id,
                    "Ignoring security group without the cluster tag"
                );
                continue;
            }
            if annotated.contains(&group.group_id) {
                warn!(
                    group_id = %group.group_id,
                    "Ignoring security group named by a Service annotation"
                );
                continue;
            }
            deletable.insert(group.group_id);
        }
        Ok(deletable)
    }

    /// Delete groups, retrying while the deleted load balancer still holds them
    async fn delete_security_groups(
        &self,
        load_balancer: &str,
        mut groups: BTreeSet<String>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.deletion.timeout();
        loop {
            let pending: Vec<String> = groups.iter().cloned().collect();
            for group_id in pending {
                match self.api.delete_security_group(&group_id).await {
                    Ok(()) => {
                        info!(group_id = %group_id, "Deleted load balancer security group");
                        groups.remove(&group_id);
                    }
                    Err(e) if e.is_group_not_found() => {
                        groups.remove(&group_id);
                    }
                    Err(e) if e.is_dependency_violation() => {
                        debug!(
                            group_id = %group_id,
                            "Security group still in use, load balancer deletion in progress"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if groups.is_empty() {
                debug!(load_balancer, "Deleted all security groups for load balancer");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::SecurityGroupDeletionTimeout {
                    load_balancer: load_balancer.to_string(),
                    groups: groups.into_iter().collect(),
                });
            }
            info!(
                load_balancer,
                remaining = groups.len(),
                "Waiting for load balancer deletion before deleting security groups"
            );
            tokio::time::sleep(self.deletion.poll_interval()).await;
        }
    }
}
