//! In-memory cloud used by unit tests
//!
//! Behaves like the provider for the subset of semantics the engine relies on:
//! not-found and duplicate error codes, dependency violations when deleting a
//! group that is still referenced, and describe filters. Every call is recorded,
//! and errors can be injected per operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::codes;
use super::types::*;
use super::{filters, CloudApi, CloudError, CloudResult};
use crate::loadbalancer::rules::IpPermissionSet;

#[derive(Clone, Debug, Default)]
pub struct FakeLoadBalancer {
    pub description: LoadBalancerDescription,
    pub attributes: LoadBalancerAttributes,
    pub policies: Vec<PolicyDescription>,
    pub tags: Vec<Tag>,
}

#[derive(Default)]
struct FakeState {
    load_balancers: BTreeMap<String, FakeLoadBalancer>,
    security_groups: BTreeMap<String, SecurityGroup>,
    subnets: Vec<Subnet>,
    route_tables: Vec<RouteTable>,
    instances: Vec<Instance>,
    other_tags: HashMap<String, Vec<Tag>>,
    next_id: u64,
    calls: Vec<String>,
    queued_faults: HashMap<String, VecDeque<CloudError>>,
    sticky_faults: HashMap<String, CloudError>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:05}", self.next_id)
    }
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Record the call and return an injected error for it, if any
    fn enter(&self, operation: &str) -> CloudResult<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state();
        state.calls.push(operation.to_string());
        if let Some(err) = state
            .queued_faults
            .get_mut(operation)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }
        if let Some(err) = state.sticky_faults.get(operation) {
            return Err(err.clone());
        }
        Ok(state)
    }

    // -- fixtures -----------------------------------------------------------

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state().subnets.push(subnet);
    }

    pub fn add_route_table(&self, table: RouteTable) {
        self.state().route_tables.push(table);
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state().instances.push(instance);
    }

    pub fn remove_instance(&self, instance_id: &str) {
        self.state().instances.retain(|i| i.instance_id != instance_id);
    }

    /// Insert a pre-existing security group, returning its ID
    pub fn add_security_group(&self, mut group: SecurityGroup) -> String {
        let mut state = self.state();
        if group.group_id.is_empty() {
            group.group_id = state.next_id("sg");
        }
        let id = group.group_id.clone();
        state.security_groups.insert(id.clone(), group);
        id
    }

    pub fn add_load_balancer(&self, lb: FakeLoadBalancer) {
        let name = lb.description.load_balancer_name.clone();
        self.state().load_balancers.insert(name, lb);
    }

    /// Fail the next call of `operation` with `err`
    pub fn fail_next(&self, operation: &str, err: CloudError) {
        self.state()
            .queued_faults
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    /// Fail every call of `operation` with `err` until cleared
    pub fn fail_always(&self, operation: &str, err: CloudError) {
        self.state()
            .sticky_faults
            .insert(operation.to_string(), err);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.queued_faults.clear();
        state.sticky_faults.clear();
    }

    // -- inspection ---------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    /// Calls that change provider state
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("Describe"))
            .collect()
    }

    pub fn load_balancer(&self, name: &str) -> Option<FakeLoadBalancer> {
        self.state().load_balancers.get(name).cloned()
    }

    pub fn security_group(&self, group_id: &str) -> Option<SecurityGroup> {
        self.state().security_groups.get(group_id).cloned()
    }

    pub fn security_group_by_name(&self, name: &str) -> Option<SecurityGroup> {
        self.state()
            .security_groups
            .values()
            .find(|g| g.group_name == name)
            .cloned()
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state().security_groups.values().cloned().collect()
    }
}

fn not_found(operation: &str, code: &str, what: &str) -> CloudError {
    CloudError::new(operation, code, format!("{what} not found"))
}

fn tags_match(tags: &[Tag], filter: &Filter) -> bool {
    if filter.name == filters::TAG_KEY {
        return tags.iter().any(|t| filter.values.contains(&t.key));
    }
    if let Some(key) = filter.name.strip_prefix("tag:") {
        return tags
            .iter()
            .any(|t| t.key == key && filter.values.contains(&t.value));
    }
    true
}

fn value_matches(value: Option<&str>, filter: &Filter) -> bool {
    value.is_some_and(|v| filter.values.iter().any(|f| f == v))
}

fn group_matches(group: &SecurityGroup, filter: &Filter) -> bool {
    match filter.name.as_str() {
        filters::VPC_ID => value_matches(group.vpc_id.as_deref(), filter),
        filters::GROUP_NAME => value_matches(Some(&group.group_name), filter),
        filters::GROUP_ID => value_matches(Some(&group.group_id), filter),
        filters::IP_PERMISSION_GROUP_ID => group.ip_permissions.iter().any(|p| {
            p.user_id_group_pairs
                .iter()
                .any(|pair| value_matches(pair.group_id.as_deref(), filter))
        }),
        _ => tags_match(&group.tags, filter),
    }
}

fn subnet_matches(subnet: &Subnet, filter: &Filter) -> bool {
    match filter.name.as_str() {
        filters::VPC_ID => value_matches(Some(&subnet.vpc_id), filter),
        filters::SUBNET_ID => value_matches(Some(&subnet.subnet_id), filter),
        _ => tags_match(&subnet.tags, filter),
    }
}

fn route_table_matches(table: &RouteTable, subnets: &[Subnet], filter: &Filter) -> bool {
    match filter.name.as_str() {
        filters::ASSOCIATION_SUBNET_ID => table
            .associations
            .iter()
            .any(|a| value_matches(a.subnet_id.as_deref(), filter)),
        filters::ASSOCIATION_MAIN => {
            let wanted = filter.values.iter().any(|v| v == "true");
            table.associations.iter().any(|a| a.main == wanted)
        }
        // Route tables have no VPC field of their own here; accept tables
        // associated with a subnet of that VPC, or main tables.
        filters::VPC_ID => table.associations.iter().any(|a| {
            a.main
                || a.subnet_id.as_deref().is_some_and(|id| {
                    subnets
                        .iter()
                        .any(|s| s.subnet_id == id && filter.values.contains(&s.vpc_id))
                })
        }),
        _ => true,
    }
}

fn instance_state_name(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Pending => "pending",
        InstanceState::Running => "running",
        InstanceState::ShuttingDown => "shutting-down",
        InstanceState::Terminated => "terminated",
        InstanceState::Stopping => "stopping",
        InstanceState::Stopped => "stopped",
    }
}

fn instance_matches(instance: &Instance, filter: &Filter) -> bool {
    match filter.name.as_str() {
        filters::INSTANCE_ID => value_matches(Some(&instance.instance_id), filter),
        filters::INSTANCE_STATE_NAME => {
            value_matches(Some(instance_state_name(instance.state)), filter)
        }
        filters::VPC_ID => value_matches(instance.vpc_id.as_deref(), filter),
        filters::PRIVATE_DNS_NAME => value_matches(instance.private_dns_name.as_deref(), filter),
        _ => tags_match(&instance.tags, filter),
    }
}

fn merge_tags(existing: &mut Vec<Tag>, new: &[Tag]) {
    for tag in new {
        match existing.iter_mut().find(|t| t.key == tag.key) {
            Some(t) => t.value = tag.value.clone(),
            None => existing.push(tag.clone()),
        }
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn describe_load_balancer(
        &self,
        name: &str,
    ) -> CloudResult<Option<LoadBalancerDescription>> {
        let state = self.enter("DescribeLoadBalancers")?;
        Ok(state
            .load_balancers
            .get(name)
            .map(|lb| lb.description.clone()))
    }

    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> CloudResult<String> {
        let mut state = self.enter("CreateLoadBalancer")?;
        if state.load_balancers.contains_key(&request.load_balancer_name) {
            return Err(CloudError::new(
                "CreateLoadBalancer",
                "DuplicateLoadBalancerName",
                "load balancer already exists",
            ));
        }
        let vpc_id = request.subnets.first().and_then(|id| {
            state
                .subnets
                .iter()
                .find(|s| &s.subnet_id == id)
                .map(|s| s.vpc_id.clone())
        });
        let zones: Vec<String> = if request.subnets.is_empty() {
            request.availability_zones.clone()
        } else {
            request
                .subnets
                .iter()
                .filter_map(|id| state.subnets.iter().find(|s| &s.subnet_id == id))
                .map(|s| s.availability_zone.clone())
                .collect()
        };
        let dns_name = format!("{}-1234567890.elb.example.com", request.load_balancer_name);
        let lb = FakeLoadBalancer {
            description: LoadBalancerDescription {
                load_balancer_name: request.load_balancer_name.clone(),
                dns_name: dns_name.clone(),
                scheme: request
                    .scheme
                    .clone()
                    .unwrap_or_else(|| "internet-facing".to_string()),
                vpc_id,
                listener_descriptions: request
                    .listeners
                    .iter()
                    .map(|l| ListenerDescription {
                        listener: l.clone(),
                        policy_names: Vec::new(),
                    })
                    .collect(),
                security_groups: request.security_groups.clone(),
                subnets: request.subnets.clone(),
                availability_zones: zones,
                instances: Vec::new(),
                health_check: Some(HealthCheck {
                    target: format!(
                        "TCP:{}",
                        request.listeners.first().map(|l| l.instance_port).unwrap_or(80)
                    ),
                    healthy_threshold: 10,
                    unhealthy_threshold: 2,
                    timeout: 5,
                    interval: 30,
                }),
                backend_server_descriptions: Vec::new(),
            },
            attributes: LoadBalancerAttributes {
                idle_timeout: 60,
                connection_draining: ConnectionDraining {
                    enabled: false,
                    timeout: 300,
                },
                ..Default::default()
            },
            policies: Vec::new(),
            tags: request.tags.clone(),
        };
        state
            .load_balancers
            .insert(request.load_balancer_name.clone(), lb);
        Ok(dns_name)
    }

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()> {
        let mut state = self.enter("DeleteLoadBalancer")?;
        state.load_balancers.remove(name);
        Ok(())
    }

    async fn create_load_balancer_listeners(
        &self,
        name: &str,
        listeners: &[Listener],
    ) -> CloudResult<()> {
        let op = "CreateLoadBalancerListeners";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        for listener in listeners {
            if lb
                .description
                .listener_descriptions
                .iter()
                .any(|d| d.listener.load_balancer_port == listener.load_balancer_port)
            {
                return Err(CloudError::new(op, "DuplicateListener", "port in use"));
            }
            lb.description.listener_descriptions.push(ListenerDescription {
                listener: listener.clone(),
                policy_names: Vec::new(),
            });
        }
        Ok(())
    }

    async fn delete_load_balancer_listeners(&self, name: &str, ports: &[i32]) -> CloudResult<()> {
        let op = "DeleteLoadBalancerListeners";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        lb.description
            .listener_descriptions
            .retain(|d| !ports.contains(&d.listener.load_balancer_port));
        Ok(())
    }

    async fn apply_security_groups_to_load_balancer(
        &self,
        name: &str,
        group_ids: &[String],
    ) -> CloudResult<()> {
        let op = "ApplySecurityGroupsToLoadBalancer";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        lb.description.security_groups = group_ids.to_vec();
        Ok(())
    }

    async fn configure_health_check(
        &self,
        name: &str,
        health_check: &HealthCheck,
    ) -> CloudResult<()> {
        let op = "ConfigureHealthCheck";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        lb.description.health_check = Some(health_check.clone());
        Ok(())
    }

    async fn describe_load_balancer_attributes(
        &self,
        name: &str,
    ) -> CloudResult<LoadBalancerAttributes> {
        let op = "DescribeLoadBalancerAttributes";
        let state = self.enter(op)?;
        state
            .load_balancers
            .get(name)
            .map(|lb| lb.attributes.clone())
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))
    }

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> CloudResult<()> {
        let op = "ModifyLoadBalancerAttributes";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        lb.attributes = attributes.clone();
        Ok(())
    }

    async fn register_instances_with_load_balancer(
        &self,
        name: &str,
        instance_ids: &[String],
    ) -> CloudResult<()> {
        let op = "RegisterInstancesWithLoadBalancer";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        for id in instance_ids {
            if !lb.description.instances.contains(id) {
                lb.description.instances.push(id.clone());
            }
        }
        Ok(())
    }

    async fn deregister_instances_from_load_balancer(
        &self,
        name: &str,
        instance_ids: &[String],
    ) -> CloudResult<()> {
        let op = "DeregisterInstancesFromLoadBalancer";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        lb.description.instances.retain(|id| !instance_ids.contains(id));
        Ok(())
    }

    async fn describe_load_balancer_policies(
        &self,
        name: &str,
        policy_names: &[String],
    ) -> CloudResult<Vec<PolicyDescription>> {
        let op = "DescribeLoadBalancerPolicies";
        let state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        if policy_names.is_empty() {
            return Ok(lb.policies.clone());
        }
        let mut found = Vec::new();
        for wanted in policy_names {
            match lb.policies.iter().find(|p| &p.policy_name == wanted) {
                Some(p) => found.push(p.clone()),
                None => return Err(not_found(op, codes::POLICY_NOT_FOUND, wanted)),
            }
        }
        Ok(found)
    }

    async fn create_load_balancer_policy(&self, request: &CreatePolicyRequest) -> CloudResult<()> {
        let op = "CreateLoadBalancerPolicy";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(&request.load_balancer_name)
            .ok_or_else(|| {
                not_found(op, codes::LOAD_BALANCER_NOT_FOUND, &request.load_balancer_name)
            })?;
        if lb.policies.iter().any(|p| p.policy_name == request.policy_name) {
            return Err(CloudError::new(op, "DuplicatePolicyName", "policy exists"));
        }
        lb.policies.push(PolicyDescription {
            policy_name: request.policy_name.clone(),
            policy_type_name: request.policy_type_name.clone(),
            attributes: request.attributes.clone(),
        });
        Ok(())
    }

    async fn set_load_balancer_policies_for_backend_server(
        &self,
        name: &str,
        instance_port: i32,
        policy_names: &[String],
    ) -> CloudResult<()> {
        let op = "SetLoadBalancerPoliciesForBackendServer";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        let backends = &mut lb.description.backend_server_descriptions;
        backends.retain(|b| b.instance_port != instance_port);
        if !policy_names.is_empty() {
            backends.push(BackendServerDescription {
                instance_port,
                policy_names: policy_names.to_vec(),
            });
        }
        Ok(())
    }

    async fn set_load_balancer_policies_of_listener(
        &self,
        name: &str,
        load_balancer_port: i32,
        policy_names: &[String],
    ) -> CloudResult<()> {
        let op = "SetLoadBalancerPoliciesOfListener";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        let listener = lb
            .description
            .listener_descriptions
            .iter_mut()
            .find(|d| d.listener.load_balancer_port == load_balancer_port)
            .ok_or_else(|| CloudError::new(op, "ListenerNotFound", "no listener on port"))?;
        listener.policy_names = policy_names.to_vec();
        Ok(())
    }

    async fn add_load_balancer_tags(&self, name: &str, tags: &[Tag]) -> CloudResult<()> {
        let op = "AddTags";
        let mut state = self.enter(op)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found(op, codes::LOAD_BALANCER_NOT_FOUND, name))?;
        merge_tags(&mut lb.tags, tags);
        Ok(())
    }

    async fn describe_instances(&self, filters: &[Filter]) -> CloudResult<Vec<Instance>> {
        let state = self.enter("DescribeInstances")?;
        Ok(state
            .instances
            .iter()
            .filter(|i| filters.iter().all(|f| instance_matches(i, f)))
            .cloned()
            .collect())
    }

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> CloudResult<Vec<SecurityGroup>> {
        let state = self.enter("DescribeSecurityGroups")?;
        Ok(state
            .security_groups
            .values()
            .filter(|g| filters.iter().all(|f| group_matches(g, f)))
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> CloudResult<String> {
        let op = "CreateSecurityGroup";
        let mut state = self.enter(op)?;
        if state
            .security_groups
            .values()
            .any(|g| g.group_name == name && g.vpc_id.as_deref() == vpc_id)
        {
            return Err(CloudError::new(op, codes::GROUP_DUPLICATE, "group exists"));
        }
        let id = state.next_id("sg");
        state.security_groups.insert(
            id.clone(),
            SecurityGroup {
                group_id: id.clone(),
                group_name: name.to_string(),
                description: description.to_string(),
                vpc_id: vpc_id.map(String::from),
                ip_permissions: Vec::new(),
                tags: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()> {
        let op = "DeleteSecurityGroup";
        let mut state = self.enter(op)?;
        if !state.security_groups.contains_key(group_id) {
            return Err(not_found(op, codes::GROUP_NOT_FOUND, group_id));
        }
        let in_use_by_lb = state
            .load_balancers
            .values()
            .any(|lb| lb.description.security_groups.iter().any(|g| g == group_id));
        let referenced = state.security_groups.values().any(|g| {
            g.group_id != group_id
                && g.ip_permissions.iter().any(|p| {
                    p.user_id_group_pairs
                        .iter()
                        .any(|pair| pair.group_id.as_deref() == Some(group_id))
                })
        });
        if in_use_by_lb || referenced {
            return Err(CloudError::new(
                op,
                codes::DEPENDENCY_VIOLATION,
                "resource has a dependent object",
            ));
        }
        state.security_groups.remove(group_id);
        Ok(())
    }

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> CloudResult<()> {
        let op = "AuthorizeSecurityGroupIngress";
        let mut state = self.enter(op)?;
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found(op, codes::GROUP_NOT_FOUND, group_id))?;

        let existing: IpPermissionSet = group.ip_permissions.iter().collect();
        let existing = existing.ungroup();
        let incoming: IpPermissionSet = permissions.iter().collect();
        let incoming = incoming.ungroup();
        if incoming.iter().any(|p| existing.contains(p)) {
            return Err(CloudError::new(
                op,
                codes::PERMISSION_DUPLICATE,
                "the specified rule already exists",
            ));
        }
        group.ip_permissions = existing.union(&incoming).list();
        Ok(())
    }

    async fn revoke_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> CloudResult<()> {
        let op = "RevokeSecurityGroupIngress";
        let mut state = self.enter(op)?;
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found(op, codes::GROUP_NOT_FOUND, group_id))?;

        let existing: IpPermissionSet = group.ip_permissions.iter().collect();
        let existing = existing.ungroup();
        let outgoing: IpPermissionSet = permissions.iter().collect();
        let outgoing = outgoing.ungroup();
        if outgoing.iter().any(|p| !existing.contains(p)) {
            return Err(CloudError::new(
                op,
                codes::PERMISSION_NOT_FOUND,
                "the specified rule does not exist",
            ));
        }
        group.ip_permissions = existing.difference(&outgoing).list();
        Ok(())
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> CloudResult<()> {
        let op = "CreateTags";
        let mut state = self.enter(op)?;
        if let Some(group) = state.security_groups.get_mut(resource_id) {
            merge_tags(&mut group.tags, tags);
            return Ok(());
        }
        if resource_id.starts_with("sg-") {
            return Err(not_found(op, codes::GROUP_NOT_FOUND, resource_id));
        }
        merge_tags(
            state.other_tags.entry(resource_id.to_string()).or_default(),
            tags,
        );
        Ok(())
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> CloudResult<Vec<Subnet>> {
        let state = self.enter("DescribeSubnets")?;
        Ok(state
            .subnets
            .iter()
            .filter(|s| filters.iter().all(|f| subnet_matches(s, f)))
            .cloned()
            .collect())
    }

    async fn describe_route_tables(&self, filters: &[Filter]) -> CloudResult<Vec<RouteTable>> {
        let state = self.enter("DescribeRouteTables")?;
        Ok(state
            .route_tables
            .iter()
            .filter(|t| filters.iter().all(|f| route_table_matches(t, &state.subnets, f)))
            .cloned()
            .collect())
    }
}
