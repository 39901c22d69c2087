//! Mapping between Kubernetes nodes and cloud instances

pub mod cache;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, NodeAddress};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::cloud::{filters, CloudApi, Filter, Instance, InstanceState};
use crate::error::{Error, Result};

pub use cache::{CacheCriteria, InstanceCache, InstanceSnapshot};

/// Nodes carrying this label never receive load balancer traffic
pub const LABEL_EXCLUDE_FROM_LOAD_BALANCERS: &str =
    "node.kubernetes.io/exclude-from-external-load-balancers";

const PROVIDER_SCHEME: &str = "aws://";

/// A cloud instance ID, e.g. `i-0123456789abcdef0`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a node's provider ID.
    ///
    /// Accepts `aws:///<zone>/<id>`, `aws:////<id>` and a bare `i-…` ID.
    pub fn from_provider_id(provider_id: &str) -> Result<Self> {
        let invalid =
            || Error::ValidationError(format!("invalid instance provider ID {provider_id:?}"));

        let rest = match provider_id.strip_prefix(PROVIDER_SCHEME) {
            Some(rest) => rest,
            None if provider_id.contains("://") => return Err(invalid()),
            None => return Self::validated(provider_id).ok_or_else(invalid),
        };
        // Skip the (normally empty) host part
        let path = rest.find('/').map(|i| &rest[i..]).unwrap_or_default();
        let tokens: Vec<&str> = path.trim_matches('/').split('/').collect();
        let id = match tokens.as_slice() {
            [id] => *id,
            [_zone, id] => *id,
            _ => return Err(invalid()),
        };
        Self::validated(id).ok_or_else(invalid)
    }

    fn validated(id: &str) -> Option<Self> {
        (id.starts_with("i-") && id.len() > 2 && !id.contains('/')).then(|| Self(id.to_string()))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_provider_id(s)
    }
}

/// Read access to the node informer's store
pub trait NodeLookup: Send + Sync {
    /// Fails with [`Error::InformerNotSynced`] until the initial list completes
    fn get_node(&self, name: &str) -> Result<Option<Arc<Node>>>;
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

/// Whether a node should be registered with load balancers at all
pub fn node_is_eligible(node: &Node) -> bool {
    node_is_ready(node) && !node.labels().contains_key(LABEL_EXCLUDE_FROM_LOAD_BALANCERS)
}

/// Eligible nodes carrying every requested label
pub fn select_target_nodes<'a>(
    nodes: &'a [Node],
    target_labels: &BTreeMap<String, String>,
) -> Vec<&'a Node> {
    nodes
        .iter()
        .filter(|node| node_is_eligible(node))
        .filter(|node| {
            let labels = node.labels();
            target_labels
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
        })
        .collect()
}

/// Instance IDs of the given nodes; nodes without a usable provider ID are
/// logged and left out
pub fn instance_ids_for_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<InstanceId> {
    let mut ids = Vec::new();
    for node in nodes {
        let Some(provider_id) = node.spec.as_ref().and_then(|s| s.provider_id.as_deref()) else {
            warn!(node = %node.name_any(), "Node has no provider ID, excluding it");
            continue;
        };
        match InstanceId::from_provider_id(provider_id) {
            Ok(id) => ids.push(id),
            Err(e) => warn!(
                node = %node.name_any(),
                error = %e,
                "Unable to map node to an instance, excluding it"
            ),
        }
    }
    ids.sort();
    ids.dedup();
    ids
}

fn address(type_: &str, value: &str) -> NodeAddress {
    NodeAddress {
        type_: type_.to_string(),
        address: value.to_string(),
    }
}

/// Addresses a node backed by `instance` should report
pub fn node_addresses(instance: &Instance) -> Vec<NodeAddress> {
    let mut addresses = Vec::new();
    if let Some(ip) = instance.private_ip_address.as_deref().filter(|s| !s.is_empty()) {
        addresses.push(address("InternalIP", ip));
    }
    if let Some(ip) = instance.public_ip_address.as_deref().filter(|s| !s.is_empty()) {
        addresses.push(address("ExternalIP", ip));
    }
    if let Some(dns) = instance.private_dns_name.as_deref().filter(|s| !s.is_empty()) {
        addresses.push(address("InternalDNS", dns));
        addresses.push(address("Hostname", dns));
    }
    if let Some(dns) = instance.public_dns_name.as_deref().filter(|s| !s.is_empty()) {
        addresses.push(address("ExternalDNS", dns));
    }
    addresses
}

/// Node lifecycle queries answered from the compute API
pub struct InstanceLookup {
    api: Arc<dyn CloudApi>,
    nodes: Arc<dyn NodeLookup>,
}

impl InstanceLookup {
    pub fn new(api: Arc<dyn CloudApi>, nodes: Arc<dyn NodeLookup>) -> Self {
        Self { api, nodes }
    }

    /// Describe one instance; `None` if the provider no longer knows it
    async fn describe_instance(&self, id: &InstanceId) -> Result<Option<Instance>> {
        let instances = match self
            .api
            .describe_instances(&[Filter::new(filters::INSTANCE_ID, [id.as_str()])])
            .await
        {
            Ok(instances) => instances,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if instances.len() > 1 {
            return Err(Error::ValidationError(format!(
                "multiple instances found for {id}"
            )));
        }
        Ok(instances.into_iter().next())
    }

    /// False once the instance is gone or terminated
    pub async fn instance_exists_by_provider_id(&self, provider_id: &str) -> Result<bool> {
        let id = InstanceId::from_provider_id(provider_id)?;
        match self.describe_instance(&id).await? {
            None => Ok(false),
            Some(instance) if instance.state == InstanceState::Terminated => {
                warn!(instance = %id, "Instance is terminated");
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }

    /// True only for a stopped instance
    pub async fn instance_shutdown_by_provider_id(&self, provider_id: &str) -> Result<bool> {
        let id = InstanceId::from_provider_id(provider_id)?;
        match self.describe_instance(&id).await? {
            None => {
                warn!(instance = %id, "Instance does not exist anymore");
                Ok(false)
            }
            Some(instance) => Ok(instance.state == InstanceState::Stopped),
        }
    }

    pub async fn node_addresses_by_provider_id(
        &self,
        provider_id: &str,
    ) -> Result<Vec<NodeAddress>> {
        let id = InstanceId::from_provider_id(provider_id)?;
        let instance = self.describe_instance(&id).await?.ok_or_else(|| {
            Error::ValidationError(format!("instance {id} not found"))
        })?;
        Ok(node_addresses(&instance))
    }

    /// Instance backing a node: its provider ID when set, otherwise the
    /// instance whose private DNS name is the node name
    pub async fn instance_id_by_node_name(&self, node_name: &str) -> Result<Option<InstanceId>> {
        let node = self.nodes.get_node(node_name)?;
        if let Some(provider_id) = node
            .as_ref()
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.provider_id.as_deref())
            .filter(|p| !p.is_empty())
        {
            return InstanceId::from_provider_id(provider_id).map(Some);
        }

        debug!(
            node = node_name,
            "Node has no provider ID, looking up instance by private DNS name"
        );
        let instances = self
            .api
            .describe_instances(&[
                Filter::new(filters::PRIVATE_DNS_NAME, [node_name]),
                Filter::new(
                    filters::INSTANCE_STATE_NAME,
                    ["pending", "running", "stopping", "stopped"],
                ),
            ])
            .await?;
        match instances.as_slice() {
            [] => Ok(None),
            [instance] => Ok(Some(InstanceId(instance.instance_id.clone()))),
            _ => Err(Error::ValidationError(format!(
                "multiple instances found for node {node_name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloud;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::HashMap;

    fn node(name: &str, provider_id: Option<&str>, ready: bool, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(String::from),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    struct StaticNodes(HashMap<String, Arc<Node>>);

    impl NodeLookup for StaticNodes {
        fn get_node(&self, name: &str) -> Result<Option<Arc<Node>>> {
            Ok(self.0.get(name).cloned())
        }
    }

    #[test]
    fn test_provider_id_forms() {
        let expected = InstanceId("i-0123456789abcdef0".to_string());
        for form in [
            "aws:///us-east-1a/i-0123456789abcdef0",
            "aws:////i-0123456789abcdef0",
            "i-0123456789abcdef0",
        ] {
            assert_eq!(InstanceId::from_provider_id(form).unwrap(), expected, "{form}");
        }
    }

    #[test]
    fn test_invalid_provider_ids() {
        for form in [
            "",
            "gce://project/zone/vm",
            "aws:///us-east-1a/vol-1",
            "aws:///a/b/i-1",
            "i-",
        ] {
            assert!(InstanceId::from_provider_id(form).is_err(), "{form}");
        }
    }

    #[test]
    fn test_target_node_selection() {
        let nodes = vec![
            node("ready", Some("i-1"), true, &[("pool", "web")]),
            node("not-ready", Some("i-2"), false, &[("pool", "web")]),
            node(
                "excluded",
                Some("i-3"),
                true,
                &[(LABEL_EXCLUDE_FROM_LOAD_BALANCERS, ""), ("pool", "web")],
            ),
            node("other-pool", Some("i-4"), true, &[("pool", "batch")]),
        ];

        let all: Vec<String> = select_target_nodes(&nodes, &BTreeMap::new())
            .into_iter()
            .map(|n| n.name_any())
            .collect();
        assert_eq!(all, vec!["ready", "other-pool"]);

        let labels = BTreeMap::from([("pool".to_string(), "web".to_string())]);
        let web: Vec<String> = select_target_nodes(&nodes, &labels)
            .into_iter()
            .map(|n| n.name_any())
            .collect();
        assert_eq!(web, vec!["ready"]);
    }

    #[test]
    fn test_unmappable_nodes_are_excluded() {
        let nodes = vec![
            node("a", Some("aws:///us-east-1a/i-1"), true, &[]),
            node("b", None, true, &[]),
            node("c", Some("bogus://x"), true, &[]),
            node("d", Some("i-1"), true, &[]),
        ];
        let ids = instance_ids_for_nodes(&nodes);
        assert_eq!(ids, vec![InstanceId("i-1".to_string())]);
    }

    #[test]
    fn test_node_addresses() {
        let instance = Instance {
            instance_id: "i-1".into(),
            private_ip_address: Some("10.0.0.5".into()),
            private_dns_name: Some("ip-10-0-0-5.ec2.internal".into()),
            public_ip_address: Some("54.1.2.3".into()),
            ..Default::default()
        };
        let types: Vec<_> = node_addresses(&instance)
            .into_iter()
            .map(|a| a.type_)
            .collect();
        assert_eq!(types, vec!["InternalIP", "ExternalIP", "InternalDNS", "Hostname"]);
    }

    #[tokio::test]
    async fn test_instance_lifecycle_queries() {
        let fake = Arc::new(FakeCloud::new());
        fake.add_instance(Instance {
            instance_id: "i-running".into(),
            ..Default::default()
        });
        fake.add_instance(Instance {
            instance_id: "i-stopped".into(),
            state: InstanceState::Stopped,
            ..Default::default()
        });
        fake.add_instance(Instance {
            instance_id: "i-gone".into(),
            state: InstanceState::Terminated,
            ..Default::default()
        });
        let lookup = InstanceLookup::new(fake, Arc::new(StaticNodes(HashMap::new())));

        assert!(lookup.instance_exists_by_provider_id("aws:///z/i-running").await.unwrap());
        assert!(lookup.instance_exists_by_provider_id("i-stopped").await.unwrap());
        assert!(!lookup.instance_exists_by_provider_id("i-gone").await.unwrap());
        assert!(!lookup.instance_exists_by_provider_id("i-missing").await.unwrap());

        assert!(lookup.instance_shutdown_by_provider_id("i-stopped").await.unwrap());
        assert!(!lookup.instance_shutdown_by_provider_id("i-running").await.unwrap());
        assert!(!lookup.instance_shutdown_by_provider_id("i-missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_instance_id_by_node_name() {
        let fake = Arc::new(FakeCloud::new());
        fake.add_instance(Instance {
            instance_id: "i-dns".into(),
            private_dns_name: Some("ip-10-0-0-9.ec2.internal".into()),
            ..Default::default()
        });
        let nodes = HashMap::from([
            (
                "with-provider".to_string(),
                Arc::new(node("with-provider", Some("aws:///z/i-7"), true, &[])),
            ),
            (
                "ip-10-0-0-9.ec2.internal".to_string(),
                Arc::new(node("ip-10-0-0-9.ec2.internal", None, true, &[])),
            ),
        ]);
        let lookup = InstanceLookup::new(fake, Arc::new(StaticNodes(nodes)));

        assert_eq!(
            lookup.instance_id_by_node_name("with-provider").await.unwrap(),
            Some(InstanceId("i-7".into()))
        );
        assert_eq!(
            lookup.instance_id_by_node_name("ip-10-0-0-9.ec2.internal").await.unwrap(),
            Some(InstanceId("i-dns".into()))
        );
        assert_eq!(lookup.instance_id_by_node_name("unknown").await.unwrap(), None);
    }
}
