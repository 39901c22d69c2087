//! Security group reconciliation
//!
//! All changes are expressed as rule-set differences and applied as
//! authorize/revoke calls against a single group. Groups named in the cloud
//! config as shared are never modified.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::rules::{is_owned_by, IpPermissionSet};
use crate::cloud::{
    error::codes, filters, ClusterTagging, CloudApi, CloudError, Filter, GroupIdentifier, Instance,
    IpPermission, ResourceLifecycle, SecurityGroup, UserIdGroupPair,
};
use crate::error::{Error, Result};

/// Attempts at the describe-then-create race before giving up
const MAX_READ_THEN_CREATE_RETRIES: u32 = 30;

/// True if every peer of `new` is already granted by `existing`
///
/// Protocol and port range must match exactly; user IDs of peer groups are
/// only compared when the new rule names one.
pub fn permission_exists(new: &IpPermission, existing: &IpPermission) -> bool {
    if new.ip_protocol != existing.ip_protocol
        || new.from_port != existing.from_port
        || new.to_port != existing.to_port
    {
        return false;
    }
    if new.ip_ranges.is_empty() && new.user_id_group_pairs.is_empty() {
        return false;
    }

    let ranges_covered = new.ip_ranges.iter().all(|range| {
        existing
            .ip_ranges
            .iter()
            .any(|e| e.cidr_ip == range.cidr_ip)
    });
    let pairs_covered = new.user_id_group_pairs.iter().all(|pair| {
        existing.user_id_group_pairs.iter().any(|e| {
            e.group_id == pair.group_id && (pair.user_id.is_none() || e.user_id == pair.user_id)
        })
    });
    ranges_covered && pairs_covered
}

fn group_not_found(group_id: &str) -> Error {
    Error::CloudError(CloudError::new(
        "DescribeSecurityGroups",
        codes::GROUP_NOT_FOUND,
        format!("security group {group_id} not found"),
    ))
}

/// The rule granting all traffic from a load balancer's group to instances
pub fn load_balancer_source_permission(load_balancer_group_id: &str) -> IpPermission {
    IpPermission {
        ip_protocol: "-1".to_string(),
        from_port: None,
        to_port: None,
        ip_ranges: Vec::new(),
        user_id_group_pairs: vec![UserIdGroupPair::group(load_balancer_group_id)],
    }
}

/// Pick the group of an instance that should admit load balancer traffic.
///
/// Exactly one cluster-tagged group is required; for clusters created before
/// group tagging, a single untagged group is accepted.
pub fn find_security_group_for_instance<'a>(
    instance: &'a Instance,
    tagged_groups: &HashMap<String, SecurityGroup>,
) -> Result<Option<&'a GroupIdentifier>> {
    let mut tagged = Vec::new();
    let mut untagged = Vec::new();
    for group in &instance.security_groups {
        if group.group_id.is_empty() {
            warn!(instance = %instance.instance_id, "Ignoring security group without ID");
            continue;
        }
        if tagged_groups.contains_key(&group.group_id) {
            tagged.push(group);
        } else {
            untagged.push(group);
        }
    }

    match (tagged.as_slice(), untagged.as_slice()) {
        ([one], _) => Ok(Some(*one)),
        ([], [one]) => Ok(Some(*one)),
        ([], []) => {
            warn!(instance = %instance.instance_id, "No security group found for instance");
            Ok(None)
        }
        ([], _) => Err(Error::ConfigError(format!(
            "multiple untagged security groups found for instance {}; \
             ensure the cluster security group is tagged",
            instance.instance_id
        ))),
        (many, _) => Err(Error::ConfigError(format!(
            "multiple tagged security groups found for instance {}: {}",
            instance.instance_id,
            many.iter()
                .map(|g| format!("{}({})", g.group_id, g.group_name))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

pub struct SecurityGroupReconciler<'a> {
    pub api: &'a dyn CloudApi,
    pub tagging: &'a ClusterTagging,
    /// Group shared by every load balancer, configured by the operator
    pub protected_group: Option<&'a str>,
}

impl SecurityGroupReconciler<'_> {
    fn is_protected(&self, group_id: &str) -> bool {
        self.protected_group == Some(group_id)
    }

    pub async fn describe_group(&self, group_id: &str) -> Result<Option<SecurityGroup>> {
        let groups = match self
            .api
            .describe_security_groups(&[Filter::new(filters::GROUP_ID, [group_id])])
            .await
        {
            Ok(groups) => groups,
            Err(e) if e.is_group_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if groups.len() > 1 {
            return Err(Error::ConfigError(format!(
                "found {} security groups with id {group_id}",
                groups.len()
            )));
        }
        Ok(groups.into_iter().next())
    }

    /// Make the group's ingress `desired`, revoking only the extra rules
    /// marked as owned by `owner`. Returns whether anything changed.
    pub async fn set_owned_ingress(
        &self,
        group_id: &str,
        desired: &IpPermissionSet,
        owner: &str,
    ) -> Result<bool> {
        self.converge_ingress(group_id, desired, Some(owner)).await
    }

    /// Without an owner, every extra rule is revoked
    async fn converge_ingress(
        &self,
        group_id: &str,
        desired: &IpPermissionSet,
        owner: Option<&str>,
    ) -> Result<bool> {
        if self.is_protected(group_id) {
            info!(group_id, "Not changing ingress of the shared load balancer security group");
            return Ok(false);
        }

        let group = self
            .describe_group(group_id)
            .await?
            .ok_or_else(|| group_not_found(group_id))?;

        let actual: IpPermissionSet = group.ip_permissions.iter().collect();
        let actual = actual.ungroup();
        let desired = desired.ungroup();

        let add = desired.difference(&actual);
        let mut remove = actual.difference(&desired);
        if let Some(owner) = owner {
            remove.delete_if(|p| !is_owned_by(p, owner));
        }

        if add.is_empty() && remove.is_empty() {
            return Ok(false);
        }

        if !add.is_empty() {
            debug!(group_id, rules = ?add.list(), "Adding security group ingress");
            self.api
                .authorize_security_group_ingress(group_id, &add.list())
                .await?;
        }
        if !remove.is_empty() {
            debug!(group_id, rules = ?remove.list(), "Removing security group ingress");
            self.api
                .revoke_security_group_ingress(group_id, &remove.list())
                .await?;
        }
        Ok(true)
    }

    /// Add rules that are not already granted. Returns whether anything changed.
    ///
    /// With `shared_public_group`, a duplicate-permission error from the
    /// provider is taken to mean another load balancer added the same rule.
    pub async fn add_ingress(
        &self,
        group_id: &str,
        additions: &[IpPermission],
        shared_public_group: bool,
    ) -> Result<bool> {
        let group = self
            .describe_group(group_id)
            .await?
            .ok_or_else(|| group_not_found(group_id))?;

        let changes: Vec<IpPermission> = additions
            .iter()
            .filter(|new| !group.ip_permissions.iter().any(|e| permission_exists(new, e)))
            .cloned()
            .collect();
        if changes.is_empty() {
            return Ok(false);
        }

        info!(group_id, rules = ?changes, "Adding security group ingress");
        match self
            .api
            .authorize_security_group_ingress(group_id, &changes)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if shared_public_group && e.is_duplicate_permission() => {
                debug!(
                    group_id,
                    "Ignoring duplicate permission on shared group, added by another load balancer"
                );
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke rules that are present. A missing group counts as success.
    pub async fn remove_ingress(&self, group_id: &str, removals: &[IpPermission]) -> Result<bool> {
        let Some(group) = self.describe_group(group_id).await? else {
            warn!(group_id, "Security group not found while removing ingress");
            return Ok(false);
        };

        let changes: Vec<IpPermission> = removals
            .iter()
            .filter(|old| group.ip_permissions.iter().any(|e| permission_exists(old, e)))
            .cloned()
            .collect();
        if changes.is_empty() {
            return Ok(false);
        }

        info!(group_id, rules = ?changes, "Removing security group ingress");
        match self.api.revoke_security_group_ingress(group_id, &changes).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_group_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the group named `name` in the VPC, creating and tagging it if absent
    pub async fn ensure_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
        additional_tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut lookup = vec![Filter::new(filters::GROUP_NAME, [name])];
        if let Some(vpc) = vpc_id {
            lookup.push(Filter::new(filters::VPC_ID, [vpc]));
        }

        let mut attempt = 0;
        let group_id = loop {
            attempt += 1;

            // group-name + vpc-id is the provider's primary key; ownership is
            // checked (and repaired) on what we find
            let existing = self.api.describe_security_groups(&lookup).await?;
            if let Some(group) = existing.first() {
                if existing.len() > 1 {
                    warn!(
                        name,
                        count = existing.len(),
                        "Found multiple security groups with the same name"
                    );
                }
                self.tagging
                    .read_repair(
                        self.api,
                        &group.group_id,
                        ResourceLifecycle::Owned,
                        &group.tags,
                        &BTreeMap::new(),
                    )
                    .await?;
                return Ok(group.group_id.clone());
            }

            match self.api.create_security_group(name, description, vpc_id).await {
                Ok(id) => break id,
                Err(e) if e.is_duplicate_group() && attempt < MAX_READ_THEN_CREATE_RETRIES => {
                    debug!(name, attempt, "Security group created concurrently, retrying lookup");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if group_id.is_empty() {
            return Err(Error::CloudError(CloudError::new(
                "CreateSecurityGroup",
                "MissingGroupId",
                format!("created security group {name} but no id was returned"),
            )));
        }

        // A failure here is repaired by read_repair on the next pass
        self.tagging
            .create_tags(self.api, &group_id, ResourceLifecycle::Owned, additional_tags)
            .await?;
        info!(name, group_id = %group_id, "Created security group");
        Ok(group_id)
    }

    /// Cluster-tagged groups, by ID
    pub async fn tagged_security_groups(&self) -> Result<HashMap<String, SecurityGroup>> {
        let groups = self
            .api
            .describe_security_groups(&self.tagging.filters())
            .await?;
        Ok(groups
            .into_iter()
            .filter(|g| self.tagging.has_cluster_tag(&g.tags))
            .map(|g| (g.group_id.clone(), g))
            .collect())
    }

    /// Make exactly the instances' groups admit traffic from the load
    /// balancer's group; pass no instances to revoke everywhere
    ///
    /// The shared load balancer group is admitted on behalf of every
    /// Service using it, so its ingress is only ever added, never revoked.
    pub async fn update_instance_ingress(
        &self,
        load_balancer_group_id: &str,
        instances: &[Instance],
    ) -> Result<()> {
        // Groups currently admitting the load balancer
        let actual: Vec<SecurityGroup> = self
            .api
            .describe_security_groups(&[Filter::new(
                filters::IP_PERMISSION_GROUP_ID,
                [load_balancer_group_id],
            )])
            .await?
            .into_iter()
            .filter(|g| self.tagging.has_cluster_tag(&g.tags))
            .collect();

        let tagged = if instances.is_empty() {
            HashMap::new()
        } else {
            self.tagged_security_groups().await?
        };

        // true: add, false: remove
        let mut changes: BTreeMap<String, bool> = BTreeMap::new();
        for instance in instances {
            match find_security_group_for_instance(instance, &tagged)? {
                Some(group) => {
                    changes.insert(group.group_id.clone(), true);
                }
                None => warn!(
                    instance = %instance.instance_id,
                    "Ignoring instance without security group"
                ),
            }
        }
        for group in &actual {
            if group.group_id.is_empty() {
                warn!("Ignoring security group without ID");
                continue;
            }
            match changes.get(&group.group_id) {
                Some(true) => {
                    changes.remove(&group.group_id);
                }
                _ => {
                    changes.insert(group.group_id.clone(), false);
                }
            }
        }

        let shared = self.is_protected(load_balancer_group_id);
        let permission = [load_balancer_source_permission(load_balancer_group_id)];
        for (group_id, add) in changes {
            if add {
                info!(
                    from = load_balancer_group_id,
                    to = %group_id,
                    "Allowing traffic from load balancer to instances"
                );
                if !self.add_ingress(&group_id, &permission, shared).await? {
                    warn!(
                        group_id = %group_id,
                        "Allowing ingress was not needed; concurrent change?"
                    );
                }
            } else if shared {
                debug!(
                    from = load_balancer_group_id,
                    to = %group_id,
                    "Keeping ingress from the shared load balancer security group"
                );
            } else {
                info!(
                    from = load_balancer_group_id,
                    to = %group_id,
                    "Revoking traffic from load balancer to instances"
                );
                if !self.remove_ingress(&group_id, &permission).await? {
                    warn!(
                        group_id = %group_id,
                        "Revoking ingress was not needed; concurrent change?"
                    );
                }
            }
        }
        Ok(())
    }
}
