//! Subnet placement for load balancers
//!
//! A load balancer gets at most one subnet per availability zone. Candidates
//! are the cluster-tagged subnets of the VPC (falling back to the controller's
//! own subnet). External load balancers only use public subnets, i.e. subnets
//! whose route table routes through an internet gateway.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cloud::{
    filters, find_tag, ClusterTagging, CloudApi, Filter, RouteTable, Subnet,
};
use crate::error::{Error, Result};

pub const INTERNAL_ELB_ROLE_TAG: &str = "kubernetes.io/role/internal-elb";
pub const PUBLIC_ELB_ROLE_TAG: &str = "kubernetes.io/role/elb";

/// How to choose between two equally suitable subnets in one zone
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubnetTieBreak {
    /// Smallest subnet ID wins
    #[default]
    Lexicographic,
    /// The first subnet returned by the API wins
    FirstListed,
}

/// True if the subnet's route table sends traffic to an internet gateway.
///
/// Subnets without an explicit association use the VPC's main route table.
pub fn is_subnet_public(route_tables: &[RouteTable], subnet_id: &str) -> Result<bool> {
    let explicit = route_tables.iter().find(|table| {
        table
            .associations
            .iter()
            .any(|a| a.subnet_id.as_deref() == Some(subnet_id))
    });
    let table = explicit
        .or_else(|| {
            route_tables
                .iter()
                .find(|table| table.associations.iter().any(|a| a.main))
        })
        .ok_or_else(|| {
            Error::ConfigError(format!("could not locate route table for subnet {subnet_id}"))
        })?;

    Ok(table.routes.iter().any(|route| {
        route
            .gateway_id
            .as_deref()
            .is_some_and(|gw| gw.starts_with("igw"))
    }))
}

struct Candidate<'a> {
    subnet: &'a Subnet,
    has_role_tag: bool,
    is_public: bool,
}

impl Candidate<'_> {
    /// True if `self` should replace `existing` for the zone
    fn beats(&self, existing: &Candidate<'_>, internal: bool, tie_break: SubnetTieBreak) -> bool {
        if self.has_role_tag != existing.has_role_tag {
            return self.has_role_tag;
        }
        if !internal && self.is_public != existing.is_public {
            return self.is_public;
        }
        match tie_break {
            SubnetTieBreak::Lexicographic => self.subnet.subnet_id < existing.subnet.subnet_id,
            SubnetTieBreak::FirstListed => false,
        }
    }
}

/// Pick one subnet per zone from `subnets`, sorted by zone name
pub fn select_subnets(
    subnets: &[Subnet],
    route_tables: &[RouteTable],
    internal: bool,
    tie_break: SubnetTieBreak,
) -> Result<Vec<String>> {
    let role_tag = if internal {
        INTERNAL_ELB_ROLE_TAG
    } else {
        PUBLIC_ELB_ROLE_TAG
    };

    let mut by_zone: BTreeMap<&str, Candidate<'_>> = BTreeMap::new();
    for subnet in subnets {
        if subnet.availability_zone.is_empty() || subnet.subnet_id.is_empty() {
            warn!(subnet = ?subnet, "Ignoring subnet with empty zone or ID");
            continue;
        }

        let is_public = is_subnet_public(route_tables, &subnet.subnet_id)?;
        if !internal && !is_public {
            debug!(subnet = %subnet.subnet_id, "Ignoring private subnet for public load balancer");
            continue;
        }

        let candidate = Candidate {
            subnet,
            has_role_tag: find_tag(&subnet.tags, role_tag).is_some(),
            is_public,
        };
        let replace = by_zone
            .get(subnet.availability_zone.as_str())
            .map_or(true, |existing| candidate.beats(existing, internal, tie_break));
        if replace {
            by_zone.insert(subnet.availability_zone.as_str(), candidate);
        }
    }

    Ok(by_zone
        .into_values()
        .map(|c| c.subnet.subnet_id.clone())
        .collect())
}

/// Resolve explicitly requested subnets (by ID or `Name` tag) against the
/// candidate set, failing if any cannot be found
pub fn resolve_explicit_subnets(
    requested: &[String],
    candidates: &[Subnet],
) -> Result<Vec<String>> {
    let mut resolved: Vec<String> = Vec::with_capacity(requested.len());
    for wanted in requested {
        let found = candidates
            .iter()
            .find(|s| &s.subnet_id == wanted)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|s| find_tag(&s.tags, "Name") == Some(wanted.as_str()))
            })
            .ok_or_else(|| {
                Error::ValidationError(format!("requested subnet {wanted} was not found"))
            })?;
        if !resolved.contains(&found.subnet_id) {
            resolved.push(found.subnet_id.clone());
        }
    }
    Ok(resolved)
}

/// Looks up candidate subnets and route tables for a VPC
pub struct SubnetSelector<'a> {
    pub api: &'a dyn CloudApi,
    pub vpc_id: &'a str,
    pub tagging: &'a ClusterTagging,
    /// Subnet of the controller's own instance, used if nothing is tagged
    pub fallback_subnet_id: Option<&'a str>,
    pub tie_break: SubnetTieBreak,
}

impl SubnetSelector<'_> {
    async fn cluster_subnets(&self) -> Result<Vec<Subnet>> {
        let all = self
            .api
            .describe_subnets(&[Filter::new(filters::VPC_ID, [self.vpc_id])])
            .await?;
        let tagged: Vec<Subnet> = all
            .into_iter()
            .filter(|s| self.tagging.has_cluster_tag(&s.tags))
            .collect();
        if !tagged.is_empty() {
            return Ok(tagged);
        }

        let Some(fallback) = self.fallback_subnet_id else {
            return Ok(Vec::new());
        };
        warn!(
            subnet = fallback,
            "No cluster-tagged subnets found, falling back to the controller's own subnet"
        );
        Ok(self
            .api
            .describe_subnets(&[Filter::new(filters::SUBNET_ID, [fallback])])
            .await?)
    }

    /// One subnet per zone for a new or updated load balancer
    pub async fn find_subnets(&self, internal: bool) -> Result<Vec<String>> {
        let subnets = self.cluster_subnets().await?;
        if subnets.is_empty() {
            return Ok(Vec::new());
        }
        let route_tables = self
            .api
            .describe_route_tables(&[Filter::new(filters::VPC_ID, [self.vpc_id])])
            .await?;
        select_subnets(&subnets, &route_tables, internal, self.tie_break)
    }

    /// Validate explicitly requested subnets against the VPC
    pub async fn explicit_subnets(&self, requested: &[String]) -> Result<Vec<String>> {
        let candidates = self
            .api
            .describe_subnets(&[Filter::new(filters::VPC_ID, [self.vpc_id])])
            .await?;
        resolve_explicit_subnets(requested, &candidates)
    }
}
