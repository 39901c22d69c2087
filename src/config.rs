//! Cloud configuration file
//!
//! ```toml
//! region = "us-east-1"
//! vpc_id = "vpc-0abc"
//! kubernetes_cluster_tag = "prod"
//! elb_security_group = "sg-0shared"
//!
//! [governor]
//! initial_delay_ms = 500
//!
//! [deletion]
//! timeout_secs = 600
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::cloud::metadata::{region_from_zone, DEFAULT_METADATA_ENDPOINT};
use crate::cloud::{ClusterTagging, GovernorConfig, SelfInstance};
use crate::error::{Error, Result};
use crate::loadbalancer::SubnetTieBreak;

/// Upper bound for the governor's backoff delay
pub const MAX_GOVERNOR_DELAY_SECS: u64 = 3_600;
pub const MAX_DELETION_TIMEOUT_SECS: u64 = 86_400;

/// How long to keep retrying deletion of a load balancer's security groups
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeletionSettings {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for DeletionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_secs: 10,
        }
    }
}

impl DeletionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    /// Discovered from the metadata service when empty
    pub region: Option<String>,
    pub zone: Option<String>,
    pub vpc_id: Option<String>,
    /// Subnet used when no subnet carries the cluster tag
    pub subnet_id: Option<String>,
    /// Cluster ID written into ownership tags
    pub kubernetes_cluster_tag: Option<String>,
    /// Also write the legacy `KubernetesCluster` tag
    pub legacy_cluster_tags: bool,
    /// Shared security group attached to every load balancer; never modified
    pub elb_security_group: Option<String>,
    /// Leave instance security groups alone
    pub disable_security_group_ingress: bool,
    pub metadata_endpoint: Option<String>,
    pub subnet_tie_break: SubnetTieBreak,
    pub governor: GovernorConfig,
    pub deletion: DeletionSettings,
}

impl CloudConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: CloudConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading cloud config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    fn validate(&self) -> Result<()> {
        let governor = &self.governor;
        if !governor.multiplier.is_finite() || governor.multiplier < 1.0 {
            return Err(Error::ConfigError(format!(
                "governor multiplier must be a finite number of at least 1.0, got {}",
                governor.multiplier
            )));
        }
        if governor.max_delay_secs > MAX_GOVERNOR_DELAY_SECS {
            return Err(Error::ConfigError(format!(
                "governor max delay must be at most {MAX_GOVERNOR_DELAY_SECS}s, got {}s",
                governor.max_delay_secs
            )));
        }
        if governor.initial_delay() > governor.max_delay() {
            return Err(Error::ConfigError(format!(
                "governor initial delay {}ms exceeds the max delay of {}s",
                governor.initial_delay_ms, governor.max_delay_secs
            )));
        }
        if self.deletion.poll_interval_secs == 0 {
            return Err(Error::ConfigError(
                "deletion poll interval must be positive".to_string(),
            ));
        }
        if self.deletion.timeout_secs > MAX_DELETION_TIMEOUT_SECS {
            return Err(Error::ConfigError(format!(
                "deletion timeout must be at most {MAX_DELETION_TIMEOUT_SECS}s, got {}s",
                self.deletion.timeout_secs
            )));
        }
        if let Some(zone) = self.zone.as_deref() {
            region_from_zone(zone)?;
        }
        Ok(())
    }

    pub fn metadata_endpoint(&self) -> &str {
        self.metadata_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(DEFAULT_METADATA_ENDPOINT)
    }

    /// Fill unset placement fields from the controller's own instance
    pub fn fill_from_self_instance(&mut self, self_instance: &SelfInstance) {
        if self.zone.is_none() {
            self.zone = Some(self_instance.availability_zone.clone());
        }
        if self.region.is_none() {
            self.region = Some(self_instance.region.clone());
        }
        if self.vpc_id.is_none() {
            self.vpc_id = self_instance.vpc_id.clone();
        }
        if self.subnet_id.is_none() {
            self.subnet_id = self_instance.subnet_id.clone();
        }
        info!(
            region = self.region.as_deref().unwrap_or_default(),
            zone = self.zone.as_deref().unwrap_or_default(),
            vpc = self.vpc_id.as_deref().unwrap_or_default(),
            "Resolved cloud placement"
        );
    }

    pub fn region(&self) -> Result<String> {
        if let Some(region) = self.region.as_deref().filter(|r| !r.is_empty()) {
            return Ok(region.to_string());
        }
        match self.zone.as_deref() {
            Some(zone) => region_from_zone(zone),
            None => Err(Error::ConfigError(
                "no region configured and none discovered".to_string(),
            )),
        }
    }

    /// Ownership tagging for this cluster; `cluster_name` overrides the file
    pub fn tagging(&self, cluster_name: Option<&str>) -> ClusterTagging {
        let cluster_id = cluster_name
            .or(self.kubernetes_cluster_tag.as_deref())
            .unwrap_or_default();
        ClusterTagging::new(cluster_id).with_legacy_tags(self.legacy_cluster_tags)
    }
}
