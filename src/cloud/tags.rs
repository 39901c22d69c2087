//! Cluster ownership tagging
//!
//! Resources created for a cluster carry `kubernetes.io/cluster/<id>` with a
//! lifecycle value of `owned` or `shared`. Older clusters used a single
//! `KubernetesCluster=<id>` tag, which is still honoured when reading and
//! written when the cluster was configured with it.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use super::types::{Filter, Tag};
use super::{filters, CloudApi, CloudError};
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";
pub const LEGACY_CLUSTER_TAG: &str = "KubernetesCluster";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceLifecycle {
    /// Created by this cluster and deleted with it
    Owned,
    /// May be used by several clusters; never deleted
    Shared,
}

impl ResourceLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceLifecycle::Owned => "owned",
            ResourceLifecycle::Shared => "shared",
        }
    }
}

impl fmt::Display for ResourceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterTagging {
    pub cluster_id: String,
    /// Also write the legacy `KubernetesCluster` tag
    pub uses_legacy_tags: bool,
}

impl ClusterTagging {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            uses_legacy_tags: false,
        }
    }

    pub fn with_legacy_tags(mut self, legacy: bool) -> Self {
        self.uses_legacy_tags = legacy;
        self
    }

    pub fn cluster_tag_key(&self) -> String {
        format!("{CLUSTER_TAG_PREFIX}{}", self.cluster_id)
    }

    /// True if the tags mark the resource as belonging to this cluster
    pub fn has_cluster_tag(&self, tags: &[Tag]) -> bool {
        if self.cluster_id.is_empty() {
            return true;
        }
        let key = self.cluster_tag_key();
        tags.iter().any(|tag| {
            tag.key == key || (tag.key == LEGACY_CLUSTER_TAG && tag.value == self.cluster_id)
        })
    }

    /// True if the tags carry no cluster ownership tag at all, for any cluster
    pub fn has_no_cluster_tags(tags: &[Tag]) -> bool {
        !tags
            .iter()
            .any(|tag| tag.key == LEGACY_CLUSTER_TAG || tag.key.starts_with(CLUSTER_TAG_PREFIX))
    }

    /// Tags to put on a resource created for this cluster
    pub fn build_tags(
        &self,
        lifecycle: ResourceLifecycle,
        additional: &BTreeMap<String, String>,
    ) -> Vec<Tag> {
        let mut tags = additional.clone();
        if !self.cluster_id.is_empty() {
            tags.insert(self.cluster_tag_key(), lifecycle.to_string());
            if self.uses_legacy_tags {
                tags.insert(LEGACY_CLUSTER_TAG.to_string(), self.cluster_id.clone());
            }
        }
        tags.into_iter().map(|(k, v)| Tag::new(k, v)).collect()
    }

    /// Filters restricting a describe call to this cluster's resources
    pub fn filters(&self) -> Vec<Filter> {
        if self.cluster_id.is_empty() {
            return Vec::new();
        }
        if self.uses_legacy_tags {
            vec![Filter::new(
                filters::tag(LEGACY_CLUSTER_TAG),
                [self.cluster_id.clone()],
            )]
        } else {
            vec![Filter::new(filters::TAG_KEY, [self.cluster_tag_key()])]
        }
    }

    /// Tag a freshly created resource, retrying while the provider catches up
    pub async fn create_tags(
        &self,
        api: &dyn CloudApi,
        resource_id: &str,
        lifecycle: ResourceLifecycle,
        additional: &BTreeMap<String, String>,
    ) -> std::result::Result<(), CloudError> {
        let tags = self.build_tags(lifecycle, additional);
        if tags.is_empty() {
            return Ok(());
        }
        retry_with_backoff(
            &RetryConfig::default(),
            "CreateTags",
            |e: &CloudError| !e.is_throttling(),
            || api.create_tags(resource_id, &tags),
        )
        .await
    }

    /// Add any cluster tags missing from a resource we own.
    ///
    /// Fails when the resource carries a conflicting value, which means it
    /// belongs to another cluster.
    pub async fn read_repair(
        &self,
        api: &dyn CloudApi,
        resource_id: &str,
        lifecycle: ResourceLifecycle,
        actual: &[Tag],
        additional: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut missing = Vec::new();
        for expected in self.build_tags(lifecycle, additional) {
            match actual.iter().find(|t| t.key == expected.key) {
                Some(tag) if tag.value == expected.value => {}
                Some(tag)
                    if tag.key.starts_with(CLUSTER_TAG_PREFIX) || tag.key == LEGACY_CLUSTER_TAG =>
                {
                    return Err(Error::ForeignClusterTag {
                        resource: resource_id.to_string(),
                        key: tag.key.clone(),
                        actual: tag.value.clone(),
                        expected: expected.value,
                    });
                }
                Some(tag) => {
                    debug!(
                        resource = resource_id,
                        key = %tag.key,
                        "Leaving user-modified tag value in place"
                    );
                }
                None => {
                    warn!(
                        resource = resource_id,
                        key = %expected.key,
                        value = %expected.value,
                        "Resource is missing expected cluster tag, adding it"
                    );
                    missing.push(expected);
                }
            }
        }

        if !missing.is_empty() {
            api.create_tags(resource_id, &missing).await?;
        }
        Ok(())
    }
}
