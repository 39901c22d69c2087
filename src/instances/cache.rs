//! Snapshot cache of every cluster instance
//!
//! Listing all instances is one paginated call, far cheaper under rate limits
//! than describing instances one by one on every reconcile. Callers state how
//! fresh and how complete the snapshot must be; anything short of that triggers
//! a full refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::InstanceId;
use crate::cloud::{CloudApi, ClusterTagging, Instance};
use crate::error::Result;

/// Requirements a cached snapshot must meet to be reused
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheCriteria {
    /// Oldest acceptable snapshot, if freshness matters
    pub max_age: Option<Duration>,
    /// Instances the snapshot must contain
    pub has_instances: Vec<InstanceId>,
}

/// An immutable listing of every instance at a point in time
#[derive(Clone, Debug)]
pub struct InstanceSnapshot {
    pub timestamp: Instant,
    pub instances: HashMap<InstanceId, Instance>,
}

impl InstanceSnapshot {
    pub fn new(timestamp: Instant, instances: impl IntoIterator<Item = Instance>) -> Self {
        let instances = instances
            .into_iter()
            .map(|i| (InstanceId(i.instance_id.clone()), i))
            .collect();
        Self {
            timestamp,
            instances,
        }
    }

    pub fn older_than(&self, other: &InstanceSnapshot) -> bool {
        self.timestamp < other.timestamp
    }

    pub fn meets_criteria(&self, criteria: &CacheCriteria) -> bool {
        if let Some(max_age) = criteria.max_age {
            let age = Instant::now().saturating_duration_since(self.timestamp);
            if age > max_age {
                debug!(
                    age_secs = age.as_secs(),
                    max_age_secs = max_age.as_secs(),
                    "Instance snapshot too old"
                );
                return false;
            }
        }
        if let Some(missing) = criteria
            .has_instances
            .iter()
            .find(|id| !self.instances.contains_key(*id))
        {
            debug!(instance = %missing, "Instance snapshot is missing a required instance");
            return false;
        }
        true
    }

    /// The subset of `ids` present in the snapshot; unknown IDs are dropped
    pub fn find_instances(&self, ids: &[InstanceId]) -> Vec<Instance> {
        ids.iter()
            .filter_map(|id| self.instances.get(id))
            .cloned()
            .collect()
    }
}

pub struct InstanceCache {
    api: Arc<dyn CloudApi>,
    tagging: ClusterTagging,
    snapshot: RwLock<Option<Arc<InstanceSnapshot>>>,
}

impl InstanceCache {
    pub fn new(api: Arc<dyn CloudApi>, tagging: ClusterTagging) -> Self {
        Self {
            api,
            tagging,
            snapshot: RwLock::new(None),
        }
    }

    /// A snapshot meeting `criteria`, refreshing it if the cached one does not
    pub async fn describe(&self, criteria: &CacheCriteria) -> Result<Arc<InstanceSnapshot>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            if snapshot.meets_criteria(criteria) {
                return Ok(Arc::clone(snapshot));
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<Arc<InstanceSnapshot>> {
        let started = Instant::now();
        debug!("Listing all cluster instances");
        let instances = self.api.describe_instances(&self.tagging.filters()).await?;
        let snapshot = Arc::new(InstanceSnapshot::new(started, instances));

        #[cfg(feature = "metrics")]
        crate::controller::metrics::inc_instance_cache_refresh();

        let mut current = self.snapshot.write().await;
        match current.as_ref() {
            // A concurrent refresh that started later already won
            Some(existing) if snapshot.older_than(existing) => {
                info!("Not caching concurrent instance listing");
            }
            _ => *current = Some(Arc::clone(&snapshot)),
        }
        Ok(snapshot)
    }
}
