//! Cross-request rate governor
//!
//! Provider rate limits are enforced per account and region, so a burst from one
//! reconciliation can get every other reconciliation in the same region
//! throttled. The governor keeps one backoff state per region, shared by every
//! caller in the process:
//!
//! - before each call, the caller waits until the region's `next_allowed` instant
//! - a throttled response grows the region's delay multiplicatively (capped) and
//!   pushes `next_allowed` forward by that delay
//! - a run of successful calls halves the delay until it falls back to zero
//!
//! This is a last-resort protection against account-wide lockout, not a
//! scheduler: it trades responsiveness under load for staying below the limit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::*;
use super::{CloudApi, CloudResult};

/// Tuning for the per-region backoff
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    /// When false, calls are never delayed
    pub enabled: bool,
    /// Delay applied after the first throttled response (milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for the delay (seconds)
    pub max_delay_secs: u64,
    /// Growth factor applied on each further throttled response
    pub multiplier: f64,
    /// Consecutive successful calls required before the delay is halved
    pub successes_before_decay: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_secs: 60,
            multiplier: 2.0,
            successes_before_decay: 5,
        }
    }
}

impl GovernorConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Delay after one more throttled response, never above the cap
    pub fn next_delay(&self, current: Duration) -> Duration {
        let max = self.max_delay();
        if current.is_zero() {
            return self.initial_delay().min(max);
        }
        let grown = current.as_secs_f64() * self.multiplier.max(1.0);
        Duration::try_from_secs_f64(grown).map_or(max, |d| d.min(max))
    }
}

/// Backoff state for one region
#[derive(Clone, Debug, Default)]
struct RegionBackoffState {
    next_allowed: Option<Instant>,
    current_delay: Duration,
    consecutive_successes: u32,
}

/// Per-region backoff shared by all API callers
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    regions: Mutex<HashMap<String, RegionBackoffState>>,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// A governor that never delays a call
    pub fn disabled() -> Self {
        Self::new(GovernorConfig {
            enabled: false,
            ..Default::default()
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegionBackoffState>> {
        // The state stays consistent even if a holder panicked mid-update
        self.regions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the region's next allowed call time has passed
    pub async fn wait_turn(&self, region: &str) {
        if !self.config.enabled {
            return;
        }

        loop {
            let deadline = {
                let regions = self.lock();
                regions
                    .get(region)
                    .and_then(|state| state.next_allowed)
                    .filter(|next| *next > Instant::now())
            };

            match deadline {
                Some(deadline) => {
                    debug!(
                        region,
                        wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis(),
                        "Delaying cloud API call due to recent throttling"
                    );
                    tokio::time::sleep_until(deadline).await;
                }
                None => return,
            }
        }
    }

    /// Record the outcome of a call made in `region`
    pub fn record_outcome(&self, region: &str, throttled: bool) {
        if !self.config.enabled {
            return;
        }

        let delay = {
            let mut regions = self.lock();
            let state = regions.entry(region.to_string()).or_default();

            if throttled {
                state.consecutive_successes = 0;
                state.current_delay = self.config.next_delay(state.current_delay);
                state.next_allowed = Instant::now().checked_add(state.current_delay);
                warn!(
                    region,
                    delay_ms = state.current_delay.as_millis(),
                    "Cloud API request was throttled, backing off all callers in region"
                );
            } else if !state.current_delay.is_zero() {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.successes_before_decay {
                    state.consecutive_successes = 0;
                    let halved = state.current_delay / 2;
                    state.current_delay = if halved < self.config.initial_delay() {
                        Duration::ZERO
                    } else {
                        halved
                    };
                    debug!(
                        region,
                        delay_ms = state.current_delay.as_millis(),
                        "Decayed cloud API backoff"
                    );
                }
            }

            state.current_delay
        };

        #[cfg(feature = "metrics")]
        {
            if throttled {
                crate::controller::metrics::inc_cloud_api_throttle(region);
            }
            crate::controller::metrics::set_governor_delay_seconds(region, delay.as_secs_f64());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = delay;
    }

    /// Current backoff delay for a region
    pub fn current_delay(&self, region: &str) -> Duration {
        self.lock()
            .get(region)
            .map(|state| state.current_delay)
            .unwrap_or_default()
    }
}

/// A [`CloudApi`] decorator that routes every call through a [`RateGovernor`]
pub struct GovernedCloud {
    inner: Arc<dyn CloudApi>,
    governor: Arc<RateGovernor>,
    region: String,
}

impl GovernedCloud {
    pub fn new(
        inner: Arc<dyn CloudApi>,
        governor: Arc<RateGovernor>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            governor,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn governed<T, F>(&self, operation: &'static str, call: F) -> CloudResult<T>
    where
        F: Future<Output = CloudResult<T>> + Send,
    {
        self.governor.wait_turn(&self.region).await;
        let result = call.await;

        let throttled = matches!(&result, Err(e) if e.is_throttling());
        self.governor.record_outcome(&self.region, throttled);

        #[cfg(feature = "metrics")]
        crate::controller::metrics::inc_cloud_api_request(
            operation,
            match &result {
                Ok(_) => "success",
                Err(e) if e.is_throttling() => "throttled",
                Err(_) => "error",
            },
        );

        if let Err(e) = &result {
            debug!(operation, region = %self.region, error = %e, "Cloud API call failed");
        }
        result
    }
}

#[async_trait]
impl CloudApi for GovernedCloud {
    async fn describe_load_balancer(
        &self,
        name: &str,
    ) -> CloudResult<Option<LoadBalancerDescription>> {
        self.governed("DescribeLoadBalancers", self.inner.describe_load_balancer(name))
            .await
    }

    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> CloudResult<String> {
        self.governed("CreateLoadBalancer", self.inner.create_load_balancer(request))
            .await
    }

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()> {
        self.governed("DeleteLoadBalancer", self.inner.delete_load_balancer(name))
            .await
    }

    async fn create_load_balancer_listeners(
        &self,
        name: &str,
        listeners: &[Listener],
    ) -> CloudResult<()> {
        self.governed(
            "CreateLoadBalancerListeners",
            self.inner.create_load_balancer_listeners(name, listeners),
        )
        .await
    }

    async fn delete_load_balancer_listeners(&self, name: &str, ports: &[i32]) -> CloudResult<()> {
        self.governed(
            "DeleteLoadBalancerListeners",
            self.inner.delete_load_balancer_listeners(name, ports),
        )
        .await
    }

    async fn apply_security_groups_to_load_balancer(
        &self,
        name: &str,
        group_ids: &[String],
    ) -> CloudResult<()> {
        self.governed(
            "ApplySecurityGroupsToLoadBalancer",
            self.inner.apply_security_groups_to_load_balancer(name, group_ids),
        )
        .await
    }

    async fn configure_health_check(
        &self,
        name: &str,
        health_check: &HealthCheck,
    ) -> CloudResult<()> {
        self.governed(
            "ConfigureHealthCheck",
            self.inner.configure_health_check(name, health_check),
        )
        .await
    }

    async fn describe_load_balancer_attributes(
        &self,
        name: &str,
    ) -> CloudResult<LoadBalancerAttributes> {
        self.governed(
            "DescribeLoadBalancerAttributes",
            self.inner.describe_load_balancer_attributes(name),
        )
        .await
    }

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> CloudResult<()> {
        self.governed(
            "ModifyLoadBalancerAttributes",
            self.inner.modify_load_balancer_attributes(name, attributes),
        )
        .await
    }

    async fn register_instances_with_load_balancer(
        &self,
        name: &str,
        instance_ids: &[String],
    ) -> CloudResult<()> {
        self.governed(
            "RegisterInstancesWithLoadBalancer",
            self.inner
                .register_instances_with_load_balancer(name, instance_ids),
        )
        .await
    }

    async fn deregister_instances_from_load_balancer(
        &self,
        name: &str,
        instance_ids: &[String],
    ) -> CloudResult<()> {
        self.governed(
            "DeregisterInstancesFromLoadBalancer",
            self.inner
                .deregister_instances_from_load_balancer(name, instance_ids),
        )
        .await
    }

    async fn describe_load_balancer_policies(
        &self,
        name: &str,
        policy_names: &[String],
    ) -> CloudResult<Vec<PolicyDescription>> {
        self.governed(
            "DescribeLoadBalancerPolicies",
            self.inner.describe_load_balancer_policies(name, policy_names),
        )
        .await
    }

    async fn create_load_balancer_policy(&self, request: &CreatePolicyRequest) -> CloudResult<()> {
        self.governed(
            "CreateLoadBalancerPolicy",
            self.inner.create_load_balancer_policy(request),
        )
        .await
    }

    async fn set_load_balancer_policies_for_backend_server(
        &self,
        name: &str,
        instance_port: i32,
        policy_names: &[String],
    ) -> CloudResult<()> {
        self.governed(
            "SetLoadBalancerPoliciesForBackendServer",
            self.inner
                .set_load_balancer_policies_for_backend_server(name, instance_port, policy_names),
        )
        .await
    }

    async fn set_load_balancer_policies_of_listener(
        &self,
        name: &str,
        load_balancer_port: i32,
        policy_names: &[String],
    ) -> CloudResult<()> {
        self.governed(
            "SetLoadBalancerPoliciesOfListener",
            self.inner
                .set_load_balancer_policies_of_listener(name, load_balancer_port, policy_names),
        )
        .await
    }

    async fn add_load_balancer_tags(&self, name: &str, tags: &[Tag]) -> CloudResult<()> {
        self.governed("AddTags", self.inner.add_load_balancer_tags(name, tags))
            .await
    }

    async fn describe_instances(&self, filters: &[Filter]) -> CloudResult<Vec<Instance>> {
        self.governed("DescribeInstances", self.inner.describe_instances(filters))
            .await
    }

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> CloudResult<Vec<SecurityGroup>> {
        self.governed(
            "DescribeSecurityGroups",
            self.inner.describe_security_groups(filters),
        )
        .await
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> CloudResult<String> {
        self.governed(
            "CreateSecurityGroup",
            self.inner.create_security_group(name, description, vpc_id),
        )
        .await
    }

    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()> {
        self.governed(
            "DeleteSecurityGroup",
            self.inner.delete_security_group(group_id),
        )
        .await
    }

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> CloudResult<()> {
        self.governed(
            "AuthorizeSecurityGroupIngress",
            self.inner
                .authorize_security_group_ingress(group_id, permissions),
        )
        .await
    }

    async fn revoke_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
    ) -> CloudResult<()> {
        self.governed(
            "RevokeSecurityGroupIngress",
            self.inner.revoke_security_group_ingress(group_id, permissions),
        )
        .await
    }

    async fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> CloudResult<()> {
        self.governed("CreateTags", self.inner.create_tags(resource_id, tags))
            .await
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> CloudResult<Vec<Subnet>> {
        self.governed("DescribeSubnets", self.inner.describe_subnets(filters))
            .await
    }

    async fn describe_route_tables(&self, filters: &[Filter]) -> CloudResult<Vec<RouteTable>> {
        self.governed(
            "DescribeRouteTables",
            self.inner.describe_route_tables(filters),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::error::codes;
    use crate::cloud::fake::FakeCloud;
    use crate::cloud::CloudError;

    fn config() -> GovernorConfig {
        GovernorConfig {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_secs: 8,
            multiplier: 2.0,
            successes_before_decay: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_without_throttling() {
        let governor = RateGovernor::new(config());
        let start = Instant::now();
        governor.wait_turn("us-east-1").await;
        governor.record_outcome("us-east-1", false);
        governor.wait_turn("us-east-1").await;
        assert_eq!(Instant::now(), start);
        assert_eq!(governor.current_delay("us-east-1"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_grows_delay_and_caps() {
        let governor = RateGovernor::new(config());
        let expected = [1, 2, 4, 8, 8];
        for secs in expected {
            governor.record_outcome("us-east-1", true);
            assert_eq!(governor.current_delay("us-east-1"), Duration::from_secs(secs));
        }
    }

    #[test]
    fn test_first_delay_respects_cap() {
        let config = GovernorConfig {
            initial_delay_ms: 120_000,
            max_delay_secs: 60,
            ..config()
        };
        assert_eq!(config.next_delay(Duration::ZERO), Duration::from_secs(60));
        assert_eq!(config.next_delay(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn test_unbounded_growth_saturates_at_cap() {
        let config = GovernorConfig {
            multiplier: f64::INFINITY,
            ..config()
        };
        assert_eq!(config.next_delay(Duration::from_secs(1)), Duration::from_secs(8));

        let config = GovernorConfig {
            multiplier: f64::NAN,
            ..self::config()
        };
        assert_eq!(config.next_delay(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_initial_delay_is_capped() {
        let governor = RateGovernor::new(GovernorConfig {
            initial_delay_ms: 120_000,
            max_delay_secs: 60,
            ..config()
        });
        governor.record_outcome("us-east-1", true);
        assert_eq!(governor.current_delay("us-east-1"), Duration::from_secs(60));

        let start = Instant::now();
        governor.wait_turn("us-east-1").await;
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_next_allowed() {
        let governor = RateGovernor::new(config());
        governor.record_outcome("us-east-1", true);

        let start = Instant::now();
        governor.wait_turn("us-east-1").await;
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_regions_are_independent() {
        let governor = RateGovernor::new(config());
        governor.record_outcome("us-east-1", true);

        let start = Instant::now();
        governor.wait_turn("eu-west-1").await;
        assert_eq!(Instant::now(), start);
        assert_eq!(governor.current_delay("eu-west-1"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_success_decays_to_zero() {
        let governor = RateGovernor::new(config());
        governor.record_outcome("us-east-1", true);
        governor.record_outcome("us-east-1", true);
        assert_eq!(governor.current_delay("us-east-1"), Duration::from_secs(2));

        // one success is not enough
        governor.record_outcome("us-east-1", false);
        assert_eq!(governor.current_delay("us-east-1"), Duration::from_secs(2));

        governor.record_outcome("us-east-1", false);
        assert_eq!(governor.current_delay("us-east-1"), Duration::from_secs(1));

        governor.record_outcome("us-east-1", false);
        governor.record_outcome("us-east-1", false);
        assert_eq!(governor.current_delay("us-east-1"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_governor_never_waits() {
        let governor = RateGovernor::disabled();
        governor.record_outcome("us-east-1", true);
        let start = Instant::now();
        governor.wait_turn("us-east-1").await;
        assert_eq!(Instant::now(), start);
        assert_eq!(governor.current_delay("us-east-1"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_governed_cloud_delays_other_callers_after_throttle() {
        let fake = Arc::new(FakeCloud::new());
        fake.fail_next(
            "DescribeInstances",
            CloudError::new("DescribeInstances", codes::REQUEST_LIMIT_EXCEEDED, "slow down"),
        );
        let governor = Arc::new(RateGovernor::new(config()));
        let cloud = GovernedCloud::new(fake.clone(), governor.clone(), "us-east-1");

        let err = cloud.describe_instances(&[]).await.unwrap_err();
        assert!(err.is_throttling());
        assert_eq!(governor.current_delay("us-east-1"), Duration::from_secs(1));

        // A different operation in the same region is delayed too
        let start = Instant::now();
        cloud.describe_subnets(&[]).await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }
}
