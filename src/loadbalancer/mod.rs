//! Load balancer convergence engine
//!
//! Each pass reads the desired state from a Service (see [`annotations`]),
//! reads the actual state from the cloud, and applies the difference with
//! idempotent calls. A pass that fails part-way leaves no rollback behind; the
//! next pass picks up from whatever state the cloud is in.

pub mod annotations;
pub mod attributes;
pub mod health_check;
pub mod listeners;
mod manager;
pub mod rules;
pub mod security_groups;
pub mod subnets;


pub use annotations::ServiceLoadBalancerSpec;
pub use listeners::{diff_listeners, ListenerDiff};
pub use manager::{
    primary_group_rules, sort_security_groups, LoadBalancerManager, LoadBalancerStatus,
    PROXY_PROTOCOL_POLICY_NAME, SERVICE_NAME_TAG,
};
pub use rules::IpPermissionSet;
pub use subnets::SubnetTieBreak;

/// Longest name the provider accepts for a load balancer
const MAX_LOAD_BALANCER_NAME_LEN: usize = 32;

/// Deterministic load balancer name for a Service: `a` followed by the UID
/// without dashes, truncated to the provider limit
pub fn load_balancer_name(service_uid: &str) -> String {
    let mut name: String = std::iter::once('a')
        .chain(service_uid.chars().filter(|c| *c != '-'))
        .collect();
    name.truncate(MAX_LOAD_BALANCER_NAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_balancer_name() {
        assert_eq!(
            load_balancer_name("6f4a3c2e-1b2d-4e5f-8a9b-0c1d2e3f4a5b"),
            "a6f4a3c2e1b2d4e5f8a9b0c1d2e3f4a5"
        );
        assert_eq!(load_balancer_name("abc-def"), "aabcdef");
    }

    #[test]
    fn test_load_balancer_name_is_stable() {
        let uid = "0b1c2d3e-4f5a-6b7c-8d9e-0f1a2b3c4d5e";
        assert_eq!(load_balancer_name(uid), load_balancer_name(uid));
        assert_eq!(load_balancer_name(uid).len(), 32);
    }
}
