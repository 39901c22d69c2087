//! Load balancer attribute comparison

use crate::cloud::{AccessLog, LoadBalancerAttributes};

/// Attributes with fields that have no effect blanked out
fn normalized(attributes: &LoadBalancerAttributes) -> LoadBalancerAttributes {
    let mut out = attributes.clone();
    if !out.access_log.enabled {
        out.access_log = AccessLog::default();
    }
    out
}

/// True if the load balancer already has the wanted attributes.
///
/// Bucket, prefix and interval of a disabled access log are not compared.
pub fn attributes_match(
    actual: &LoadBalancerAttributes,
    expected: &LoadBalancerAttributes,
) -> bool {
    normalized(actual) == normalized(expected)
}
