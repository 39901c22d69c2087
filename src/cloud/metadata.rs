//! Instance metadata service client
//!
//! The controller runs on a cluster instance and uses the link-local metadata
//! service to discover its own identity, zone and network placement when these
//! are not set in the cloud config. Missing paths are reported as `None` and
//! logged; only the instance ID and availability zone are mandatory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254/latest/meta-data/";

/// Read access to the instance metadata tree
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Fetch a metadata path, `None` if the path does not exist
    async fn get(&self, path: &str) -> Result<Option<String>>;
}

/// Metadata service reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpMetadataService {
    client: Client,
    base_url: String,
}

impl HttpMetadataService {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    async fn get(&self, path: &str) -> Result<Option<String>> {
        let url = format!("{}{}", self.base_url, path.trim_start_matches('/'));
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, "Metadata path not present");
            return Ok(None);
        }
        let body = response.error_for_status()?.text().await?;
        Ok(Some(body.trim().to_string()))
    }
}

/// Identity and placement of the instance the controller runs on
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelfInstance {
    pub instance_id: String,
    pub availability_zone: String,
    pub region: String,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    /// Private IPv4 addresses across all attached interfaces
    pub private_ips: Vec<String>,
    pub public_ipv4: Option<String>,
    pub local_hostname: Option<String>,
    pub public_hostname: Option<String>,
}

impl SelfInstance {
    pub async fn discover(metadata: &dyn MetadataService) -> Result<Self> {
        let instance_id = required(metadata, "instance-id").await?;
        let availability_zone = required(metadata, "placement/availability-zone").await?;
        let region = region_from_zone(&availability_zone)?;

        let mut instance = SelfInstance {
            instance_id,
            region,
            availability_zone,
            ..Default::default()
        };

        if let Some(mac) = optional(metadata, "mac").await? {
            let prefix = format!("network/interfaces/macs/{mac}");
            instance.vpc_id = optional(metadata, &format!("{prefix}/vpc-id")).await?;
            instance.subnet_id = optional(metadata, &format!("{prefix}/subnet-id")).await?;
        }

        // Every interface, not only the primary one, contributes addresses
        if let Some(macs) = optional(metadata, "network/interfaces/macs/").await? {
            for mac in macs.lines().map(|m| m.trim().trim_end_matches('/')) {
                if mac.is_empty() {
                    continue;
                }
                let path = format!("network/interfaces/macs/{mac}/local-ipv4s");
                if let Some(ips) = optional(metadata, &path).await? {
                    instance.private_ips.extend(
                        ips.lines()
                            .map(str::trim)
                            .filter(|ip| !ip.is_empty())
                            .map(String::from),
                    );
                }
            }
        }
        if instance.private_ips.is_empty() {
            if let Some(ip) = optional(metadata, "local-ipv4").await? {
                instance.private_ips.push(ip);
            }
        }

        instance.public_ipv4 = optional(metadata, "public-ipv4").await?;
        instance.local_hostname = optional(metadata, "local-hostname").await?;
        instance.public_hostname = optional(metadata, "public-hostname").await?;

        info!(
            instance_id = %instance.instance_id,
            zone = %instance.availability_zone,
            vpc_id = ?instance.vpc_id,
            "Discovered self instance from metadata"
        );
        Ok(instance)
    }
}

async fn required(metadata: &dyn MetadataService, path: &str) -> Result<String> {
    match metadata.get(path).await? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::ConfigError(format!(
            "instance metadata path {path} is not available"
        ))),
    }
}

async fn optional(metadata: &dyn MetadataService, path: &str) -> Result<Option<String>> {
    let value = metadata.get(path).await?.filter(|v| !v.is_empty());
    if value.is_none() {
        debug!(path, "Optional metadata value absent");
    }
    Ok(value)
}

/// Derive the region from an availability zone name, e.g. `us-east-1a` → `us-east-1`
pub fn region_from_zone(zone: &str) -> Result<String> {
    match zone.chars().last() {
        Some(c) if c.is_ascii_alphabetic() && zone.len() > 1 => {
            Ok(zone[..zone.len() - 1].to_string())
        }
        _ => Err(Error::ConfigError(format!(
            "invalid availability zone name {zone:?}"
        ))),
    }
}
