//! Listener construction and diffing
//!
//! A Service port maps to one listener: the Service port on the load balancer,
//! forwarding to the NodePort on every instance. A TLS certificate switches the
//! selected ports to a TLS front-end protocol.

use std::collections::BTreeSet;

use tracing::warn;

use crate::cloud::{Listener, ListenerDescription};
use crate::error::{Error, Result};

/// Ports that terminate TLS when a certificate is configured
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SslPorts {
    /// Unset or `*`: every port
    #[default]
    All,
    Selected {
        numbers: BTreeSet<i32>,
        /// Lower-cased port names
        names: BTreeSet<String>,
    },
}

impl SslPorts {
    /// Parse `443,8443,https`; an empty value or `*` selects every port
    pub fn parse(value: Option<&str>) -> Self {
        let value = value.map(str::trim).unwrap_or_default();
        if value.is_empty() || value == "*" {
            return SslPorts::All;
        }
        let mut numbers = BTreeSet::new();
        let mut names = BTreeSet::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.parse::<i32>() {
                Ok(port) => {
                    numbers.insert(port);
                }
                Err(_) => {
                    names.insert(item.to_ascii_lowercase());
                }
            }
        }
        SslPorts::Selected { numbers, names }
    }

    pub fn contains(&self, port: i32, name: Option<&str>) -> bool {
        match self {
            SslPorts::All => true,
            SslPorts::Selected { numbers, names } => {
                numbers.contains(&port)
                    || name.is_some_and(|n| names.contains(&n.to_ascii_lowercase()))
            }
        }
    }
}

/// Front-end protocol to use for a given backend protocol when TLS terminates
/// at the load balancer
fn frontend_protocol_for(backend: &str) -> Option<&'static str> {
    match backend {
        "https" | "http" => Some("https"),
        "ssl" | "tcp" => Some("ssl"),
        _ => None,
    }
}

/// Settings from the Service that shape its listeners
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub certificate_id: Option<String>,
    pub backend_protocol: Option<String>,
    pub ssl_ports: SslPorts,
}

/// Build the listener for one Service port
pub fn build_listener(
    port: i32,
    port_name: Option<&str>,
    node_port: i32,
    protocol: &str,
    options: &ListenerOptions,
) -> Result<Listener> {
    let mut frontend = protocol.to_ascii_lowercase();
    let mut backend = frontend.clone();
    let backend_annotation = options
        .backend_protocol
        .as_deref()
        .map(str::to_ascii_lowercase);

    let certificate = options
        .certificate_id
        .as_deref()
        .filter(|c| !c.is_empty() && options.ssl_ports.contains(port, port_name));

    if let Some(cert) = certificate {
        match backend_annotation.as_deref().filter(|b| !b.is_empty()) {
            None => {
                frontend = "ssl".to_string();
                backend = "tcp".to_string();
            }
            Some(b) => {
                frontend = frontend_protocol_for(b)
                    .ok_or_else(|| {
                        Error::ValidationError(format!(
                            "invalid backend protocol {b} for certificate {cert}"
                        ))
                    })?
                    .to_string();
                backend = b.to_string();
            }
        }
    } else if backend_annotation.as_deref() == Some("http") {
        frontend = "http".to_string();
        backend = "http".to_string();
    }

    Ok(Listener {
        protocol: frontend,
        load_balancer_port: port,
        instance_protocol: backend,
        instance_port: node_port,
        ssl_certificate_id: certificate.map(String::from),
    })
}

fn protocols_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn certificates_equal(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or_default()
        .eq_ignore_ascii_case(b.unwrap_or_default())
}

/// Listener equality as the provider reports it back: protocols and
/// certificate references are case-insensitive, and no certificate equals an
/// empty one
pub fn listeners_equal(actual: &Listener, expected: &Listener) -> bool {
    protocols_equal(&actual.protocol, &expected.protocol)
        && protocols_equal(&actual.instance_protocol, &expected.instance_protocol)
        && actual.instance_port == expected.instance_port
        && actual.load_balancer_port == expected.load_balancer_port
        && certificates_equal(
            actual.ssl_certificate_id.as_deref(),
            expected.ssl_certificate_id.as_deref(),
        )
}

/// Listeners to create and load balancer ports to delete
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerDiff {
    pub to_create: Vec<Listener>,
    pub to_delete: Vec<i32>,
}

impl ListenerDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// Compare desired listeners with what the load balancer reports
pub fn diff_listeners(
    load_balancer_name: &str,
    desired: &[Listener],
    actual: &[ListenerDescription],
) -> ListenerDiff {
    let mut found = vec![false; desired.len()];
    let mut diff = ListenerDiff::default();

    for description in actual {
        let listener = &description.listener;
        if listener.load_balancer_port == 0 {
            warn!(load_balancer = load_balancer_name, "Ignoring empty listener on load balancer");
            continue;
        }

        let matched = desired.iter().enumerate().find(|(_, expected)| {
            expected.load_balancer_port != 0 && listeners_equal(listener, expected)
        });
        match matched {
            Some((i, _)) => found[i] = true,
            None => diff.to_delete.push(listener.load_balancer_port),
        }
    }

    for (i, expected) in desired.iter().enumerate() {
        if expected.load_balancer_port == 0 {
            warn!(load_balancer = load_balancer_name, "Ignoring empty desired listener");
            continue;
        }
        if !found[i] {
            diff.to_create.push(expected.clone());
        }
    }
    diff
}
