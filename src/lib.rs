//! cloud-lb-controller: load balancers for Kubernetes LoadBalancer Services
//!
//! This crate converges classic elastic load balancers, their security groups
//! and backend registrations with the Services and Nodes of a cluster.

pub mod app;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod instances;
pub mod loadbalancer;
pub mod retry;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
