//! Controller module for LoadBalancer Services
//! This module contains the main controller loop, the node informer,
//! and finalizer handling.

mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
mod nodes;
mod reconciler;

pub use finalizers::{
    has_finalizer, needs_cleanup, wants_load_balancer, FIELD_MANAGER,
    LOAD_BALANCER_CLEANUP_FINALIZER,
};
pub use nodes::NodeCache;
pub use reconciler::{run_controller, ControllerState, CONTROLLER_NAME};
