//! VM lifecycle management
//!
//! This module provides abstractions for managing session VMs including:
//! - VM handles (identity, capacity, endpoint, health bookkeeping)
//! - The lifecycle controller (plan-driven provisioning, health probing,
//!   bounded destruction)

pub mod controller;
pub mod handle;

pub use controller::VmLifecycleController;
pub use handle::{VmHandle, VmState};
