//! kubedevice-coordinator: Allocation coordination across device plugins
//!
//! This crate provides:
//! - Node registration driving each plugin through its lifecycle
//! - All-or-nothing allocation across the plugins a container needs
//! - Launch descriptors merging every plugin's mounts, devices and env

pub mod coordinator;
pub mod launch;

pub use coordinator::{Coordinator, NodeRegistration, NodeSummary};
pub use launch::LaunchDescriptor;
