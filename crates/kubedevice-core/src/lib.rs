//! kubedevice-core: Core types and accounting for kubedevice
//!
//! This crate provides the fundamental types used throughout the kubedevice system:
//! - Node, pod and container resource records
//! - The per-node resource ledger
//! - Configuration types
//! - Error handling
//! - Typed structural comparison
//! - The injectable logging capability

pub mod config;
pub mod diff;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod types;

pub use config::*;
pub use diff::*;
pub use error::*;
pub use ledger::*;
pub use logging::*;
pub use types::*;
