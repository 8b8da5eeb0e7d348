//! kubedevice-api: REST API server for kubedevice
//!
//! This crate provides the REST API for interacting with a coordinator:
//! - Node listing, refresh and removal
//! - Container allocation and release
//! - Registered device kinds

pub mod rest;

pub use rest::create_router;
