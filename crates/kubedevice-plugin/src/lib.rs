//! kubedevice-plugin: Device plugin contract and builtin plugins
//!
//! This crate provides:
//! - The `DevicePlugin` trait every device kind implements
//! - A lifecycle wrapper enforcing init/start/ready ordering
//! - A registry mapping device kinds to plugin factories
//! - GPU and NIC plugins built on a shared device pool

pub mod gpu;
pub mod lifecycle;
pub mod nic;
pub mod pool;
pub mod registry;
pub mod traits;

pub use gpu::{GpuPlugin, GpuPluginConfig};
pub use lifecycle::{ManagedPlugin, PluginState};
pub use nic::{NicPlugin, NicPluginConfig};
pub use pool::DevicePool;
pub use registry::{PluginContext, PluginFactory, PluginRegistry};
pub use traits::{Allocation, DevicePlugin};
