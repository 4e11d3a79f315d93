//! Kubernetes device plugin protocol.
//!
//! The kubelet talks to the plugin over a Unix socket using two gRPC services:
//! - [`identity::IdentityService`]: the registration handshake
//! - [`device_plugin::DevicePluginService`]: device listing, container
//!   initialization and pod admission

pub mod device_plugin;
pub mod identity;

pub use device_plugin::DevicePluginService;
pub use identity::IdentityService;
