pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod platform;
pub mod plugin;
pub mod signals;

pub use backend::DeviceBackend;
pub use backend::FaultEvent;
pub use device::Device;
pub use device::DeviceSet;
pub use device::Health;
pub use plugin::NvidiaDevicePlugin;
