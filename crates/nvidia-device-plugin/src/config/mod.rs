pub mod cli;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub use cli::*;

pub const DEFAULT_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const DEFAULT_DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Settings the lifecycle manager needs, derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Unix socket the gRPC services are served on.
    pub socket_path: PathBuf,
    /// Resource name advertised to the kubelet, e.g. `nvidia.com/gpu`.
    pub resource_name: String,
    /// Whether hardware fault events are turned into health transitions.
    pub health_checks: bool,
    /// How long Stop waits for in-flight calls before aborting them.
    pub shutdown_timeout: Duration,
}

impl PluginConfig {
    pub fn new(device_plugin_path: impl AsRef<Path>, resource_name: impl Into<String>) -> Self {
        let resource_name = resource_name.into();
        Self {
            socket_path: socket_path(device_plugin_path, &resource_name),
            resource_name,
            health_checks: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Cli> for PluginConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            health_checks: !cli.disable_health_checks,
            shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
            ..Self::new(&cli.device_plugin_path, cli.resource_name.clone())
        }
    }
}

/// Socket path convention: `<dir>/<resource-name>.sock`.
///
/// Resource names contain a `/`, so the socket lands in a sub-directory.
pub fn socket_path(device_plugin_path: impl AsRef<Path>, resource_name: &str) -> PathBuf {
    device_plugin_path
        .as_ref()
        .join(format!("{resource_name}.sock"))
}
