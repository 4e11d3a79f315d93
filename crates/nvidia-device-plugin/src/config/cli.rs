use std::path::PathBuf;

use clap::Parser;
use utils::version;

use super::DEFAULT_DEVICE_PLUGIN_PATH;
use super::DEFAULT_RESOURCE_NAME;

/// Kubernetes device plugin advertising NVIDIA GPUs to the kubelet
#[derive(Parser, Debug, Clone)]
#[command(version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "DP_RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Extended resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        env = "DP_DEVICE_PLUGIN_PATH",
        default_value = DEFAULT_DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the kubelet watches for device plugin sockets"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "DP_DISABLE_HEALTHCHECKS",
        help = "Do not mark devices unhealthy on critical XID errors",
        default_value_t = false,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub disable_health_checks: bool,

    #[arg(
        long,
        env = "DP_IGNORED_XIDS",
        value_delimiter = ',',
        help = "Additional XIDs that do not make a device unhealthy, e.g. 13,68"
    )]
    pub ignored_xids: Vec<u64>,

    #[arg(
        long,
        env = "DP_SHUTDOWN_TIMEOUT_SECS",
        default_value = "5",
        help = "Seconds to wait for in-flight gRPC calls on shutdown before aborting them"
    )]
    pub shutdown_timeout_secs: u64,

    #[arg(
        long,
        env = "DP_LOG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily, e.g. /var/log/nvidia-device-plugin.log"
    )]
    pub log_path: Option<PathBuf>,
}
