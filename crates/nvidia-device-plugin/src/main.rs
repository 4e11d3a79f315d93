use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use nvidia_device_plugin::config::Cli;
use nvidia_device_plugin::config::PluginConfig;
use nvidia_device_plugin::platform::nvml::NvmlBackend;
use nvidia_device_plugin::signals::TerminationSignals;
use nvidia_device_plugin::DeviceBackend;
use nvidia_device_plugin::DeviceSet;
use nvidia_device_plugin::NvidiaDevicePlugin;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Parks the process so the kubelet keeps seeing it as present but unready.
async fn wait_indefinitely() -> ! {
    let never: Infallible = std::future::pending().await;
    match never {}
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init(cli.log_path.as_deref())?;

    tracing::info!("Starting NVIDIA device plugin {}", &**version::VERSION);

    tracing::info!("Loading NVML");
    let backend = match NvmlBackend::init(&cli.ignored_xids) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!("Failed to start NVML: {e:?}");
            tracing::error!(
                "If this is a GPU node, did you set the docker default runtime to `nvidia`?"
            );
            tracing::error!(
                "You can check the prerequisites at: https://github.com/NVIDIA/k8s-device-plugin#prerequisites"
            );
            tracing::error!(
                "You can learn how to set the runtime at: https://github.com/NVIDIA/k8s-device-plugin#quick-start"
            );
            wait_indefinitely().await
        }
    };

    tracing::info!("Fetching devices");
    let devices = match backend.enumerate_devices() {
        Ok(ids) => DeviceSet::new(ids),
        Err(e) => {
            tracing::error!("Failed to enumerate devices: {e:?}");
            wait_indefinitely().await
        }
    };
    if devices.is_empty() {
        tracing::info!("No devices found. Waiting indefinitely.");
        wait_indefinitely().await;
    }

    tracing::info!("Starting OS watcher");
    let mut signals = TerminationSignals::new().context("install signal handlers failed")?;

    let plugin = NvidiaDevicePlugin::new(PluginConfig::from(&cli), devices, backend);
    if let Err(e) = plugin.start().await {
        tracing::error!("Failed to start device plugin: {e:?}");
        wait_indefinitely().await;
    }

    let signal = signals.recv().await;
    tracing::info!("Received signal \"{signal}\", shutting down");

    plugin
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("stop device plugin failed: {e:?}"))?;

    Ok(())
}
