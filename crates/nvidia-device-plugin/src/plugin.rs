//! Lifecycle manager: owns the Unix socket, the gRPC server and the health monitor.

use std::io;
use std::path::Path;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::DeviceBackend;
use crate::config::PluginConfig;
use crate::device::Device;
use crate::device::DeviceSet;
use crate::error::PluginError;
use crate::health::HealthMonitor;
use crate::platform::k8s::device_plugin::api::device_plugin_server::DevicePluginServer;
use crate::platform::k8s::identity::api::identity_server::IdentityServer;
use crate::platform::k8s::DevicePluginService;
use crate::platform::k8s::IdentityService;

const HEALTH_EVENT_CAPACITY: usize = 64;

/// Everything that exists only while the plugin is serving.
struct Serving {
    cancellation_token: CancellationToken,
    server: JoinHandle<()>,
    health_monitor: JoinHandle<()>,
}

/// NVIDIA GPU device plugin
pub struct NvidiaDevicePlugin {
    config: PluginConfig,
    devices: DeviceSet,
    backend: Arc<dyn DeviceBackend>,
    health_events: broadcast::Sender<Device>,
    serving: Mutex<Option<Serving>>,
}

impl NvidiaDevicePlugin {
    pub fn new(config: PluginConfig, devices: DeviceSet, backend: Arc<dyn DeviceBackend>) -> Self {
        let (health_events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        Self {
            config,
            devices,
            backend,
            health_events,
            serving: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// `false` once stopped, or once the gRPC server exited on its own.
    pub async fn is_serving(&self) -> bool {
        self.serving
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.server.is_finished())
    }

    /// Binds the socket and starts the gRPC server and the health monitor.
    ///
    /// Returns once both background tasks are spawned; it does not wait for the
    /// kubelet to connect.
    #[tracing::instrument(skip(self), fields(socket = %self.config.socket_path.display()))]
    pub async fn start(&self) -> Result<(), Report<PluginError>> {
        let mut serving = self.serving.lock().await;
        if serving.is_some() {
            return Err(Report::new(PluginError::AlreadyServing {
                path: self.socket_display(),
            }));
        }

        if self.devices.is_empty() {
            return Err(Report::new(PluginError::NoDevices));
        }

        remove_socket(&self.config.socket_path)?;

        if let Some(dir) = self.config.socket_path.parent() {
            std::fs::create_dir_all(dir).change_context(PluginError::CreateDir {
                path: dir.display().to_string(),
            })?;
        }

        let listener =
            UnixListener::bind(&self.config.socket_path).change_context(PluginError::Bind {
                path: self.socket_display(),
            })?;

        let cancellation_token = CancellationToken::new();

        let device_plugin_server = DevicePluginServer::new(DevicePluginService::new(
            self.devices.clone(),
            self.health_events.clone(),
            cancellation_token.clone(),
        ));
        let identity_server = IdentityServer::new(IdentityService::new(
            self.config.resource_name.clone(),
        ));

        let server = tokio::spawn({
            let cancellation_token = cancellation_token.clone();
            let socket_path = self.config.socket_path.clone();
            async move {
                let result = tonic::transport::Server::builder()
                    .add_service(device_plugin_server)
                    .add_service(identity_server)
                    .serve_with_incoming_shutdown(
                        tokio_stream::wrappers::UnixListenerStream::new(listener),
                        {
                            let cancellation_token = cancellation_token.clone();
                            async move {
                                cancellation_token.cancelled().await;
                                info!("shutting down gRPC server");
                            }
                        },
                    )
                    .await;
                on_server_exit(result, &cancellation_token, &socket_path);
            }
        });

        let health_monitor = tokio::spawn(
            HealthMonitor::new(
                self.devices.clone(),
                self.backend.clone(),
                self.health_events.clone(),
                self.config.health_checks,
            )
            .run(cancellation_token.clone()),
        );

        info!("Starting to serve on {}", self.socket_display());
        *serving = Some(Serving {
            cancellation_token,
            server,
            health_monitor,
        });

        Ok(())
    }

    /// Stops serving and removes the socket. A no-op when not serving.
    #[tracing::instrument(skip(self), fields(socket = %self.config.socket_path.display()))]
    pub async fn stop(&self) -> Result<(), Report<PluginError>> {
        let Some(serving) = self.serving.lock().await.take() else {
            debug!("device plugin is not serving, nothing to stop");
            return Ok(());
        };

        // Ends the ListAndWatch streams as well, otherwise the server would wait on them
        serving.cancellation_token.cancel();

        let mut server = serving.server;
        if tokio::time::timeout(self.config.shutdown_timeout, &mut server)
            .await
            .is_err()
        {
            warn!(
                "gRPC server did not drain within {:?}, aborting in-flight calls",
                self.config.shutdown_timeout
            );
            server.abort();
        }

        if let Err(e) = serving.health_monitor.await {
            error!("health monitor task failed: {e}");
        }

        remove_socket(&self.config.socket_path)?;
        info!("device plugin stopped");
        Ok(())
    }

    fn socket_display(&self) -> String {
        self.config.socket_path.display().to_string()
    }
}

/// Removes the socket file, ignoring a file that is already gone.
fn remove_socket(socket_path: &Path) -> Result<(), Report<PluginError>> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e).change_context(PluginError::SocketCleanup {
            path: socket_path.display().to_string(),
        })),
    }
}

/// Runs when the gRPC server task returns. Unless Stop caused it, the server
/// died on its own: wake the other tasks and drop the socket so nothing
/// connects to a plugin that no longer serves.
fn on_server_exit<E: std::fmt::Display>(
    result: Result<(), E>,
    cancellation_token: &CancellationToken,
    socket_path: &Path,
) {
    if let Err(e) = &result {
        error!("gRPC server terminated with error: {e}");
    }
    if cancellation_token.is_cancelled() {
        return;
    }

    cancellation_token.cancel();
    if let Err(e) = remove_socket(socket_path) {
        error!("failed to remove socket after server exit: {e:?}");
    }
}
