#![allow(clippy::doc_markdown)]
pub mod api {
    tonic::include_proto!("v1alpha");
}

use std::collections::HashMap;
use std::pin::Pin;

use api::device_plugin_server::DevicePlugin;
use api::AdmitPodRequest;
use api::AdmitPodResponse;
use api::ContainerSpec;
use api::GetPluginInfoRequest;
use api::GetPluginInfoResponse;
use api::InitContainerRequest;
use api::InitContainerResponse;
use api::ListAndWatchRequest;
use api::ListAndWatchResponse;
use api::PodSpec;
use futures::Stream;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::device::DeviceSet;

/// Device plugin API version implemented by this plugin.
pub const VERSION: &str = "v1alpha";

/// Environment variable the NVIDIA container runtime reads to select GPUs.
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

pub const RUNTIME_ANNOTATION_KEY: &str = "annotation.io.kubernetes.container.runtime";
pub const RUNTIME_ANNOTATION_VALUE: &str = "nvidia";

const INIT_TIMEOUT: i64 = 1;

/// DevicePlugin service implementation
/// reports devices and their health, validates allocations and annotates pods
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    devices: DeviceSet,
    /// devices that just became unhealthy
    health_events: broadcast::Sender<Device>,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        devices: DeviceSet,
        health_events: broadcast::Sender<Device>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            devices,
            health_events,
            cancellation_token,
        }
    }

    fn runtime_annotations() -> HashMap<String, String> {
        HashMap::from([(
            RUNTIME_ANNOTATION_KEY.to_string(),
            RUNTIME_ANNOTATION_VALUE.to_string(),
        )])
    }
}

/// Current ids and health of every device, in discovery order.
pub fn device_list(devices: &DeviceSet) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: devices
            .iter()
            .map(|d| api::Device {
                id: d.id().to_string(),
                health: d.health().to_string(),
            })
            .collect(),
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> TonicResult<Response<GetPluginInfoResponse>> {
        debug!("getting plugin info");

        Ok(Response::new(GetPluginInfoResponse {
            init_timeout: INIT_TIMEOUT,
            labels: HashMap::new(),
        }))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// list devices and resend the list whenever a device turns unhealthy
    async fn list_and_watch(
        &self,
        _request: Request<ListAndWatchRequest>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        // a capacity of one makes every send wait until the previous list was taken
        let (tx, rx) = mpsc::channel::<Result<ListAndWatchResponse, Status>>(1);
        let devices = self.devices.clone();
        let cancellation_token = self.cancellation_token.clone();
        // subscribe before the first snapshot so no transition falls in between
        let mut health_events = self.health_events.subscribe();

        tokio::spawn(async move {
            if tx.send(Ok(device_list(&devices))).await.is_err() {
                debug!("kubelet went away before the initial device list was sent");
                return;
            }

            loop {
                select! {
                    biased;
                    _ = cancellation_token.cancelled() => {
                        info!("stop requested, closing device list stream");
                        break;
                    }
                    _ = tx.closed() => {
                        info!("kubelet closed the device list stream");
                        break;
                    }
                    event = health_events.recv() => match event {
                        Ok(device) => {
                            info!(device = device.id(), "device health changed, resending device list");
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed health events, resending device list");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                if tx.send(Ok(device_list(&devices))).await.is_err() {
                    break;
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// validate the devices assigned to a container and expose them to the runtime
    async fn init_container(
        &self,
        request: Request<InitContainerRequest>,
    ) -> TonicResult<Response<InitContainerResponse>> {
        let req = request.into_inner();
        debug!("InitContainer: {:?}", req);

        let requested = req.container.map(|c| c.devices).unwrap_or_default();
        if let Some(unknown) = self.devices.first_unknown(&requested) {
            warn!(device = unknown, "rejecting allocation of unknown device");
            return Err(Status::invalid_argument(format!(
                "invalid allocation request: unknown device: {unknown}"
            )));
        }

        info!("initializing container with devices {:?}", requested);
        let spec = ContainerSpec {
            envs: HashMap::from([(VISIBLE_DEVICES_ENV.to_string(), requested.join(","))]),
            annotations: Self::runtime_annotations(),
        };

        Ok(Response::new(InitContainerResponse { spec: Some(spec) }))
    }

    async fn admit_pod(
        &self,
        request: Request<AdmitPodRequest>,
    ) -> TonicResult<Response<AdmitPodResponse>> {
        debug!("AdmitPod: {:?}", request.get_ref());

        // CRI-O 1.9 reads the runtime annotation from the pod rather than the
        // container, so every pod gets it regardless of what it requested.
        Ok(Response::new(AdmitPodResponse {
            pod: Some(PodSpec {
                annotations: Self::runtime_annotations(),
            }),
        }))
    }
}
