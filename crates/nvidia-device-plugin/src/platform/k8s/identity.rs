#![allow(clippy::doc_markdown)]
pub mod api {
    tonic::include_proto!("pluginregistration");
}

use api::identity_server::Identity;
use api::Empty;
use api::GetPluginIdentityRequest;
use api::GetPluginIdentityResponse;
use api::GetSupportedVersionsRequest;
use api::GetSupportedVersionsResponse;
use api::RegistrationStatus;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::device_plugin::VERSION;

/// Identity service answering the kubelet plugin watcher's discovery queries.
#[derive(Debug, Clone)]
pub struct IdentityService {
    /// resource name (e.g. "nvidia.com/gpu")
    resource_name: String,
}

impl IdentityService {
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_supported_versions(
        &self,
        _request: Request<GetSupportedVersionsRequest>,
    ) -> TonicResult<Response<GetSupportedVersionsResponse>> {
        debug!("getting supported versions");

        Ok(Response::new(GetSupportedVersionsResponse {
            supported_versions: vec![VERSION.to_string()],
        }))
    }

    async fn get_plugin_identity(
        &self,
        _request: Request<GetPluginIdentityRequest>,
    ) -> TonicResult<Response<GetPluginIdentityResponse>> {
        debug!("getting plugin identity");

        Ok(Response::new(GetPluginIdentityResponse {
            resource_name: self.resource_name.clone(),
        }))
    }

    async fn plugin_registration_status(
        &self,
        request: Request<RegistrationStatus>,
    ) -> TonicResult<Response<Empty>> {
        let status = request.into_inner();
        if status.plugin_registered {
            info!("plugin registered with kubelet");
        } else {
            warn!("plugin registration rejected by kubelet: {}", status.error);
        }

        Ok(Response::new(Empty {}))
    }
}
