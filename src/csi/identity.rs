//! CSI identity service

use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::proto::v1::identity_server::Identity;
use crate::proto::v1::plugin_capability::service::Type as ServiceType;
use crate::proto::v1::plugin_capability::{Service, Type as CapabilityType};
use crate::proto::v1::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

/// Identity service of both plugin flavors. The driver name is the
/// provisioner name, which storage classes reference as their provisioner.
pub struct IdentityService {
    provisioner_name: String,
}

impl IdentityService {
    pub fn new(provisioner_name: &str) -> Self {
        Self {
            provisioner_name: provisioner_name.to_string(),
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    #[instrument(skip_all)]
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.provisioner_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }))
    }

    #[instrument(skip_all)]
    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: vec![PluginCapability {
                r#type: Some(CapabilityType::Service(Service {
                    r#type: ServiceType::ControllerService as i32,
                })),
            }],
        }))
    }

    #[instrument(skip_all)]
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plugin_info_reports_the_provisioner_name() {
        let service = IdentityService::new("my-provisioner");
        let response = service
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.name, "my-provisioner");
        assert!(!response.vendor_version.is_empty());
    }

    #[tokio::test]
    async fn the_controller_service_capability_is_advertised() {
        let service = IdentityService::new("p");
        let response = service
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.capabilities.len(), 1);
        match response.capabilities[0].r#type.as_ref().unwrap() {
            CapabilityType::Service(s) => {
                assert_eq!(s.r#type, ServiceType::ControllerService as i32);
            }
        }
    }

    #[tokio::test]
    async fn probe_reports_ready() {
        let service = IdentityService::new("p");
        let response = service
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.ready, Some(true));
    }
}
