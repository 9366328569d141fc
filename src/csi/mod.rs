//! Container-storage-interface plugins
//!
//! Each provisioner gets its own controller plugin (one Deployment) and
//! node plugin (one DaemonSet pod per node), both serving the reduced CSI
//! surface on a Unix domain socket next to the embedded sidecars. The
//! plugins hold no state: they seed state machines on orchestrator objects
//! and watch for the node agents to drive them to a terminal state.

mod controller;
mod identity;
mod node;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use kube::{Api, Client};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::Status;
use tracing::info;

use crate::config::CSI_SOCKET_PATH;
use crate::crd::PavProvisioner;
use crate::error::Error;
use crate::proto::v1::identity_server::IdentityServer;
use crate::proto::v1::controller_server::ControllerServer;
use crate::proto::v1::node_server::NodeServer;

/// Identity of the provisioner a plugin process serves.
#[derive(Clone, Debug)]
pub struct ProvisionerRef {
    pub name: String,
    pub uid: String,
}

/// Serve the identity and controller services until shutdown.
pub async fn serve_controller(client: Client, provisioner: ProvisionerRef) -> Result<(), Error> {
    let identity = IdentityServer::new(IdentityService::new(&provisioner.name));
    let controller = ControllerServer::new(ControllerService::new(client, provisioner));

    serve(|mut server| server.add_service(identity).add_service(controller)).await
}

/// Serve the identity and node services until shutdown.
pub async fn serve_node(
    client: Client,
    provisioner: ProvisionerRef,
    node_name: String,
) -> Result<(), Error> {
    let identity = IdentityServer::new(IdentityService::new(&provisioner.name));
    let node = NodeServer::new(NodeService::new(client, provisioner, node_name));

    serve(|mut server| server.add_service(identity).add_service(node)).await
}

async fn serve<F>(add_services: F) -> Result<(), Error>
where
    F: FnOnce(Server) -> tonic::transport::server::Router,
{
    // a stale socket from a previous plugin instance blocks the bind
    let _ = std::fs::remove_file(CSI_SOCKET_PATH);

    let listener = UnixListener::bind(CSI_SOCKET_PATH)
        .map_err(|e| Error::internal(format!("cannot bind {CSI_SOCKET_PATH}: {e}")))?;

    info!(socket = CSI_SOCKET_PATH, "CSI plugin listening");

    add_services(Server::builder())
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| Error::internal(format!("CSI server: {e}")))
}

/// Abort the RPC with `code` unless the condition holds.
pub(crate) fn ensure(condition: bool, code: tonic::Code, details: &str) -> Result<(), Status> {
    if condition {
        Ok(())
    } else {
        Err(Status::new(code, details.to_string()))
    }
}

/// Abort with FailedPrecondition if the provisioner is being deleted.
pub(crate) async fn ensure_provisioner_is_not_being_deleted(
    client: &Client,
    provisioner: &ProvisionerRef,
) -> Result<(), Status> {
    let api: Api<PavProvisioner> = Api::all(client.clone());
    let object = api
        .get(&provisioner.name)
        .await
        .map_err(|e| Status::internal(format!("cannot read provisioner: {e}")))?;

    ensure(
        object.metadata.deletion_timestamp.is_none(),
        tonic::Code::FailedPrecondition,
        "the PavProvisioner is under deletion",
    )
}

/// Wire name of a requested access mode, if PaV supports it.
pub(crate) fn access_mode_name(mode: i32) -> Option<&'static str> {
    use crate::proto::v1::volume_capability::access_mode::Mode;

    match Mode::try_from(mode).ok()? {
        Mode::SingleNodeWriter => Some("ReadWriteOnce"),
        Mode::MultiNodeReaderOnly => Some("ReadOnlyMany"),
        Mode::MultiNodeMultiWriter => Some("ReadWriteMany"),
        _ => None,
    }
}

/// Volume mode implied by a capability's access type.
pub(crate) fn capability_volume_mode(
    capability: &crate::proto::v1::VolumeCapability,
) -> &'static str {
    use crate::proto::v1::volume_capability::AccessType;

    match capability.access_type {
        Some(AccessType::Mount(_)) => "Filesystem",
        _ => "Block",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::v1::volume_capability::access_mode::Mode;
    use crate::proto::v1::volume_capability::{AccessType, BlockVolume, MountVolume};
    use crate::proto::v1::VolumeCapability;

    #[test]
    fn supported_access_modes_map_to_their_wire_names() {
        assert_eq!(
            access_mode_name(Mode::SingleNodeWriter as i32),
            Some("ReadWriteOnce")
        );
        assert_eq!(
            access_mode_name(Mode::MultiNodeReaderOnly as i32),
            Some("ReadOnlyMany")
        );
        assert_eq!(
            access_mode_name(Mode::MultiNodeMultiWriter as i32),
            Some("ReadWriteMany")
        );
    }

    #[test]
    fn unsupported_access_modes_are_rejected() {
        assert_eq!(access_mode_name(Mode::Unknown as i32), None);
        assert_eq!(access_mode_name(Mode::SingleNodeReaderOnly as i32), None);
        assert_eq!(access_mode_name(9999), None);
    }

    #[test]
    fn the_access_type_decides_the_volume_mode() {
        let mount = VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: None,
        };
        assert_eq!(capability_volume_mode(&mount), "Filesystem");

        let block = VolumeCapability {
            access_type: Some(AccessType::Block(BlockVolume::default())),
            access_mode: None,
        };
        assert_eq!(capability_volume_mode(&block), "Block");
    }

    #[test]
    fn ensure_produces_the_requested_code() {
        assert!(ensure(true, tonic::Code::Aborted, "never").is_ok());

        let status = ensure(false, tonic::Code::InvalidArgument, "bad input").unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "bad input");
    }
}
