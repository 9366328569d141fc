//! CSI controller service: volume creation and deletion
//!
//! CreateVolume does not create anything itself. It stamps the triggering
//! claim with the provisioning state machine's initial state, the
//! provisioner label, the delete-volume finalizer, and a snapshot of the
//! storage class (which may be deleted before the claim is), then watches
//! the claim until the agents drive the machine to `Created` or a failure.
//! DeleteVolume is trivial: it is only invoked after the claim is fully
//! deleted, which the finalizer protocol delays until the backing volume is
//! already gone.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client, ResourceExt};
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use crate::config::{
    delete_volume_finalizer, deletion_requested_annotation, provisioner_label, state_annotation,
    storage_class_annotation,
};
use crate::error::Error;
use crate::kube_utils::{atomically_modify, watch_until};
use crate::proto::v1::controller_server::Controller;
use crate::proto::v1::controller_service_capability::rpc::Type as RpcType;
use crate::proto::v1::controller_service_capability::{Rpc, Type as CapabilityType};
use crate::proto::v1::volume_capability::AccessType;
use crate::proto::v1::{
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerServiceCapability, CreateVolumeRequest, CreateVolumeResponse, DeleteVolumeRequest,
    DeleteVolumeResponse, Volume, VolumeCapability,
};
use crate::quantity::{parse_quantity, Rounding};
use crate::states::ProvisioningState;

use super::{
    access_mode_name, capability_volume_mode, ensure, ensure_provisioner_is_not_being_deleted,
    ProvisionerRef,
};

/// Controller plugin of one provisioner.
pub struct ControllerService {
    client: Client,
    provisioner: ProvisionerRef,
}

impl ControllerService {
    pub fn new(client: Client, provisioner: ProvisionerRef) -> Self {
        Self {
            client,
            provisioner,
        }
    }

    /// Stamp the claim so the agents start provisioning, unless an earlier
    /// attempt already did.
    async fn delegate_creation(
        &self,
        pvc_name: &str,
        pvc_namespace: &str,
        pvc_uid: &str,
        sc: &StorageClass,
    ) -> Result<(), Error> {
        let sc_json = serde_json::to_string(sc)?;
        let provisioner_name = self.provisioner.name.clone();

        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), pvc_namespace);

        atomically_modify(&api, pvc_name, |pvc| {
            if pvc.uid().as_deref() != Some(pvc_uid) {
                return Err(Error::ObjectReplaced("PersistentVolumeClaim"));
            }

            let annotations = pvc.metadata.annotations.get_or_insert_with(Default::default);

            annotations.insert(storage_class_annotation(), sc_json.clone());

            let state = annotations
                .get(&state_annotation())
                .and_then(|json| ProvisioningState::from_json(json).ok());
            let deletion_requested = annotations.contains_key(&deletion_requested_annotation());

            // a fresh claim, or one whose previous attempt failed, restarts
            // the machine; anything else is an in-flight attempt we adopt
            let restartable =
                matches!(state, None | Some(ProvisioningState::CreationFailed { .. }));

            if restartable {
                pvc.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(provisioner_label(), provisioner_name.clone());

                if !deletion_requested {
                    pvc.metadata
                        .finalizers
                        .get_or_insert_with(Vec::new)
                        .push(delete_volume_finalizer());

                    pvc.metadata
                        .annotations
                        .get_or_insert_with(Default::default)
                        .insert(
                            state_annotation(),
                            ProvisioningState::LaunchValidationPod.to_json(),
                        );
                }
            }

            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Watch the claim until the machine reaches `Created` or fails.
    async fn wait_for_creation(
        &self,
        pvc_name: &str,
        pvc_namespace: &str,
        pvc_uid: &str,
    ) -> Result<(String, i64), Status> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), pvc_namespace);

        watch_until(&api, pvc_name, |pvc| {
            if pvc.uid().as_deref() != Some(pvc_uid) {
                return Err(Error::ObjectReplaced("PersistentVolumeClaim"));
            }

            let state_json = pvc
                .annotations()
                .get(&state_annotation())
                .ok_or_else(|| Error::internal("claim lost its state annotation"))?;
            let state = ProvisioningState::from_json(state_json)
                .map_err(|e| Error::internal(format!("unparsable state annotation: {e}")))?;

            if let Some((code, details)) = state.failure() {
                return Ok(Some(Err(Status::new(code.into(), details.to_string()))));
            }

            match state {
                ProvisioningState::Created { handle, capacity } => {
                    Ok(Some(Ok((handle, capacity))))
                }
                // deletion already started after creation completed
                state if state.is_after_created() => Ok(Some(Err(Status::aborted(
                    "the volume is already being deleted",
                )))),
                _ => Ok(None),
            }
        })
        .await
        .map_err(status_from_error)?
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(skip_all)]
    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(CapabilityType::Rpc(Rpc {
                    r#type: RpcType::CreateDeleteVolume as i32,
                })),
            }],
        }))
    }

    #[instrument(skip_all, fields(volume = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request = request.into_inner();

        ensure_provisioner_is_not_being_deleted(&self.client, &self.provisioner).await?;

        let pvc_name = extra_metadata(&request.parameters, "csi.storage.k8s.io/pvc/name")?;
        let pvc_namespace =
            extra_metadata(&request.parameters, "csi.storage.k8s.io/pvc/namespace")?;

        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc_namespace);
        let pvc = pvcs
            .get(&pvc_name)
            .await
            .map_err(|e| Status::internal(format!("cannot read claim: {e}")))?;

        let sc_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
            .ok_or_else(|| Status::internal("claim has no storage class"))?;
        let scs: Api<StorageClass> = Api::all(self.client.clone());
        let sc = scs
            .get(&sc_name)
            .await
            .map_err(|e| Status::internal(format!("cannot read storage class: {e}")))?;

        cross_check(&self.provisioner.name, &request, &pvc, &sc)?;
        validate_capabilities(&request.volume_capabilities)?;

        let pvc_uid = pvc
            .uid()
            .ok_or_else(|| Status::internal("claim has no uid"))?;

        self.delegate_creation(&pvc_name, &pvc_namespace, &pvc_uid, &sc)
            .await
            .map_err(status_from_error)?;

        let (handle, capacity) = self
            .wait_for_creation(&pvc_name, &pvc_namespace, &pvc_uid)
            .await?;

        info!(handle, capacity, "volume created");

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                volume_id: handle,
                capacity_bytes: capacity,
                // copied onto the persistent volume as its attributes
                volume_context: sc
                    .parameters
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<HashMap<_, _>>(),
            }),
        }))
    }

    #[instrument(skip_all, fields(volume = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        // This RPC only runs after the claim is fully deleted, which the
        // delete-volume finalizer delays until the agents have deleted the
        // backing volume. Nothing is left to do.
        let _ = request;
        Ok(Response::new(DeleteVolumeResponse {}))
    }
}

/// Ensure the request agrees with the claim and storage class it names.
/// The agents reconstruct everything from those objects, so any
/// disagreement means the orchestrator and sidecar are out of sync.
fn cross_check(
    provisioner_name: &str,
    request: &CreateVolumeRequest,
    pvc: &PersistentVolumeClaim,
    sc: &StorageClass,
) -> Result<(), Status> {
    let spec = pvc
        .spec
        .as_ref()
        .ok_or_else(|| Status::internal("claim has no spec"))?;

    ensure(
        provisioner_name == sc.provisioner,
        tonic::Code::Internal,
        "storage class names a different provisioner",
    )?;

    let requested_modes: HashSet<&str> = request
        .volume_capabilities
        .iter()
        .map(capability_volume_mode)
        .collect();
    let claim_mode = spec.volume_mode.as_deref().unwrap_or("Filesystem");
    ensure(
        requested_modes.len() == 1 && requested_modes.contains(claim_mode),
        tonic::Code::Internal,
        "request volume mode does not match the claim",
    )?;

    let mut requested_access = HashSet::new();
    for capability in &request.volume_capabilities {
        let mode = capability
            .access_mode
            .as_ref()
            .map(|m| m.mode)
            .unwrap_or_default();
        let name = access_mode_name(mode).ok_or_else(|| {
            Status::invalid_argument("the claim requests an unsupported access mode")
        })?;
        requested_access.insert(name.to_string());
    }
    let claim_access: HashSet<String> = spec
        .access_modes
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    ensure(
        requested_access == claim_access,
        tonic::Code::Internal,
        "request access modes do not match the claim",
    )?;

    let resources = spec
        .resources
        .as_ref()
        .ok_or_else(|| Status::internal("claim has no resource requirements"))?;
    let min_capacity = resources
        .requests
        .as_ref()
        .and_then(|r| r.get("storage"))
        .map(|q| parse_quantity(&q.0, Rounding::HalfEven))
        .transpose()
        .map_err(|e| Status::internal(e.to_string()))?
        .unwrap_or(0);
    let max_capacity = resources
        .limits
        .as_ref()
        .and_then(|l| l.get("storage"))
        .map(|q| parse_quantity(&q.0, Rounding::HalfEven))
        .transpose()
        .map_err(|e| Status::internal(e.to_string()))?
        .unwrap_or(0);

    let range = request.capacity_range.clone().unwrap_or_default();
    ensure(
        range.required_bytes == min_capacity && range.limit_bytes == max_capacity,
        tonic::Code::Internal,
        "request capacity range does not match the claim",
    )?;

    let sc_params = sc.parameters.clone().unwrap_or_default();
    ensure(
        sc_params
            .iter()
            .all(|(k, v)| request.parameters.get(k) == Some(v)),
        tonic::Code::Internal,
        "request parameters do not include the storage class parameters",
    )
}

fn extra_metadata(parameters: &HashMap<String, String>, key: &str) -> Result<String, Status> {
    parameters.get(key).cloned().ok_or_else(|| {
        Status::invalid_argument(format!(
            "missing parameter {key:?}; the embedded external-provisioner runs with \
             --extra-create-metadata"
        ))
    })
}

/// PaV leaves filesystem choice and mount flags to the staging template.
fn validate_capabilities(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    for capability in capabilities {
        if let Some(AccessType::Mount(mount)) = &capability.access_type {
            ensure(
                mount.fs_type.is_empty(),
                tonic::Code::InvalidArgument,
                "must not specify 'StorageClass.parameters[\"csi.storage.k8s.io/fstype\"]'",
            )?;
            ensure(
                mount.mount_flags.is_empty(),
                tonic::Code::InvalidArgument,
                "must not specify 'StorageClass.mountOptions'",
            )?;
        }
    }
    Ok(())
}

fn status_from_error(error: Error) -> Status {
    match error {
        Error::ObjectReplaced(_) => Status::failed_precondition(error.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::v1::volume_capability::access_mode::Mode;
    use crate::proto::v1::volume_capability::{AccessMode, MountVolume};
    use crate::proto::v1::CapacityRange;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn mount_capability(mode: i32) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: Some(AccessMode { mode }),
        }
    }

    fn sample_pvc() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".into()),
                namespace: Some("apps".into()),
                uid: Some("uid-1".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadOnlyMany".into()]),
                volume_mode: Some("Filesystem".into()),
                storage_class_name: Some("fast".into()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity("1Gi".into()))]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sample_sc() -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some("fast".into()),
                ..Default::default()
            },
            provisioner: "my-provisioner".into(),
            ..Default::default()
        }
    }

    fn sample_request() -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: "pvc-uid-1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 1 << 30,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability(Mode::MultiNodeReaderOnly as i32)],
            parameters: HashMap::from([
                (
                    "csi.storage.k8s.io/pvc/name".to_string(),
                    "data".to_string(),
                ),
                (
                    "csi.storage.k8s.io/pvc/namespace".to_string(),
                    "apps".to_string(),
                ),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn matching_requests_pass_the_cross_check() {
        cross_check("my-provisioner", &sample_request(), &sample_pvc(), &sample_sc()).unwrap();
    }

    #[test]
    fn a_foreign_storage_class_fails_the_cross_check() {
        let status =
            cross_check("other", &sample_request(), &sample_pvc(), &sample_sc()).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn mismatched_capacity_fails_the_cross_check() {
        let mut request = sample_request();
        request.capacity_range.as_mut().unwrap().required_bytes = 123;

        let status =
            cross_check("my-provisioner", &request, &sample_pvc(), &sample_sc()).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn mismatched_access_modes_fail_the_cross_check() {
        let mut request = sample_request();
        request.volume_capabilities = vec![mount_capability(Mode::SingleNodeWriter as i32)];

        assert!(cross_check("my-provisioner", &request, &sample_pvc(), &sample_sc()).is_err());
    }

    #[test]
    fn unsupported_access_modes_are_invalid_arguments() {
        let mut request = sample_request();
        request.volume_capabilities = vec![mount_capability(Mode::SingleNodeReaderOnly as i32)];

        let status =
            cross_check("my-provisioner", &request, &sample_pvc(), &sample_sc()).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn fs_type_and_mount_flags_are_rejected() {
        let with_fs_type = vec![VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: "ext4".into(),
                ..Default::default()
            })),
            access_mode: None,
        }];
        let status = validate_capabilities(&with_fs_type).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let with_flags = vec![VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume {
                mount_flags: vec!["noatime".into()],
                ..Default::default()
            })),
            access_mode: None,
        }];
        assert!(validate_capabilities(&with_flags).is_err());

        let clean = vec![mount_capability(Mode::SingleNodeWriter as i32)];
        validate_capabilities(&clean).unwrap();
    }

    #[test]
    fn missing_extra_metadata_is_an_invalid_argument() {
        let status = extra_metadata(&HashMap::new(), "csi.storage.k8s.io/pvc/name").unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn replaced_objects_surface_as_failed_preconditions() {
        let status = status_from_error(Error::ObjectReplaced("PersistentVolumeClaim"));
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status = status_from_error(Error::internal("boom"));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
