//! CSI node service: volume publish and unpublish
//!
//! NodePublishVolume delegates staging to the node agent through
//! annotations on the client pod: one staging state machine per (client
//! pod, claim) pair, keyed by the claim UID, plus a per-volume finalizer
//! that keeps the pod around until unstaging finishes. NodeUnpublishVolume
//! finds the pair by publish target path, requests unstaging, and waits for
//! a terminal state. Both calls are idempotent.

use std::sync::OnceLock;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use crate::config::{
    staging_pvc_name_annotation, staging_pvc_namespace_annotation, staging_read_only_annotation,
    staging_state_annotation, staging_target_path_annotation, unstage_volume_finalizer,
    unstaging_requested_annotation, uses_provisioner_label, uses_volume_label,
    uses_volumes_label, DOMAIN,
};
use crate::error::Error;
use crate::kube_utils::{atomically_modify, watch_until};
use crate::proto::v1::node_server::Node;
use crate::proto::v1::volume_capability::AccessType;
use crate::proto::v1::{
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
};
use crate::states::StagingState;

use super::{
    access_mode_name, capability_volume_mode, ensure, ensure_provisioner_is_not_being_deleted,
    ProvisionerRef,
};

/// Node plugin of one provisioner, serving one node.
pub struct NodeService {
    client: Client,
    provisioner: ProvisionerRef,
    node_name: String,
}

#[derive(Clone, Debug)]
struct ObjectRef {
    name: String,
    namespace: String,
    uid: String,
}

/// The (client pod, claim) pair identifying one staged volume.
#[derive(Clone, Debug)]
struct VolumeStageRef {
    client_pod: ObjectRef,
    pvc_uid: String,
}

fn target_path_annotation_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^{}/([0-9a-fA-F]{{8}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{12}})-target-path-in-host$",
            regex::escape(DOMAIN)
        ))
        .expect("pattern is valid")
    })
}

impl NodeService {
    pub fn new(client: Client, provisioner: ProvisionerRef, node_name: String) -> Self {
        Self {
            client,
            provisioner,
            node_name,
        }
    }

    /// Find the persistent volume with the given handle under this
    /// provisioner. Only metadata.name is a valid PV field selector, so
    /// this lists and filters.
    async fn find_pv(&self, volume_id: &str) -> Result<PersistentVolume, Status> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let volumes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Status::internal(format!("cannot list volumes: {e}")))?;

        let mut matches = volumes.items.into_iter().filter(|pv| {
            pv.spec
                .as_ref()
                .and_then(|s| s.csi.as_ref())
                .is_some_and(|csi| {
                    csi.driver == self.provisioner.name && csi.volume_handle == volume_id
                })
        });

        let pv = matches
            .next()
            .ok_or_else(|| Status::not_found(format!("no volume with handle {volume_id:?}")))?;

        ensure(
            matches.next().is_none(),
            tonic::Code::Internal,
            "more than one volume matches the handle",
        )?;

        Ok(pv)
    }

    /// Stamp the client pod so the node agent starts staging, unless an
    /// earlier attempt already did.
    async fn delegate_staging(
        &self,
        client_pod: &ObjectRef,
        pvc: &ObjectRef,
        target_path: &str,
        read_only: bool,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &client_pod.namespace);
        let provisioner_uid = self.provisioner.uid.clone();
        let pvc = pvc.clone();
        let expected_uid = client_pod.uid.clone();

        atomically_modify(&api, &client_pod.name, |pod| {
            if pod.uid().as_deref() != Some(expected_uid.as_str()) {
                return Err(Error::ObjectReplaced("Pod"));
            }

            let state = pod
                .annotations()
                .get(&staging_state_annotation(&pvc.uid))
                .and_then(|json| StagingState::from_json(json).ok());
            let unstaging_requested = pod
                .annotations()
                .contains_key(&unstaging_requested_annotation(&pvc.uid));

            let restartable = matches!(state, None | Some(StagingState::StagingFailed { .. }));

            if restartable {
                let labels = pod.metadata.labels.get_or_insert_with(Default::default);
                labels.insert(uses_provisioner_label(&provisioner_uid), String::new());
                labels.insert(uses_volume_label(&pvc.uid), String::new());
                labels.insert(uses_volumes_label(), String::new());

                if !unstaging_requested {
                    pod.metadata
                        .finalizers
                        .get_or_insert_with(Vec::new)
                        .push(unstage_volume_finalizer(&pvc.uid));

                    let annotations =
                        pod.metadata.annotations.get_or_insert_with(Default::default);
                    annotations.insert(
                        staging_state_annotation(&pvc.uid),
                        StagingState::LaunchStagingPod.to_json(),
                    );
                    annotations.insert(staging_pvc_name_annotation(&pvc.uid), pvc.name.clone());
                    annotations.insert(
                        staging_pvc_namespace_annotation(&pvc.uid),
                        pvc.namespace.clone(),
                    );
                    annotations.insert(
                        staging_target_path_annotation(&pvc.uid),
                        target_path.to_string(),
                    );
                    annotations.insert(
                        staging_read_only_annotation(&pvc.uid),
                        read_only.to_string(),
                    );
                }
            }

            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Watch the client pod until the machine reaches `Staged` or fails.
    async fn wait_for_staging(
        &self,
        client_pod: &ObjectRef,
        pvc_uid: &str,
    ) -> Result<(), Status> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &client_pod.namespace);
        let expected_uid = client_pod.uid.clone();
        let annotation = staging_state_annotation(pvc_uid);

        watch_until(&api, &client_pod.name, |pod| {
            if pod.uid().as_deref() != Some(expected_uid.as_str()) {
                return Err(Error::ObjectReplaced("Pod"));
            }

            let state_json = pod
                .annotations()
                .get(&annotation)
                .ok_or_else(|| Error::internal("pod lost its staging state annotation"))?;
            let state = StagingState::from_json(state_json)
                .map_err(|e| Error::internal(format!("unparsable state annotation: {e}")))?;

            if let Some((code, details)) = state.failure() {
                return Ok(Some(Err(Status::new(code.into(), details.to_string()))));
            }

            match state {
                StagingState::Staged { .. } => Ok(Some(Ok(()))),
                // unstaging already started after staging completed
                state if state.is_after_staged() => Ok(Some(Err(Status::aborted(
                    "the volume is already being unstaged",
                )))),
                _ => Ok(None),
            }
        })
        .await
        .map_err(|e| Status::internal(e.to_string()))?
    }

    /// Find the (client pod, claim) pair whose publish target is
    /// `target_path`. The target path embeds both UIDs, so it is globally
    /// unique; None means nothing is staged there.
    async fn find_stage_ref(&self, target_path: &str) -> Result<Option<VolumeStageRef>, Status> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", self.node_name)))
            .await
            .map_err(|e| Status::internal(format!("cannot list pods: {e}")))?;

        let pattern = target_path_annotation_pattern();
        let mut matches = pods.items.iter().filter_map(|pod| {
            let pvc_uid = pod.annotations().iter().find_map(|(key, value)| {
                let captures = pattern.captures(key)?;
                (value == target_path).then(|| captures[1].to_string())
            })?;

            Some(VolumeStageRef {
                client_pod: ObjectRef {
                    name: pod.name_any(),
                    namespace: pod.namespace().unwrap_or_default(),
                    uid: pod.uid().unwrap_or_default(),
                },
                pvc_uid,
            })
        });

        let stage_ref = matches.next();
        ensure(
            matches.next().is_none(),
            tonic::Code::Internal,
            "more than one pod publishes the target path",
        )?;

        Ok(stage_ref)
    }

    /// Ask the node agent to unstage: mark the request and, if the volume
    /// is currently staged, advance the machine into the unstaging arm.
    async fn delegate_unstaging(&self, stage_ref: &VolumeStageRef) -> Result<(), Error> {
        let api: Api<Pod> =
            Api::namespaced(self.client.clone(), &stage_ref.client_pod.namespace);
        let expected_uid = stage_ref.client_pod.uid.clone();
        let pvc_uid = stage_ref.pvc_uid.clone();

        atomically_modify(&api, &stage_ref.client_pod.name, |pod| {
            if pod.uid().as_deref() != Some(expected_uid.as_str()) {
                return Err(Error::ObjectReplaced("Pod"));
            }

            let state = pod
                .annotations()
                .get(&staging_state_annotation(&pvc_uid))
                .and_then(|json| StagingState::from_json(json).ok());

            let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
            annotations.insert(unstaging_requested_annotation(&pvc_uid), String::new());

            if let Some(StagingState::Staged {
                staging_pod_namespace,
            }) = state
            {
                annotations.insert(
                    staging_state_annotation(&pvc_uid),
                    StagingState::RemoveStagingPod {
                        staging_pod_namespace,
                    }
                    .to_json(),
                );
            }

            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Watch the client pod until the machine leaves the unstaging arm.
    /// Failed terminal states still complete the unpublish; they park the
    /// volume for operator repair.
    async fn wait_for_unstaging(&self, stage_ref: &VolumeStageRef) -> Result<(), Status> {
        let api: Api<Pod> =
            Api::namespaced(self.client.clone(), &stage_ref.client_pod.namespace);
        let expected_uid = stage_ref.client_pod.uid.clone();
        let annotation = staging_state_annotation(&stage_ref.pvc_uid);

        watch_until(&api, &stage_ref.client_pod.name, |pod| {
            if pod.uid().as_deref() != Some(expected_uid.as_str()) {
                return Err(Error::ObjectReplaced("Pod"));
            }

            let state_json = pod
                .annotations()
                .get(&annotation)
                .ok_or_else(|| Error::internal("pod lost its staging state annotation"))?;
            let state = StagingState::from_json(state_json)
                .map_err(|e| Error::internal(format!("unparsable state annotation: {e}")))?;

            match state {
                StagingState::Unstaged
                | StagingState::StagingFailed { .. }
                | StagingState::UnrecoverableFailure { .. } => Ok(Some(())),
                _ => Ok(None),
            }
        })
        .await
        .map_err(|e| Status::internal(e.to_string()))?;

        Ok(())
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    #[instrument(skip_all)]
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: 0,
        }))
    }

    #[instrument(skip_all)]
    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![],
        }))
    }

    #[instrument(skip_all, fields(volume = %request.get_ref().volume_id))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();

        ensure_provisioner_is_not_being_deleted(&self.client, &self.provisioner).await?;

        let pod_context = |key: &str| {
            request
                .volume_context
                .get(&format!("csi.storage.k8s.io/pod.{key}"))
                .cloned()
                .ok_or_else(|| {
                    Status::invalid_argument(format!(
                        "missing pod {key} in volume context; the CSIDriver object enables \
                         podInfoOnMount"
                    ))
                })
        };

        let client_pod = ObjectRef {
            name: pod_context("name")?,
            namespace: pod_context("namespace")?,
            uid: pod_context("uid")?,
        };

        let pv = self.find_pv(&request.volume_id).await?;

        let claim_ref = pv
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.clone())
            .ok_or_else(|| Status::internal("volume is not bound to a claim"))?;
        let pvc_name = claim_ref
            .name
            .ok_or_else(|| Status::internal("claim reference has no name"))?;
        let pvc_namespace = claim_ref
            .namespace
            .ok_or_else(|| Status::internal("claim reference has no namespace"))?;

        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &pvc_namespace);
        let pvc = pvcs
            .get(&pvc_name)
            .await
            .map_err(|e| Status::internal(format!("cannot read claim: {e}")))?;

        ensure(
            pvc.uid() == claim_ref.uid,
            tonic::Code::Internal,
            "claim does not match the volume's claim reference",
        )?;

        cross_check_publish(&self.provisioner.name, &request, &pv, &pvc)?;
        validate_publish_capability(&request)?;

        let pvc_ref = ObjectRef {
            name: pvc_name,
            namespace: pvc_namespace,
            uid: pvc.uid().unwrap_or_default(),
        };

        self.delegate_staging(
            &client_pod,
            &pvc_ref,
            &request.target_path,
            request.readonly,
        )
        .await
        .map_err(|e| Status::internal(e.to_string()))?;

        self.wait_for_staging(&client_pod, &pvc_ref.uid).await?;

        info!(target = %request.target_path, "volume published");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume = %request.get_ref().volume_id))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();

        if let Some(stage_ref) = self.find_stage_ref(&request.target_path).await? {
            self.delegate_unstaging(&stage_ref)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            self.wait_for_unstaging(&stage_ref).await?;
            info!(target = %request.target_path, "volume unpublished");
        }

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }
}

/// Ensure the request agrees with the bound volume and claim it names.
fn cross_check_publish(
    provisioner_name: &str,
    request: &NodePublishVolumeRequest,
    pv: &PersistentVolume,
    pvc: &PersistentVolumeClaim,
) -> Result<(), Status> {
    let driver = pv
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .map(|csi| csi.driver.as_str())
        .unwrap_or_default();
    ensure(
        provisioner_name == driver,
        tonic::Code::Internal,
        "volume belongs to a different provisioner",
    )?;

    let capability = request
        .volume_capability
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("missing volume capability"))?;

    let claim_mode = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or("Filesystem");
    ensure(
        capability_volume_mode(capability) == claim_mode,
        tonic::Code::Internal,
        "request volume mode does not match the claim",
    )?;

    let mode = capability
        .access_mode
        .as_ref()
        .map(|m| m.mode)
        .unwrap_or_default();
    let access_mode = access_mode_name(mode)
        .ok_or_else(|| Status::invalid_argument("unsupported access mode"))?;
    let claim_access = pvc
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.clone())
        .unwrap_or_default();
    ensure(
        claim_access.iter().any(|m| m == access_mode),
        tonic::Code::Internal,
        "request access mode is not among the claim's access modes",
    )
}

/// The checks only fail for statically provisioned volumes; dynamic ones
/// were already rejected at creation.
fn validate_publish_capability(request: &NodePublishVolumeRequest) -> Result<(), Status> {
    if let Some(AccessType::Mount(mount)) = request
        .volume_capability
        .as_ref()
        .and_then(|c| c.access_type.as_ref())
    {
        ensure(
            mount.fs_type.is_empty(),
            tonic::Code::InvalidArgument,
            "must not specify 'PersistentVolume.spec.csi.fsType'",
        )?;
        ensure(
            mount.mount_flags.is_empty(),
            tonic::Code::InvalidArgument,
            "must not specify 'PersistentVolume.spec.mountOptions'",
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::v1::volume_capability::access_mode::Mode;
    use crate::proto::v1::volume_capability::{AccessMode, BlockVolume, MountVolume};
    use crate::proto::v1::VolumeCapability;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_pv() -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: "my-provisioner".into(),
                    volume_handle: "vol-1".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sample_pvc() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into(), "ReadOnlyMany".into()]),
                volume_mode: Some("Filesystem".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn publish_request(capability: VolumeCapability) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "vol-1".into(),
            target_path: "/var/lib/kubelet/pods/x/volumes/y/mount".into(),
            volume_capability: Some(capability),
            ..Default::default()
        }
    }

    fn mount_capability(mode: i32) -> VolumeCapability {
        VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: Some(AccessMode { mode }),
        }
    }

    #[test]
    fn matching_publish_requests_pass_the_cross_check() {
        // MULTI_NODE_READER_ONLY is the wire name of ReadOnlyMany
        let request = publish_request(mount_capability(Mode::MultiNodeReaderOnly as i32));
        cross_check_publish("my-provisioner", &request, &sample_pv(), &sample_pvc()).unwrap();
    }

    #[test]
    fn block_requests_against_filesystem_claims_fail() {
        let capability = VolumeCapability {
            access_type: Some(AccessType::Block(BlockVolume::default())),
            access_mode: Some(AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
        };
        let request = publish_request(capability);

        assert!(
            cross_check_publish("my-provisioner", &request, &sample_pv(), &sample_pvc()).is_err()
        );
    }

    #[test]
    fn access_modes_outside_the_claim_fail() {
        let request = publish_request(mount_capability(Mode::MultiNodeMultiWriter as i32));
        assert!(
            cross_check_publish("my-provisioner", &request, &sample_pv(), &sample_pvc()).is_err()
        );
    }

    #[test]
    fn fs_type_is_rejected_on_publish() {
        let capability = VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: "xfs".into(),
                ..Default::default()
            })),
            access_mode: None,
        };
        let status = validate_publish_capability(&publish_request(capability)).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("fsType"));
    }

    #[test]
    fn the_target_path_annotation_pattern_extracts_the_claim_uid() {
        let pattern = target_path_annotation_pattern();

        let key = format!(
            "{DOMAIN}/11111111-2222-3333-4444-555555555555-target-path-in-host"
        );
        let captures = pattern.captures(&key).expect("key should match");
        assert_eq!(&captures[1], "11111111-2222-3333-4444-555555555555");

        assert!(pattern
            .captures(&format!("{DOMAIN}/not-a-uid-target-path-in-host"))
            .is_none());
        assert!(pattern
            .captures(&format!(
                "{DOMAIN}/11111111-2222-3333-4444-555555555555-read-only"
            ))
            .is_none());
    }
}
