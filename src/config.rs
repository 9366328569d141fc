//! Cluster-wide constants shared by every PaV process.

use std::time::Duration;

/// Used for the provisioner CRD group and as the prefix for every label,
/// annotation, and finalizer PaV writes.
pub const DOMAIN: &str = "pav.kubernetes-pav.io";

pub const PROVISIONER_GROUP: &str = DOMAIN;
pub const PROVISIONER_VERSION: &str = "v1alpha1";
pub const PROVISIONER_KIND: &str = "PavProvisioner";
pub const PROVISIONER_PLURAL: &str = "pavprovisioners";

/// Namespace holding the PaV agents and the admission webhook service.
pub const INTERNAL_NAMESPACE: &str = "pav";

/// Path, inside a CSI plugin container, of the CSI Unix domain socket.
pub const CSI_SOCKET_PATH: &str = "/csi/socket";

/// Host directory under which per-worker `/pav` volumes are created. Mounted
/// into the node agent with bidirectional propagation so unmounts performed
/// by worker pods are visible here.
pub const PAV_VOLUME_DIR: &str = "/var/lib/kubernetes-pav";

/// Delay before retrying an agent reconcile step after an internal failure.
pub const AGENT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default bound on a single worker-pod lifetime for the validation,
/// creation, deletion, and unstaging phases. Staging pods may outlive this
/// once they have signalled `/pav/ready`.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Base and cap for exponential backoff on transient orchestrator errors.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Name of the validating webhook configuration the controller agent owns.
pub const WEBHOOK_CONFIG_NAME: &str = "pav-provisioner-validation";

/// In-cluster service backing the admission webhook.
pub const WEBHOOK_SERVICE_NAME: &str = "pav-webhook";

/// Fixed cluster roles the per-provisioner service accounts bind to.
pub const CONTROLLER_PLUGIN_CLUSTER_ROLE: &str = "pav-controller-plugin";
pub const NODE_PLUGIN_CLUSTER_ROLE: &str = "pav-node-plugin";

/// Finalizer on PavProvisioner objects, held while the infrastructure bundle
/// or any volume of the provisioner exists.
pub fn provisioner_finalizer() -> String {
    format!("{DOMAIN}/provisioner-cleanup")
}

/// Finalizer on claims, held until the backing volume is deleted.
pub fn delete_volume_finalizer() -> String {
    format!("{DOMAIN}/delete-volume")
}

/// Annotation on claims holding the provisioning state machine state.
pub fn state_annotation() -> String {
    format!("{DOMAIN}/state")
}

/// Annotation on claims holding the storage class JSON at creation time. The
/// storage class can be deleted before the claim, so deletion re-reads it
/// from here.
pub fn storage_class_annotation() -> String {
    format!("{DOMAIN}/storage-class")
}

/// Annotation on claims that collapses an in-flight provisioning state
/// machine directly into its deletion arm.
pub fn deletion_requested_annotation() -> String {
    format!("{DOMAIN}/deletion-requested")
}

/// Label on claims naming the provisioner that owns them.
pub fn provisioner_label() -> String {
    format!("{DOMAIN}/provisioner")
}

/// Label pinning node-sensitive provisioning states to the node that holds
/// the worker's `/pav` host directory.
pub fn handler_node_label() -> String {
    format!("{DOMAIN}/handler-node")
}

/// Label on client pods that mount at least one PaV volume.
pub fn uses_volumes_label() -> String {
    format!("{DOMAIN}/uses-volumes")
}

/// Label on client pods naming one PaV volume they mount.
pub fn uses_volume_label(pvc_uid: &str) -> String {
    format!("{DOMAIN}/uses-volume-{pvc_uid}")
}

/// Label on client pods naming one provisioner they depend on.
pub fn uses_provisioner_label(provisioner_uid: &str) -> String {
    format!("{DOMAIN}/uses-provisioner-{provisioner_uid}")
}

/// Per-volume staging annotations and finalizer on the client pod. A pod
/// can mount several PaV volumes, so every key embeds the claim UID.
pub fn staging_state_annotation(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-state")
}

pub fn staging_pvc_name_annotation(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-pvc-name")
}

pub fn staging_pvc_namespace_annotation(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-pvc-namespace")
}

pub fn staging_target_path_annotation(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-target-path-in-host")
}

pub fn staging_read_only_annotation(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-read-only")
}

pub fn unstaging_requested_annotation(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-unstaging-requested")
}

pub fn unstage_volume_finalizer(pvc_uid: &str) -> String {
    format!("{DOMAIN}/{pvc_uid}-unstage-volume")
}
