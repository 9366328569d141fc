//! PavProvisioner Custom Resource Definition
//!
//! A PavProvisioner declares how volumes are validated, created, deleted,
//! staged, and unstaged by naming a pod template per lifecycle phase. Every
//! string leaf of the spec except `provisioningModes` is a template, so the
//! phase sections keep loosely-typed fields (`serde_json::Value` for
//! capacities and pod templates) and are only strictly validated after
//! template evaluation.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ProvisioningMode;

/// Specification for a PavProvisioner
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "pav.kubernetes-pav.io",
    version = "v1alpha1",
    kind = "PavProvisioner",
    plural = "pavprovisioners",
    shortname = "pav",
    status = "PavProvisionerStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Modes","type":"string","jsonPath":".spec.provisioningModes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PavProvisionerSpec {
    /// Non-empty subset of {Dynamic, Static}. Never templated.
    pub provisioning_modes: Vec<ProvisioningMode>,

    /// Admission filters and optional validation worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_validation: Option<VolumeValidationSpec>,

    /// Worker that creates the backing object. Dynamic provisioners only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_creation: Option<VolumeCreationSpec>,

    /// Worker that destroys the backing object. Dynamic provisioners only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_deletion: Option<VolumeDeletionSpec>,

    /// Worker that makes a volume available on a node.
    pub volume_staging: VolumeStagingSpec,

    /// Worker that reverts staging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_unstaging: Option<VolumeUnstagingSpec>,
}

impl PavProvisionerSpec {
    /// Returns true if volumes may be provisioned dynamically.
    pub fn allows_dynamic(&self) -> bool {
        self.provisioning_modes.contains(&ProvisioningMode::Dynamic)
    }

    /// Returns true if pre-provisioned volumes are accepted.
    pub fn allows_static(&self) -> bool {
        self.provisioning_modes.contains(&ProvisioningMode::Static)
    }
}

/// `spec.volumeValidation`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeValidationSpec {
    /// Accepted volume modes; entries may be templates. Default: Filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_modes: Option<Vec<String>>,

    /// Accepted access modes; entries may be templates. Default: all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,

    /// Minimum capacity (integer bytes, quantity string, or template).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_capacity: Option<serde_json::Value>,

    /// Maximum capacity (integer bytes, quantity string, or template).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_capacity: Option<serde_json::Value>,

    /// Validation worker pod template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<serde_json::Value>,
}

/// `spec.volumeCreation`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCreationSpec {
    /// Volume handle; defaults to `pvc-<claim uid>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,

    /// Capacity of the created volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<serde_json::Value>,

    /// Creation worker pod template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<serde_json::Value>,
}

/// `spec.volumeDeletion`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDeletionSpec {
    /// Deletion worker pod template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<serde_json::Value>,
}

/// `spec.volumeStaging`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStagingSpec {
    /// Staging worker pod template.
    pub pod_template: serde_json::Value,
}

/// `spec.volumeUnstaging`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeUnstagingSpec {
    /// Unstaging worker pod template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<serde_json::Value>,
}

/// Lifecycle phase of the provisioner's infrastructure bundle.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum ProvisionerPhase {
    /// Bundle objects are being created or are not yet ready.
    #[default]
    Bootstrapping,
    /// Both plugin workloads are ready; the provisioner serves volumes.
    Active,
    /// Deletion was requested but volumes still reference the provisioner.
    Blocked,
}

/// Status for a PavProvisioner
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PavProvisionerStatus {
    /// Current bundle phase.
    #[serde(default)]
    pub phase: ProvisionerPhase,

    /// Human-readable explanation of the current phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Whether the controller-plugin Deployment reports ready.
    #[serde(default)]
    pub controller_plugin_ready: bool,

    /// Whether the node-plugin DaemonSet reports ready on all nodes.
    #[serde(default)]
    pub node_plugin_ready: bool,
}

impl PavProvisionerStatus {
    /// Create a status with the given phase and message.
    pub fn new(phase: ProvisionerPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}
