//! Per-phase template evaluation contexts
//!
//! Validation, creation, and deletion evaluate against the claim and its
//! storage class; staging and unstaging evaluate against the bound volume,
//! the claim, and the node. The serialized field names are the variable
//! names visible inside templates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use serde::Serialize;

use crate::error::Error;
use crate::quantity::{parse_quantity, Rounding};

/// Context for the validation, creation, and deletion phases of a
/// dynamically provisioned volume. `defaultHandle` is only present for
/// creation and deletion.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningContext {
    pub requested_volume_mode: String,
    pub requested_access_modes: Vec<String>,
    pub requested_min_capacity: i64,
    pub requested_max_capacity: Option<i64>,
    pub params: BTreeMap<String, String>,
    pub sc: serde_json::Value,
    pub pvc: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_handle: Option<String>,
}

impl ProvisioningContext {
    /// Build the dynamic-validation context from a claim and its storage
    /// class.
    pub fn validation(pvc: &PersistentVolumeClaim, sc: &StorageClass) -> Result<Self, Error> {
        let spec = pvc
            .spec
            .as_ref()
            .ok_or_else(|| Error::internal("claim has no spec"))?;

        let resources = spec
            .resources
            .as_ref()
            .ok_or_else(|| Error::internal("claim has no resource requirements"))?;

        let min_capacity = resources
            .requests
            .as_ref()
            .and_then(|r| r.get("storage"))
            .ok_or_else(|| Error::internal("claim requests no storage"))
            .and_then(|q| parse_quantity(&q.0, Rounding::Floor))?;

        let max_capacity = resources
            .limits
            .as_ref()
            .and_then(|l| l.get("storage"))
            .map(|q| parse_quantity(&q.0, Rounding::Ceiling))
            .transpose()?;

        Ok(Self {
            requested_volume_mode: spec
                .volume_mode
                .clone()
                .unwrap_or_else(|| "Filesystem".to_string()),
            requested_access_modes: spec.access_modes.clone().unwrap_or_default(),
            requested_min_capacity: min_capacity,
            requested_max_capacity: max_capacity,
            params: sc.parameters.clone().unwrap_or_default(),
            sc: serde_json::to_value(sc)?,
            pvc: serde_json::to_value(pvc)?,
            default_handle: None,
        })
    }

    /// Build the creation/deletion context: the validation context plus
    /// `defaultHandle = pvc-<claim uid>`.
    pub fn creation_deletion(
        pvc: &PersistentVolumeClaim,
        sc: &StorageClass,
    ) -> Result<Self, Error> {
        let uid = pvc
            .uid()
            .ok_or_else(|| Error::internal("claim has no uid"))?;

        let mut context = Self::validation(pvc, sc)?;
        context.default_handle = Some(format!("pvc-{uid}"));
        Ok(context)
    }

    /// The context as template globals.
    pub fn to_template_value(&self) -> minijinja::Value {
        minijinja::Value::from_serialize(self)
    }
}

/// Context for the staging and unstaging phases.
///
/// `accessModes` comes from the claim rather than the volume: mounts can
/// only use the access modes the claim declared.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingContext {
    pub volume_mode: String,
    pub access_modes: Vec<String>,
    pub capacity: i64,
    pub params: BTreeMap<String, String>,
    pub handle: String,
    pub read_only: bool,
    pub pvc: serde_json::Value,
    pub pv: serde_json::Value,
    pub node: serde_json::Value,
}

impl StagingContext {
    /// Build the staging/unstaging context from the bound volume, its
    /// claim, and the node on which staging happens.
    pub fn new(
        pvc: &PersistentVolumeClaim,
        pv: &PersistentVolume,
        node: &Node,
        read_only: bool,
    ) -> Result<Self, Error> {
        let pv_spec = pv
            .spec
            .as_ref()
            .ok_or_else(|| Error::internal("volume has no spec"))?;

        let csi = pv_spec
            .csi
            .as_ref()
            .ok_or_else(|| Error::internal("volume has no CSI source"))?;

        let capacity = pv_spec
            .capacity
            .as_ref()
            .and_then(|c| c.get("storage"))
            .ok_or_else(|| Error::internal("volume has no storage capacity"))
            .and_then(|q| parse_quantity(&q.0, Rounding::HalfEven))?;

        Ok(Self {
            volume_mode: pv_spec
                .volume_mode
                .clone()
                .unwrap_or_else(|| "Filesystem".to_string()),
            access_modes: pvc
                .spec
                .as_ref()
                .and_then(|s| s.access_modes.clone())
                .unwrap_or_default(),
            capacity,
            params: csi.volume_attributes.clone().unwrap_or_default(),
            handle: csi.volume_handle.clone(),
            read_only,
            pvc: serde_json::to_value(pvc)?,
            pv: serde_json::to_value(pv)?,
            node: serde_json::to_value(node)?,
        })
    }

    /// The context as template globals.
    pub fn to_template_value(&self) -> minijinja::Value {
        minijinja::Value::from_serialize(self)
    }
}
