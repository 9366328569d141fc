//! Evaluation of provisioner phase sections
//!
//! Each lifecycle phase evaluates its spec section over the phase context,
//! re-validates the substituted tree against the strict schema, and parses
//! it into a typed config consumed by the phase runner.

use std::collections::HashSet;

use crate::crd::{AccessMode, PavProvisioner, VolumeMode};
use crate::error::Error;
use crate::quantity::{parse_quantity_value, Rounding};
use crate::schema::{self, Mode, Section};
use crate::template::context::{ProvisioningContext, StagingContext};
use crate::template::TemplateEngine;

/// Evaluated `spec.volumeValidation`.
#[derive(Clone, Debug)]
pub struct VolumeValidationConfig {
    pub volume_modes: HashSet<VolumeMode>,
    pub access_modes: HashSet<AccessMode>,
    pub min_capacity: i64,
    pub max_capacity: Option<i64>,
    pub pod_template: Option<serde_json::Value>,
}

/// Evaluated `spec.volumeCreation`.
#[derive(Clone, Debug)]
pub struct VolumeCreationConfig {
    pub handle: Option<String>,
    pub capacity: Option<i64>,
    pub pod_template: Option<serde_json::Value>,
}

/// Evaluated `spec.volumeDeletion`.
#[derive(Clone, Debug)]
pub struct VolumeDeletionConfig {
    pub pod_template: Option<serde_json::Value>,
}

/// Evaluated `spec.volumeStaging`.
#[derive(Clone, Debug)]
pub struct VolumeStagingConfig {
    pub pod_template: serde_json::Value,
}

/// Evaluated `spec.volumeUnstaging`.
#[derive(Clone, Debug)]
pub struct VolumeUnstagingConfig {
    pub pod_template: Option<serde_json::Value>,
}

/// A provisioner paired with the engine its templates evaluate under.
pub struct ProvisionerTemplates<'a> {
    provisioner: &'a PavProvisioner,
    engine: &'a TemplateEngine,
}

impl<'a> ProvisionerTemplates<'a> {
    pub fn new(provisioner: &'a PavProvisioner, engine: &'a TemplateEngine) -> Self {
        Self {
            provisioner,
            engine,
        }
    }

    pub fn eval_validation_config(
        &self,
        context: &ProvisioningContext,
    ) -> Result<VolumeValidationConfig, Error> {
        let obj = self.eval_section(
            Section::Validation,
            serde_json::to_value(&self.provisioner.spec.volume_validation)?,
            context.to_template_value(),
        )?;

        let volume_modes = match obj.get("volumeModes") {
            None => HashSet::from([VolumeMode::Filesystem]),
            Some(list) => parse_mode_list(list)?,
        };

        let access_modes = match obj.get("accessModes") {
            None => HashSet::from(AccessMode::ALL),
            Some(list) => parse_mode_list(list)?,
        };

        let min_capacity = match obj.get("minCapacity") {
            None => 1,
            Some(v) => parse_positive_capacity(v, Rounding::Floor)?,
        };

        let max_capacity = obj
            .get("maxCapacity")
            .map(|v| parse_positive_capacity(v, Rounding::Ceiling))
            .transpose()?;

        if let Some(max) = max_capacity {
            if min_capacity > max {
                return Err(Error::schema(
                    "'spec.volumeValidation.minCapacity' must not be greater than \
                     'spec.volumeValidation.maxCapacity'",
                ));
            }
        }

        Ok(VolumeValidationConfig {
            volume_modes,
            access_modes,
            min_capacity,
            max_capacity,
            pod_template: obj.get("podTemplate").cloned(),
        })
    }

    pub fn eval_creation_config(
        &self,
        context: &ProvisioningContext,
    ) -> Result<VolumeCreationConfig, Error> {
        let obj = self.eval_section(
            Section::Creation,
            serde_json::to_value(&self.provisioner.spec.volume_creation)?,
            context.to_template_value(),
        )?;

        let capacity = obj
            .get("capacity")
            .map(|v| parse_positive_capacity(v, Rounding::Floor))
            .transpose()?;

        if self.provisioner.spec.allows_dynamic()
            && capacity.is_none()
            && obj.get("podTemplate").is_none()
        {
            return Err(Error::schema(
                "at least one of 'spec.volumeCreation.capacity' or \
                 'spec.volumeCreation.podTemplate' must be specified when \
                 'spec.provisioningModes' contains 'Dynamic'",
            ));
        }

        Ok(VolumeCreationConfig {
            handle: obj
                .get("handle")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            capacity,
            pod_template: obj.get("podTemplate").cloned(),
        })
    }

    pub fn eval_deletion_config(
        &self,
        context: &ProvisioningContext,
    ) -> Result<VolumeDeletionConfig, Error> {
        let obj = self.eval_section(
            Section::Deletion,
            serde_json::to_value(&self.provisioner.spec.volume_deletion)?,
            context.to_template_value(),
        )?;

        Ok(VolumeDeletionConfig {
            pod_template: obj.get("podTemplate").cloned(),
        })
    }

    pub fn eval_staging_config(
        &self,
        context: &StagingContext,
    ) -> Result<VolumeStagingConfig, Error> {
        let obj = self.eval_section(
            Section::Staging,
            serde_json::to_value(&self.provisioner.spec.volume_staging)?,
            context.to_template_value(),
        )?;

        let pod_template = obj
            .get("podTemplate")
            .cloned()
            .ok_or_else(|| Error::schema("'spec.volumeStaging.podTemplate' is required"))?;

        Ok(VolumeStagingConfig { pod_template })
    }

    pub fn eval_unstaging_config(
        &self,
        context: &StagingContext,
    ) -> Result<VolumeUnstagingConfig, Error> {
        let obj = self.eval_section(
            Section::Unstaging,
            serde_json::to_value(&self.provisioner.spec.volume_unstaging)?,
            context.to_template_value(),
        )?;

        Ok(VolumeUnstagingConfig {
            pod_template: obj.get("podTemplate").cloned(),
        })
    }

    /// Evaluate a phase section and re-validate the substituted tree.
    fn eval_section(
        &self,
        section: Section,
        raw: serde_json::Value,
        context: minijinja::Value,
    ) -> Result<serde_json::Value, Error> {
        let raw = if raw.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            raw
        };

        let evaluated = self.engine.evaluate_tree(&raw, &context)?;
        schema::validate_section(section, &evaluated, Mode::Evaluated)?;
        Ok(evaluated)
    }
}

fn parse_mode_list<T>(value: &serde_json::Value) -> Result<HashSet<T>, Error>
where
    T: std::str::FromStr<Err = Error> + Eq + std::hash::Hash,
{
    value
        .as_array()
        .into_iter()
        .flatten()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| Error::schema("mode entries must be strings"))?
                .parse()
        })
        .collect()
}

fn parse_positive_capacity(value: &serde_json::Value, rounding: Rounding) -> Result<i64, Error> {
    let capacity = parse_quantity_value(value, rounding)?;
    if capacity <= 0 {
        return Err(Error::schema("capacity values must be positive"));
    }
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PavProvisionerSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn provisioner(spec: serde_json::Value) -> PavProvisioner {
        let spec: PavProvisionerSpec =
            serde_json::from_value(spec).expect("test spec should deserialize");
        PavProvisioner {
            metadata: ObjectMeta {
                name: Some("test-provisioner".into()),
                uid: Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".into()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn sample_context() -> ProvisioningContext {
        ProvisioningContext {
            requested_volume_mode: "Filesystem".into(),
            requested_access_modes: vec!["ReadOnlyMany".into()],
            requested_min_capacity: 1 << 30,
            requested_max_capacity: None,
            params: BTreeMap::from([("tier".to_string(), "ssd".to_string())]),
            sc: json!({"metadata": {"name": "fast"}}),
            pvc: json!({"metadata": {"name": "data", "namespace": "apps"}}),
            default_handle: Some("pvc-123".into()),
        }
    }

    #[test]
    fn validation_defaults_apply_when_the_section_is_absent() {
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {"capacity": "1Gi"},
            "volumeStaging": {"podTemplate": {}}
        }));
        let engine = TemplateEngine::new();
        let config = ProvisionerTemplates::new(&p, &engine)
            .eval_validation_config(&sample_context())
            .unwrap();

        assert_eq!(config.volume_modes, HashSet::from([VolumeMode::Filesystem]));
        assert_eq!(config.access_modes, HashSet::from(AccessMode::ALL));
        assert_eq!(config.min_capacity, 1);
        assert_eq!(config.max_capacity, None);
        assert!(config.pod_template.is_none());
    }

    #[test]
    fn templated_capacity_evaluates_from_the_context() {
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {"capacity": "{{ requestedMinCapacity }}"},
            "volumeStaging": {"podTemplate": {}}
        }));
        let engine = TemplateEngine::new();
        let config = ProvisionerTemplates::new(&p, &engine)
            .eval_creation_config(&sample_context())
            .unwrap();

        assert_eq!(config.capacity, Some(1 << 30));
        assert!(config.handle.is_none());
    }

    #[test]
    fn creation_needs_capacity_or_pod_template_for_dynamic_provisioners() {
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {},
            "volumeStaging": {"podTemplate": {}}
        }));
        let engine = TemplateEngine::new();
        let err = ProvisionerTemplates::new(&p, &engine)
            .eval_creation_config(&sample_context())
            .unwrap_err();
        assert!(err.to_string().contains("at least one of"));
    }

    #[test]
    fn min_capacity_above_max_is_rejected_after_evaluation() {
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeValidation": {"minCapacity": "10Gi", "maxCapacity": "1Gi"},
            "volumeCreation": {"capacity": "1Gi"},
            "volumeStaging": {"podTemplate": {}}
        }));
        let engine = TemplateEngine::new();
        let err = ProvisionerTemplates::new(&p, &engine)
            .eval_validation_config(&sample_context())
            .unwrap_err();
        assert!(err.to_string().contains("must not be greater"));
    }

    #[test]
    fn staging_pod_template_substitutes_context_variables() {
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {"capacity": "1Gi"},
            "volumeStaging": {
                "podTemplate": {
                    "spec": {"containers": [{
                        "name": "stage",
                        "image": "busybox",
                        "command": ["sh", "-c", "echo {{ handle | tobash }} > /pav/volume"]
                    }]}
                }
            }
        }));
        let engine = TemplateEngine::new();
        let staging_context = StagingContext {
            volume_mode: "Filesystem".into(),
            access_modes: vec!["ReadWriteOnce".into()],
            capacity: 1 << 30,
            params: BTreeMap::new(),
            handle: "vol 1".into(),
            read_only: false,
            pvc: json!({}),
            pv: json!({}),
            node: json!({}),
        };
        let config = ProvisionerTemplates::new(&p, &engine)
            .eval_staging_config(&staging_context)
            .unwrap();

        let command = config.pod_template["spec"]["containers"][0]["command"][2]
            .as_str()
            .unwrap();
        assert_eq!(command, "echo 'vol 1' > /pav/volume");
    }

    #[test]
    fn evaluated_sections_are_revalidated_strictly() {
        // the template evaluates to a malformed quantity
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {"capacity": "{{ params.tier }}"},
            "volumeStaging": {"podTemplate": {}}
        }));
        let engine = TemplateEngine::new();
        let err = ProvisionerTemplates::new(&p, &engine)
            .eval_creation_config(&sample_context())
            .unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn absent_unstaging_section_evaluates_to_no_pod_template() {
        let p = provisioner(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {"capacity": "1Gi"},
            "volumeStaging": {"podTemplate": {}}
        }));
        let engine = TemplateEngine::new();
        let staging_context = StagingContext {
            volume_mode: "Filesystem".into(),
            access_modes: vec![],
            capacity: 1,
            params: BTreeMap::new(),
            handle: "h".into(),
            read_only: false,
            pvc: json!({}),
            pv: json!({}),
            node: json!({}),
        };
        let config = ProvisionerTemplates::new(&p, &engine)
            .eval_unstaging_config(&staging_context)
            .unwrap();
        assert!(config.pod_template.is_none());
    }
}
