//! Declarative validation of provisioner specs
//!
//! The same field tables drive two validators selected by [`Mode`]: the
//! admission webhook validates raw specs where any string leaf may instead
//! be a template, and the agents re-validate each phase section after
//! template evaluation, where the intrinsic patterns apply strictly.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::crd::{PavProvisionerSpec, ProvisioningMode};
use crate::error::Error;
use crate::template::TemplateEngine;

/// Which realization of the schema to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Raw spec: a string leaf also passes if it contains a
    /// template-opening token.
    Templated,
    /// Evaluated subtree: string leaves must match their intrinsic pattern.
    Evaluated,
}

/// The five per-phase sections of a provisioner spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Validation,
    Creation,
    Deletion,
    Staging,
    Unstaging,
}

impl Section {
    fn field_name(self) -> &'static str {
        match self {
            Self::Validation => "volumeValidation",
            Self::Creation => "volumeCreation",
            Self::Deletion => "volumeDeletion",
            Self::Staging => "volumeStaging",
            Self::Unstaging => "volumeUnstaging",
        }
    }

    fn fields(self) -> &'static [(&'static str, Slot, bool)] {
        match self {
            Self::Validation => &[
                ("volumeModes", Slot::VolumeModeList, false),
                ("accessModes", Slot::AccessModeList, false),
                ("minCapacity", Slot::Quantity, false),
                ("maxCapacity", Slot::Quantity, false),
                ("podTemplate", Slot::PodTemplate, false),
            ],
            Self::Creation => &[
                ("handle", Slot::Handle, false),
                ("capacity", Slot::Quantity, false),
                ("podTemplate", Slot::PodTemplate, false),
            ],
            Self::Deletion | Self::Unstaging => &[("podTemplate", Slot::PodTemplate, false)],
            Self::Staging => &[("podTemplate", Slot::PodTemplate, true)],
        }
    }
}

/// Intrinsic shape of a schema slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    VolumeModeList,
    AccessModeList,
    Quantity,
    Handle,
    PodTemplate,
}

fn volume_mode_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(Filesystem|Block)$").expect("pattern is valid"))
}

fn access_mode_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(ReadWriteOnce|ReadOnlyMany|ReadWriteMany)$").expect("pattern is valid")
    })
}

fn quantity_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\+?([0-9]+(\.[0-9]*)?|\.[0-9]+)([numk]|[KMGTPE]i|[MGTPE]|[eE][-+]?[0-9]+)?$")
            .expect("pattern is valid")
    })
}

/// Validate a whole provisioner spec, including the cross-field rules that
/// templates cannot influence. In [`Mode::Templated`] this also compiles
/// every template for syntax.
pub fn validate_provisioner(spec: &PavProvisionerSpec, mode: Mode) -> Result<(), Error> {
    // provisioningModes is never templated
    if spec.provisioning_modes.is_empty() {
        return Err(Error::schema("'spec.provisioningModes' must not be empty"));
    }

    let mut seen = HashSet::new();
    for m in &spec.provisioning_modes {
        if !seen.insert(*m) {
            return Err(Error::schema(format!(
                "'spec.provisioningModes' lists {m:?} more than once"
            )));
        }
    }

    if !spec.allows_dynamic() {
        if spec.volume_creation.is_some() {
            return Err(Error::schema(
                "'spec.volumeCreation' requires 'Dynamic' in 'spec.provisioningModes'",
            ));
        }
        if spec.volume_deletion.is_some() {
            return Err(Error::schema(
                "'spec.volumeDeletion' requires 'Dynamic' in 'spec.provisioningModes'",
            ));
        }
    }

    // validation of pre-provisioned volumes is not supported
    let static_only = spec.provisioning_modes == [ProvisioningMode::Static];
    let has_validation_pod = spec
        .volume_validation
        .as_ref()
        .is_some_and(|v| v.pod_template.is_some());
    if static_only && has_validation_pod {
        return Err(Error::schema(
            "'spec.volumeValidation.podTemplate' is not supported when \
             'spec.provisioningModes' is ['Static']",
        ));
    }

    for (section, value) in [
        (
            Section::Validation,
            serde_json::to_value(&spec.volume_validation)?,
        ),
        (
            Section::Creation,
            serde_json::to_value(&spec.volume_creation)?,
        ),
        (
            Section::Deletion,
            serde_json::to_value(&spec.volume_deletion)?,
        ),
        (
            Section::Staging,
            serde_json::to_value(Some(&spec.volume_staging))?,
        ),
        (
            Section::Unstaging,
            serde_json::to_value(&spec.volume_unstaging)?,
        ),
    ] {
        if !value.is_null() {
            validate_section(section, &value, mode)?;
        }
    }

    if mode == Mode::Templated {
        let engine = TemplateEngine::new();
        let spec_value = serde_json::to_value(spec)?;
        for (key, section_value) in spec_value
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(key, _)| *key != "provisioningModes")
        {
            engine
                .check_tree_syntax(section_value)
                .map_err(|e| Error::schema(format!("'spec.{key}': {e}")))?;
        }
    }

    Ok(())
}

/// Validate one phase section against its field table.
pub fn validate_section(
    section: Section,
    value: &serde_json::Value,
    mode: Mode,
) -> Result<(), Error> {
    let name = section.field_name();

    let obj = value
        .as_object()
        .ok_or_else(|| Error::schema(format!("'spec.{name}' must be a mapping")))?;

    let fields = section.fields();

    for key in obj.keys() {
        if !fields.iter().any(|(field, _, _)| field == key) {
            return Err(Error::schema(format!(
                "'spec.{name}' has unknown field {key:?}"
            )));
        }
    }

    for (field, slot, required) in fields {
        let path = format!("spec.{name}.{field}");
        match obj.get(*field) {
            None | Some(serde_json::Value::Null) => {
                if *required {
                    return Err(Error::schema(format!("'{path}' is required")));
                }
            }
            Some(field_value) => validate_slot(*slot, field_value, mode, &path)?,
        }
    }

    Ok(())
}

fn validate_slot(
    slot: Slot,
    value: &serde_json::Value,
    mode: Mode,
    path: &str,
) -> Result<(), Error> {
    match slot {
        Slot::VolumeModeList => validate_string_list(value, volume_mode_pattern(), mode, path),
        Slot::AccessModeList => validate_string_list(value, access_mode_pattern(), mode, path),
        Slot::Quantity => match value {
            serde_json::Value::Number(n) if n.is_u64() || n.is_i64() => Ok(()),
            serde_json::Value::String(s) => check_string(s, quantity_pattern(), mode, path),
            _ => Err(Error::schema(format!(
                "'{path}' must be an integer or a quantity string"
            ))),
        },
        Slot::Handle => match value {
            serde_json::Value::String(s) if !s.is_empty() => Ok(()),
            _ => Err(Error::schema(format!("'{path}' must be a non-empty string"))),
        },
        Slot::PodTemplate => {
            let obj = value
                .as_object()
                .ok_or_else(|| Error::schema(format!("'{path}' must be a mapping")))?;
            for key in obj.keys() {
                if key != "metadata" && key != "spec" {
                    return Err(Error::schema(format!(
                        "'{path}' may only specify fields 'metadata' and 'spec'"
                    )));
                }
            }
            Ok(())
        }
    }
}

fn validate_string_list(
    value: &serde_json::Value,
    pattern: &Regex,
    mode: Mode,
    path: &str,
) -> Result<(), Error> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::schema(format!("'{path}' must be a list")))?;

    for (index, item) in items.iter().enumerate() {
        match item {
            serde_json::Value::String(s) => check_string(s, pattern, mode, &format!("{path}[{index}]"))?,
            _ => {
                return Err(Error::schema(format!(
                    "'{path}[{index}]' must be a string"
                )))
            }
        }
    }

    Ok(())
}

fn check_string(s: &str, pattern: &Regex, mode: Mode, path: &str) -> Result<(), Error> {
    let accepted = pattern.is_match(s)
        || (mode == Mode::Templated && TemplateEngine::has_template_syntax(s));

    if accepted {
        Ok(())
    } else {
        Err(Error::schema(format!(
            "'{path}' has invalid value {s:?}"
        )))
    }
}
