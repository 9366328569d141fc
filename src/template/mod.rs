//! Template evaluation for provisioner specs
//!
//! Provisioner specs embed Jinja-style templates in every string leaf
//! outside `provisioningModes`. This module owns the engine, the per-phase
//! evaluation contexts, and the evaluated phase configs.

mod context;
mod engine;
mod error;
mod filters;
mod provisioner;

pub use context::{ProvisioningContext, StagingContext};
pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use provisioner::{
    ProvisionerTemplates, VolumeCreationConfig, VolumeDeletionConfig, VolumeStagingConfig,
    VolumeUnstagingConfig, VolumeValidationConfig,
};
